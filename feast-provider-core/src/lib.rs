pub mod config;
pub mod error;
pub mod key_serialization;
pub mod model;
pub mod offline_store;
pub mod online_read;
pub mod online_write;
pub mod onlinestore;
pub mod provider;
pub mod query_context;
pub mod query_plan;
pub mod registry;
pub mod retrieval_job;
pub mod table;

pub mod feast {
    pub mod types;
}
