use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LogLevel> for tracing::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Critical => tracing::Level::ERROR,
        }
    }
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct EntityInput {
    /// SQL producing the entity rows
    #[arg(long = "entity-query")]
    pub entity_query: Option<String>,
    /// JSON records file (or .sql file) holding the entity rows
    #[arg(short = 'e', long = "entity-file")]
    pub entity_file: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Print the point-in-time SQL for a historical retrieval
    Plan {
        /// Comma separated feature references, e.g. driver_hourly_stats:conv_rate
        #[arg(long = "features", value_delimiter = ',', required = true)]
        features: Vec<String>,
        #[command(flatten)]
        entities: EntityInput,
    },
    /// Run a historical retrieval against the local offline tables and print JSON rows
    MaterializeLocal {
        /// Comma separated feature references
        #[arg(long = "features", value_delimiter = ',', required = true)]
        features: Vec<String>,
        /// JSON records file holding the entity rows
        #[arg(short = 'e', long = "entity-file")]
        entity_file: String,
    },
    /// Print the latest row per entity of a feature view's source within a time range
    PullLatest {
        #[arg(long = "view")]
        view: String,
        /// Range start, RFC 3339 or "YYYY-MM-DD HH:MM:SS" in UTC
        #[arg(long = "start")]
        start: String,
        /// Range end, RFC 3339 or "YYYY-MM-DD HH:MM:SS" in UTC
        #[arg(long = "end")]
        end: String,
        /// Print the SQL instead of running it locally
        #[arg(long = "sql", default_value_t = false)]
        sql: bool,
    },
    /// Write JSON records into the online store
    Write {
        #[arg(long = "view")]
        view: String,
        /// JSON array of objects carrying join keys, feature values, event_timestamp
        /// and an optional created_timestamp
        #[arg(long = "file")]
        file: String,
    },
    /// Read online feature values for JSON entity keys
    Read {
        #[arg(long = "view")]
        view: String,
        /// JSON array of objects mapping join keys to values
        #[arg(long = "keys")]
        keys: String,
    },
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct CliOptions {
    #[arg(short = 'c', long = "chdir", default_value = None)]
    /// Switch to a different feature repository directory before executing the given subcommand.
    /// Can also be set via the FEATURE_REPO_DIR_ENV_VAR environment variable.
    pub chdir: Option<String>,
    /// The logging level. Case-insensitive.
    #[arg(
        value_enum,
        long = "log-level",
        ignore_case = true,
        default_value = "info"
    )]
    pub log_level: LogLevel,
    /// Override the directory where the CLI should look for the feature_store.yaml file.
    /// Can also be set via the FEAST_FS_YAML_FILE_PATH environment variable
    #[arg(short='f', long="feature-store-yaml", default_value = None)]
    pub feature_store_yaml: Option<String>,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plan_with_entity_query() {
        let opts = CliOptions::try_parse_from([
            "feast",
            "--log-level",
            "DEBUG",
            "plan",
            "--features",
            "driver_hourly_stats:conv_rate,customer_profile:current_balance",
            "--entity-query",
            "SELECT * FROM feast.entities",
        ])
        .unwrap();
        assert_eq!(opts.log_level, LogLevel::Debug);
        let CliCommand::Plan { features, entities } = opts.command else {
            panic!("expected plan");
        };
        assert_eq!(features.len(), 2);
        assert_eq!(entities.entity_query.as_deref(), Some("SELECT * FROM feast.entities"));
        assert!(entities.entity_file.is_none());
    }

    #[test]
    fn plan_needs_exactly_one_entity_input() {
        let missing = CliOptions::try_parse_from([
            "feast",
            "plan",
            "--features",
            "driver_hourly_stats:conv_rate",
        ]);
        assert!(missing.is_err());
        let both = CliOptions::try_parse_from([
            "feast",
            "plan",
            "--features",
            "driver_hourly_stats:conv_rate",
            "--entity-query",
            "SELECT 1",
            "--entity-file",
            "rows.json",
        ]);
        assert!(both.is_err());
    }
}
