use crate::error::ProviderError;
use crate::model::{DataSource, Feature, FeatureView, mapped_source_column};
use anyhow::Result;
use std::collections::HashMap;

/// Everything the point-in-time planner needs to know about one feature view.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureViewQueryContext {
    pub name: String,
    /// Seconds; 0 disables the validity window.
    pub ttl: i64,
    pub entities: Vec<String>,
    pub features: Vec<String>,
    pub table_ref: Option<String>,
    pub query: Option<String>,
    pub event_timestamp_column: String,
    pub created_timestamp_column: Option<String>,
    /// Source column to feature name.
    pub field_mapping: HashMap<String, String>,
}

impl FeatureViewQueryContext {
    /// Column of the source table that holds `feature`.
    pub fn source_column<'a>(&'a self, feature: &'a str) -> &'a str {
        mapped_source_column(&self.field_mapping, feature)
    }

    /// `{view}__{feature}` output column.
    pub fn output_column(&self, feature: &str) -> String {
        format!("{}__{}", self.name, feature)
    }
}

/// True for `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(view: &str, what: &str, name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(ProviderError::configuration(format!(
            "Feature view '{}' has {} '{}' which is not a valid SQL identifier",
            view, what, name
        ))
        .into())
    }
}

/// Groups `view:feature` references by view, in order of first appearance,
/// keeping request order (without duplicates) inside each view.
fn requested_features_by_view<'a>(
    feature_refs: &[&str],
    feature_views: &'a [FeatureView],
) -> Result<Vec<(&'a FeatureView, Vec<String>)>> {
    let mut grouped: Vec<(&FeatureView, Vec<String>)> = vec![];
    for feature_ref in feature_refs {
        let Feature {
            feature_view_name,
            feature_name,
        } = Feature::try_from(*feature_ref)?;
        let view = feature_views
            .iter()
            .find(|fv| fv.name == feature_view_name)
            .ok_or_else(|| ProviderError::feature_view_not_found(&feature_view_name))?;
        if view.feature(&feature_name).is_none() {
            return Err(ProviderError::configuration(format!(
                "Feature view '{}' has no feature '{}'",
                view.name, feature_name
            ))
            .into());
        }
        match grouped.iter_mut().find(|(fv, _)| fv.name == view.name) {
            Some((_, features)) => {
                if !features.contains(&feature_name) {
                    features.push(feature_name);
                }
            }
            None => grouped.push((view, vec![feature_name])),
        }
    }
    Ok(grouped)
}

pub fn get_feature_view_query_context(
    feature_refs: &[&str],
    feature_views: &[FeatureView],
) -> Result<Vec<FeatureViewQueryContext>> {
    requested_features_by_view(feature_refs, feature_views)?
        .into_iter()
        .map(|(view, features)| -> Result<FeatureViewQueryContext> {
            let DataSource::BigQuery(source) = &view.batch_source else {
                return Err(ProviderError::configuration(format!(
                    "Feature view '{}' has a {} batch source, only big_query sources can be joined",
                    view.name,
                    view.batch_source.kind()
                ))
                .into());
            };
            check_identifier(&view.name, "name", &view.name)?;
            for entity in &view.entities {
                check_identifier(&view.name, "entity column", entity)?;
            }
            for feature in &features {
                check_identifier(&view.name, "feature", feature)?;
            }
            check_identifier(
                &view.name,
                "event timestamp column",
                &source.event_timestamp_column,
            )?;
            if let Some(created) = &source.created_timestamp_column {
                check_identifier(&view.name, "created timestamp column", created)?;
            }
            for column in source.field_mapping.keys() {
                check_identifier(&view.name, "mapped column", column)?;
            }
            Ok(FeatureViewQueryContext {
                name: view.name.clone(),
                ttl: view.ttl_seconds(),
                entities: view.entities.clone(),
                features,
                table_ref: source.table_ref.clone(),
                query: source.query.clone(),
                event_timestamp_column: source.event_timestamp_column.clone(),
                created_timestamp_column: source.created_timestamp_column.clone(),
                field_mapping: source.field_mapping.clone(),
            })
        })
        .collect()
}
