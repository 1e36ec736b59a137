use std::fmt::{self, Display, Formatter};

/// Conditions callers are expected to match on. They travel inside
/// `anyhow::Error` and are recovered with `downcast_ref`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    Configuration {
        message: String,
    },
    FeatureViewNotFound {
        name: String,
    },
    WriteConflict {
        table: String,
    },
    WriteFailure {
        table: String,
        minibatch: usize,
        attempts: usize,
    },
    StoreUnavailable {
        message: String,
    },
}

impl ProviderError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn feature_view_not_found(name: impl Into<String>) -> Self {
        Self::FeatureViewNotFound { name: name.into() }
    }

    pub fn write_conflict(table: impl Into<String>) -> Self {
        Self::WriteConflict {
            table: table.into(),
        }
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::WriteConflict { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::FeatureViewNotFound { .. }
        )
    }
}

/// True when the error chain carries a [`ProviderError::WriteConflict`].
pub fn is_write_conflict(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<ProviderError>()
            .is_some_and(ProviderError::is_conflict)
    })
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { message } => write!(f, "Invalid configuration: {}", message),
            Self::FeatureViewNotFound { name } => {
                write!(f, "Could not find feature view '{}'", name)
            }
            Self::WriteConflict { table } => {
                write!(f, "Write conflict on online table '{}'", table)
            }
            Self::WriteFailure {
                table,
                minibatch,
                attempts,
            } => write!(
                f,
                "Minibatch {} of table '{}' failed after {} attempts",
                minibatch, table, attempts
            ),
            Self::StoreUnavailable { message } => {
                write!(f, "Online store unavailable: {}", message)
            }
        }
    }
}

impl std::error::Error for ProviderError {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn conflict_is_found_through_context() {
        let err = anyhow::Error::new(ProviderError::write_conflict("driver_stats"))
            .context("commit minibatch");
        assert!(is_write_conflict(&err));
        assert!(!is_write_conflict(&anyhow!("disk full")));
    }

    #[test]
    fn configuration_errors_are_classified() {
        assert!(ProviderError::configuration("bad source").is_configuration());
        assert!(ProviderError::feature_view_not_found("fv").is_configuration());
        assert!(!ProviderError::store_unavailable("down").is_configuration());
    }

    #[test]
    fn write_failure_message_names_minibatch() -> anyhow::Result<()> {
        let err: anyhow::Result<()> = Err(ProviderError::WriteFailure {
            table: "driver_stats".to_string(),
            minibatch: 4,
            attempts: 3,
        })
        .context("online write");
        let message = format!("{:#}", err.unwrap_err());
        assert!(message.contains("Minibatch 4 of table 'driver_stats' failed after 3 attempts"));
        Ok(())
    }
}
