//! Error types for the indexer.

use lake_dataset::DatasetError;

/// The result type used throughout lake-indexer.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while refreshing views or running backfills.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required dependency or setting is missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A dataset operation failed inside a domain.
    #[error("{domain} dataset error: {source}")]
    Dataset {
        /// Domain whose store raised the error.
        domain: &'static str,
        /// The dataset failure.
        #[source]
        source: DatasetError,
    },

    /// An external source failed or returned unusable data.
    #[error("source {source_name} failed: {message}")]
    Source {
        /// Name of the failing source.
        source_name: String,
        /// Description of the failure.
        message: String,
    },

    /// A backfill stopped at a failed epoch.
    #[error("backfill failed at epoch {epoch} (last completed: {last_success:?}): {message}")]
    Backfill {
        /// Epoch that failed.
        epoch: u64,
        /// Highest epoch written before the failure, if any.
        last_success: Option<u64>,
        /// Description of the failure.
        message: String,
    },

    /// An error from lake-core.
    #[error("core error: {0}")]
    Core(#[from] lake_core::Error),
}

impl Error {
    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates an external source error.
    #[must_use]
    pub fn upstream(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Returns a closure wrapping dataset errors for `domain`.
    pub fn dataset(domain: &'static str) -> impl Fn(DatasetError) -> Self {
        move |source| Self::Dataset { domain, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn dataset_error_keeps_domain_and_source() {
        let inner = DatasetError::invalid_row("fact_revenue_distributions", 0, "bad");
        let err = Error::dataset("revenue")(inner);
        assert!(err.to_string().starts_with("revenue dataset error"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn backfill_error_reports_progress() {
        let err = Error::Backfill {
            epoch: 12,
            last_success: Some(11),
            message: "rpc timeout".into(),
        };
        assert_eq!(
            err.to_string(),
            "backfill failed at epoch 12 (last completed: Some(11)): rpc timeout"
        );
    }
}
