use std::fmt;
use std::time::Duration;

use eventing_core::{SubscriptionSubjectIdentifier, ValidationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Broker connection not established or lost mid-operation.
    #[error("backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error(transparent)]
    PartialSync(#[from] PartialSyncError),

    /// Backend-local, a delete of something that does not exist counts as success.
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("broker operation failed: {0:#}")]
    Transport(anyhow::Error),

    #[error("broker operation did not complete within {0:?}")]
    Timeout(Duration),

    #[error("synchronization cancelled after {applied} applied operations")]
    Cancelled { applied: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BackendError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        BackendError::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

impl From<anyhow::Error> for BackendError {
    fn from(value: anyhow::Error) -> Self {
        BackendError::Transport(value)
    }
}

/// One identifier which could not be converged.
#[derive(Debug)]
pub struct SyncFailure {
    pub id: SubscriptionSubjectIdentifier,
    pub operation: &'static str,
    pub error: BackendError,
}

/// Aggregated result of a best-effort sync pass.
///
/// Operations which succeeded before or after a failure are not rolled back.
#[derive(Debug, Error)]
pub struct PartialSyncError {
    pub failures: Vec<SyncFailure>,
    pub succeeded: usize,
}

impl PartialSyncError {
    pub fn failed_ids(&self) -> impl Iterator<Item = &SubscriptionSubjectIdentifier> {
        self.failures.iter().map(|failure| &failure.id)
    }
}

impl fmt::Display for PartialSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} operations failed",
            self.failures.len(),
            self.failures.len() + self.succeeded
        )?;
        for failure in &self.failures {
            write!(
                f,
                "; {} consumer {}: {}",
                failure.operation,
                failure.id.consumer_name(),
                failure.error
            )?;
        }
        Ok(())
    }
}
