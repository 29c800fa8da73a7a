use std::time::Duration;

/// Failures talking to the lease store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backend rejected or could not serve the request.
    #[error("lease store unavailable during {operation}: {reason}")]
    Unavailable {
        operation: &'static str,
        reason: String,
        retryable: bool,
    },

    #[error("lease store timed out during {operation} after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A record came back in a shape we don't understand.
    #[error("malformed lease record: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn unavailable(operation: &'static str, reason: impl ToString) -> Self {
        StoreError::Unavailable {
            operation,
            reason: reason.to_string(),
            retryable: false,
        }
    }

    pub fn transient(operation: &'static str, reason: impl ToString) -> Self {
        StoreError::Unavailable {
            operation,
            reason: reason.to_string(),
            retryable: true,
        }
    }

    /// Whether a bounded retry may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable {
                retryable: true,
                ..
            }
        )
    }
}

/// Failures talking to the container registry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("container registry unavailable: {0}")]
    Unavailable(String),

    #[error("container registry timed out running `{command}` after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("`{command}` exited with {exit_code:?}: {stderr}")]
    CommandFailed {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    #[error("unexpected registry output: {0}")]
    Malformed(String),
}

/// Infrastructure failures surfaced by the coordinator.
///
/// Contention and bad input are reported through the outcome enums instead;
/// an error here always means a dependency could not answer, never that a
/// lease is absent.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    #[error(transparent)]
    RegistryUnavailable(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("{0} is not valid unicode")]
    NotUnicode(String),
}

/// Failures wiring a [`crate::LockService`] together from its configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open lease store: {0}")]
    Store(#[from] StoreError),
}
