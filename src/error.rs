use thiserror::Error;

/// Error taxonomy shared by every venue adapter.
///
/// Only [`AdapterError::Auth`] is treated as non-retryable by
/// [`crate::adapter::ReconnectSupervisor`] — every other variant triggers the
/// normal exponential-backoff reconnect loop.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("stale data: {0}")]
    Stale(String),
}

impl AdapterError {
    /// Auth failures are not retried — credentials won't fix themselves on
    /// the next reconnect attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AdapterError::Auth(_))
    }
}
