use thiserror::Error;

/// A scheduled poll could not fetch usage data. Recoverable; the next tick retries.
#[derive(Debug, Error)]
#[error("Error communicating with Duke Energy Usage API: {source}")]
pub struct UpdateFailed {
    #[source]
    pub source: anyhow::Error,
}

/// The realtime background task could not be started.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("no async runtime available to run the realtime subscription")]
    NoRuntime,
}

/// A push message could not be turned into a measurement.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not a usage message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timestamp {0} is out of range")]
    Timestamp(i64),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Why setting up the integration failed.
#[derive(Debug, Error)]
pub enum SetupError {
    /// No account has a smart meter with gateway access. Retrying will not help.
    #[error("could not identify a smart meter on your account with gateway access")]
    NoGateway,
    /// The first refresh failed. The caller should retry setup later.
    #[error("integration not ready: {0}")]
    NotReady(#[source] UpdateFailed),
    #[error("failed to start realtime usage: {0}")]
    Subscription(#[from] SubscriptionError),
    #[error("failed to create Duke Energy client: {0}")]
    Client(#[source] anyhow::Error),
}

impl SetupError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SetupError::NotReady(_))
    }
}
