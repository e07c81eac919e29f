use thiserror::Error;

/// Errors surfaced by the rate limiter.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The caller's `max_delay` bound would be exceeded waiting for tokens.
    #[error("rate limit wait for endpoint {endpoint:?} would exceed the {max_delay_secs}s cap")]
    WaitTooLong {
        endpoint: String,
        max_delay_secs: f64,
    },
}

/// Errors surfaced by the fetcher and its collaborators.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limit exceeded for endpoint {endpoint:?}; retry after {period_remaining_secs}s")]
    RateLimitExceeded {
        endpoint: String,
        period_remaining_secs: f64,
    },

    #[error(transparent)]
    RateLimitWait(#[from] RateLimitError),

    #[error("network error: {0}")]
    Network(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// The error's stringified message, for retry-policy substring
    /// classification and the dead-letter `error_type` field.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// A short class name used as the dead-letter `error_type` field.
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "RateLimitExceeded",
            Self::RateLimitWait(_) => "RateLimitWaitTooLong",
            Self::Network(_) => "NetworkError",
            Self::Server { .. } => "ServerError",
            Self::InvalidParameter(_) => "InvalidParameter",
            Self::Other(_) => "FetchError",
        }
    }

    /// If this error carries a `period_remaining`, callers must sleep
    /// exactly that period instead of the computed backoff.
    pub fn period_remaining_secs(&self) -> Option<f64> {
        match self {
            Self::RateLimitExceeded {
                period_remaining_secs,
                ..
            } => Some(*period_remaining_secs),
            _ => None,
        }
    }
}
