use thiserror::Error;

/// Typed failure surface for chat and embedding calls.
///
/// The retry wrapper consults [`LlmError::retryable`] to decide whether a
/// failed attempt is worth repeating; authentication and bad-request errors
/// fail fast.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("rate limited{}", status_suffix(.status))]
    RateLimit { status: Option<u16> },

    #[error("authentication failed{}", status_suffix(.status))]
    Authentication { status: Option<u16> },

    #[error("bad request: {message}")]
    BadRequest { status: Option<u16>, message: String },

    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("llm call failed{}: {message}", status_suffix(.status))]
    Unknown { status: Option<u16>, message: String },
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (status {code})"),
        None => String::new(),
    }
}

impl LlmError {
    /// Map an HTTP status code plus body text into the matching variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimit { status: Some(status) },
            401 | 403 => Self::Authentication { status: Some(status) },
            400..=499 => Self::BadRequest { status: Some(status), message },
            _ => Self::Unknown { status: Some(status), message },
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimit { status }
            | Self::Authentication { status }
            | Self::BadRequest { status, .. }
            | Self::Unknown { status, .. } => *status,
            Self::Timeout { .. } | Self::Cancelled => None,
        }
    }

    /// Rate limits, timeouts, and 5xx-class unknowns are worth retrying.
    pub fn retryable(&self) -> bool {
        match self {
            Self::RateLimit { .. } | Self::Timeout { .. } => true,
            Self::Unknown { status, .. } => status.is_none_or(|code| code >= 500),
            Self::Authentication { .. } | Self::BadRequest { .. } | Self::Cancelled => false,
        }
    }
}
