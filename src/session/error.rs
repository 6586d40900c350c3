use reqwest::StatusCode;

/// Errors surfaced by [`SessionGuard`](super::SessionGuard).
///
/// `Clone` so one refresh outcome can be handed to every request waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// 401 where no refresh applies, or the retried request was rejected again.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The refresh call failed. Stored tokens were cleared.
    #[error("session expired: {0}")]
    SessionExpired(String),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    /// No response was received.
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    /// A 2xx response whose body is not the expected JSON.
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl SessionError {
    /// Classify a transport failure from reqwest.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }

    /// Build an error for a non-2xx response from its status and raw body.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = error_message(status, body);
        if status == StatusCode::UNAUTHORIZED {
            Self::Unauthorized(message)
        } else {
            Self::Api {
                status: status.as_u16(),
                message,
            }
        }
    }

    /// HTTP status behind the error, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized(_) | Self::SessionExpired(_) => Some(401),
            Self::Api { status, .. } => Some(*status),
            Self::Network(_) | Self::Timeout | Self::Decode(_) => None,
        }
    }

    /// Whether the user has to sign in again.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::SessionExpired(_))
    }
}

/// Pull a human-readable message out of an error body.
///
/// Looks at `message` (string or list of strings) then `error`, falling back
/// to the raw text or the status reason.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error"] {
            match value.get(key) {
                Some(serde_json::Value::String(s)) if !s.is_empty() => return s.clone(),
                Some(serde_json::Value::Array(items)) if !items.is_empty() => {
                    return items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                }
                _ => {}
            }
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("Request failed")
            .to_string()
    } else {
        trimmed.to_string()
    }
}
