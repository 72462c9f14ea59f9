use std::time::Duration;

/// Failures of an agent's `generate` capability.
/// Classifies errors as retryable at the round level or not.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AgentError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Backend(_) | Self::RateLimited { .. } | Self::StreamInterrupted(_) | Self::Timeout(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging and error chunks.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Backend(_) => "backend",
            Self::RateLimited { .. } => "rate_limited",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(AgentError::Backend("502".into()).is_retryable());
        assert!(AgentError::RateLimited { retry_after: None }.is_retryable());
        assert!(AgentError::StreamInterrupted("eof".into()).is_retryable());
        assert!(AgentError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!AgentError::InvalidRequest("bad".into()).is_retryable());
        assert!(!AgentError::Cancelled.is_retryable());
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = AgentError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(5)));
        assert_eq!(AgentError::Backend("x".into()).suggested_delay(), None);
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(AgentError::Cancelled.error_kind(), "cancelled");
        assert_eq!(AgentError::Timeout(Duration::ZERO).error_kind(), "timeout");
    }
}
