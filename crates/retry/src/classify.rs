//! Stable classification of errors into retryable vs. permanent, shared by
//! the refresh path and the upstream HTTP client.

/// Whether a loop should keep retrying after this error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Permanent,
}

/// The shape of error an `isRetryable` check is asked to classify.
#[derive(Debug, Clone)]
pub enum Failure {
    /// Connection refused, timed out, reset, or DNS resolution failure.
    Transport,
    /// An HTTP response with no successful status.
    Http { status: u16 },
    /// An identity-provider error code from a JSON error body (e.g.
    /// `temporarily_unavailable`, `invalid_grant`, `token_revoked`).
    ProviderCode(String),
}

/// Classifies a failure. The same input always maps to the same output —
/// classification never depends on retry-loop state.
pub fn classify(failure: &Failure) -> Classification {
    match failure {
        Failure::Transport => Classification::Retryable,
        Failure::Http { status } => match status {
            408 | 429 => Classification::Retryable,
            s if (500..600).contains(s) => Classification::Retryable,
            _ => Classification::Permanent,
        },
        Failure::ProviderCode(code) => match code.as_str() {
            "temporarily_unavailable" => Classification::Retryable,
            "invalid_grant" | "token_revoked" => Classification::Permanent,
            _ => Classification::Permanent,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_retryable() {
        assert_eq!(classify(&Failure::Transport), Classification::Retryable);
    }

    #[test]
    fn server_errors_are_retryable() {
        for status in [500, 502, 503, 504] {
            assert_eq!(classify(&Failure::Http { status }), Classification::Retryable);
        }
    }

    #[test]
    fn rate_limit_and_timeout_are_retryable() {
        assert_eq!(classify(&Failure::Http { status: 429 }), Classification::Retryable);
        assert_eq!(classify(&Failure::Http { status: 408 }), Classification::Retryable);
    }

    #[test]
    fn other_4xx_are_permanent() {
        assert_eq!(classify(&Failure::Http { status: 400 }), Classification::Permanent);
        assert_eq!(classify(&Failure::Http { status: 404 }), Classification::Permanent);
    }

    #[test]
    fn temporarily_unavailable_is_retryable() {
        assert_eq!(
            classify(&Failure::ProviderCode("temporarily_unavailable".to_string())),
            Classification::Retryable
        );
    }

    #[test]
    fn invalid_grant_and_token_revoked_are_permanent() {
        assert_eq!(classify(&Failure::ProviderCode("invalid_grant".to_string())), Classification::Permanent);
        assert_eq!(classify(&Failure::ProviderCode("token_revoked".to_string())), Classification::Permanent);
    }

    #[test]
    fn classification_is_stable_regardless_of_surrounding_context() {
        let a = classify(&Failure::ProviderCode("invalid_grant".to_string()));
        let b = classify(&Failure::ProviderCode("invalid_grant".to_string()));
        assert_eq!(a, b);
    }
}
