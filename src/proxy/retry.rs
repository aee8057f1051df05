//! Failover bookkeeping for chat completions.
//!
//! - Classifying upstream status codes into key/provider outcomes
//! - Reading `Retry-After` for throttled keys
//! - Header formatting for `x-keyrelay-retries`

use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

use crate::router::CallStatus;
use crate::types::Provider;

/// Longest `Retry-After` honoured for a throttled key.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Record of a single failed attempt for building the `x-keyrelay-retries` header.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub provider: Provider,
    pub status_code: u16,
}

/// Whether an HTTP status code should trigger failover to another provider.
///
/// Returns `true` for 500, 502, 503, 504 (server errors that are typically transient).
pub fn is_retryable(status_code: u16) -> bool {
    matches!(status_code, 500 | 502 | 503 | 504)
}

/// Map a non-success upstream status to the outcome it implies.
pub fn classify_status(status_code: u16, headers: &HeaderMap) -> CallStatus {
    match status_code {
        429 => CallStatus::Throttled {
            retry_after: parse_retry_after(headers),
        },
        401 | 403 => CallStatus::Rejected,
        code if is_retryable(code) => CallStatus::Failed,
        _ => CallStatus::Refused,
    }
}

/// Whether another attempt may succeed after `status`.
pub fn should_failover(status: CallStatus) -> bool {
    matches!(
        status,
        CallStatus::Throttled { .. } | CallStatus::Rejected | CallStatus::Failed
    )
}

/// Parse `Retry-After` given in seconds. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// Format attempt records into the `x-keyrelay-retries` header value.
///
/// Format: `"2/openai, 1/anthropic"` -- count of failed attempts per
/// provider, preserving first-appearance order.
///
/// Returns `None` if the attempts slice is empty (no retries occurred).
pub fn format_retries_header(attempts: &[AttemptRecord]) -> Option<String> {
    if attempts.is_empty() {
        return None;
    }
    let mut counts: Vec<(Provider, u32)> = Vec::new();
    for attempt in attempts {
        if let Some(entry) = counts.iter_mut().find(|(p, _)| *p == attempt.provider) {
            entry.1 += 1;
        } else {
            counts.push((attempt.provider, 1));
        }
    }
    Some(
        counts
            .iter()
            .map(|(provider, count)| format!("{}/{}", count, provider))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_is_retryable() {
        for code in [500, 502, 503, 504] {
            assert!(is_retryable(code), "{} should be retryable", code);
        }
        for code in [400, 401, 404, 429, 501] {
            assert!(!is_retryable(code), "{} should not be retryable", code);
        }
    }

    #[test]
    fn test_classify_status() {
        let empty = HeaderMap::new();
        assert_eq!(classify_status(401, &empty), CallStatus::Rejected);
        assert_eq!(classify_status(403, &empty), CallStatus::Rejected);
        assert_eq!(classify_status(503, &empty), CallStatus::Failed);
        assert_eq!(classify_status(400, &empty), CallStatus::Refused);
        assert_eq!(classify_status(501, &empty), CallStatus::Refused);
        assert_eq!(
            classify_status(429, &empty),
            CallStatus::Throttled { retry_after: None }
        );

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(
            classify_status(429, &headers),
            CallStatus::Throttled {
                retry_after: Some(Duration::from_secs(12))
            }
        );
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("999999"));
        assert_eq!(parse_retry_after(&headers), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_should_failover() {
        assert!(should_failover(CallStatus::Failed));
        assert!(should_failover(CallStatus::Rejected));
        assert!(!should_failover(CallStatus::Refused));
        assert!(!should_failover(CallStatus::Success));
    }

    #[test]
    fn test_format_retries_header() {
        assert_eq!(format_retries_header(&[]), None);

        let attempts = vec![
            AttemptRecord {
                provider: Provider::OpenAi,
                status_code: 503,
            },
            AttemptRecord {
                provider: Provider::Anthropic,
                status_code: 429,
            },
            AttemptRecord {
                provider: Provider::OpenAi,
                status_code: 502,
            },
        ];
        assert_eq!(
            format_retries_header(&attempts).as_deref(),
            Some("2/openai, 1/anthropic")
        );
    }
}
