//! Fetch-with-retry: one logical request that may retry transparently.
//!
//! Retries happen only on HTTP 429, HTTP 5xx, or a transport failure
//! (including a per-attempt timeout). Any other status fails immediately.
//! Backoff honours `Retry-After` (delta-seconds or HTTP date) when present,
//! otherwise `base_delay * 2^attempt`. The result never escalates: after
//! the last attempt the caller gets `ok = false` with the last status and
//! error.

pub mod transport;

pub use transport::{HttpResponse, HttpTransport, ReqwestTransport, ScriptedTransport, TransportError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Retry knobs for one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Time box for each individual attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Blocking pause between attempts.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested sleeps without blocking.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }
}

/// Why the last attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("HTTP_{status}")]
    Http { status: u16 },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Upstream telemetry for one logical request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Upstream {
    pub http_status: Option<u16>,
    /// Wall clock across all attempts, sleeps included.
    pub latency_ms: u64,
    pub retry_count: u32,
    /// Sticky: true once any attempt saw a 429.
    pub rate_limited: bool,
}

/// Result of [`fetch_with_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub ok: bool,
    pub status: Option<u16>,
    pub body: String,
    pub error: Option<FetchError>,
    /// `Retry-After` of the last response, in seconds, when it carried one.
    pub retry_after_secs: Option<u64>,
    pub upstream: Upstream,
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Parse a `Retry-After` value: positive delta-seconds, or an HTTP date in
/// the future (rounded up to whole seconds).
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return (secs.is_finite() && secs > 0.0).then(|| secs.ceil() as u64);
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let wait_ms = at.with_timezone(&Utc).signed_duration_since(now).num_milliseconds();
    (wait_ms > 0).then(|| (wait_ms as u64).div_ceil(1000))
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(20))
}

/// Perform one logical GET with bounded retry.
pub fn fetch_with_retry(
    transport: &dyn HttpTransport,
    sleeper: &dyn Sleeper,
    url: &str,
    headers: &[(&str, &str)],
    policy: &RetryPolicy,
) -> FetchOutcome {
    let started = Instant::now();
    let mut retry_count = 0u32;
    let mut rate_limited = false;
    let mut attempt = 0u32;

    loop {
        let (delay, failure) = match transport.get(url, headers, policy.timeout) {
            Ok(resp) if resp.is_success() => {
                return FetchOutcome {
                    ok: true,
                    status: Some(resp.status),
                    body: resp.body,
                    error: None,
                    retry_after_secs: None,
                    upstream: Upstream {
                        http_status: Some(resp.status),
                        latency_ms: elapsed_ms(started),
                        retry_count,
                        rate_limited,
                    },
                };
            }
            Ok(resp) => {
                if resp.status == 429 {
                    rate_limited = true;
                }
                let retry_after = resp
                    .header("retry-after")
                    .and_then(|v| parse_retry_after(v, Utc::now()));
                let delay = retry_after
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| backoff(policy.base_delay, attempt));
                let failure = FetchOutcome {
                    ok: false,
                    status: Some(resp.status),
                    body: resp.body,
                    error: Some(FetchError::Http {
                        status: resp.status,
                    }),
                    retry_after_secs: retry_after,
                    upstream: Upstream::default(),
                };
                if !is_retryable_status(resp.status) {
                    return finish(failure, started, retry_count, rate_limited);
                }
                (delay, failure)
            }
            Err(e) => {
                let failure = FetchOutcome {
                    ok: false,
                    status: None,
                    body: String::new(),
                    error: Some(FetchError::Transport(e)),
                    retry_after_secs: None,
                    upstream: Upstream::default(),
                };
                (backoff(policy.base_delay, attempt), failure)
            }
        };

        if attempt >= policy.max_retries {
            return finish(failure, started, retry_count, rate_limited);
        }

        retry_count += 1;
        debug!(
            url = %redact(url),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = ?failure.error,
            "retrying request"
        );
        sleeper.sleep(delay);
        attempt += 1;
    }
}

fn finish(
    mut outcome: FetchOutcome,
    started: Instant,
    retry_count: u32,
    rate_limited: bool,
) -> FetchOutcome {
    outcome.upstream = Upstream {
        http_status: outcome.status,
        latency_ms: elapsed_ms(started),
        retry_count,
        rate_limited,
    };
    outcome
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Strip the query string so API tokens never reach the logs.
pub fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// Header map helper for callers building request headers.
pub fn header_pairs(headers: &BTreeMap<String, String>) -> Vec<(&str, &str)> {
    headers
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn retry_after_seconds_is_honoured_exactly() {
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::new(429, "slow down").with_header("Retry-After", "2")),
            Ok(HttpResponse::new(200, "[]")),
        ]);
        let sleeper = RecordingSleeper::new();

        let out = fetch_with_retry(&transport, &sleeper, "https://x/eod", &[], &policy(3));

        assert!(out.ok);
        assert_eq!(out.body, "[]");
        assert_eq!(sleeper.sleeps(), vec![Duration::from_millis(2000)]);
        assert_eq!(out.upstream.retry_count, 1);
        assert!(out.upstream.rate_limited);
        assert_eq!(out.upstream.http_status, Some(200));
    }

    #[test]
    fn exhausted_retries_return_last_status() {
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::new(500, "")),
            Ok(HttpResponse::new(500, "")),
            Ok(HttpResponse::new(500, "")),
            Ok(HttpResponse::new(200, "late")),
        ]);
        let sleeper = RecordingSleeper::new();

        let out = fetch_with_retry(&transport, &sleeper, "https://x", &[], &policy(2));

        assert!(!out.ok);
        assert_eq!(out.status, Some(500));
        assert_eq!(out.upstream.http_status, Some(500));
        assert_eq!(out.upstream.retry_count, 2);
        assert_eq!(out.error, Some(FetchError::Http { status: 500 }));
        assert_eq!(transport.call_count(), 3, "no fourth attempt");
        assert_eq!(
            sleeper.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn client_errors_fail_without_retry() {
        let transport = ScriptedTransport::new(vec![Ok(HttpResponse::new(404, "nope"))]);
        let sleeper = RecordingSleeper::new();

        let out = fetch_with_retry(&transport, &sleeper, "https://x", &[], &policy(3));

        assert!(!out.ok);
        assert_eq!(out.status, Some(404));
        assert_eq!(out.body, "nope");
        assert_eq!(out.upstream.retry_count, 0);
        assert!(sleeper.sleeps().is_empty());
        assert_eq!(transport.call_count(), 1);
    }

    #[test]
    fn timeouts_are_retried_as_network_failures() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout("attempt exceeded 1s".into())),
            Ok(HttpResponse::new(200, "ok")),
        ]);
        let sleeper = RecordingSleeper::new();

        let out = fetch_with_retry(&transport, &sleeper, "https://x", &[], &policy(3));

        assert!(out.ok);
        assert_eq!(out.upstream.retry_count, 1);
        assert!(!out.upstream.rate_limited);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_millis(100)]);
    }

    #[test]
    fn final_transport_failure_has_no_status() {
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::new(503, "")),
            Err(TransportError::Network("connection reset".into())),
        ]);
        let sleeper = RecordingSleeper::new();

        let out = fetch_with_retry(&transport, &sleeper, "https://x", &[], &policy(1));

        assert!(!out.ok);
        assert_eq!(out.status, None);
        assert!(matches!(out.error, Some(FetchError::Transport(_))));
        assert_eq!(out.upstream.retry_count, 1);
    }

    #[test]
    fn rate_limited_flag_is_sticky() {
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::new(429, "")),
            Ok(HttpResponse::new(502, "")),
            Ok(HttpResponse::new(200, "")),
        ]);
        let sleeper = RecordingSleeper::new();

        let out = fetch_with_retry(&transport, &sleeper, "https://x", &[], &policy(3));

        assert!(out.ok);
        assert!(out.upstream.rate_limited);
        assert_eq!(out.upstream.retry_count, 2);
    }

    #[test]
    fn retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        assert_eq!(
            parse_retry_after("Sun, 18 Oct 2026 12:00:05 GMT", now),
            Some(5)
        );
        assert_eq!(parse_retry_after("Sun, 18 Oct 2026 11:59:00 GMT", now), None);
        assert_eq!(parse_retry_after("0", now), None);
        assert_eq!(parse_retry_after("1.5", now), Some(2));
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn redact_drops_query() {
        assert_eq!(
            redact("https://eodhd.com/api/eod/AAPL.US?api_token=secret"),
            "https://eodhd.com/api/eod/AAPL.US"
        );
    }
}
