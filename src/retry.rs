// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! Pure helpers behind the consumer's retry path: reading the attempt
//! counter a message carries, computing the exponential backoff before the
//! next attempt, and building the headers of the replacement message.

use crate::config::RetryConfig;
use lapin::types::{AMQPValue, FieldTable, LongInt, LongLongInt, LongString, ShortString};
use std::time::Duration;

/// Number of failed attempts already made for a message
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Error text of the most recent failed attempt
pub const AMQP_HEADERS_LAST_ERROR: &str = "x-last-error";
/// Unix seconds of the most recent failed attempt
pub const AMQP_HEADERS_LAST_RETRY: &str = "x-last-retry";

/// Extracts the retry count from message headers.
///
/// The counter travels as a 32-bit signed integer. A missing header, any
/// other value type or a negative value counts as zero.
pub fn retry_count(headers: &FieldTable) -> u32 {
    match headers.inner().get(AMQP_HEADERS_RETRY_COUNT) {
        Some(AMQPValue::LongInt(count)) => u32::try_from(*count).unwrap_or_default(),
        _ => 0,
    }
}

/// Backoff before retrying a message that failed `retry_count` times.
///
/// `retry_delay_base_secs * 2^retry_count` seconds, capped at
/// `max_retry_delay_secs`. The arithmetic saturates, so the result is
/// non-decreasing in `retry_count` and never above the cap.
pub fn retry_delay(retry_count: u32, cfg: &RetryConfig) -> Duration {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    let secs = cfg.retry_delay_base_secs.saturating_mul(factor);

    Duration::from_secs(secs.min(cfg.max_retry_delay_secs))
}

/// Retry metadata of the replacement message published for the next
/// attempt. The consumer layers these over the original headers.
pub fn retry_headers(next_count: u32, last_error: &str, retried_at_unix: i64) -> FieldTable {
    let mut headers = FieldTable::default();

    headers.insert(
        ShortString::from(AMQP_HEADERS_RETRY_COUNT),
        AMQPValue::LongInt(LongInt::try_from(next_count).unwrap_or(LongInt::MAX)),
    );
    headers.insert(
        ShortString::from(AMQP_HEADERS_LAST_ERROR),
        AMQPValue::LongString(LongString::from(last_error.to_owned())),
    );
    headers.insert(
        ShortString::from(AMQP_HEADERS_LAST_RETRY),
        AMQPValue::LongLongInt(LongLongInt::from(retried_at_unix)),
    );

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(base: u64, max: u64) -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            retry_delay_base_secs: base,
            max_retry_delay_secs: max,
        }
    }

    #[test]
    fn missing_header_counts_as_zero() {
        assert_eq!(retry_count(&FieldTable::default()), 0);
    }

    #[test]
    fn stored_count_is_returned() {
        let headers = retry_headers(2, "boom", 1_700_000_000);
        assert_eq!(retry_count(&headers), 2);
    }

    #[test]
    fn unexpected_types_count_as_zero() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongString(LongString::from("3")),
        );
        assert_eq!(retry_count(&headers), 0);

        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongInt(-4),
        );
        assert_eq!(retry_count(&headers), 0);
    }

    #[test]
    fn delay_doubles_until_capped() {
        let cfg = cfg(2, 60);
        let delays: Vec<u64> = (0..7).map(|n| retry_delay(n, &cfg).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn delay_is_monotonic_and_bounded() {
        for (base, max) in [(0, 10), (1, 1), (3, 100), (7, 3600), (u64::MAX, 30)] {
            let cfg = cfg(base, max);
            let mut previous = Duration::ZERO;
            for n in 0..200 {
                let delay = retry_delay(n, &cfg);
                assert!(delay >= previous, "base {base} max {max} count {n}");
                assert!(delay <= Duration::from_secs(max));
                previous = delay;
            }
        }
    }

    #[test]
    fn retry_headers_replace_metadata() {
        let headers = retry_headers(1, "handler exploded", 42);

        assert_eq!(headers.inner().len(), 3);
        assert_eq!(
            headers.inner().get(AMQP_HEADERS_LAST_RETRY),
            Some(&AMQPValue::LongLongInt(42))
        );
        match headers.inner().get(AMQP_HEADERS_LAST_ERROR) {
            Some(AMQPValue::LongString(v)) => assert_eq!(v.as_bytes(), b"handler exploded"),
            other => panic!("unexpected x-last-error {other:?}"),
        }
    }
}
