//! Republish decision for failed task deliveries.
//!
//! Retries ride the broker: a failed message is republished to the retry
//! exchange with a per-message expiration, and the broker's dead-letter
//! machinery routes it back to the work queue once the delay elapses. The
//! broker stamps each pass through that cycle into the `x-death` header, so
//! the previous delay can be read off the message itself and the engine keeps
//! no per-task state between deliveries.
//!
//! [`decide`] is a pure function from a delivery's headers to the next move:
//! give up, or republish with a doubled delay and an incremented counter.

use lapin::types::{AMQPValue, FieldTable};

/// Maximum number of trips through the retry cycle before a task is dropped.
pub const MAX_RETRIES: i32 = 6;

/// Delay before the first redelivery: 15 minutes.
pub const INITIAL_DELAY_MS: u64 = 15 * 60 * 1000;

/// Header carrying the engine-maintained retry counter.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Broker-stamped dead-letter trace; the head's `original-expiration` is the
/// previous delay in milliseconds.
pub const DEATH_HEADER: &str = "x-death";

/// Outcome of the retry policy for one failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The retry budget is exhausted; acknowledge and drop the task.
    GiveUp,

    /// Republish to the retry exchange with this expiration and counter.
    Republish { delay_ms: u64, retry_count: i32 },
}

/// Decide what to do with a delivery whose handler failed.
///
/// The projected counter is the prior `x-retry-count` plus one (one when the
/// header is absent). Past [`MAX_RETRIES`] the task is dropped. The delay is
/// double the previous expiration recorded in `x-death`, or
/// [`INITIAL_DELAY_MS`] when the message has not been through the cycle yet.
pub fn decide(headers: Option<&FieldTable>) -> RetryDecision {
    let retry_count = prior_retry_count(headers) + 1;
    if retry_count > MAX_RETRIES {
        return RetryDecision::GiveUp;
    }

    let delay_ms = match previous_delay_ms(headers) {
        Some(prev) => prev * 2,
        None => INITIAL_DELAY_MS,
    };

    RetryDecision::Republish {
        delay_ms,
        retry_count,
    }
}

/// True when the delivery has never been republished for retry.
///
/// The approved-decision e-mail must go out at most once per delivery chain;
/// an absent `x-retry-count` header is the first-attempt witness.
pub fn is_first_attempt(headers: Option<&FieldTable>) -> bool {
    header(headers, RETRY_COUNT_HEADER).is_none()
}

/// Headers for a republished message: the incremented retry counter.
pub fn retry_headers(retry_count: i32) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongInt(retry_count));
    headers
}

fn header<'a>(headers: Option<&'a FieldTable>, name: &str) -> Option<&'a AMQPValue> {
    headers?
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)
}

fn prior_retry_count(headers: Option<&FieldTable>) -> i32 {
    match header(headers, RETRY_COUNT_HEADER) {
        Some(AMQPValue::LongInt(count)) => *count,
        Some(AMQPValue::LongLongInt(count)) => *count as i32,
        _ => 0,
    }
}

fn previous_delay_ms(headers: Option<&FieldTable>) -> Option<u64> {
    let AMQPValue::FieldArray(deaths) = header(headers, DEATH_HEADER)? else {
        return None;
    };
    let AMQPValue::FieldTable(head) = deaths.as_slice().first()? else {
        return None;
    };
    let expiration = head
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "original-expiration")
        .map(|(_, value)| value)?;
    let AMQPValue::LongString(expiration) = expiration else {
        return None;
    };
    std::str::from_utf8(expiration.as_bytes()).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::FieldArray;

    fn headers_with(retry_count: Option<i32>, original_expiration: Option<&str>) -> FieldTable {
        let mut headers = FieldTable::default();
        if let Some(count) = retry_count {
            headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongInt(count));
        }
        if let Some(expiration) = original_expiration {
            let mut death = FieldTable::default();
            death.insert(
                "original-expiration".into(),
                AMQPValue::LongString(expiration.into()),
            );
            headers.insert(
                DEATH_HEADER.into(),
                AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(death)])),
            );
        }
        headers
    }

    #[test]
    fn first_failure_uses_initial_delay() {
        assert_eq!(
            decide(None),
            RetryDecision::Republish {
                delay_ms: INITIAL_DELAY_MS,
                retry_count: 1,
            }
        );
    }

    #[test]
    fn delay_doubles_from_death_trace() {
        let headers = headers_with(Some(1), Some("900000"));
        assert_eq!(
            decide(Some(&headers)),
            RetryDecision::Republish {
                delay_ms: 1_800_000,
                retry_count: 2,
            }
        );
    }

    #[test]
    fn counter_increments_by_exactly_one() {
        for prior in 0..MAX_RETRIES {
            let headers = headers_with(Some(prior), Some("900000"));
            match decide(Some(&headers)) {
                RetryDecision::Republish { retry_count, .. } => {
                    assert_eq!(retry_count, prior + 1)
                }
                RetryDecision::GiveUp => panic!("gave up at prior count {prior}"),
            }
        }
    }

    #[test]
    fn gives_up_past_max_retries() {
        let headers = headers_with(Some(MAX_RETRIES), Some("28800000"));
        assert_eq!(decide(Some(&headers)), RetryDecision::GiveUp);
    }

    #[test]
    fn delay_sequence_doubles_from_fifteen_minutes() {
        // Walk the whole chain the way the broker would feed it back
        let mut expected_delay = INITIAL_DELAY_MS;
        let mut headers: Option<FieldTable> = None;

        for attempt in 1..=MAX_RETRIES {
            match decide(headers.as_ref()) {
                RetryDecision::Republish {
                    delay_ms,
                    retry_count,
                } => {
                    assert_eq!(delay_ms, expected_delay);
                    assert_eq!(retry_count, attempt);
                    headers = Some(headers_with(Some(retry_count), Some(&delay_ms.to_string())));
                    expected_delay *= 2;
                }
                RetryDecision::GiveUp => panic!("gave up at attempt {attempt}"),
            }
        }

        // 15 min doubled five times lands at 8 h; the seventh decision drops
        assert_eq!(expected_delay, 28_800_000 * 2);
        assert_eq!(decide(headers.as_ref()), RetryDecision::GiveUp);
    }

    #[test]
    fn unparseable_expiration_falls_back_to_initial_delay() {
        let headers = headers_with(Some(2), Some("soon"));
        assert_eq!(
            decide(Some(&headers)),
            RetryDecision::Republish {
                delay_ms: INITIAL_DELAY_MS,
                retry_count: 3,
            }
        );
    }

    #[test]
    fn missing_death_trace_falls_back_to_initial_delay() {
        let headers = headers_with(Some(3), None);
        assert_eq!(
            decide(Some(&headers)),
            RetryDecision::Republish {
                delay_ms: INITIAL_DELAY_MS,
                retry_count: 4,
            }
        );
    }

    #[test]
    fn first_attempt_witness() {
        assert!(is_first_attempt(None));
        assert!(is_first_attempt(Some(&FieldTable::default())));
        let headers = headers_with(Some(1), None);
        assert!(!is_first_attempt(Some(&headers)));
    }

    #[test]
    fn retry_headers_carry_counter() {
        let headers = retry_headers(4);
        assert_eq!(prior_retry_count(Some(&headers)), 4);
    }
}
