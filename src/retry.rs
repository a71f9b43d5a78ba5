// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Decision Engine
//!
//! Decides what happens to a delivery after domain processing: acknowledge it,
//! reject it into the delayed-retry loop, or escalate it to the dead-letter
//! exchange.
//!
//! The number of attempts already made is never stored by the application.
//! It is read from the `x-death` header the broker maintains each time it
//! dead-letters the message, so a restarted consumer sees exactly the same
//! count as the one that crashed.

use lapin::types::{AMQPValue, FieldTable};

/// Header the broker appends to a message each time it is dead-lettered
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Number of times the message was dead-lettered for one `(queue, reason)` pair
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Queue the message was dead-lettered from
pub const AMQP_HEADERS_QUEUE: &str = "queue";
/// Why the message was dead-lettered (`rejected`, `expired`, `maxlen`, ...)
pub const AMQP_HEADERS_REASON: &str = "reason";
/// Reason recorded for a `basic.nack`/`basic.reject` with `requeue=false`
pub const X_DEATH_REASON_REJECTED: &str = "rejected";

/// Retries allowed before a failing message is escalated.
pub const MAX_RETRIES: u32 = 3;

/// What to do with a delivery once its handler has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Processing succeeded: acknowledge and drop the message.
    Ack,
    /// Processing failed with retries left: reject without requeue so the
    /// broker routes it through the delay queue. `attempt` is the 1-based
    /// retry about to be scheduled.
    Retry { attempt: u32, max: u32 },
    /// Processing failed and the retry budget is spent: publish to the
    /// dead-letter exchange, then acknowledge.
    DeadLetter { attempts: u32 },
}

/// Bounded retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        RetryPolicy { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Maps a processing outcome and the attempts already recorded for the
    /// message to a verdict.
    ///
    /// With the default budget of 3 the fourth delivery, the one that arrives
    /// with 3 recorded retries, is escalated.
    pub fn decide<E>(&self, outcome: &Result<(), E>, attempts: u32) -> Verdict {
        match outcome {
            Ok(()) => Verdict::Ack,
            Err(_) if attempts >= self.max_retries => Verdict::DeadLetter { attempts },
            Err(_) => Verdict::Retry {
                attempt: attempts.saturating_add(1),
                max: self.max_retries,
            },
        }
    }
}

/// Number of retries already recorded for a message consumed from `queue`.
///
/// Sums the `count` of every `x-death` entry recording a rejection from
/// `queue`. The broker folds repeated deaths for the same queue and reason
/// into one entry, so counting entries alone would undercount. Entries that
/// do not name a queue or reason are counted, and entries without `count`
/// weigh 1. Missing or malformed headers mean a first delivery.
pub fn attempt_count(headers: Option<&FieldTable>, queue: &str) -> u32 {
    let Some(deaths) = headers
        .and_then(|h| h.inner().get(AMQP_HEADERS_X_DEATH))
        .and_then(AMQPValue::as_array)
    else {
        return 0;
    };

    deaths
        .as_slice()
        .iter()
        .filter_map(AMQPValue::as_field_table)
        .filter(|entry| is_rejection_from(entry, queue))
        .map(death_count)
        .fold(0u32, u32::saturating_add)
}

fn is_rejection_from(entry: &FieldTable, queue: &str) -> bool {
    let matches = |key: &str, expected: &str| match entry.inner().get(key) {
        Some(value) => text(value).is_some_and(|v| v == expected),
        None => true,
    };

    matches(AMQP_HEADERS_QUEUE, queue) && matches(AMQP_HEADERS_REASON, X_DEATH_REASON_REJECTED)
}

fn death_count(entry: &FieldTable) -> u32 {
    let count = match entry.inner().get(AMQP_HEADERS_COUNT) {
        Some(AMQPValue::LongLongInt(v)) => *v,
        Some(AMQPValue::LongInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortInt(v)) => i64::from(*v),
        Some(AMQPValue::LongUInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortUInt(v)) => i64::from(*v),
        _ => 1,
    };

    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}

fn text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        _ => None,
    }
}
