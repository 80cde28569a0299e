//! Retry and dead-letter policy for failed deliveries.
//!
//! The broker does not count redeliveries for us. Every requeue carries a
//! retry counter in the `x-retry-count` header, and [`decide`] turns that
//! counter into either another requeue or a dead-letter.
//!
//! Backoff, when configured, is applied by the consumer itself before it
//! issues the requeue. Because the consumer never holds more than `prefetch`
//! deliveries, a sleeping delivery throttles the consumer instead of piling
//! up work.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of requeues before a message is dead-lettered.
pub const DEFAULT_RETRY_CEILING: u32 = 3;

/// Outcome of a failed processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the delivery with its counter set to `retry_count`.
    Requeue { retry_count: u32 },
    /// Stop retrying: reject without requeue.
    DeadLetter,
}

/// Decide what to do with a delivery that failed processing.
///
/// `retry_count` is the number of times the message has already been
/// requeued. A message is requeued while `retry_count < ceiling`, so an
/// always-failing message is requeued exactly `ceiling` times.
pub fn decide(retry_count: u32, ceiling: u32) -> RetryDecision {
    if retry_count < ceiling {
        RetryDecision::Requeue {
            retry_count: retry_count.saturating_add(1),
        }
    } else {
        RetryDecision::DeadLetter
    }
}

/// Delay strategy applied before a requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Requeue immediately.
    #[default]
    None,
    /// Wait the same delay before every requeue.
    Fixed {
        #[serde(rename = "delay_ms", with = "millis")]
        delay: Duration,
    },
    /// Double the delay on every retry, capped at `max`.
    Exponential {
        #[serde(rename = "base_ms", with = "millis")]
        base: Duration,
        #[serde(rename = "max_ms", with = "millis")]
        max: Duration,
    },
}

impl Backoff {
    /// Delay before the requeue that sets the counter to `retry_count`.
    ///
    /// `retry_count` is 1-based: the first retry waits `base`, the second
    /// `2 * base`, and so on.
    pub fn delay(&self, retry_count: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { base, max } => {
                let exponent = retry_count.saturating_sub(1).min(31);
                base.checked_mul(1 << exponent).unwrap_or(max).min(max)
            }
        }
    }
}

/// Retry ceiling plus backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub ceiling: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_RETRY_CEILING,
            backoff: Backoff::None,
        }
    }
}

impl RetryPolicy {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Apply [`decide`] with this policy's ceiling.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        decide(retry_count, self.ceiling)
    }

    /// Backoff delay for a [`RetryDecision::Requeue`].
    pub fn delay_for(&self, decision: RetryDecision) -> Duration {
        match decision {
            RetryDecision::Requeue { retry_count } => self.backoff.delay(retry_count),
            RetryDecision::DeadLetter => Duration::ZERO,
        }
    }
}

/// What happens to a rejected message when its queue has no dead-letter
/// exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterLossPolicy {
    /// The broker discards the message; the consumer logs the loss.
    #[default]
    Discard,
    /// Refuse topologies without a dead-letter destination.
    Require,
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
