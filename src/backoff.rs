//! Retry backoff policy for the message queues.
//!
//! Pure functions only - no I/O, no shared state. Inbound retries are more
//! aggressive than outbound ones because they sit in front of the user.

use crate::types::QueueKind;

/// Maximum retry attempts before a message is dead-lettered.
pub const MAX_RETRIES: u32 = 5;

/// Inbound backoff delays in milliseconds, indexed by retry count (1-based).
const INBOUND_BACKOFF_MS: [i64; 5] = [
    1_000,   // retry 1: 1s
    5_000,   // retry 2: 5s
    25_000,  // retry 3: 25s
    120_000, // retry 4: 2m
    600_000, // retry 5: 10m
];

/// Outbound backoff delays in milliseconds, indexed by retry count (1-based).
const OUTBOUND_BACKOFF_MS: [i64; 5] = [
    5_000,   // retry 1: 5s
    25_000,  // retry 2: 25s
    120_000, // retry 3: 2m
    600_000, // retry 4: 10m
    600_000, // retry 5: 10m (repeat cap)
];

/// Compute the backoff delay in ms for a given retry count.
///
/// Retry counts at or past the end of the ladder get the final (capped) delay.
pub fn compute_backoff_ms(kind: QueueKind, retry_count: u32) -> i64 {
    if retry_count == 0 {
        return 0;
    }
    let delays = match kind {
        QueueKind::Inbound => &INBOUND_BACKOFF_MS,
        QueueKind::Outbound => &OUTBOUND_BACKOFF_MS,
    };
    let index = (retry_count as usize - 1).min(delays.len() - 1);
    delays[index]
}

/// Compute the next retry timestamp (epoch ms).
pub fn compute_next_retry_at(kind: QueueKind, retry_count: u32, now_ms: i64) -> i64 {
    now_ms + compute_backoff_ms(kind, retry_count)
}

/// Whether another retry is allowed, or the message should be dead-lettered.
pub fn should_retry(retry_count: u32, max_retries: u32) -> bool {
    retry_count < max_retries
}

/// Whether a scheduled retry is due. A record with no schedule is always due.
pub fn is_retry_due(next_retry_at: Option<i64>, now_ms: i64) -> bool {
    match next_retry_at {
        Some(at) => now_ms >= at,
        None => true,
    }
}
