//! Generic message queue over a storage backend.
//!
//! The inbound and outbound queues are the same machine parameterized by
//! message type: enqueue persists before anything else happens, ack deletes,
//! fail reschedules with backoff until the retry budget runs out, at which
//! point the message is dead-lettered.

use ulid::Ulid;

use crate::backoff::{compute_backoff_ms, compute_next_retry_at, should_retry, MAX_RETRIES};
use crate::error::Result;
use crate::storage::StorageBackend;
use crate::types::{now_ms, DeadLetterMessage, QueueMetrics, QueueRecord};

/// Persistent queue for one message kind.
pub struct MessageQueue<M: QueueRecord> {
    backend: Box<dyn StorageBackend<M>>,
    max_retries: u32,
}

impl<M: QueueRecord> MessageQueue<M> {
    pub fn new(backend: Box<dyn StorageBackend<M>>) -> Self {
        Self::with_max_retries(backend, MAX_RETRIES)
    }

    pub fn with_max_retries(backend: Box<dyn StorageBackend<M>>, max_retries: u32) -> Self {
        Self {
            backend,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Persist a new message and return its id.
    ///
    /// A storage error propagates: enqueue never reports success for a write
    /// that did not durably land.
    pub fn enqueue(&self, params: M::Params) -> Result<String> {
        let id = Ulid::new().to_string();
        let message = M::from_params(id.clone(), now_ms(), params);
        self.backend.create(&message)?;
        tracing::debug!("Enqueued {} message {}", M::KIND, id);
        Ok(id)
    }

    /// Acknowledge successful processing - removes the record.
    ///
    /// Acking an unknown id is a caller bug and surfaces as `Error::NotFound`.
    pub fn ack(&self, id: &str) -> Result<()> {
        self.backend.delete(id)?;
        tracing::debug!("Acked {} message {}", M::KIND, id);
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// Increments the retry count and reschedules via the backoff curve; once
    /// the count reaches the retry budget the message is dead-lettered instead.
    /// The increment is computed inside the backend's read-modify-write so a
    /// concurrent failure report on the same record is never overwritten.
    pub fn fail(&self, id: &str, error: &str) -> Result<()> {
        let mut new_retry_count = 0;
        let mut rescheduled_at = None;
        self.backend.update(id, &mut |m| {
            new_retry_count = m.retry_count() + 1;
            if should_retry(new_retry_count, self.max_retries) {
                let next_retry_at = compute_next_retry_at(M::KIND, new_retry_count, now_ms());
                m.record_failure(new_retry_count, next_retry_at, error);
                rescheduled_at = Some(next_retry_at);
            }
        })?;

        match rescheduled_at {
            Some(next_retry_at) => {
                tracing::debug!(
                    "Failed {} message {} (retry {}/{}, next attempt at {})",
                    M::KIND,
                    id,
                    new_retry_count,
                    self.max_retries,
                    next_retry_at
                );
            }
            None => {
                self.backend.move_to_dead_letter(id, error)?;
                tracing::warn!(
                    "Dead-lettered {} message {} after {} retries: {}",
                    M::KIND,
                    id,
                    new_retry_count - 1,
                    error
                );
            }
        }
        Ok(())
    }

    /// Terminal transition to the dead-letter set, independent of the retry
    /// budget. Used when an error is known to be non-retryable.
    pub fn move_to_failed(&self, id: &str, reason: &str) -> Result<()> {
        self.backend.move_to_dead_letter(id, reason)?;
        tracing::warn!("Dead-lettered {} message {}: {}", M::KIND, id, reason);
        Ok(())
    }

    /// All pending messages, FIFO by enqueue time.
    pub fn load_pending(&self) -> Result<Vec<M>> {
        self.backend.list_pending()
    }

    /// All dead-lettered messages, oldest first.
    pub fn load_dead_letters(&self) -> Result<Vec<DeadLetterMessage>> {
        self.backend.list_dead_letters()
    }

    /// Backoff delay for a given retry count, so callers can decide whether a
    /// message is worth touching yet.
    pub fn compute_backoff(&self, retry_count: u32) -> i64 {
        compute_backoff_ms(M::KIND, retry_count)
    }

    /// Point-in-time counters, recomputed from the backend.
    pub fn metrics(&self) -> Result<QueueMetrics> {
        let recorded_at = now_ms();
        let pending = self.backend.list_pending()?;
        let oldest_pending_age_ms = pending.first().map(|m| recorded_at - m.enqueued_at());
        Ok(QueueMetrics {
            recorded_at,
            pending: pending.len(),
            dead_lettered: self.backend.count_dead_letters()?,
            oldest_pending_age_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::FileBackend;
    use crate::types::{InboundMessage, InboundParams, QueueRecord};
    use std::cell::Cell;
    use tempfile::TempDir;

    fn queue(temp: &TempDir) -> MessageQueue<InboundMessage> {
        let backend = FileBackend::<InboundMessage>::new(temp.path()).unwrap();
        MessageQueue::new(Box::new(backend))
    }

    fn params(session: &str) -> InboundParams {
        InboundParams {
            session_id: session.to_string(),
            channel: "telegram".to_string(),
            from_address: "12345".to_string(),
            chat_id: None,
            chat_type: None,
            body: Some("hello".to_string()),
            media_urls: None,
            metadata: None,
        }
    }

    #[test]
    fn test_enqueue_then_load_pending() {
        let temp = TempDir::new().unwrap();
        let queue = queue(&temp);

        let id = queue.enqueue(params("s1")).unwrap();
        let pending = queue.load_pending().unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), id);
        assert_eq!(pending[0].retry_count(), 0);
    }

    #[test]
    fn test_ack_removes_record() {
        let temp = TempDir::new().unwrap();
        let queue = queue(&temp);

        let id = queue.enqueue(params("s1")).unwrap();
        queue.ack(&id).unwrap();

        assert!(queue.load_pending().unwrap().is_empty());
        assert!(matches!(queue.ack(&id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_fail_reschedules_until_budget_exhausted() {
        let temp = TempDir::new().unwrap();
        let queue = queue(&temp);
        let id = queue.enqueue(params("s1")).unwrap();

        // max_retries - 1 failures keep the message pending.
        for attempt in 1..MAX_RETRIES {
            queue.fail(&id, "transient").unwrap();
            let pending = queue.load_pending().unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].retry_count(), attempt);
            assert!(pending[0].next_retry_at().is_some());
        }

        // The final failure dead-letters instead of rescheduling.
        queue.fail(&id, "still broken").unwrap();
        assert!(queue.load_pending().unwrap().is_empty());

        let letters = queue.load_dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].id, id);
        assert_eq!(letters[0].reason, "still broken");
        assert_eq!(letters[0].retry_count, MAX_RETRIES - 1);
    }

    /// Backend that injects a rival worker's failure report on the same
    /// record just before the first update lands.
    struct ContendedBackend {
        inner: FileBackend<InboundMessage>,
        rival: MessageQueue<InboundMessage>,
        rival_pending: Cell<bool>,
    }

    impl StorageBackend<InboundMessage> for ContendedBackend {
        fn create(&self, message: &InboundMessage) -> Result<()> {
            self.inner.create(message)
        }

        fn read(&self, id: &str) -> Result<Option<InboundMessage>> {
            self.inner.read(id)
        }

        fn update(&self, id: &str, mutate: &mut dyn FnMut(&mut InboundMessage)) -> Result<()> {
            if self.rival_pending.replace(false) {
                self.rival.fail(id, "rival failure").unwrap();
            }
            self.inner.update(id, mutate)
        }

        fn delete(&self, id: &str) -> Result<()> {
            self.inner.delete(id)
        }

        fn list_pending(&self) -> Result<Vec<InboundMessage>> {
            self.inner.list_pending()
        }

        fn move_to_dead_letter(&self, id: &str, reason: &str) -> Result<()> {
            self.inner.move_to_dead_letter(id, reason)
        }

        fn list_dead_letters(&self) -> Result<Vec<DeadLetterMessage>> {
            self.inner.list_dead_letters()
        }
    }

    #[test]
    fn test_concurrent_fail_increments_are_not_lost() {
        let temp = TempDir::new().unwrap();
        let backend = ContendedBackend {
            inner: FileBackend::new(temp.path()).unwrap(),
            rival: MessageQueue::new(Box::new(
                FileBackend::<InboundMessage>::new(temp.path()).unwrap(),
            )),
            rival_pending: Cell::new(true),
        };
        let queue = MessageQueue::new(Box::new(backend));

        let id = queue.enqueue(params("s1")).unwrap();
        queue.fail(&id, "first failure").unwrap();

        // Both reports must be reflected: the rival bumped the count to 1
        // inside our update window, so ours lands as 2.
        let pending = queue.load_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 2);
        assert_eq!(pending[0].last_error.as_deref(), Some("first failure"));
    }

    #[test]
    fn test_move_to_failed_is_direct() {
        let temp = TempDir::new().unwrap();
        let queue = queue(&temp);
        let id = queue.enqueue(params("s1")).unwrap();

        queue.move_to_failed(&id, "unparseable payload").unwrap();

        assert!(queue.load_pending().unwrap().is_empty());
        let letters = queue.load_dead_letters().unwrap();
        assert_eq!(letters[0].reason, "unparseable payload");
        assert_eq!(letters[0].retry_count, 0);
    }

    #[test]
    fn test_metrics_snapshot() {
        let temp = TempDir::new().unwrap();
        let queue = queue(&temp);

        let id1 = queue.enqueue(params("s1")).unwrap();
        queue.enqueue(params("s2")).unwrap();
        queue.move_to_failed(&id1, "bad").unwrap();

        let metrics = queue.metrics().unwrap();
        assert_eq!(metrics.pending, 1);
        assert_eq!(metrics.dead_lettered, 1);
        assert!(metrics.oldest_pending_age_ms.is_some());
    }

    #[test]
    fn test_compute_backoff_delegates_to_policy() {
        let temp = TempDir::new().unwrap();
        let queue = queue(&temp);
        assert_eq!(queue.compute_backoff(1), 1_000);
        assert_eq!(queue.compute_backoff(5), 600_000);
    }
}
