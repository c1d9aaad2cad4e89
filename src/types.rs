//! Message and lock types shared by the inbound and outbound queues.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Current time as unix epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Queue kind - selects storage location and backoff curve.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Inbound,
    Outbound,
}

impl QueueKind {
    /// Directory name for the file backend.
    pub fn dir_name(&self) -> &'static str {
        match self {
            QueueKind::Inbound => "inbound-queue",
            QueueKind::Outbound => "outbound-queue",
        }
    }

    /// Message table name for the SQLite backend.
    pub fn table(&self) -> &'static str {
        match self {
            QueueKind::Inbound => "inbound_queue",
            QueueKind::Outbound => "outbound_queue",
        }
    }

    /// Dead-letter table name for the SQLite backend.
    pub fn dead_letter_table(&self) -> &'static str {
        match self {
            QueueKind::Inbound => "inbound_dead_letter",
            QueueKind::Outbound => "outbound_dead_letter",
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Inbound => write!(f, "inbound"),
            QueueKind::Outbound => write!(f, "outbound"),
        }
    }
}

/// Chat context of an inbound message.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Dm,
    Group,
}

/// Contract every persisted queue record satisfies.
///
/// The queue and both storage backends are generic over this trait, so the
/// inbound and outbound queues share one implementation.
pub trait QueueRecord: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// Enqueue-time parameters (everything except id/timestamps/retry state).
    type Params;

    const KIND: QueueKind;

    fn from_params(id: String, enqueued_at: i64, params: Self::Params) -> Self;

    fn id(&self) -> &str;
    fn session_id(&self) -> &str;
    fn enqueued_at(&self) -> i64;
    fn retry_count(&self) -> u32;
    fn next_retry_at(&self) -> Option<i64>;
    fn last_error(&self) -> Option<&str>;

    /// Record a failed attempt: bumped retry count, recomputed due time, error text.
    fn record_failure(&mut self, retry_count: u32, next_retry_at: i64, error: &str);
}

/// Inbound message persisted before processing.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InboundMessage {
    pub id: String,
    pub enqueued_at: i64,
    pub retry_count: u32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,

    pub session_id: String,
    pub channel: String,
    pub from_address: String,
    pub chat_id: Option<String>,
    pub chat_type: Option<ChatType>,
    pub body: Option<String>,
    pub media_urls: Option<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
}

/// Parameters for enqueueing an inbound message.
#[derive(Clone, Debug)]
pub struct InboundParams {
    pub session_id: String,
    pub channel: String,
    pub from_address: String,
    pub chat_id: Option<String>,
    pub chat_type: Option<ChatType>,
    pub body: Option<String>,
    pub media_urls: Option<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
}

impl QueueRecord for InboundMessage {
    type Params = InboundParams;

    const KIND: QueueKind = QueueKind::Inbound;

    fn from_params(id: String, enqueued_at: i64, params: InboundParams) -> Self {
        Self {
            id,
            enqueued_at,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            session_id: params.session_id,
            channel: params.channel,
            from_address: params.from_address,
            chat_id: params.chat_id,
            chat_type: params.chat_type,
            body: params.body,
            media_urls: params.media_urls,
            metadata: params.metadata,
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn enqueued_at(&self) -> i64 {
        self.enqueued_at
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn next_retry_at(&self) -> Option<i64> {
        self.next_retry_at
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn record_failure(&mut self, retry_count: u32, next_retry_at: i64, error: &str) {
        self.retry_count = retry_count;
        self.next_retry_at = Some(next_retry_at);
        self.last_error = Some(error.to_string());
    }
}

/// Outbound delivery persisted before sending.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OutboundMessage {
    pub id: String,
    pub enqueued_at: i64,
    pub retry_count: u32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,

    pub session_id: String,
    pub channel: String,
    pub to_address: String,
    /// Opaque array of delivery payloads, passed through to the transport.
    pub payloads: serde_json::Value,
    pub thread_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub best_effort: bool,
}

/// Parameters for enqueueing an outbound delivery.
#[derive(Clone, Debug)]
pub struct OutboundParams {
    pub session_id: String,
    pub channel: String,
    pub to_address: String,
    pub payloads: serde_json::Value,
    pub thread_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub best_effort: bool,
}

impl QueueRecord for OutboundMessage {
    type Params = OutboundParams;

    const KIND: QueueKind = QueueKind::Outbound;

    fn from_params(id: String, enqueued_at: i64, params: OutboundParams) -> Self {
        Self {
            id,
            enqueued_at,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            session_id: params.session_id,
            channel: params.channel,
            to_address: params.to_address,
            payloads: params.payloads,
            thread_id: params.thread_id,
            reply_to_id: params.reply_to_id,
            best_effort: params.best_effort,
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn enqueued_at(&self) -> i64 {
        self.enqueued_at
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn next_retry_at(&self) -> Option<i64> {
        self.next_retry_at
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn record_failure(&mut self, retry_count: u32, next_retry_at: i64, error: &str) {
        self.retry_count = retry_count;
        self.next_retry_at = Some(next_retry_at);
        self.last_error = Some(error.to_string());
    }
}

/// Immutable snapshot of a message at the moment it was dead-lettered.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeadLetterMessage {
    pub id: String,
    /// Full JSON of the original queue record.
    pub original: serde_json::Value,
    pub reason: String,
    pub moved_at: i64,
    pub retry_count: u32,
}

/// Session lock held by one worker while it processes that session's messages.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProcessingLock {
    pub session_id: String,
    pub kind: QueueKind,
    pub worker_id: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

/// Point-in-time queue counters, recomputed on demand from the backend.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    pub recorded_at: i64,
    pub pending: usize,
    pub dead_lettered: usize,
    pub oldest_pending_age_ms: Option<i64>,
}

impl std::fmt::Display for QueueMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Queue Metrics:")?;
        writeln!(f, "  Pending:      {}", self.pending)?;
        writeln!(f, "  Dead-letters: {}", self.dead_lettered)?;
        match self.oldest_pending_age_ms {
            Some(age) => write!(f, "  Oldest age:   {}ms", age),
            None => write!(f, "  Oldest age:   -"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_from_params() {
        let msg = InboundMessage::from_params(
            "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
            1_700_000_000_000,
            InboundParams {
                session_id: "s1".to_string(),
                channel: "telegram".to_string(),
                from_address: "12345".to_string(),
                chat_id: None,
                chat_type: Some(ChatType::Dm),
                body: Some("hello".to_string()),
                media_urls: None,
                metadata: None,
            },
        );

        assert_eq!(msg.retry_count, 0);
        assert!(msg.next_retry_at.is_none());
        assert_eq!(msg.session_id(), "s1");
        assert_eq!(InboundMessage::KIND, QueueKind::Inbound);
    }

    #[test]
    fn test_record_failure() {
        let mut msg = OutboundMessage::from_params(
            "id1".to_string(),
            1,
            OutboundParams {
                session_id: "s1".to_string(),
                channel: "telegram".to_string(),
                to_address: "12345".to_string(),
                payloads: serde_json::json!([{"text": "hi"}]),
                thread_id: None,
                reply_to_id: None,
                best_effort: false,
            },
        );

        msg.record_failure(1, 5_000, "send timed out");
        assert_eq!(msg.retry_count(), 1);
        assert_eq!(msg.next_retry_at(), Some(5_000));
        assert_eq!(msg.last_error(), Some("send timed out"));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(QueueKind::Inbound.dir_name(), "inbound-queue");
        assert_eq!(QueueKind::Outbound.table(), "outbound_queue");
        assert_eq!(QueueKind::Inbound.to_string(), "inbound");
    }
}
