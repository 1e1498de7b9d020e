//! Bounded in-memory record of messages the consumer gave up on.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use time::OffsetDateTime;
use tracing::error;
use uuid::Uuid;

use crate::util::lock::mutex_lock;

const SOURCE: &str = "broker::dead_letter";
const METRIC_EVENTS_DEAD_LETTERED: &str = "ripple_events_dead_lettered_total";
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The body could not be decoded into the handler's event type.
    Poison,
    /// The handler failed or timed out on every attempt.
    HandlerExhausted,
}

impl DeadLetterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterReason::Poison => "poison",
            DeadLetterReason::HandlerExhausted => "handler_exhausted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: Uuid,
    /// Monotonic sequence number within this process.
    pub sequence: u64,
    pub queue: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub reason: DeadLetterReason,
    pub attempts: u32,
    pub error: String,
    pub recorded_at: OffsetDateTime,
}

/// The oldest entry is evicted once `capacity` is reached.
pub struct DeadLetterLog {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
    sequence: AtomicU64,
}

/// Fields of a new dead letter.
#[derive(Debug)]
pub struct DeadLetterEntry<'a> {
    pub queue: &'a str,
    pub routing_key: &'a str,
    pub body: &'a [u8],
    pub reason: DeadLetterReason,
    pub attempts: u32,
    pub error: String,
}

impl DeadLetterLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn record(&self, entry: DeadLetterEntry<'_>) {
        let letter = DeadLetter {
            id: Uuid::new_v4(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            queue: entry.queue.to_string(),
            routing_key: entry.routing_key.to_string(),
            body: entry.body.to_vec(),
            reason: entry.reason,
            attempts: entry.attempts,
            error: entry.error,
            recorded_at: OffsetDateTime::now_utc(),
        };

        error!(
            dead_letter_id = %letter.id,
            queue = %letter.queue,
            routing_key = %letter.routing_key,
            reason = letter.reason.as_str(),
            attempts = letter.attempts,
            error = %letter.error,
            body = %String::from_utf8_lossy(&letter.body),
            "Message dead-lettered"
        );
        counter!(METRIC_EVENTS_DEAD_LETTERED, "reason" => letter.reason.as_str()).increment(1);

        let mut entries = mutex_lock(&self.entries, SOURCE, "record");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(letter);
    }

    /// Copy of the retained entries, oldest first.
    pub fn snapshot(&self) -> Vec<DeadLetter> {
        mutex_lock(&self.entries, SOURCE, "snapshot")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeadLetterLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
