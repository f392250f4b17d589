pub mod dedup;
pub mod file;
pub mod memory;
pub mod record;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use plexus_util::UnixMillis;

pub type Seq = u64;

/// Ordered header map: name -> list of values, publish order preserved.
pub type HeaderMap = Vec<(String, Vec<String>)>;

/// First value recorded under `name`, if any.
pub fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, vs)| vs.first())
        .map(|s| s.as_str())
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub seq: Seq,
    pub subject: String,
    pub headers: HeaderMap,
    pub payload: Bytes,
    pub timestamp: UnixMillis,
}

impl Message {
    /// Logical size used for byte accounting: payload plus encoded headers.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64 + record::encoded_headers_len(&self.headers) as u64
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreState {
    pub msgs: u64,
    pub bytes: u64,
    pub first_seq: Seq,
    pub last_seq: Seq,
    pub first_time: UnixMillis,
    pub last_time: UnixMillis,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("message not found")]
    NotFound,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt block {block}: {reason}")]
    Corrupt { block: u64, reason: String },

    #[error("bad record: {0}")]
    BadRecord(String),

    #[error("sequence out of order: expected above {expected}, got {got}")]
    SeqOutOfOrder { expected: Seq, got: Seq },

    #[error("store is closed")]
    Closed,
}

/// Persisted append log of messages keyed by strictly increasing sequence.
///
/// `append` is serialized by the owning stream's writer path; reads may run
/// concurrently and never observe a partially appended message.
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    /// Append one message, assigning `last_seq + 1`. Durable on return.
    async fn append(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: Bytes,
        timestamp: UnixMillis,
    ) -> Result<Seq, StoreError>;

    /// Re-insert a message with its original sequence (snapshot restore).
    /// The sequence must be above the current `last_seq`.
    async fn restore_message(&self, msg: Message) -> Result<(), StoreError>;

    async fn get(&self, seq: Seq) -> Result<Message, StoreError>;

    /// Tombstone-delete one message. Errors with `NotFound` for sequences
    /// that never existed or were already removed.
    async fn delete_msg(&self, seq: Seq) -> Result<bool, StoreError>;

    /// Remove and return the oldest live message (retention eviction).
    async fn remove_oldest(&self) -> Result<Option<Message>, StoreError>;

    /// Drop every message. Returns the number removed; the next append
    /// still gets `last_seq + 1`.
    async fn purge(&self) -> Result<u64, StoreError>;

    async fn state(&self) -> StoreState;

    async fn first_seq(&self) -> Seq;

    async fn last_seq(&self) -> Seq;

    /// Live messages with `seq >= from`, ascending, at most `max`.
    async fn scan_from(&self, from: Seq, max: usize) -> Result<Vec<Message>, StoreError>;

    /// Lowest live sequence whose timestamp is at or after `ts`;
    /// `last_seq + 1` when no such message exists.
    async fn first_seq_since(&self, ts: UnixMillis) -> Result<Seq, StoreError>;

    /// Flush and close. Further operations fail with `Closed`.
    async fn stop(&self) -> Result<(), StoreError>;
}
