//! In-RAM message store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::{HeaderMap, Message, MessageStore, Seq, StoreError, StoreState, UnixMillis};

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemInner>,
}

#[derive(Debug, Default)]
struct MemInner {
    msgs: BTreeMap<Seq, Message>,
    bytes: u64,
    last_seq: Seq,
    closed: bool,
}

impl MemInner {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn state(&self) -> StoreState {
        let first = self.msgs.values().next();
        let last = self.msgs.values().next_back();
        StoreState {
            msgs: self.msgs.len() as u64,
            bytes: self.bytes,
            first_seq: first.map(|m| m.seq).unwrap_or(self.last_seq + 1),
            last_seq: self.last_seq,
            first_time: first.map(|m| m.timestamp).unwrap_or(0),
            last_time: last.map(|m| m.timestamp).unwrap_or(0),
        }
    }

    fn remove(&mut self, seq: Seq) -> Option<Message> {
        let msg = self.msgs.remove(&seq)?;
        self.bytes -= msg.size();
        Some(msg)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: Bytes,
        timestamp: UnixMillis,
    ) -> Result<Seq, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        let seq = inner.last_seq + 1;
        let msg = Message {
            seq,
            subject: subject.to_string(),
            headers: headers.clone(),
            payload,
            timestamp,
        };
        inner.bytes += msg.size();
        inner.msgs.insert(seq, msg);
        inner.last_seq = seq;
        Ok(seq)
    }

    async fn restore_message(&self, msg: Message) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        if msg.seq <= inner.last_seq {
            return Err(StoreError::SeqOutOfOrder {
                expected: inner.last_seq,
                got: msg.seq,
            });
        }
        inner.last_seq = msg.seq;
        inner.bytes += msg.size();
        inner.msgs.insert(msg.seq, msg);
        Ok(())
    }

    async fn get(&self, seq: Seq) -> Result<Message, StoreError> {
        let inner = self.inner.lock().await;
        inner.check_open()?;
        inner.msgs.get(&seq).cloned().ok_or(StoreError::NotFound)
    }

    async fn delete_msg(&self, seq: Seq) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        if inner.remove(seq).is_none() {
            return Err(StoreError::NotFound);
        }
        Ok(true)
    }

    async fn remove_oldest(&self) -> Result<Option<Message>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        let Some(first) = inner.msgs.keys().next().copied() else {
            return Ok(None);
        };
        Ok(inner.remove(first))
    }

    async fn purge(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        let removed = inner.msgs.len() as u64;
        inner.msgs.clear();
        inner.bytes = 0;
        Ok(removed)
    }

    async fn state(&self) -> StoreState {
        self.inner.lock().await.state()
    }

    async fn first_seq(&self) -> Seq {
        self.inner.lock().await.state().first_seq
    }

    async fn last_seq(&self) -> Seq {
        self.inner.lock().await.last_seq
    }

    async fn scan_from(&self, from: Seq, max: usize) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check_open()?;
        Ok(inner.msgs.range(from..).take(max).map(|(_, m)| m.clone()).collect())
    }

    async fn first_seq_since(&self, ts: UnixMillis) -> Result<Seq, StoreError> {
        let inner = self.inner.lock().await;
        inner.check_open()?;
        Ok(inner
            .msgs
            .values()
            .find(|m| m.timestamp >= ts)
            .map(|m| m.seq)
            .unwrap_or(inner.last_seq + 1))
    }

    async fn stop(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        Ok(())
    }
}
