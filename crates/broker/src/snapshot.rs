//! Flow-controlled snapshot transfer.
//!
//! A snapshot is one crc-framed JSON header (stream config, created
//! timestamp and consumer states) followed by the message records in
//! sequence order, split into chunks. One chunk is in flight at a time:
//! the next is published only after the receiver replies to the previous
//! one. An empty publish terminates the transfer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use plexus_storage::{record, Seq, StoreError, UnixMillis};
use plexus_util::random_token;

use crate::config::{ConsumerConfig, StreamConfig};
use crate::error::Error;
use crate::persist::ConsumerStateSnapshot;
use crate::server::InboxRegistry;
use crate::stream::Stream;
use crate::transport::Transport;

pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;
pub const CHUNK_ACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub deliver_subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub check_msgs: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumerSnap {
    pub name: String,
    pub config: ConsumerConfig,
    pub created: UnixMillis,
    pub state: ConsumerStateSnapshot,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub config: StreamConfig,
    pub created: UnixMillis,
    pub consumers: Vec<ConsumerSnap>,
}

/// Frame an opaque blob with the same length+crc shape records use.
pub fn encode_blob(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + data.len());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32c::crc32c(data).to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Inverse of [`encode_blob`]; `Ok(None)` when more bytes are needed.
pub fn decode_blob(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, Error> {
    if buf.len() < 8 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 8 + len {
        return Ok(None);
    }
    let expected = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let data = &buf[8..8 + len];
    let actual = crc32c::crc32c(data);
    if actual != expected {
        return Err(Error::Store(StoreError::BadRecord(format!(
            "snapshot header crc mismatch: expected {expected:#x}, got {actual:#x}"
        ))));
    }
    Ok(Some((data.to_vec(), 8 + len)))
}

pub async fn build_header(stream: &Arc<Stream>) -> SnapshotHeader {
    let mut consumers = Vec::new();
    for name in stream.consumer_names() {
        if let Some(c) = stream.get_consumer(&name) {
            let config = c.config().await;
            if !config.is_durable() {
                continue;
            }
            consumers.push(ConsumerSnap {
                name: name.clone(),
                config,
                created: c.created(),
                state: c.state_snapshot().await,
            });
        }
    }
    consumers.sort_by(|a, b| a.name.cmp(&b.name));
    SnapshotHeader {
        config: stream.config().await,
        created: stream.created(),
        consumers,
    }
}

/// Drive one snapshot transfer to completion. Runs inside a spawned task;
/// errors abort the transfer and are logged by the caller.
pub async fn run_snapshot(
    stream: Arc<Stream>,
    transport: Arc<dyn Transport>,
    inboxes: Arc<InboxRegistry>,
    req: SnapshotRequest,
) -> Result<(), Error> {
    let chunk_size = req
        .chunk_size
        .unwrap_or(DEFAULT_CHUNK_SIZE)
        .clamp(1024, 4 * 1024 * 1024);

    let header = build_header(&stream).await;
    let header_json = serde_json::to_vec(&header)?;

    let inbox = format!("_SNAP.{}", random_token(12));
    let mut rx = inboxes.register(&inbox);
    let result = async {
        let mut buf: Vec<u8> = encode_blob(&header_json);
        let mut cursor: Seq = 0;
        let mut done = false;

        while !done || !buf.is_empty() {
            // Top the chunk up with message records.
            while !done && buf.len() < chunk_size {
                let batch = stream.store.scan_from(cursor + 1, 32).await?;
                if batch.is_empty() {
                    done = true;
                    break;
                }
                for msg in batch {
                    cursor = msg.seq;
                    let frame = record::encode_frame(&record::Record::message(&msg));
                    if req.check_msgs {
                        record::decode_frame(&frame)?;
                    }
                    buf.extend_from_slice(&frame);
                }
            }

            let take = buf.len().min(chunk_size);
            let chunk: Vec<u8> = buf.drain(..take).collect();

            transport
                .publish(&req.deliver_subject, Some(&inbox), &Vec::new(), Bytes::from(chunk))
                .await?;

            // Reply-driven windowing: exactly one chunk outstanding.
            tokio::select! {
                _ = stream.shutdown.cancelled() => {
                    return Err(Error::ChannelClosed);
                }
                got = tokio::time::timeout(CHUNK_ACK_TIMEOUT, rx.recv()) => {
                    match got {
                        Ok(Some(_)) => {}
                        Ok(None) | Err(_) => return Err(Error::NoResponders),
                    }
                }
            }
        }

        // Empty payload signals end-of-snapshot.
        transport
            .publish(&req.deliver_subject, None, &Vec::new(), Bytes::new())
            .await?;
        Ok(())
    }
    .await;

    inboxes.unregister(&inbox);
    match &result {
        Ok(()) => debug!(stream = %stream.name(), "snapshot complete"),
        Err(e) => warn!(stream = %stream.name(), error = %e, "snapshot aborted"),
    }
    result
}
