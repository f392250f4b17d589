//! plexus: a persistent, subject-addressed streaming core.
//!
//! Streams are append-only message logs bound to subject patterns of an
//! external pub/sub transport; consumers drive ordered, acknowledged,
//! at-least-once delivery with redelivery on ack timeout. See the member
//! crates for the pieces: `plexus_storage` (message stores, dedup),
//! `plexus_broker` (streams, consumers, accounts, templates, snapshots,
//! management API).

pub use plexus_broker::{
    account::{AccountInfo, AccountLimits},
    config::{
        AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, DiscardPolicy, PubAck,
        ReplayPolicy, RetentionPolicy, SequencePair, StorageType, StreamConfig, StreamInfo,
        StreamState, TemplateConfig, TemplateInfo,
    },
    consumer::{AckKind, AckReply, Consumer},
    error::Error,
    server::{Server, ServerConfig},
    snapshot::SnapshotRequest,
    stream::Stream,
    transport::Transport,
    ACK_PREFIX, MGMT_PREFIX, MSG_ID_HEADER,
};
pub use plexus_storage::{
    dedup::DedupIndex, file::FileStore, memory::MemoryStore, HeaderMap, Message, MessageStore,
    Seq, StoreError, StoreState,
};
pub use plexus_util::{init_tracing, random_token, unix_millis, UnixMillis};
