//! Stream, consumer and template configuration plus the info payloads
//! returned by the management surface.

use serde::{Deserialize, Serialize};

use plexus_storage::{StoreState, UnixMillis};

use crate::error::Error;
use crate::subject;

/// Default dedup window when none is configured.
pub const DEFAULT_DUPLICATE_WINDOW_MS: u64 = 2 * 60 * 1000;
/// Default ack wait before redelivery.
pub const DEFAULT_ACK_WAIT_MS: u64 = 30_000;
/// Default idle grace before an ephemeral consumer is removed.
pub const DEFAULT_INACTIVE_THRESHOLD_MS: u64 = 2_000;
/// Page size of NAMES/LIST management responses.
pub const DEFAULT_PAGE_LIMIT: usize = 256;

fn neg_one() -> i64 {
    -1
}

fn neg_one_i32() -> i32 {
    -1
}

fn one_i32() -> i32 {
    1
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Memory,
    #[default]
    File,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    WorkQueue,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    #[default]
    Old,
    New,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    None,
    All,
    #[default]
    Explicit,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    #[default]
    All,
    Last,
    New,
    ByStartSequence,
    ByStartTime,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    #[default]
    Instant,
    Original,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default = "neg_one_i32")]
    pub max_consumers: i32,
    #[serde(default = "neg_one")]
    pub max_msgs: i64,
    #[serde(default = "neg_one")]
    pub max_bytes: i64,
    /// 0 means no age limit.
    #[serde(default)]
    pub max_age_ms: u64,
    #[serde(default = "neg_one_i32")]
    pub max_msg_size: i32,
    #[serde(default)]
    pub storage: StorageType,
    #[serde(default)]
    pub discard: DiscardPolicy,
    #[serde(default = "one_i32")]
    pub num_replicas: i32,
    #[serde(default)]
    pub no_ack: bool,
    /// 0 picks the 2 minute default, capped by `max_age_ms` when set.
    #[serde(default)]
    pub duplicate_window_ms: u64,
    /// Set on streams created by a template; such streams cannot be
    /// managed directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subjects: Vec::new(),
            retention: RetentionPolicy::default(),
            max_consumers: -1,
            max_msgs: -1,
            max_bytes: -1,
            max_age_ms: 0,
            max_msg_size: -1,
            storage: StorageType::default(),
            discard: DiscardPolicy::default(),
            num_replicas: 1,
            no_ack: false,
            duplicate_window_ms: 0,
            template: None,
        }
    }

    /// Apply defaults and validate the standalone parts of the config.
    pub fn normalize(&mut self) -> Result<(), Error> {
        if !subject::valid_name(&self.name) {
            return Err(Error::StreamNameInvalid);
        }
        if self.num_replicas > 1 {
            return Err(Error::ReplicasUnsupported(self.num_replicas));
        }
        self.num_replicas = 1;

        if self.subjects.is_empty() {
            self.subjects.push(self.name.clone());
        }
        for s in &self.subjects {
            if !subject::valid_subject(s) {
                return Err(Error::SubjectInvalid);
            }
            if subject::overlaps_reserved(s) {
                return Err(Error::SubjectsOverlap);
            }
        }

        if self.duplicate_window_ms == 0 {
            self.duplicate_window_ms = DEFAULT_DUPLICATE_WINDOW_MS;
        }
        if self.max_age_ms > 0 && self.duplicate_window_ms > self.max_age_ms {
            self.duplicate_window_ms = self.max_age_ms;
        }
        Ok(())
    }

    pub fn matches_subject(&self, subj: &str) -> bool {
        self.subjects.iter().any(|p| subject::subject_matches(p, subj))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable: Option<String>,
    /// Present for push consumers, absent for pull.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_time_ms: Option<UnixMillis>,
    #[serde(default)]
    pub ack_policy: AckPolicy,
    /// 0 picks the 30s default.
    #[serde(default)]
    pub ack_wait_ms: u64,
    #[serde(default = "neg_one")]
    pub max_deliver: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
    /// Bits per second; push only; 0 disables.
    #[serde(default)]
    pub rate_limit_bps: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            durable: None,
            deliver_subject: None,
            deliver_policy: DeliverPolicy::default(),
            opt_start_seq: None,
            opt_start_time_ms: None,
            ack_policy: AckPolicy::default(),
            ack_wait_ms: 0,
            max_deliver: -1,
            filter_subject: None,
            replay_policy: ReplayPolicy::default(),
            rate_limit_bps: 0,
        }
    }
}

impl ConsumerConfig {
    pub fn is_pull(&self) -> bool {
        self.deliver_subject.is_none()
    }

    pub fn is_durable(&self) -> bool {
        self.durable.as_deref().map(|d| !d.is_empty()).unwrap_or(false)
    }

    pub fn ack_wait(&self) -> u64 {
        if self.ack_wait_ms == 0 {
            DEFAULT_ACK_WAIT_MS
        } else {
            self.ack_wait_ms
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePair {
    pub consumer_seq: u64,
    pub stream_seq: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    pub msgs: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub last_seq: u64,
    pub first_time: UnixMillis,
    pub last_time: UnixMillis,
    pub consumer_count: usize,
}

impl StreamState {
    pub fn from_store(st: StoreState, consumer_count: usize) -> Self {
        Self {
            msgs: st.msgs,
            bytes: st.bytes,
            first_seq: st.first_seq,
            last_seq: st.last_seq,
            first_time: st.first_time,
            last_time: st.last_time,
            consumer_count,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub created: UnixMillis,
    pub state: StreamState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub name: String,
    pub created: UnixMillis,
    pub config: ConsumerConfig,
    pub delivered: SequencePair,
    pub ack_floor: SequencePair,
    pub num_ack_pending: usize,
    pub num_redelivered: u64,
    pub num_waiting: usize,
    pub num_pending: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PubAck {
    pub stream: String,
    pub seq: u64,
    pub duplicate: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub name: String,
    pub config: StreamConfig,
    pub max_streams: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub config: TemplateConfig,
    pub streams: Vec<String>,
}
