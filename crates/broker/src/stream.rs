//! Stream: an append-only, subject-bound message log with retention,
//! deduplication and consumer fan-out.
//!
//! The writer path (ingest, purge, limit eviction) is serialized behind
//! one mutex; reads go straight to the store. Consumers are signalled
//! through their own notify handles after every append.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use plexus_storage::dedup::DedupIndex;
use plexus_storage::file::{FileStore, FileStoreConfig};
use plexus_storage::memory::MemoryStore;
use plexus_storage::{header_value, record, HeaderMap, Message, MessageStore, Seq, UnixMillis};
use plexus_util::{random_token, unix_millis};

use crate::account::AccountResources;
use crate::config::{
    AckPolicy, ConsumerConfig, DeliverPolicy, DiscardPolicy, PubAck, RetentionPolicy,
    StorageType, StreamConfig, StreamInfo, StreamState,
};
use crate::consumer::Consumer;
use crate::error::Error;
use crate::persist::{self, ConsumerStateSnapshot, StoredConsumerConfig, StoredStreamConfig, StreamDirs};
use crate::subject;
use crate::transport::Transport;
use crate::{TaskGroup, MSG_ID_HEADER};

#[derive(Debug)]
struct WriterState {
    dedup: DedupIndex,
}

#[derive(Debug)]
pub struct Stream {
    name: String,
    created: UnixMillis,
    retention: RetentionPolicy,
    storage: StorageType,
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) account: Arc<AccountResources>,
    pub(crate) dirs: Option<StreamDirs>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: Arc<TaskGroup>,
    config: RwLock<StreamConfig>,
    writer: Mutex<WriterState>,
    consumers: DashMap<String, Arc<Consumer>>,
    deleted: AtomicBool,
}

impl Stream {
    pub(crate) async fn new(
        mut config: StreamConfig,
        account: Arc<AccountResources>,
        transport: Arc<dyn Transport>,
        dirs: Option<StreamDirs>,
        created: UnixMillis,
    ) -> Result<Arc<Self>, Error> {
        config.normalize()?;

        let store: Arc<dyn MessageStore> = match config.storage {
            StorageType::Memory => Arc::new(MemoryStore::new()),
            StorageType::File => {
                let dirs = dirs.as_ref().ok_or_else(|| {
                    Error::Store(plexus_storage::StoreError::Io(std::io::Error::other(
                        "file storage requires a store root",
                    )))
                })?;
                Arc::new(FileStore::open(dirs.messages_dir(), FileStoreConfig::default()).await?)
            }
        };

        // Recovered messages count against the account from the start.
        let st = store.state().await;
        if st.bytes > 0 {
            if let Err(e) = account.reserve_bytes(config.storage, st.bytes) {
                warn!(stream = %config.name, error = %e, "recovered stream exceeds account limits");
            }
        }

        let stream = Arc::new(Self {
            name: config.name.clone(),
            created,
            retention: config.retention,
            storage: config.storage,
            store,
            transport,
            account,
            dirs,
            shutdown: CancellationToken::new(),
            tasks: Arc::new(TaskGroup::new()),
            config: RwLock::new(config.clone()),
            writer: Mutex::new(WriterState {
                dedup: DedupIndex::new(),
            }),
            consumers: DashMap::new(),
            deleted: AtomicBool::new(false),
        });

        if let Some(dirs) = &stream.dirs {
            persist::write_json_atomic(
                &dirs.config_path(),
                &StoredStreamConfig { config, created },
            )?;
        }

        stream.spawn_housekeeper();
        Ok(stream)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created(&self) -> UnixMillis {
        self.created
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    pub async fn config(&self) -> StreamConfig {
        self.config.read().await.clone()
    }

    pub async fn state(&self) -> StreamState {
        StreamState::from_store(self.store.state().await, self.consumers.len())
    }

    pub async fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config().await,
            created: self.created,
            state: self.state().await,
        }
    }

    pub fn consumer_names(&self) -> Vec<String> {
        self.consumers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn get_consumer(&self, name: &str) -> Option<Arc<Consumer>> {
        self.consumers.get(name).map(|e| e.value().clone())
    }

    fn consumer_handles(&self) -> Vec<Arc<Consumer>> {
        self.consumers.iter().map(|e| e.value().clone()).collect()
    }

    // ---------------- ingest ----------------

    /// Core ingest path: dedup, limits, append, consumer signal.
    pub async fn ingest(
        &self,
        subj: &str,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<PubAck, Error> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(Error::StreamNotFound);
        }
        let cfg = self.config.read().await.clone();
        if !cfg.matches_subject(subj) {
            return Err(Error::SubjectMismatch);
        }

        let mut writer = self.writer.lock().await;
        let now = unix_millis();

        let msg_id = header_value(&headers, MSG_ID_HEADER).map(str::to_string);
        if let Some(id) = &msg_id {
            writer
                .dedup
                .evict_older_than(now.saturating_sub(cfg.duplicate_window_ms));
            if let Some(seq) = writer.dedup.check(id) {
                return Ok(PubAck {
                    stream: self.name.clone(),
                    seq,
                    duplicate: true,
                });
            }
        }

        let size = payload.len() as u64 + record::encoded_headers_len(&headers) as u64;
        if cfg.max_msg_size >= 0 && size > cfg.max_msg_size as u64 {
            return Err(Error::MessageTooLarge);
        }

        self.enforce_limits(&cfg, size).await?;
        self.account.reserve_bytes(cfg.storage, size)?;

        let seq = match self.store.append(subj, &headers, payload, now).await {
            Ok(seq) => seq,
            Err(e) => {
                self.account.release_bytes(cfg.storage, size);
                return Err(e.into());
            }
        };
        if let Some(id) = &msg_id {
            writer.dedup.record(id, seq, now);
        }
        drop(writer);

        let consumers = self.consumer_handles();
        if cfg.retention == RetentionPolicy::Interest && consumers.is_empty() {
            // Nobody will ever ack it: gone right away.
            self.remove_seq(seq).await;
        } else {
            for c in &consumers {
                c.on_new_message(seq, subj).await;
            }
        }

        Ok(PubAck {
            stream: self.name.clone(),
            seq,
            duplicate: false,
        })
    }

    /// Transport-facing ingest: formats `+OK`/`-ERR` replies.
    pub async fn process_publish(
        &self,
        subj: &str,
        headers: HeaderMap,
        payload: Bytes,
        reply: Option<&str>,
    ) -> Result<PubAck, Error> {
        let no_ack = self.config.read().await.no_ack;
        let result = self.ingest(subj, headers, payload).await;
        if let Some(reply) = reply {
            if !no_ack {
                let body = match &result {
                    Ok(ack) => {
                        let json = serde_json::to_string(ack)?;
                        Bytes::from(format!("+OK {json}"))
                    }
                    Err(e) => Bytes::from(format!("-ERR '{e}'")),
                };
                let _ = self
                    .transport
                    .publish(reply, None, &HeaderMap::new(), body)
                    .await;
            }
        }
        result
    }

    /// Evict oldest-first until the incoming message fits, or reject.
    async fn enforce_limits(&self, cfg: &StreamConfig, incoming: u64) -> Result<(), Error> {
        loop {
            let st = self.store.state().await;
            let over_msgs = cfg.max_msgs >= 0 && st.msgs + 1 > cfg.max_msgs as u64;
            let over_bytes = cfg.max_bytes >= 0 && st.bytes + incoming > cfg.max_bytes as u64;
            if !over_msgs && !over_bytes {
                return Ok(());
            }
            let reject = || {
                if over_msgs {
                    Error::MaxMessagesExceeded
                } else {
                    Error::MaxBytesExceeded
                }
            };
            if cfg.discard == DiscardPolicy::New || st.msgs == 0 {
                return Err(reject());
            }
            if cfg.retention == RetentionPolicy::Interest
                && !self.below_all_floors(st.first_seq).await
            {
                // Interest eviction waits for acks; the stream is full.
                return Err(reject());
            }
            if !self.evict_oldest().await? {
                return Err(reject());
            }
        }
    }

    async fn below_all_floors(&self, seq: Seq) -> bool {
        for c in self.consumer_handles() {
            if c.ack_floor().await.stream_seq < seq {
                return false;
            }
        }
        true
    }

    async fn evict_oldest(&self) -> Result<bool, Error> {
        let Some(msg) = self.store.remove_oldest().await? else {
            return Ok(false);
        };
        self.account.release_bytes(self.storage, msg.size());
        for c in self.consumer_handles() {
            c.on_evicted(msg.seq, &msg.subject).await;
        }
        Ok(true)
    }

    async fn remove_seq(&self, seq: Seq) -> bool {
        let msg = match self.store.get(seq).await {
            Ok(m) => m,
            Err(_) => return false,
        };
        if self.store.delete_msg(seq).await.is_err() {
            return false;
        }
        self.account.release_bytes(self.storage, msg.size());
        for c in self.consumer_handles() {
            c.on_evicted(seq, &msg.subject).await;
        }
        true
    }

    // ---------------- retention hooks ----------------

    /// WorkQueue retention: the eligible consumer acked `seq`.
    pub(crate) async fn workqueue_remove(&self, seq: Seq) {
        self.remove_seq(seq).await;
    }

    /// Interest retention: drop messages every consumer has acked past.
    pub(crate) async fn interest_sweep(&self) {
        let consumers = self.consumer_handles();
        if consumers.is_empty() {
            while self.evict_oldest().await.unwrap_or(false) {}
            return;
        }
        let mut min_floor = u64::MAX;
        for c in &consumers {
            min_floor = min_floor.min(c.ack_floor().await.stream_seq);
        }
        loop {
            let st = self.store.state().await;
            if st.msgs == 0 || st.first_seq > min_floor {
                break;
            }
            if !self.evict_oldest().await.unwrap_or(false) {
                break;
            }
        }
    }

    // ---------------- message level ops ----------------

    pub async fn get_msg(&self, seq: Seq) -> Result<Message, Error> {
        Ok(self.store.get(seq).await?)
    }

    pub async fn delete_msg(&self, seq: Seq) -> Result<bool, Error> {
        let msg = self.store.get(seq).await?;
        self.store.delete_msg(seq).await?;
        self.account.release_bytes(self.storage, msg.size());
        for c in self.consumer_handles() {
            c.on_evicted(seq, &msg.subject).await;
        }
        Ok(true)
    }

    /// Drop all messages, keep config and consumers.
    pub async fn purge(&self) -> Result<u64, Error> {
        let _writer = self.writer.lock().await;
        let st = self.store.state().await;
        let count = self.store.purge().await?;
        self.account.release_bytes(self.storage, st.bytes);
        drop(_writer);

        let last = self.store.last_seq().await;
        for c in self.consumer_handles() {
            c.on_purge(last).await;
        }
        Ok(count)
    }

    /// Restore one message with its original sequence (snapshot restore).
    pub(crate) async fn restore_message(&self, msg: Message) -> Result<(), Error> {
        let size = msg.size();
        self.account.reserve_bytes(self.storage, size)?;
        if let Err(e) = self.store.restore_message(msg).await {
            self.account.release_bytes(self.storage, size);
            return Err(e.into());
        }
        Ok(())
    }

    // ---------------- config update ----------------

    pub async fn update(&self, mut new_cfg: StreamConfig) -> Result<(), Error> {
        new_cfg.normalize()?;
        {
            let cur = self.config.read().await;
            if new_cfg.name != cur.name {
                return Err(Error::UpdateImmutable("name"));
            }
            if new_cfg.storage != cur.storage {
                return Err(Error::UpdateImmutable("storage type"));
            }
            if new_cfg.retention != cur.retention {
                return Err(Error::UpdateImmutable("retention policy"));
            }
            if new_cfg.num_replicas != cur.num_replicas {
                return Err(Error::UpdateImmutable("replicas"));
            }
            if new_cfg.template != cur.template {
                return Err(Error::UpdateImmutable("template owner"));
            }
            if new_cfg.max_consumers != cur.max_consumers {
                return Err(Error::UpdateImmutable("max consumers"));
            }
        }

        // A WorkQueue subject change must not orphan or overlap the
        // existing consumer filters.
        if self.retention == RetentionPolicy::WorkQueue {
            for c in self.consumer_handles() {
                let ccfg = c.config().await;
                if let Some(filter) = &ccfg.filter_subject {
                    let still_bound = new_cfg
                        .subjects
                        .iter()
                        .any(|s| subject::subject_is_subset(filter, s));
                    if !still_bound {
                        return Err(Error::SubjectsOverlap);
                    }
                }
            }
        }

        *self.config.write().await = new_cfg.clone();
        if let Some(dirs) = &self.dirs {
            persist::write_json_atomic(
                &dirs.config_path(),
                &StoredStreamConfig {
                    config: new_cfg.clone(),
                    created: self.created,
                },
            )?;
        }

        // Lowered limits take effect immediately.
        let mut evicted = 0u64;
        loop {
            let st = self.store.state().await;
            let over_msgs = new_cfg.max_msgs >= 0 && st.msgs > new_cfg.max_msgs as u64;
            let over_bytes = new_cfg.max_bytes >= 0 && st.bytes > new_cfg.max_bytes as u64;
            if !over_msgs && !over_bytes {
                break;
            }
            if self.retention == RetentionPolicy::Interest
                && !self.below_all_floors(st.first_seq).await
            {
                break;
            }
            if !self.evict_oldest().await? {
                break;
            }
            evicted += 1;
        }
        if evicted > 0 {
            debug!(stream = %self.name, evicted, "eviction after config update");
        }
        Ok(())
    }

    // ---------------- consumers ----------------

    pub async fn add_consumer(
        self: &Arc<Self>,
        cfg: ConsumerConfig,
    ) -> Result<Arc<Consumer>, Error> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(Error::StreamNotFound);
        }
        let stream_cfg = self.config.read().await.clone();
        self.validate_consumer(&cfg, &stream_cfg).await?;

        // Identical durable registrations are idempotent.
        if let Some(durable) = cfg.durable.as_deref().filter(|d| !d.is_empty()) {
            if !subject::valid_name(durable) {
                return Err(Error::ConsumerConfigInvalid(
                    "durable name can not contain '.', '*', '>'".into(),
                ));
            }
            if let Some(existing) = self.get_consumer(durable) {
                let existing_cfg = existing.config().await;
                if existing_cfg == cfg {
                    return Ok(existing);
                }
                let mut probe = existing_cfg.clone();
                probe.deliver_subject = cfg.deliver_subject.clone();
                if probe == cfg {
                    if let Some(ds) = cfg.deliver_subject.clone() {
                        existing.update_deliver_subject(ds).await?;
                        return Ok(existing);
                    }
                }
                return Err(Error::ConsumerAlreadyExists);
            }
        }

        if stream_cfg.max_consumers >= 0
            && self.consumers.len() >= stream_cfg.max_consumers as usize
        {
            return Err(Error::MaxConsumersExceeded);
        }
        self.account.try_add_consumer()?;

        let name = cfg
            .durable
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| random_token(6));
        let created = unix_millis();

        if cfg.is_durable() {
            if let Some(dirs) = &self.dirs {
                if let Err(e) = persist::write_json_atomic(
                    &dirs.consumer_config_path(&name),
                    &StoredConsumerConfig {
                        name: name.clone(),
                        config: cfg.clone(),
                        created,
                    },
                ) {
                    self.account.remove_consumer();
                    return Err(e);
                }
            }
        }

        match Consumer::spawn(self, name.clone(), cfg, None, created).await {
            Ok(consumer) => {
                self.consumers.insert(name, consumer.clone());
                Ok(consumer)
            }
            Err(e) => {
                self.account.remove_consumer();
                Err(e)
            }
        }
    }

    /// Re-attach a durable consumer from its persisted state.
    pub(crate) async fn restore_consumer(
        self: &Arc<Self>,
        name: String,
        cfg: ConsumerConfig,
        snapshot: ConsumerStateSnapshot,
        created: UnixMillis,
    ) -> Result<Arc<Consumer>, Error> {
        self.account.try_add_consumer()?;
        match Consumer::spawn(self, name.clone(), cfg, Some(snapshot), created).await {
            Ok(consumer) => {
                self.consumers.insert(name, consumer.clone());
                Ok(consumer)
            }
            Err(e) => {
                self.account.remove_consumer();
                Err(e)
            }
        }
    }

    pub async fn delete_consumer(&self, name: &str) -> Result<(), Error> {
        let Some((_, consumer)) = self.consumers.remove(name) else {
            return Err(Error::ConsumerNotFound);
        };
        consumer.stop().await;
        self.account.remove_consumer();
        if let Some(dirs) = &self.dirs {
            let _ = persist::remove_dir(&dirs.consumer_dir(name));
        }
        if self.retention == RetentionPolicy::Interest {
            self.interest_sweep().await;
        }
        Ok(())
    }

    async fn validate_consumer(
        &self,
        cfg: &ConsumerConfig,
        stream_cfg: &StreamConfig,
    ) -> Result<(), Error> {
        if let Some(ds) = &cfg.deliver_subject {
            if !subject::is_literal(ds) {
                return Err(Error::ConsumerConfigInvalid(
                    "delivery subject has wildcards".into(),
                ));
            }
            if stream_cfg
                .subjects
                .iter()
                .any(|s| subject::subjects_overlap(s, ds))
            {
                return Err(Error::ConsumerConfigInvalid(
                    "delivery subject forms a cycle".into(),
                ));
            }
            if cfg.ack_policy == AckPolicy::All && cfg.filter_subject.is_some() {
                return Err(Error::ConsumerConfigInvalid(
                    "filtered consumer can not use ack all".into(),
                ));
            }
            if !cfg.is_durable() && !self.transport.has_interest(ds) {
                return Err(Error::DeliverSubjectNotInterest);
            }
        } else {
            // Pull mode.
            if !cfg.is_durable() {
                return Err(Error::ConsumerConfigInvalid(
                    "pull based consumer requires a durable name".into(),
                ));
            }
            if cfg.ack_policy != AckPolicy::Explicit {
                return Err(Error::ConsumerConfigInvalid(
                    "pull based consumer requires explicit ack".into(),
                ));
            }
            if cfg.rate_limit_bps > 0 {
                return Err(Error::ConsumerConfigInvalid(
                    "rate limit not supported for pull based consumer".into(),
                ));
            }
        }

        if cfg.opt_start_seq.is_some() && cfg.opt_start_time_ms.is_some() {
            return Err(Error::ConsumerConfigInvalid(
                "start sequence and start time can not both be set".into(),
            ));
        }
        match cfg.deliver_policy {
            DeliverPolicy::ByStartSequence => {
                if cfg.opt_start_seq.is_none() {
                    return Err(Error::ConsumerConfigInvalid(
                        "deliver by start sequence requires a start sequence".into(),
                    ));
                }
            }
            DeliverPolicy::ByStartTime => {
                if cfg.opt_start_time_ms.is_none() {
                    return Err(Error::ConsumerConfigInvalid(
                        "deliver by start time requires a start time".into(),
                    ));
                }
            }
            _ => {
                if cfg.opt_start_seq.is_some() || cfg.opt_start_time_ms.is_some() {
                    return Err(Error::ConsumerConfigInvalid(
                        "start position set but deliver policy does not use one".into(),
                    ));
                }
            }
        }

        if let Some(filter) = &cfg.filter_subject {
            if !subject::valid_subject(filter) {
                return Err(Error::ConsumerConfigInvalid("invalid filter subject".into()));
            }
            if !stream_cfg
                .subjects
                .iter()
                .any(|s| subject::subject_is_subset(filter, s))
            {
                return Err(Error::ConsumerConfigInvalid(
                    "filter subject is not bound to the stream".into(),
                ));
            }
        }

        if stream_cfg.retention == RetentionPolicy::WorkQueue {
            if cfg.deliver_policy != DeliverPolicy::All {
                return Err(Error::ConsumerConfigInvalid(
                    "workqueue stream requires deliver all".into(),
                ));
            }
            if cfg.ack_policy != AckPolicy::Explicit {
                return Err(Error::ConsumerConfigInvalid(
                    "workqueue stream requires explicit ack".into(),
                ));
            }
            // Consumers must partition the subject space.
            for existing in self.consumer_handles() {
                let other = existing.config().await;
                let overlap = match (&cfg.filter_subject, &other.filter_subject) {
                    (Some(a), Some(b)) => subject::subjects_overlap(a, b),
                    _ => true,
                };
                if overlap {
                    return Err(Error::ConsumerConfigInvalid(
                        "multiple non-filtered consumers not allowed on workqueue stream".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    // ---------------- lifecycle ----------------

    fn spawn_housekeeper(self: &Arc<Self>) {
        let stream = self.clone();
        self.tasks.spawn(async move {
            let cfg = stream.config.read().await.clone();
            let mut tick = cfg.duplicate_window_ms / 4;
            if cfg.max_age_ms > 0 {
                tick = tick.min(cfg.max_age_ms / 2);
            }
            let tick = tick.clamp(25, 1_000);
            loop {
                tokio::select! {
                    _ = stream.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(tick)) => {}
                }
                stream.housekeeping().await;
            }
        });
    }

    async fn housekeeping(&self) {
        let cfg = self.config.read().await.clone();
        let now = unix_millis();
        {
            let mut writer = self.writer.lock().await;
            writer
                .dedup
                .evict_older_than(now.saturating_sub(cfg.duplicate_window_ms));
        }
        if cfg.max_age_ms > 0 {
            loop {
                let st = self.store.state().await;
                if st.msgs == 0 || st.first_time == 0 || st.first_time + cfg.max_age_ms > now {
                    break;
                }
                if cfg.retention == RetentionPolicy::Interest
                    && !self.below_all_floors(st.first_seq).await
                {
                    break;
                }
                if !self.evict_oldest().await.unwrap_or(false) {
                    break;
                }
            }
        }
    }

    /// Number of dedup entries currently tracked (for info/testing).
    pub async fn dedup_len(&self) -> usize {
        self.writer.lock().await.dedup.len()
    }

    /// Stop all activity. `delete` additionally removes persisted state.
    pub(crate) async fn stop(&self, delete: bool) {
        self.deleted.store(true, Ordering::Release);
        self.shutdown.cancel();

        let names: Vec<String> = self.consumer_names();
        for name in names {
            if let Some((_, c)) = self.consumers.remove(&name) {
                c.stop().await;
                self.account.remove_consumer();
            }
        }
        self.tasks.shutdown().await;

        let st = self.store.state().await;
        if let Err(e) = self.store.stop().await {
            warn!(stream = %self.name, error = %e, "store close failed");
        }
        self.account.release_bytes(self.storage, st.bytes);

        if delete {
            if let Some(dirs) = &self.dirs {
                let _ = persist::remove_dir(dirs.dir());
            }
        }
    }
}
