//! Consumer: delivery state machine over a parent stream.
//!
//! Each consumer runs one delivery task, woken by new stream data, ack
//! traffic, pull requests and redelivery timers. All mutable state sits
//! behind one mutex so ack processing and delivery are mutually exclusive.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use plexus_storage::{MessageStore, Seq, StoreError, UnixMillis};
use plexus_util::unix_millis;

use crate::config::{
    AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, ReplayPolicy, RetentionPolicy,
    SequencePair, DEFAULT_INACTIVE_THRESHOLD_MS,
};
use crate::error::Error;
use crate::persist::{self, ConsumerStateSnapshot, PendingSnapshot, StreamDirs};
use crate::stream::Stream;
use crate::subject::subject_matches;
use crate::transport::Transport;
use crate::{ACK_PREFIX, ADVISORY_PREFIX};

/// Parsed delivery reply token:
/// `$ACK.<stream>.<consumer>.<delivery_count>.<stream_seq>.<consumer_seq>.<timestamp>.<pending>`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckReply {
    pub stream: String,
    pub consumer: String,
    pub delivery_count: u64,
    pub stream_seq: Seq,
    pub consumer_seq: u64,
    pub timestamp: UnixMillis,
    pub pending: u64,
}

impl AckReply {
    pub fn token(
        stream: &str,
        consumer: &str,
        delivery_count: u64,
        stream_seq: Seq,
        consumer_seq: u64,
        timestamp: UnixMillis,
        pending: u64,
    ) -> String {
        format!(
            "{ACK_PREFIX}.{stream}.{consumer}.{delivery_count}.{stream_seq}.{consumer_seq}.{timestamp}.{pending}"
        )
    }

    pub fn parse(subject: &str) -> Option<Self> {
        let rest = subject.strip_prefix(ACK_PREFIX)?.strip_prefix('.')?;
        let toks: Vec<&str> = rest.split('.').collect();
        if toks.len() != 7 {
            return None;
        }
        Some(Self {
            stream: toks[0].to_string(),
            consumer: toks[1].to_string(),
            delivery_count: toks[2].parse().ok()?,
            stream_seq: toks[3].parse().ok()?,
            consumer_seq: toks[4].parse().ok()?,
            timestamp: toks[5].parse().ok()?,
            pending: toks[6].parse().ok()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nak,
    InProgress,
    Term,
    /// Ack plus a pull request for this inbox.
    Next(usize),
}

impl AckKind {
    pub fn parse(body: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(body).ok()?.trim();
        if text.is_empty() || text == "+ACK" {
            return Some(AckKind::Ack);
        }
        if text == "-NAK" {
            return Some(AckKind::Nak);
        }
        if text == "+WPI" {
            return Some(AckKind::InProgress);
        }
        if text == "+TERM" {
            return Some(AckKind::Term);
        }
        if let Some(rest) = text.strip_prefix("+NXT") {
            let rest = rest.trim();
            let batch = if rest.is_empty() {
                1
            } else {
                rest.parse().ok()?
            };
            return Some(AckKind::Next(batch));
        }
        None
    }
}

#[derive(Serialize)]
struct TerminatedAdvisory<'a> {
    stream: &'a str,
    consumer: &'a str,
    stream_seq: Seq,
    consumer_seq: u64,
    deliveries: u64,
    reason: &'a str,
}

#[derive(Clone, Copy, Debug)]
struct PendingEntry {
    consumer_seq: u64,
    delivered_at: UnixMillis,
    delivery_count: u64,
    timer_deadline: UnixMillis,
}

#[derive(Clone, Debug)]
struct Waiter {
    reply: String,
    batch: usize,
    expires: Option<UnixMillis>,
}

#[derive(Debug)]
struct TokenBucket {
    rate_bps: u64,
    tokens: f64,
    last: UnixMillis,
}

impl TokenBucket {
    fn new(rate_bps: u64) -> Self {
        Self {
            rate_bps,
            tokens: rate_bps as f64,
            last: unix_millis(),
        }
    }

    /// Take `bits` from the bucket or report how long until they fit.
    fn try_take(&mut self, bits: u64, now: UnixMillis) -> Result<(), Duration> {
        let elapsed_ms = now.saturating_sub(self.last);
        self.last = now;
        self.tokens = (self.tokens + self.rate_bps as f64 * elapsed_ms as f64 / 1000.0)
            .min(self.rate_bps as f64);
        if self.tokens >= bits as f64 {
            self.tokens -= bits as f64;
            return Ok(());
        }
        let deficit = bits as f64 - self.tokens;
        let wait_ms = (deficit * 1000.0 / self.rate_bps as f64).ceil() as u64;
        Err(Duration::from_millis(wait_ms.max(1)))
    }
}

#[derive(Debug)]
struct ConsumerState {
    config: ConsumerConfig,
    delivered: SequencePair,
    ack_floor: SequencePair,
    pending: HashMap<Seq, PendingEntry>,
    timers: BinaryHeap<Reverse<(UnixMillis, Seq)>>,
    rdq: VecDeque<Seq>,
    rdq_set: HashSet<Seq>,
    waiters: VecDeque<Waiter>,
    terminated: HashSet<Seq>,
    num_redelivered: u64,
    num_pending: u64,
    active: bool,
    inactive_since: Option<UnixMillis>,
    last_delivery_at: UnixMillis,
    last_stored_ts: Option<UnixMillis>,
    rate: Option<TokenBucket>,
    dirty: bool,
}

impl ConsumerState {
    fn recompute_floor(&mut self) -> bool {
        let before = self.ack_floor.stream_seq;
        if self.pending.is_empty() {
            self.ack_floor = self.delivered;
        } else {
            let min_sseq = *self.pending.keys().min().expect("pending non-empty");
            let min_cseq = self
                .pending
                .values()
                .map(|p| p.consumer_seq)
                .min()
                .expect("pending non-empty");
            self.ack_floor.stream_seq = min_sseq.saturating_sub(1);
            self.ack_floor.consumer_seq = min_cseq.saturating_sub(1);
        }
        self.ack_floor.stream_seq > before
    }

    fn matches_filter(&self, subject: &str) -> bool {
        match &self.config.filter_subject {
            Some(f) => subject_matches(f, subject),
            None => true,
        }
    }

    fn push_rdq_back(&mut self, seq: Seq) {
        if self.rdq_set.insert(seq) {
            self.rdq.push_back(seq);
        }
    }

    fn push_rdq_front(&mut self, seq: Seq) {
        if self.rdq_set.insert(seq) {
            self.rdq.push_front(seq);
        }
    }

    fn schedule_timer(&mut self, seq: Seq, deadline: UnixMillis) {
        self.timers.push(Reverse((deadline, seq)));
    }

    fn snapshot(&self) -> ConsumerStateSnapshot {
        let mut pending: Vec<PendingSnapshot> = self
            .pending
            .iter()
            .map(|(seq, e)| PendingSnapshot {
                stream_seq: *seq,
                consumer_seq: e.consumer_seq,
                delivery_count: e.delivery_count,
            })
            .collect();
        pending.sort_by_key(|p| p.stream_seq);
        ConsumerStateSnapshot {
            delivered: self.delivered,
            ack_floor: self.ack_floor,
            pending,
            redeliver: self.rdq.iter().copied().collect(),
        }
    }
}

enum Step {
    Delivered { floor_advanced: bool },
    Delay(Duration),
    Idle,
}

#[derive(Debug)]
pub struct Consumer {
    name: String,
    stream_name: String,
    created: UnixMillis,
    retention: RetentionPolicy,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn Transport>,
    stream: Weak<Stream>,
    dirs: Option<StreamDirs>,
    state: Mutex<ConsumerState>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl Consumer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created(&self) -> UnixMillis {
        self.created
    }

    pub async fn config(&self) -> ConsumerConfig {
        self.state.lock().await.config.clone()
    }

    pub async fn is_durable(&self) -> bool {
        self.state.lock().await.config.is_durable()
    }

    pub(crate) async fn spawn(
        stream: &Arc<Stream>,
        name: String,
        config: ConsumerConfig,
        restored: Option<ConsumerStateSnapshot>,
        created: UnixMillis,
    ) -> Result<Arc<Self>, Error> {
        let store = stream.store.clone();
        let store_state = store.state().await;

        // Start cursor: highest stream sequence considered already handled.
        let mut delivered = SequencePair::default();
        delivered.stream_seq = match config.deliver_policy {
            DeliverPolicy::All => store_state.first_seq.saturating_sub(1),
            DeliverPolicy::New => store_state.last_seq,
            DeliverPolicy::ByStartSequence => {
                config.opt_start_seq.unwrap_or(store_state.first_seq).saturating_sub(1)
            }
            DeliverPolicy::ByStartTime => {
                let t = config.opt_start_time_ms.unwrap_or(0);
                store.first_seq_since(t).await?.saturating_sub(1)
            }
            DeliverPolicy::Last => {
                let mut last_match = 0;
                let mut cursor = store_state.first_seq;
                loop {
                    let batch = store.scan_from(cursor, 128).await?;
                    if batch.is_empty() {
                        break;
                    }
                    for m in &batch {
                        let hit = match &config.filter_subject {
                            Some(f) => subject_matches(f, &m.subject),
                            None => true,
                        };
                        if hit {
                            last_match = m.seq;
                        }
                        cursor = m.seq + 1;
                    }
                }
                if last_match > 0 {
                    last_match - 1
                } else {
                    store_state.last_seq
                }
            }
        };

        let mut state = ConsumerState {
            config: config.clone(),
            delivered,
            ack_floor: delivered,
            pending: HashMap::new(),
            timers: BinaryHeap::new(),
            rdq: VecDeque::new(),
            rdq_set: HashSet::new(),
            waiters: VecDeque::new(),
            terminated: HashSet::new(),
            num_redelivered: 0,
            num_pending: 0,
            active: true,
            inactive_since: None,
            last_delivery_at: 0,
            last_stored_ts: None,
            rate: (config.rate_limit_bps > 0).then(|| TokenBucket::new(config.rate_limit_bps)),
            dirty: false,
        };

        if let Some(snap) = restored {
            state.delivered = snap.delivered;
            state.ack_floor = snap.ack_floor;
            let now = unix_millis();
            let ack_wait = config.ack_wait();
            for p in snap.pending {
                state.pending.insert(
                    p.stream_seq,
                    PendingEntry {
                        consumer_seq: p.consumer_seq,
                        delivered_at: now,
                        delivery_count: p.delivery_count,
                        timer_deadline: now + ack_wait,
                    },
                );
                state.schedule_timer(p.stream_seq, now + ack_wait);
            }
            for seq in snap.redeliver {
                state.push_rdq_back(seq);
            }
        }

        if let Some(ds) = &config.deliver_subject {
            state.active = stream.transport.has_interest(ds);
            if !state.active {
                state.inactive_since = Some(unix_millis());
            }
        }

        // Count filter matches beyond the cursor for num_pending.
        let mut cursor = state.delivered.stream_seq + 1;
        loop {
            let batch = store.scan_from(cursor, 128).await?;
            if batch.is_empty() {
                break;
            }
            for m in &batch {
                if state.matches_filter(&m.subject) {
                    state.num_pending += 1;
                }
                cursor = m.seq + 1;
            }
        }

        let consumer = Arc::new(Self {
            name,
            stream_name: stream.name().to_string(),
            created,
            retention: stream.retention(),
            store,
            transport: stream.transport.clone(),
            stream: Arc::downgrade(stream),
            dirs: stream.dirs.clone(),
            state: Mutex::new(state),
            notify: Notify::new(),
            shutdown: stream.shutdown.child_token(),
        });

        let task = consumer.clone();
        stream.tasks.spawn(async move { task.run().await });
        consumer.notify.notify_one();
        Ok(consumer)
    }

    /// Stream signal: a new message was appended.
    pub(crate) async fn on_new_message(&self, seq: Seq, subject: &str) {
        {
            let mut st = self.state.lock().await;
            if seq > st.delivered.stream_seq && st.matches_filter(subject) {
                st.num_pending += 1;
            }
        }
        self.notify.notify_one();
    }

    /// Stream signal: a message was evicted/deleted out from under us.
    pub(crate) async fn on_evicted(&self, seq: Seq, subject: &str) {
        let mut st = self.state.lock().await;
        if seq > st.delivered.stream_seq && st.matches_filter(subject) {
            st.num_pending = st.num_pending.saturating_sub(1);
        }
        if st.pending.remove(&seq).is_some() {
            st.recompute_floor();
            st.dirty = true;
        }
        st.terminated.remove(&seq);
    }

    /// Stream purge: everything below `last_seq + 1` is gone.
    pub(crate) async fn on_purge(&self, last_seq: Seq) {
        let mut st = self.state.lock().await;
        st.pending.clear();
        st.rdq.clear();
        st.rdq_set.clear();
        st.timers.clear();
        st.terminated.clear();
        st.num_pending = 0;
        if st.delivered.stream_seq < last_seq {
            st.delivered.stream_seq = last_seq;
        }
        st.recompute_floor();
        st.dirty = true;
        drop(st);
        self.notify.notify_one();
    }

    /// Pull request: queue a waiter for this inbox.
    pub async fn request_next(
        &self,
        reply: &str,
        batch: usize,
        expires: Option<UnixMillis>,
    ) -> Result<(), Error> {
        {
            let mut st = self.state.lock().await;
            if !st.config.is_pull() {
                return Err(Error::ConsumerConfigInvalid(
                    "consumer is push based".into(),
                ));
            }
            st.waiters.push_back(Waiter {
                reply: reply.to_string(),
                batch: batch.max(1),
                expires,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Transport reports no more interest on `subject`.
    pub(crate) async fn interest_lost(&self, subject: &str) {
        let mut st = self.state.lock().await;
        if st.config.deliver_subject.as_deref() == Some(subject) && st.active {
            st.active = false;
            st.inactive_since = Some(unix_millis());
        }
        st.waiters.retain(|w| w.reply != subject);
        drop(st);
        self.notify.notify_one();
    }

    pub(crate) async fn interest_gained(&self, subject: &str) {
        let mut st = self.state.lock().await;
        if st.config.deliver_subject.as_deref() == Some(subject) {
            st.active = true;
            st.inactive_since = None;
        }
        drop(st);
        self.notify.notify_one();
    }

    /// Only the delivery subject may change, and only while inactive.
    pub(crate) async fn update_deliver_subject(&self, subject: String) -> Result<(), Error> {
        let mut st = self.state.lock().await;
        if st.config.is_pull() {
            return Err(Error::ConsumerConfigInvalid(
                "consumer is pull based".into(),
            ));
        }
        if st.active {
            return Err(Error::ConsumerAlreadyExists);
        }
        st.config.deliver_subject = Some(subject);
        st.active = true;
        st.inactive_since = None;
        st.dirty = true;
        drop(st);
        self.notify.notify_one();
        Ok(())
    }

    pub async fn info(&self) -> ConsumerInfo {
        let st = self.state.lock().await;
        ConsumerInfo {
            stream_name: self.stream_name.clone(),
            name: self.name.clone(),
            created: self.created,
            config: st.config.clone(),
            delivered: st.delivered,
            ack_floor: st.ack_floor,
            num_ack_pending: st.pending.len(),
            num_redelivered: st.num_redelivered,
            num_waiting: st.waiters.len(),
            num_pending: st.num_pending,
        }
    }

    pub async fn ack_floor(&self) -> SequencePair {
        self.state.lock().await.ack_floor
    }

    pub(crate) async fn state_snapshot(&self) -> ConsumerStateSnapshot {
        self.state.lock().await.snapshot()
    }

    pub(crate) async fn stop(&self) {
        self.shutdown.cancel();
        self.persist_state().await;
    }

    async fn persist_state(&self) {
        let Some(dirs) = &self.dirs else { return };
        let snap = {
            let mut st = self.state.lock().await;
            if !st.config.is_durable() {
                return;
            }
            st.dirty = false;
            st.snapshot()
        };
        if let Err(e) = persist::write_json_atomic(&dirs.consumer_state_path(&self.name), &snap) {
            warn!(consumer = %self.name, error = %e, "failed to persist consumer state");
        }
    }

    /// Handle an ack protocol body published to one of our reply tokens.
    pub async fn handle_ack(&self, token: &AckReply, body: &[u8], reply: Option<&str>) {
        let Some(kind) = AckKind::parse(body) else {
            debug!(consumer = %self.name, "ignoring unparseable ack body");
            return;
        };

        let now = unix_millis();
        let mut acked: Vec<Seq> = Vec::new();
        let mut advisory: Option<Vec<u8>> = None;
        let floor_advanced;
        {
            let mut st = self.state.lock().await;
            match kind {
                AckKind::Ack | AckKind::Next(_) => {
                    self.apply_ack(&mut st, token.stream_seq, &mut acked);
                    if let AckKind::Next(batch) = kind {
                        if let Some(reply) = reply {
                            st.waiters.push_back(Waiter {
                                reply: reply.to_string(),
                                batch: batch.max(1),
                                expires: None,
                            });
                        }
                    }
                }
                AckKind::Nak => {
                    if st.pending.contains_key(&token.stream_seq) {
                        st.push_rdq_front(token.stream_seq);
                    }
                }
                AckKind::InProgress => {
                    let ack_wait = st.config.ack_wait();
                    if let Some(entry) = st.pending.get_mut(&token.stream_seq) {
                        entry.delivered_at = now;
                        entry.timer_deadline = now + ack_wait;
                        let deadline = entry.timer_deadline;
                        st.schedule_timer(token.stream_seq, deadline);
                    }
                }
                AckKind::Term => {
                    if let Some(entry) = st.pending.remove(&token.stream_seq) {
                        st.terminated.insert(token.stream_seq);
                        let adv = TerminatedAdvisory {
                            stream: &self.stream_name,
                            consumer: &self.name,
                            stream_seq: token.stream_seq,
                            consumer_seq: entry.consumer_seq,
                            deliveries: entry.delivery_count,
                            reason: "consumer terminated the message",
                        };
                        advisory = serde_json::to_vec(&adv).ok();
                    }
                }
            }
            floor_advanced = st.recompute_floor();
            st.dirty = true;
        }

        // Probe acks (a reply inbox on a plain ack) get a confirmation.
        if matches!(kind, AckKind::Ack) {
            if let Some(reply) = reply {
                let _ = self
                    .transport
                    .publish(reply, None, &Vec::new(), Bytes::from_static(b"+OK"))
                    .await;
            }
        }

        if let Some(body) = advisory {
            let subject = format!(
                "{ADVISORY_PREFIX}.TERMINATED.{}.{}",
                self.stream_name, self.name
            );
            let _ = self
                .transport
                .publish(&subject, None, &Vec::new(), Bytes::from(body))
                .await;
        }

        if let Some(stream) = self.stream.upgrade() {
            match self.retention {
                RetentionPolicy::WorkQueue => {
                    for seq in &acked {
                        stream.workqueue_remove(*seq).await;
                    }
                }
                RetentionPolicy::Interest => {
                    if floor_advanced || matches!(kind, AckKind::Term) {
                        stream.interest_sweep().await;
                    }
                }
                RetentionPolicy::Limits => {}
            }
        }

        self.notify.notify_one();
    }

    fn apply_ack(&self, st: &mut ConsumerState, stream_seq: Seq, acked: &mut Vec<Seq>) {
        match st.config.ack_policy {
            AckPolicy::None => {}
            AckPolicy::Explicit => {
                if st.pending.remove(&stream_seq).is_some() {
                    acked.push(stream_seq);
                }
            }
            AckPolicy::All => {
                let below: Vec<Seq> = st
                    .pending
                    .keys()
                    .copied()
                    .filter(|s| *s <= stream_seq)
                    .collect();
                for seq in below {
                    st.pending.remove(&seq);
                    acked.push(seq);
                }
            }
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            let wake_at = self.next_wake().await;
            let sleep = wake_at.map(|at| {
                let now = unix_millis();
                Duration::from_millis(at.saturating_sub(now))
            });

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = async {
                    match sleep {
                        Some(d) => tokio::time::sleep(d).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }

            if self.check_inactivity().await {
                break;
            }
            self.run_cycle().await;
            self.flush_if_dirty().await;
        }
        debug!(stream = %self.stream_name, consumer = %self.name, "delivery task exiting");
    }

    async fn next_wake(&self) -> Option<UnixMillis> {
        let st = self.state.lock().await;
        let mut wake: Option<UnixMillis> = None;
        let mut consider = |t: UnixMillis| {
            wake = Some(wake.map_or(t, |w| w.min(t)));
        };
        if let Some(Reverse((deadline, _))) = st.timers.peek() {
            consider(*deadline);
        }
        for w in &st.waiters {
            if let Some(e) = w.expires {
                consider(e);
            }
        }
        if st.config.is_pull() || st.config.is_durable() {
            // durable and pull consumers never die of inactivity
        } else if let Some(since) = st.inactive_since {
            consider(since + DEFAULT_INACTIVE_THRESHOLD_MS);
        }
        if st.dirty && st.config.is_durable() && self.dirs.is_some() {
            consider(unix_millis() + 100);
        }
        wake
    }

    /// Returns true when this ephemeral consumer timed out and removed
    /// itself.
    async fn check_inactivity(&self) -> bool {
        let expired = {
            let st = self.state.lock().await;
            if st.config.is_durable() || st.config.is_pull() {
                false
            } else {
                match st.inactive_since {
                    Some(since) => {
                        !st.active && unix_millis() >= since + DEFAULT_INACTIVE_THRESHOLD_MS
                    }
                    None => false,
                }
            }
        };
        if !expired {
            return false;
        }
        if let Some(stream) = self.stream.upgrade() {
            debug!(consumer = %self.name, "removing idle ephemeral consumer");
            let _ = stream.delete_consumer(&self.name).await;
        }
        true
    }

    async fn flush_if_dirty(&self) {
        if self.dirs.is_none() {
            return;
        }
        let dirty = {
            let st = self.state.lock().await;
            st.dirty && st.config.is_durable()
        };
        if dirty {
            self.persist_state().await;
        }
    }

    async fn run_cycle(self: &Arc<Self>) {
        loop {
            let step = {
                let mut st = self.state.lock().await;
                self.step(&mut st).await
            };
            match step {
                Step::Delivered { floor_advanced } => {
                    if floor_advanced && self.retention == RetentionPolicy::Interest {
                        if let Some(stream) = self.stream.upgrade() {
                            stream.interest_sweep().await;
                        }
                    }
                }
                Step::Delay(d) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(d) => {}
                    }
                }
                Step::Idle => return,
            }
        }
    }

    async fn step(&self, st: &mut ConsumerState) -> Step {
        let now = unix_millis();
        self.expire_timers(st, now);
        st.waiters
            .retain(|w| w.expires.map_or(true, |e| e > now));

        let is_pull = st.config.is_pull();
        if is_pull && st.waiters.is_empty() {
            return Step::Idle;
        }

        // Redeliveries take priority over fresh messages.
        let mut redelivery = None;
        while let Some(&seq) = st.rdq.front() {
            if !st.pending.contains_key(&seq) {
                st.rdq.pop_front();
                st.rdq_set.remove(&seq);
                continue;
            }
            redelivery = Some(seq);
            break;
        }

        let (msg, is_redelivery) = if let Some(seq) = redelivery {
            match self.store.get(seq).await {
                Ok(m) => (m, true),
                Err(StoreError::NotFound) => {
                    // Evicted while queued; it can never be delivered.
                    st.rdq.pop_front();
                    st.rdq_set.remove(&seq);
                    st.pending.remove(&seq);
                    let floor_advanced = st.recompute_floor();
                    st.dirty = true;
                    return Step::Delivered { floor_advanced };
                }
                Err(e) => {
                    warn!(consumer = %self.name, seq, error = %e, "redelivery read failed");
                    st.rdq.pop_front();
                    st.rdq_set.remove(&seq);
                    return Step::Delivered {
                        floor_advanced: false,
                    };
                }
            }
        } else {
            match self.next_fresh(st).await {
                Ok(Some(m)) => (m, false),
                Ok(None) => return Step::Idle,
                Err(e) => {
                    warn!(consumer = %self.name, error = %e, "fresh scan failed");
                    return Step::Idle;
                }
            }
        };

        // Replay pacing reproduces the stored inter-arrival gaps.
        if !is_redelivery && st.config.replay_policy == ReplayPolicy::Original {
            if let Some(prev_ts) = st.last_stored_ts {
                let gap = msg.timestamp.saturating_sub(prev_ts);
                let due = st.last_delivery_at + gap;
                if now < due {
                    return Step::Delay(Duration::from_millis(due - now));
                }
            }
        }

        if let Some(bucket) = st.rate.as_mut() {
            let bits = msg.size() * 8;
            if let Err(wait) = bucket.try_take(bits, now) {
                return Step::Delay(wait);
            }
        }

        let consumer_seq = st.delivered.consumer_seq + 1;
        let delivery_count = if is_redelivery {
            let entry = st.pending.get(&msg.seq).expect("redelivery is pending");
            entry.delivery_count + 1
        } else {
            1
        };

        if is_redelivery {
            st.rdq.pop_front();
            st.rdq_set.remove(&msg.seq);
            st.num_redelivered += 1;
        } else {
            st.num_pending = st.num_pending.saturating_sub(1);
            st.last_stored_ts = Some(msg.timestamp);
        }

        st.delivered.consumer_seq = consumer_seq;
        if msg.seq > st.delivered.stream_seq {
            st.delivered.stream_seq = msg.seq;
        }
        st.last_delivery_at = now;

        let ack_wait = st.config.ack_wait();
        if st.config.ack_policy != AckPolicy::None {
            st.pending.insert(
                msg.seq,
                PendingEntry {
                    consumer_seq,
                    delivered_at: now,
                    delivery_count,
                    timer_deadline: now + ack_wait,
                },
            );
            st.schedule_timer(msg.seq, now + ack_wait);
        }

        let token = AckReply::token(
            &self.stream_name,
            &self.name,
            delivery_count,
            msg.seq,
            consumer_seq,
            now,
            st.num_pending,
        );

        let target = if is_pull {
            let waiter = st.waiters.front_mut().expect("pull checked above");
            waiter.batch -= 1;
            let reply = waiter.reply.clone();
            if waiter.batch == 0 {
                st.waiters.pop_front();
            }
            reply
        } else {
            st.config
                .deliver_subject
                .clone()
                .expect("push consumer has deliver subject")
        };

        if let Err(e) = self
            .transport
            .deliver(&target, &msg.subject, &token, &msg.headers, msg.payload.clone())
            .await
        {
            // No interest is tolerated: the ack-wait timer redelivers.
            debug!(consumer = %self.name, seq = msg.seq, error = %e, "delivery not received");
        }

        let mut floor_advanced = false;
        if st.config.ack_policy == AckPolicy::None {
            floor_advanced = st.recompute_floor();
        }
        st.dirty = true;
        Step::Delivered { floor_advanced }
    }

    fn expire_timers(&self, st: &mut ConsumerState, now: UnixMillis) {
        let max_deliver = st.config.max_deliver;
        loop {
            let Some(Reverse((deadline, seq))) = st.timers.peek().copied() else {
                break;
            };
            if deadline > now {
                break;
            }
            st.timers.pop();
            let Some(entry) = st.pending.get(&seq) else {
                continue; // acked/evicted in the meantime
            };
            if entry.timer_deadline != deadline {
                continue; // rescheduled by WPI or a redelivery
            }
            if max_deliver > 0 && entry.delivery_count >= max_deliver as u64 {
                // Delivery attempts exhausted; stays pending until acked,
                // terminated or evicted.
                continue;
            }
            st.push_rdq_back(seq);
        }
    }

    async fn next_fresh(
        &self,
        st: &mut ConsumerState,
    ) -> Result<Option<plexus_storage::Message>, StoreError> {
        let mut cursor = st.delivered.stream_seq + 1;
        loop {
            let batch = self.store.scan_from(cursor, 64).await?;
            if batch.is_empty() {
                return Ok(None);
            }
            let got = batch.len();
            for m in batch {
                cursor = m.seq + 1;
                if st.matches_filter(&m.subject) {
                    return Ok(Some(m));
                }
                // Filtered-out messages are permanently skipped.
                if m.seq > st.delivered.stream_seq {
                    st.delivered.stream_seq = m.seq;
                }
            }
            if got < 64 {
                return Ok(None);
            }
        }
    }
}
