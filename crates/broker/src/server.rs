//! Server: routes inbound publishes to the management API, stream ingest,
//! ack handling, template instantiation, snapshot/restore plumbing, and
//! rehydrates persisted state on startup.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use plexus_storage::{record, HeaderMap};
use plexus_util::{random_token, unix_millis};

use crate::account::{AccountLimits, AccountResources};
use crate::api;
use crate::config::{StreamConfig, StreamInfo, TemplateConfig};
use crate::consumer::AckReply;
use crate::error::Error;
use crate::persist::{self, StreamDirs};
use crate::snapshot::{self, SnapshotHeader, SnapshotRequest};
use crate::stream::Stream;
use crate::subject::{subjects_overlap, valid_name};
use crate::template::{canonical_name, StreamTemplate};
use crate::transport::Transport;
use crate::{TaskGroup, ACK_PREFIX, MGMT_PREFIX};

/// One message routed to a registered inbox (snapshot chunk acks).
#[derive(Debug)]
pub struct InboxMsg {
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// Routes transient inbox subjects to in-flight tasks.
#[derive(Debug, Default)]
pub struct InboxRegistry {
    map: DashMap<String, mpsc::UnboundedSender<InboxMsg>>,
}

impl InboxRegistry {
    pub fn register(&self, subject: &str) -> mpsc::UnboundedReceiver<InboxMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.map.insert(subject.to_string(), tx);
        rx
    }

    pub fn unregister(&self, subject: &str) {
        self.map.remove(subject);
    }

    pub fn route(&self, subject: &str, msg: InboxMsg) -> bool {
        match self.map.get(subject) {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }
}

#[derive(Debug)]
struct RestoreSession {
    account: String,
    target: String,
    buf: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Root directory of the persisted layout; None disables persistence
    /// (and with it file-backed streams).
    pub store_root: Option<PathBuf>,
    pub account_limits: AccountLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            store_root: None,
            account_limits: AccountLimits::default(),
        }
    }
}

#[derive(Debug)]
pub struct Account {
    pub(crate) id: String,
    pub(crate) resources: Arc<AccountResources>,
    pub(crate) streams: DashMap<String, Arc<Stream>>,
    pub(crate) templates: DashMap<String, Arc<StreamTemplate>>,
}

impl Account {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug)]
pub struct Server {
    cfg: ServerConfig,
    pub(crate) transport: Arc<dyn Transport>,
    accounts: DashMap<String, Arc<Account>>,
    pub(crate) inboxes: Arc<InboxRegistry>,
    restores: DashMap<String, Arc<Mutex<RestoreSession>>>,
    pub(crate) tasks: Arc<TaskGroup>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(transport: Arc<dyn Transport>, cfg: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            transport,
            accounts: DashMap::new(),
            inboxes: Arc::new(InboxRegistry::default()),
            restores: DashMap::new(),
            tasks: Arc::new(TaskGroup::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Rehydrate persisted streams and durable consumers. Call once after
    /// construction.
    pub async fn recover(self: &Arc<Self>) {
        let Some(root) = self.cfg.store_root.clone() else {
            return;
        };
        for (account_id, streams) in persist::recover_root(&root) {
            for recovered in streams {
                let name = recovered.config.name.clone();
                let stream = match self
                    .add_stream_internal(&account_id, recovered.config, recovered.created)
                    .await
                {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(account = %account_id, stream = %name, error = %e, "stream recovery failed");
                        continue;
                    }
                };
                for c in recovered.consumers {
                    if let Err(e) = stream
                        .restore_consumer(c.name.clone(), c.config, c.state, c.created)
                        .await
                    {
                        warn!(stream = %name, consumer = %c.name, error = %e, "consumer recovery failed");
                    }
                }
                info!(account = %account_id, stream = %name, "recovered stream");
            }
        }
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let mut stops = Vec::new();
        for account in self.accounts.iter().map(|e| e.value().clone()).collect::<Vec<_>>() {
            let names: Vec<String> = account.streams.iter().map(|e| e.key().clone()).collect();
            for name in names {
                if let Some((_, s)) = account.streams.remove(&name) {
                    stops.push(async move { s.stop(false).await });
                }
            }
        }
        futures::future::join_all(stops).await;
        self.tasks.shutdown().await;
    }

    pub fn account(&self, id: &str) -> Arc<Account> {
        self.accounts
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Account {
                    id: id.to_string(),
                    resources: Arc::new(AccountResources::new(self.cfg.account_limits)),
                    streams: DashMap::new(),
                    templates: DashMap::new(),
                })
            })
            .clone()
    }

    // ---------------- streams ----------------

    pub async fn add_stream(
        self: &Arc<Self>,
        account_id: &str,
        config: StreamConfig,
    ) -> Result<Arc<Stream>, Error> {
        if config.template.is_some() {
            return Err(Error::StreamNameInvalid);
        }
        self.add_stream_internal(account_id, config, unix_millis())
            .await
    }

    async fn add_stream_internal(
        self: &Arc<Self>,
        account_id: &str,
        mut config: StreamConfig,
        created: plexus_util::UnixMillis,
    ) -> Result<Arc<Stream>, Error> {
        config.normalize()?;
        let account = self.account(account_id);

        if account.streams.contains_key(&config.name) {
            return Err(Error::StreamAlreadyExists);
        }
        for other in account.streams.iter().map(|e| e.value().clone()).collect::<Vec<_>>() {
            let other_cfg = other.config().await;
            for a in &config.subjects {
                for b in &other_cfg.subjects {
                    if subjects_overlap(a, b) {
                        return Err(Error::SubjectsOverlap);
                    }
                }
            }
        }

        account.resources.try_add_stream()?;

        let dirs = self
            .cfg
            .store_root
            .as_ref()
            .map(|root| StreamDirs::new(root, account_id, &config.name));

        let name = config.name.clone();
        match Stream::new(
            config,
            account.resources.clone(),
            self.transport.clone(),
            dirs,
            created,
        )
        .await
        {
            Ok(stream) => {
                account.streams.insert(name, stream.clone());
                Ok(stream)
            }
            Err(e) => {
                account.resources.remove_stream();
                Err(e)
            }
        }
    }

    pub fn lookup_stream(&self, account_id: &str, name: &str) -> Result<Arc<Stream>, Error> {
        self.account(account_id)
            .streams
            .get(name)
            .map(|e| e.value().clone())
            .ok_or(Error::StreamNotFound)
    }

    pub async fn update_stream(
        &self,
        account_id: &str,
        config: StreamConfig,
    ) -> Result<Arc<Stream>, Error> {
        let account = self.account(account_id);
        let stream = self.lookup_stream(account_id, &config.name)?;
        for other in account.streams.iter().map(|e| e.value().clone()).collect::<Vec<_>>() {
            if other.name() == config.name {
                continue;
            }
            let other_cfg = other.config().await;
            for a in &config.subjects {
                for b in &other_cfg.subjects {
                    if subjects_overlap(a, b) {
                        return Err(Error::SubjectsOverlap);
                    }
                }
            }
        }
        stream.update(config).await?;
        Ok(stream)
    }

    pub async fn delete_stream(&self, account_id: &str, name: &str) -> Result<(), Error> {
        let account = self.account(account_id);
        let Some((_, stream)) = account.streams.remove(name) else {
            return Err(Error::StreamNotFound);
        };
        let template = stream.config().await.template;
        stream.stop(true).await;
        account.resources.remove_stream();
        if let Some(tname) = template {
            if let Some(t) = account.templates.get(&tname) {
                t.unregister_stream(name);
            }
        }
        Ok(())
    }

    pub fn stream_names(&self, account_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .account(account_id)
            .streams
            .iter()
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn account_info(&self, account_id: &str) -> crate::account::AccountInfo {
        self.account(account_id).resources.info()
    }

    // ---------------- templates ----------------

    pub fn add_template(
        &self,
        account_id: &str,
        config: TemplateConfig,
    ) -> Result<Arc<StreamTemplate>, Error> {
        if !valid_name(&config.name) {
            return Err(Error::StreamNameInvalid);
        }
        let mut stream_cfg = config.config.clone();
        stream_cfg.normalize()?;
        let account = self.account(account_id);
        if account.templates.contains_key(&config.name) {
            return Err(Error::TemplateAlreadyExists);
        }
        let template = Arc::new(StreamTemplate::new(config.clone(), unix_millis()));
        account
            .templates
            .insert(config.name.clone(), template.clone());
        Ok(template)
    }

    pub fn lookup_template(
        &self,
        account_id: &str,
        name: &str,
    ) -> Result<Arc<StreamTemplate>, Error> {
        self.account(account_id)
            .templates
            .get(name)
            .map(|e| e.value().clone())
            .ok_or(Error::TemplateNotFound)
    }

    /// Deleting a template deletes every stream it created.
    pub async fn delete_template(&self, account_id: &str, name: &str) -> Result<(), Error> {
        let account = self.account(account_id);
        let Some((_, template)) = account.templates.remove(name) else {
            return Err(Error::TemplateNotFound);
        };
        for stream_name in template.stream_names() {
            if let Some((_, stream)) = account.streams.remove(&stream_name) {
                stream.stop(true).await;
                account.resources.remove_stream();
            }
        }
        Ok(())
    }

    pub fn template_names(&self, account_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .account(account_id)
            .templates
            .iter()
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    // ---------------- publish routing ----------------

    /// Entry point for every inbound publish the embedding layer hands us.
    pub async fn process_publish(
        self: &Arc<Self>,
        account_id: &str,
        subject: &str,
        headers: HeaderMap,
        payload: Bytes,
        reply: Option<&str>,
    ) {
        // Snapshot chunk acks and other transient inboxes.
        if self.inboxes.route(
            subject,
            InboxMsg {
                reply: reply.map(str::to_string),
                payload: payload.clone(),
            },
        ) {
            return;
        }

        if self.restores.contains_key(subject) {
            self.handle_restore_chunk(subject, payload, reply).await;
            return;
        }

        if subject.starts_with(ACK_PREFIX) {
            self.handle_ack_subject(account_id, subject, &payload, reply)
                .await;
            return;
        }

        if subject.starts_with(MGMT_PREFIX) {
            let response = api::dispatch(self, account_id, subject, &payload, reply).await;
            if let (Some(reply), Some(body)) = (reply, response) {
                let _ = self
                    .transport
                    .publish(reply, None, &HeaderMap::new(), Bytes::from(body))
                    .await;
            }
            return;
        }

        // A stream bound to this subject?
        let account = self.account(account_id);
        let streams: Vec<Arc<Stream>> =
            account.streams.iter().map(|e| e.value().clone()).collect();
        for stream in &streams {
            if stream.config().await.matches_subject(subject) {
                let _ = stream
                    .process_publish(subject, headers, payload, reply)
                    .await;
                return;
            }
        }

        // A template that should instantiate one?
        let templates: Vec<Arc<StreamTemplate>> =
            account.templates.iter().map(|e| e.value().clone()).collect();
        for template in templates {
            if !template.matches(subject) {
                continue;
            }
            let name = canonical_name(subject);
            if let Err(e) = template.try_register_stream(&name) {
                // Cap reached: the publish fails silently.
                debug!(template = %template.name(), subject, error = %e, "template refused stream");
                return;
            }
            let mut config = template.config().config.clone();
            config.name = name.clone();
            config.subjects = vec![subject.to_string()];
            config.template = Some(template.name().to_string());
            match self
                .add_stream_internal(account_id, config, unix_millis())
                .await
            {
                Ok(stream) => {
                    let _ = stream
                        .process_publish(subject, headers, payload, reply)
                        .await;
                }
                Err(e) => {
                    template.unregister_stream(&name);
                    warn!(template = %template.name(), subject, error = %e, "template stream create failed");
                }
            }
            return;
        }
    }

    async fn handle_ack_subject(
        &self,
        account_id: &str,
        subject: &str,
        body: &[u8],
        reply: Option<&str>,
    ) {
        let Some(token) = AckReply::parse(subject) else {
            return;
        };
        let Ok(stream) = self.lookup_stream(account_id, &token.stream) else {
            return;
        };
        let Some(consumer) = stream.get_consumer(&token.consumer) else {
            return;
        };
        consumer.handle_ack(&token, body, reply).await;
    }

    // ---------------- snapshot / restore ----------------

    pub(crate) async fn start_snapshot(
        self: &Arc<Self>,
        account_id: &str,
        name: &str,
        req: SnapshotRequest,
    ) -> Result<StreamInfo, Error> {
        let stream = self.lookup_stream(account_id, name)?;
        let info = stream.info().await;
        let transport = self.transport.clone();
        let inboxes = self.inboxes.clone();
        self.tasks.spawn(async move {
            if let Err(e) = snapshot::run_snapshot(stream, transport, inboxes, req).await {
                warn!(error = %e, "snapshot transfer failed");
            }
        });
        Ok(info)
    }

    pub(crate) fn start_restore(
        &self,
        account_id: &str,
        target: &str,
    ) -> Result<String, Error> {
        if !valid_name(target) {
            return Err(Error::StreamNameInvalid);
        }
        if self.account(account_id).streams.contains_key(target) {
            return Err(Error::StreamAlreadyExists);
        }
        let subject = format!("_RESTORE.{}.{}", target, random_token(12));
        self.restores.insert(
            subject.clone(),
            Arc::new(Mutex::new(RestoreSession {
                account: account_id.to_string(),
                target: target.to_string(),
                buf: Vec::new(),
            })),
        );
        Ok(subject)
    }

    async fn handle_restore_chunk(
        self: &Arc<Self>,
        subject: &str,
        payload: Bytes,
        reply: Option<&str>,
    ) {
        let Some(session) = self.restores.get(subject).map(|e| e.value().clone()) else {
            return;
        };

        if payload.is_empty() {
            // Terminator: build the stream and answer with its info.
            self.restores.remove(subject);
            let sess = session.lock().await;
            let result = self.finalize_restore(&sess).await;
            if let Some(reply) = reply {
                let body = match result {
                    Ok(info) => api::ok_body(&info),
                    Err(e) => api::error_body(&e),
                };
                let _ = self
                    .transport
                    .publish(reply, None, &HeaderMap::new(), Bytes::from(body))
                    .await;
            }
            return;
        }

        let Some(reply) = reply else {
            // No reply inbox means no flow control; the restore is dead.
            warn!(subject, "restore chunk without reply, aborting restore");
            self.restores.remove(subject);
            return;
        };

        session.lock().await.buf.extend_from_slice(&payload);
        let _ = self
            .transport
            .publish(reply, None, &HeaderMap::new(), Bytes::new())
            .await;
    }

    async fn finalize_restore(self: &Arc<Self>, sess: &RestoreSession) -> Result<StreamInfo, Error> {
        let buf = &sess.buf;
        let Some((header_bytes, mut pos)) = snapshot::decode_blob(buf)? else {
            return Err(Error::RestoreSubscriptionClosed);
        };
        let header: SnapshotHeader = serde_json::from_slice(&header_bytes)?;

        let mut config = header.config.clone();
        config.name = sess.target.clone();

        let stream = self
            .add_stream_internal(&sess.account, config, header.created)
            .await?;

        let result: Result<(), Error> = async {
            while pos < buf.len() {
                match record::decode_frame(&buf[pos..])? {
                    Some((rec, used)) => {
                        pos += used;
                        if rec.kind == record::REC_MSG {
                            stream.restore_message(rec.into_message()).await?;
                        }
                    }
                    None => {
                        return Err(Error::Store(plexus_storage::StoreError::BadRecord(
                            "truncated snapshot".into(),
                        )))
                    }
                }
            }
            for snap in &header.consumers {
                stream
                    .restore_consumer(
                        snap.name.clone(),
                        snap.config.clone(),
                        snap.state.clone(),
                        snap.created,
                    )
                    .await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            let _ = self.delete_stream(&sess.account, &sess.target).await;
            return Err(e);
        }
        Ok(stream.info().await)
    }

    // ---------------- interest events ----------------

    /// Transport signal: the last subscription on `subject` went away.
    pub async fn interest_lost(&self, account_id: &str, subject: &str) {
        let account = self.account(account_id);
        let streams: Vec<Arc<Stream>> =
            account.streams.iter().map(|e| e.value().clone()).collect();
        for stream in streams {
            for name in stream.consumer_names() {
                if let Some(c) = stream.get_consumer(&name) {
                    c.interest_lost(subject).await;
                }
            }
        }
        self.inboxes.unregister(subject);
        self.restores.remove(subject);
    }

    /// Transport signal: a subscription appeared on `subject`.
    pub async fn interest_gained(&self, account_id: &str, subject: &str) {
        let account = self.account(account_id);
        let streams: Vec<Arc<Stream>> =
            account.streams.iter().map(|e| e.value().clone()).collect();
        for stream in streams {
            for name in stream.consumer_names() {
                if let Some(c) = stream.get_consumer(&name) {
                    c.interest_gained(subject).await;
                }
            }
        }
    }
}
