//! In-memory transport and test harness.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use plexus_storage::HeaderMap;
use plexus_util::random_token;

use crate::account::AccountLimits;
use crate::config::{PubAck, StreamConfig};
use crate::error::Error;
use crate::server::{Server, ServerConfig};
use crate::stream::Stream;
use crate::subject::subject_matches;
use crate::transport::Transport;

/// One message observed by a test subscription.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Original message subject (for stream deliveries) or the publish
    /// subject itself.
    pub subject: String,
    /// Subject the message was routed on.
    pub routed_on: String,
    pub reply: Option<String>,
    pub headers: HeaderMap,
    pub payload: Bytes,
}

/// Loopback transport: subscriptions are plain channels keyed by pattern.
#[derive(Debug, Default)]
pub struct MemTransport {
    subs: DashMap<String, mpsc::UnboundedSender<Delivery>>,
}

impl MemTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, pattern: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.insert(pattern.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, pattern: &str) {
        self.subs.remove(pattern);
    }

    fn route(&self, routed_on: &str, delivery: Delivery) -> bool {
        let mut hit = false;
        let mut dead = Vec::new();
        for entry in self.subs.iter() {
            if subject_matches(entry.key(), routed_on) {
                if entry.value().send(delivery.clone()).is_ok() {
                    hit = true;
                } else {
                    dead.push(entry.key().clone());
                }
            }
        }
        for key in dead {
            self.subs.remove(&key);
        }
        hit
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        headers: &HeaderMap,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.route(
            subject,
            Delivery {
                subject: subject.to_string(),
                routed_on: subject.to_string(),
                reply: reply.map(str::to_string),
                headers: headers.clone(),
                payload,
            },
        );
        Ok(())
    }

    async fn deliver(
        &self,
        deliver_subject: &str,
        msg_subject: &str,
        reply: &str,
        headers: &HeaderMap,
        payload: Bytes,
    ) -> Result<(), Error> {
        let hit = self.route(
            deliver_subject,
            Delivery {
                subject: msg_subject.to_string(),
                routed_on: deliver_subject.to_string(),
                reply: Some(reply.to_string()),
                headers: headers.clone(),
                payload,
            },
        );
        if hit {
            Ok(())
        } else {
            Err(Error::NoResponders)
        }
    }

    fn has_interest(&self, subject: &str) -> bool {
        self.subs
            .iter()
            .any(|e| subject_matches(e.key(), subject))
    }
}

pub const TEST_ACCOUNT: &str = "$T";

pub struct TestState {
    pub transport: Arc<MemTransport>,
    pub server: Arc<Server>,
    store_root: Option<PathBuf>,
    limits: AccountLimits,
}

impl Default for TestState {
    fn default() -> Self {
        Self::new()
    }
}

impl TestState {
    pub fn new() -> Self {
        Self::build(None, AccountLimits::default())
    }

    pub fn with_root(root: &Path) -> Self {
        Self::build(Some(root.to_path_buf()), AccountLimits::default())
    }

    pub fn with_limits(limits: AccountLimits) -> Self {
        Self::build(None, limits)
    }

    fn build(store_root: Option<PathBuf>, limits: AccountLimits) -> Self {
        let transport = MemTransport::new();
        let server = Server::new(
            transport.clone(),
            ServerConfig {
                store_root: store_root.clone(),
                account_limits: limits,
            },
        );
        Self {
            transport,
            server,
            store_root,
            limits,
        }
    }

    /// Stop the server and bring a fresh one up over the same store root.
    pub async fn restart(&mut self) {
        self.server.stop().await;
        let server = Server::new(
            self.transport.clone(),
            ServerConfig {
                store_root: self.store_root.clone(),
                account_limits: self.limits,
            },
        );
        server.recover().await;
        self.server = server;
    }

    pub async fn recover(&self) {
        self.server.recover().await;
    }

    pub async fn add_stream(&self, config: StreamConfig) -> Result<Arc<Stream>, Error> {
        self.server.add_stream(TEST_ACCOUNT, config).await
    }

    pub fn lookup_stream(&self, name: &str) -> Result<Arc<Stream>, Error> {
        self.server.lookup_stream(TEST_ACCOUNT, name)
    }

    /// Fire-and-forget publish into the server.
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) {
        self.server
            .process_publish(TEST_ACCOUNT, subject, HeaderMap::new(), payload.into(), None)
            .await;
    }

    /// Request/reply publish; returns the first response within a second.
    pub async fn request(&self, subject: &str, payload: impl Into<Bytes>) -> Option<Delivery> {
        self.request_with_headers(subject, HeaderMap::new(), payload)
            .await
    }

    pub async fn request_with_headers(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: impl Into<Bytes>,
    ) -> Option<Delivery> {
        let inbox = format!("_INBOX.{}", random_token(12));
        let mut rx = self.transport.subscribe(&inbox);
        self.server
            .process_publish(
                TEST_ACCOUNT,
                subject,
                headers,
                payload.into(),
                Some(&inbox),
            )
            .await;
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten();
        self.transport.unsubscribe(&inbox);
        got
    }

    /// Request expecting a `+OK <json>` pub ack.
    pub async fn publish_expect_ack(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> Result<PubAck, String> {
        self.parse_ack(self.request(subject, payload).await)
    }

    pub async fn publish_with_id(
        &self,
        subject: &str,
        msg_id: &str,
        payload: impl Into<Bytes>,
    ) -> Result<PubAck, String> {
        let headers = vec![(crate::MSG_ID_HEADER.to_string(), vec![msg_id.to_string()])];
        self.parse_ack(
            self.request_with_headers(subject, headers, payload).await,
        )
    }

    fn parse_ack(&self, delivery: Option<Delivery>) -> Result<PubAck, String> {
        let Some(delivery) = delivery else {
            return Err("no response".into());
        };
        let text = String::from_utf8_lossy(&delivery.payload).to_string();
        if let Some(json) = text.strip_prefix("+OK ") {
            serde_json::from_str(json).map_err(|e| format!("bad pub ack: {e}"))
        } else {
            Err(text)
        }
    }

    /// JSON management request; panics on transport timeouts.
    pub async fn api(&self, subject: &str, body: impl Into<Bytes>) -> serde_json::Value {
        let resp = self
            .request(subject, body)
            .await
            .unwrap_or_else(|| panic!("no api response for {subject}"));
        serde_json::from_slice(&resp.payload)
            .unwrap_or_else(|e| panic!("bad api response for {subject}: {e}"))
    }

    /// Send an ack protocol body on a delivery's reply token.
    pub async fn respond(&self, delivery: &Delivery, body: &[u8]) {
        let reply = delivery.reply.clone().expect("delivery has a reply token");
        self.server
            .process_publish(
                TEST_ACCOUNT,
                &reply,
                HeaderMap::new(),
                Bytes::copy_from_slice(body),
                None,
            )
            .await;
    }

    /// Pull the next message for a durable pull consumer into `inbox`.
    pub async fn pull_next(&self, stream: &str, consumer: &str, inbox: &str) {
        self.server
            .process_publish(
                TEST_ACCOUNT,
                &format!("mgmt.CONSUMER.MSG.NEXT.{stream}.{consumer}"),
                HeaderMap::new(),
                Bytes::new(),
                Some(inbox),
            )
            .await;
    }

    pub async fn recv(
        rx: &mut mpsc::UnboundedReceiver<Delivery>,
        timeout_ms: u64,
    ) -> Option<Delivery> {
        tokio::time::timeout(Duration::from_millis(timeout_ms), rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn expect_no_message(rx: &mut mpsc::UnboundedReceiver<Delivery>, timeout_ms: u64) {
        if let Some(d) = Self::recv(rx, timeout_ms).await {
            panic!(
                "unexpected message on {}: {:?}",
                d.routed_on,
                String::from_utf8_lossy(&d.payload)
            );
        }
    }
}
