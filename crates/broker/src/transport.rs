//! Seam to the underlying pub/sub transport.
//!
//! The core publishes acks, deliveries and advisories through this trait
//! and asks it about live subscription interest. Inbound traffic (client
//! publishes, ack bodies, pull requests) is pushed into the core by the
//! embedding layer via [`crate::server::Server::process_publish`].

use async_trait::async_trait;
use bytes::Bytes;

use plexus_storage::HeaderMap;

use crate::error::Error;

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Publish a plain message (ack responses, advisories, snapshot
    /// chunks).
    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        headers: &HeaderMap,
        payload: Bytes,
    ) -> Result<(), Error>;

    /// Deliver a stream message on `deliver_subject`, preserving the
    /// original publish subject and carrying the ack reply token.
    async fn deliver(
        &self,
        deliver_subject: &str,
        msg_subject: &str,
        reply: &str,
        headers: &HeaderMap,
        payload: Bytes,
    ) -> Result<(), Error>;

    /// Is there an active subscription matching `subject` right now?
    fn has_interest(&self, subject: &str) -> bool;
}
