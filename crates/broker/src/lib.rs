pub mod account;
pub mod api;
pub mod config;
pub mod consumer;
pub mod error;
pub mod persist;
pub mod server;
pub mod snapshot;
pub mod stream;
pub mod subject;
pub mod template;
pub mod test_util;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::queue::SegQueue;

pub use error::Error;

/// Reserved prefix of the management request surface.
pub const MGMT_PREFIX: &str = "mgmt.";

/// Prefix of consumer delivery reply tokens.
pub const ACK_PREFIX: &str = "$ACK";

/// Prefix of server-emitted advisory subjects.
pub const ADVISORY_PREFIX: &str = "$PLX.EVENT";

/// Header carrying the publisher-supplied message id for deduplication.
pub const MSG_ID_HEADER: &str = "Plexus-Msg-Id";

/// Tracks spawned background tasks so shutdown can drain them.
#[derive(Debug, Default)]
pub struct TaskGroup {
    handles: SegQueue<tokio::task::JoinHandle<()>>,
    shutdown: AtomicBool,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        // Hard gate: no tasks after shutdown
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }

        let handle = tokio::spawn(fut);

        if self.shutdown.load(Ordering::Acquire) {
            handle.abort();
        } else {
            self.handles.push(handle);
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        while let Some(h) = self.handles.pop() {
            h.abort();
        }
    }
}
