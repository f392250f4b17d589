//! Crash-safe on-disk layout for stream and consumer config/state.
//!
//! ```text
//! <root>/<account>/streams/<stream>/config.json
//! <root>/<account>/streams/<stream>/messages/        (file storage blocks)
//! <root>/<account>/streams/<stream>/consumers/<name>/config.json
//! <root>/<account>/streams/<stream>/consumers/<name>/state.json
//! ```
//!
//! JSON writes go through a temp file and an atomic rename.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use plexus_util::UnixMillis;

use crate::config::{ConsumerConfig, SequencePair, StreamConfig};
use crate::error::Error;

const STREAMS_DIR: &str = "streams";
const MESSAGES_DIR: &str = "messages";
const CONSUMERS_DIR: &str = "consumers";
const CONFIG_FILE: &str = "config.json";
const STATE_FILE: &str = "state.json";

#[derive(Clone, Debug)]
pub struct StreamDirs {
    dir: PathBuf,
}

impl StreamDirs {
    pub fn new(root: &Path, account: &str, stream: &str) -> Self {
        Self {
            dir: root.join(account).join(STREAMS_DIR).join(stream),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.dir.join(MESSAGES_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn consumer_dir(&self, name: &str) -> PathBuf {
        self.dir.join(CONSUMERS_DIR).join(name)
    }

    pub fn consumer_config_path(&self, name: &str) -> PathBuf {
        self.consumer_dir(name).join(CONFIG_FILE)
    }

    pub fn consumer_state_path(&self, name: &str) -> PathBuf {
        self.consumer_dir(name).join(STATE_FILE)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredStreamConfig {
    pub config: StreamConfig,
    pub created: UnixMillis,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredConsumerConfig {
    pub name: String,
    pub config: ConsumerConfig,
    pub created: UnixMillis,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PendingSnapshot {
    pub stream_seq: u64,
    pub consumer_seq: u64,
    pub delivery_count: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConsumerStateSnapshot {
    pub delivered: SequencePair,
    pub ack_floor: SequencePair,
    #[serde(default)]
    pub pending: Vec<PendingSnapshot>,
    #[serde(default)]
    pub redeliver: Vec<u64>,
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let parent = path.parent().ok_or_else(|| {
        Error::Store(plexus_storage::StoreError::Io(std::io::Error::other(
            "path has no parent",
        )))
    })?;
    fs::create_dir_all(parent).map_err(io_err)?;
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, data).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let data = fs::read(path).map_err(io_err)?;
    Ok(serde_json::from_slice(&data)?)
}

fn io_err(e: std::io::Error) -> Error {
    Error::Store(plexus_storage::StoreError::Io(e))
}

pub fn remove_dir(path: &Path) -> Result<(), Error> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(io_err)?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct RecoveredConsumer {
    pub name: String,
    pub config: ConsumerConfig,
    pub created: UnixMillis,
    pub state: ConsumerStateSnapshot,
}

#[derive(Debug)]
pub struct RecoveredStream {
    pub config: StreamConfig,
    pub created: UnixMillis,
    pub consumers: Vec<RecoveredConsumer>,
}

/// Rehydrate every account directory under `root`. Unreadable entries are
/// logged and skipped; recovery never fails the whole restart.
pub fn recover_root(root: &Path) -> Vec<(String, Vec<RecoveredStream>)> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(root) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(account) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };
        let streams = recover_account(&path);
        if !streams.is_empty() {
            out.push((account, streams));
        }
    }
    out
}

fn recover_account(account_dir: &Path) -> Vec<RecoveredStream> {
    let mut out = Vec::new();
    let streams_dir = account_dir.join(STREAMS_DIR);
    let Ok(entries) = fs::read_dir(&streams_dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let cfg_path = dir.join(CONFIG_FILE);
        let stored: StoredStreamConfig = match read_json(&cfg_path) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %cfg_path.display(), error = %e, "skipping unreadable stream config");
                continue;
            }
        };
        let consumers = recover_consumers(&dir.join(CONSUMERS_DIR));
        out.push(RecoveredStream {
            config: stored.config,
            created: stored.created,
            consumers,
        });
    }
    out
}

fn recover_consumers(dir: &Path) -> Vec<RecoveredConsumer> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let cdir = entry.path();
        if !cdir.is_dir() {
            continue;
        }
        let cfg_path = cdir.join(CONFIG_FILE);
        let stored: StoredConsumerConfig = match read_json(&cfg_path) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %cfg_path.display(), error = %e, "skipping unreadable consumer config");
                continue;
            }
        };
        let state: ConsumerStateSnapshot =
            read_json(&cdir.join(STATE_FILE)).unwrap_or_default();
        out.push(RecoveredConsumer {
            name: stored.name,
            config: stored.config,
            created: stored.created,
            state,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;

    #[test]
    fn atomic_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = StreamConfig::new("S");
        cfg.normalize().unwrap();
        let stored = StoredStreamConfig {
            config: cfg.clone(),
            created: 42,
        };
        write_json_atomic(&path, &stored).unwrap();
        let back: StoredStreamConfig = read_json(&path).unwrap();
        assert_eq!(back.config, cfg);
        assert_eq!(back.created, 42);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn recover_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let dirs = StreamDirs::new(root.path(), "acc", "ORDERS");
        let mut cfg = StreamConfig::new("ORDERS");
        cfg.normalize().unwrap();
        write_json_atomic(
            &dirs.config_path(),
            &StoredStreamConfig {
                config: cfg,
                created: 1,
            },
        )
        .unwrap();
        write_json_atomic(
            &dirs.consumer_config_path("dur"),
            &StoredConsumerConfig {
                name: "dur".into(),
                config: ConsumerConfig {
                    durable: Some("dur".into()),
                    ..ConsumerConfig::default()
                },
                created: 2,
            },
        )
        .unwrap();
        write_json_atomic(
            &dirs.consumer_state_path("dur"),
            &ConsumerStateSnapshot {
                delivered: SequencePair {
                    consumer_seq: 5,
                    stream_seq: 5,
                },
                ack_floor: SequencePair {
                    consumer_seq: 3,
                    stream_seq: 3,
                },
                pending: vec![PendingSnapshot {
                    stream_seq: 4,
                    consumer_seq: 4,
                    delivery_count: 1,
                }],
                redeliver: vec![],
            },
        )
        .unwrap();

        let recovered = recover_root(root.path());
        assert_eq!(recovered.len(), 1);
        let (account, streams) = &recovered[0];
        assert_eq!(account, "acc");
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].config.name, "ORDERS");
        assert_eq!(streams[0].consumers.len(), 1);
        assert_eq!(streams[0].consumers[0].state.delivered.stream_seq, 5);
    }
}
