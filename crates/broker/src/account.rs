//! Per-account resource accounting.
//!
//! Counters are shared across an account's streams; reservations use
//! compare-swap against the limit so concurrent ingests cannot overshoot.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::StorageType;
use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLimits {
    /// Bytes of memory-backed stream data; -1 unlimited, 0 hard zero.
    pub max_memory: i64,
    /// Bytes of file-backed stream data; -1 unlimited, 0 hard zero.
    pub max_store: i64,
    pub max_streams: i32,
    pub max_consumers: i32,
}

impl Default for AccountLimits {
    fn default() -> Self {
        Self {
            max_memory: -1,
            max_store: -1,
            max_streams: -1,
            max_consumers: -1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct AccountInfo {
    pub memory: u64,
    pub storage: u64,
    pub streams: usize,
    pub consumers: usize,
    pub limits: AccountLimits,
}

#[derive(Debug)]
pub struct AccountResources {
    limits: AccountLimits,
    memory: AtomicU64,
    store: AtomicU64,
    streams: AtomicUsize,
    consumers: AtomicUsize,
}

impl AccountResources {
    pub fn new(limits: AccountLimits) -> Self {
        Self {
            limits,
            memory: AtomicU64::new(0),
            store: AtomicU64::new(0),
            streams: AtomicUsize::new(0),
            consumers: AtomicUsize::new(0),
        }
    }

    pub fn limits(&self) -> AccountLimits {
        self.limits
    }

    fn bucket(&self, storage: StorageType) -> (&AtomicU64, i64) {
        match storage {
            StorageType::Memory => (&self.memory, self.limits.max_memory),
            StorageType::File => (&self.store, self.limits.max_store),
        }
    }

    /// Reserve `delta` bytes in the bucket for `storage`, failing when it
    /// would push usage past the limit.
    pub fn reserve_bytes(&self, storage: StorageType, delta: u64) -> Result<(), Error> {
        let (counter, limit) = self.bucket(storage);
        if limit < 0 {
            counter.fetch_add(delta, Ordering::AcqRel);
            return Ok(());
        }
        let limit = limit as u64;
        let mut cur = counter.load(Ordering::Acquire);
        loop {
            let next = cur + delta;
            if next > limit {
                return Err(Error::AccountResourceExhausted);
            }
            match counter.compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn release_bytes(&self, storage: StorageType, delta: u64) {
        let (counter, _) = self.bucket(storage);
        let mut cur = counter.load(Ordering::Acquire);
        loop {
            let next = cur.saturating_sub(delta);
            match counter.compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    fn try_add(counter: &AtomicUsize, limit: i32, err: Error) -> Result<(), Error> {
        if limit < 0 {
            counter.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }
        let limit = limit as usize;
        let mut cur = counter.load(Ordering::Acquire);
        loop {
            if cur + 1 > limit {
                return Err(err);
            }
            match counter.compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn try_add_stream(&self) -> Result<(), Error> {
        Self::try_add(&self.streams, self.limits.max_streams, Error::MaxStreamsExceeded)
    }

    pub fn remove_stream(&self) {
        self.streams.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn try_add_consumer(&self) -> Result<(), Error> {
        Self::try_add(
            &self.consumers,
            self.limits.max_consumers,
            Error::MaxConsumersExceeded,
        )
    }

    pub fn remove_consumer(&self) {
        self.consumers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn info(&self) -> AccountInfo {
        AccountInfo {
            memory: self.memory.load(Ordering::Acquire),
            storage: self.store.load(Ordering::Acquire),
            streams: self.streams.load(Ordering::Acquire),
            consumers: self.consumers.load(Ordering::Acquire),
            limits: self.limits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_by_default() {
        let acc = AccountResources::new(AccountLimits::default());
        acc.reserve_bytes(StorageType::Memory, u64::MAX / 2).unwrap();
        acc.try_add_stream().unwrap();
        acc.try_add_consumer().unwrap();
    }

    #[test]
    fn byte_limit_is_enforced_and_released() {
        let acc = AccountResources::new(AccountLimits {
            max_memory: 100,
            ..AccountLimits::default()
        });
        acc.reserve_bytes(StorageType::Memory, 80).unwrap();
        assert!(matches!(
            acc.reserve_bytes(StorageType::Memory, 30),
            Err(Error::AccountResourceExhausted)
        ));
        acc.release_bytes(StorageType::Memory, 50);
        acc.reserve_bytes(StorageType::Memory, 30).unwrap();
        assert_eq!(acc.info().memory, 60);
    }

    #[test]
    fn zero_limit_is_a_hard_zero() {
        let acc = AccountResources::new(AccountLimits {
            max_streams: 0,
            ..AccountLimits::default()
        });
        assert!(matches!(
            acc.try_add_stream(),
            Err(Error::MaxStreamsExceeded)
        ));
    }

    #[test]
    fn storage_classes_use_separate_buckets() {
        let acc = AccountResources::new(AccountLimits {
            max_memory: 10,
            max_store: 1_000,
            ..AccountLimits::default()
        });
        acc.reserve_bytes(StorageType::File, 500).unwrap();
        assert!(acc.reserve_bytes(StorageType::Memory, 20).is_err());
        let info = acc.info();
        assert_eq!(info.storage, 500);
        assert_eq!(info.memory, 0);
    }
}
