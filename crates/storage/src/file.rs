//! Block-file message store.
//!
//! A stream's messages live in a directory of numbered block files
//! (`00000001.blk`, ...). Each block is a sequence of crc-framed records
//! (see [`crate::record`]); deletes append tombstone records so the log
//! stays append-only. The seq index is rebuilt by scanning blocks on open;
//! a torn tail record is truncated away, a corrupt interior record makes
//! the rest of that block unreadable without failing the open.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::warn;

use crate::record::{self, Record, REC_MSG, REC_TOMBSTONE};
use crate::{HeaderMap, Message, MessageStore, Seq, StoreError, StoreState, UnixMillis};

const BLOCK_EXT: &str = "blk";

#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    pub block_max_bytes: u64,
    pub sync_writes: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            block_max_bytes: 8 * 1024 * 1024,
            sync_writes: true,
        }
    }
}

#[derive(Debug)]
struct Block {
    id: u64,
    len: u64,
    /// Live message records currently indexed in this block.
    live: u64,
    /// Framed bytes of removed records and of tombstones, for compaction.
    dead_bytes: u64,
}

#[derive(Clone, Copy, Debug)]
struct RecordLoc {
    block: u64,
    offset: u64,
    frame_len: u32,
    /// Logical message size (payload + headers) for byte accounting.
    size: u64,
    timestamp: UnixMillis,
}

#[derive(Debug)]
struct FileInner {
    dir: PathBuf,
    cfg: FileStoreConfig,
    blocks: BTreeMap<u64, Block>,
    index: BTreeMap<Seq, RecordLoc>,
    active: Option<File>,
    bytes: u64,
    last_seq: Seq,
    closed: bool,
}

#[derive(Debug)]
pub struct FileStore {
    inner: Mutex<FileInner>,
}

fn block_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:08}.{BLOCK_EXT}"))
}

impl FileStore {
    pub async fn open(
        dir: impl Into<PathBuf>,
        cfg: FileStoreConfig,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut ids: Vec<u64> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOCK_EXT) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut inner = FileInner {
            dir,
            cfg,
            blocks: BTreeMap::new(),
            index: BTreeMap::new(),
            active: None,
            bytes: 0,
            last_seq: 0,
            closed: false,
        };

        let last_id = ids.last().copied();
        for id in ids {
            inner.scan_block(id, Some(id) == last_id)?;
        }

        // Reopen the last block for appends.
        if let Some(id) = last_id {
            let path = block_path(&inner.dir, id);
            let mut f = OpenOptions::new().append(true).open(&path)?;
            f.seek(SeekFrom::End(0))?;
            inner.active = Some(f);
        }

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }
}

impl FileInner {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn scan_block(&mut self, id: u64, is_last: bool) -> Result<(), StoreError> {
        let path = block_path(&self.dir, id);
        let mut buf = Vec::new();
        File::open(&path)?.read_to_end(&mut buf)?;

        let mut block = Block {
            id,
            len: buf.len() as u64,
            live: 0,
            dead_bytes: 0,
        };

        let mut offset = 0usize;
        loop {
            match record::decode_frame(&buf[offset..]) {
                Ok(None) => {
                    if offset < buf.len() {
                        if is_last {
                            // Torn tail write: truncate back to the last
                            // complete record.
                            warn!(block = id, at = offset, "truncating torn block tail");
                            let f = OpenOptions::new().write(true).open(&path)?;
                            f.set_len(offset as u64)?;
                            f.sync_all()?;
                            block.len = offset as u64;
                        } else {
                            warn!(block = id, at = offset, "ignoring trailing bytes in sealed block");
                        }
                    }
                    break;
                }
                Ok(Some((rec, used))) => {
                    match rec.kind {
                        REC_MSG => {
                            let loc = RecordLoc {
                                block: id,
                                offset: offset as u64,
                                frame_len: used as u32,
                                size: rec.payload.len() as u64
                                    + record::encoded_headers_len(&rec.headers) as u64,
                                timestamp: rec.timestamp,
                            };
                            self.bytes += loc.size;
                            self.index.insert(rec.seq, loc);
                            block.live += 1;
                            if rec.seq > self.last_seq {
                                self.last_seq = rec.seq;
                            }
                        }
                        REC_TOMBSTONE => {
                            block.dead_bytes += used as u64;
                            if let Some(loc) = self.index.remove(&rec.seq) {
                                self.bytes -= loc.size;
                                if let Some(b) = self.blocks.get_mut(&loc.block) {
                                    b.live -= 1;
                                    b.dead_bytes += loc.frame_len as u64;
                                } else if loc.block == id {
                                    block.live -= 1;
                                    block.dead_bytes += loc.frame_len as u64;
                                }
                            }
                            if rec.seq > self.last_seq {
                                self.last_seq = rec.seq;
                            }
                        }
                        _ => unreachable!("decode_frame rejects unknown kinds"),
                    }
                    offset += used;
                }
                Err(e) => {
                    // The remainder of this block is unreadable; sequences
                    // in it are lost but the store keeps serving the rest.
                    warn!(block = id, at = offset, error = %e, "corrupt record, skipping block remainder");
                    if is_last {
                        let f = OpenOptions::new().write(true).open(&path)?;
                        f.set_len(offset as u64)?;
                        f.sync_all()?;
                        block.len = offset as u64;
                    }
                    break;
                }
            }
        }

        self.blocks.insert(id, block);
        Ok(())
    }

    fn active_block_id(&self) -> Option<u64> {
        self.blocks.keys().next_back().copied()
    }

    /// Append one framed record, rolling to a fresh block when the active
    /// one is full. Returns (block id, offset, frame len).
    fn write_record(&mut self, rec: &Record) -> Result<(u64, u64, u32), StoreError> {
        let frame = record::encode_frame(rec);

        let need_roll = match self.active_block_id() {
            None => true,
            Some(id) => {
                let b = &self.blocks[&id];
                b.len > 0 && b.len + frame.len() as u64 > self.cfg.block_max_bytes
            }
        };
        if need_roll {
            self.roll_block()?;
        }

        let id = self.active_block_id().expect("active block after roll");
        let offset = self.blocks[&id].len;
        let file = self.active.as_mut().ok_or(StoreError::Closed)?;
        file.write_all(&frame)?;
        if self.cfg.sync_writes {
            file.sync_data()?;
        }
        let block = self.blocks.get_mut(&id).expect("active block exists");
        block.len += frame.len() as u64;
        Ok((id, offset, frame.len() as u32))
    }

    fn roll_block(&mut self) -> Result<(), StoreError> {
        if let Some(f) = self.active.take() {
            f.sync_all()?;
        }
        let id = self.active_block_id().map(|id| id + 1).unwrap_or(1);
        let path = block_path(&self.dir, id);
        let f = OpenOptions::new().create_new(true).append(true).open(&path)?;
        self.active = Some(f);
        self.blocks.insert(
            id,
            Block {
                id,
                len: 0,
                live: 0,
                dead_bytes: 0,
            },
        );
        Ok(())
    }

    fn read_record(&self, loc: RecordLoc) -> Result<Record, StoreError> {
        let path = block_path(&self.dir, loc.block);
        let mut f = File::open(&path)?;
        f.seek(SeekFrom::Start(loc.offset))?;
        let mut buf = vec![0u8; loc.frame_len as usize];
        f.read_exact(&mut buf)?;
        match record::decode_frame(&buf)? {
            Some((rec, _)) => Ok(rec),
            None => Err(StoreError::Corrupt {
                block: loc.block,
                reason: "indexed record truncated".into(),
            }),
        }
    }

    fn get(&self, seq: Seq) -> Result<Message, StoreError> {
        let loc = self.index.get(&seq).copied().ok_or(StoreError::NotFound)?;
        Ok(self.read_record(loc)?.into_message())
    }

    /// Tombstone `seq`. The caller already holds the message if it needs it.
    fn delete(&mut self, seq: Seq, now: UnixMillis) -> Result<(), StoreError> {
        let loc = self.index.remove(&seq).ok_or(StoreError::NotFound)?;
        self.bytes -= loc.size;

        let tomb = Record::tombstone(seq, now);
        let (tomb_block, _, tomb_len) = self.write_record(&tomb)?;
        if let Some(b) = self.blocks.get_mut(&tomb_block) {
            b.dead_bytes += tomb_len as u64;
        }
        if let Some(b) = self.blocks.get_mut(&loc.block) {
            b.live -= 1;
            b.dead_bytes += loc.frame_len as u64;
        }

        self.drop_empty_head_blocks()?;
        self.maybe_compact(loc.block)?;
        Ok(())
    }

    /// Head blocks with no live records can be unlinked outright.
    fn drop_empty_head_blocks(&mut self) -> Result<(), StoreError> {
        let active = self.active_block_id();
        loop {
            let Some((&id, block)) = self.blocks.iter().next() else {
                break;
            };
            if Some(id) == active || block.live > 0 {
                break;
            }
            fs::remove_file(block_path(&self.dir, id))?;
            self.blocks.remove(&id);
        }
        Ok(())
    }

    /// Rewrite a sealed block once more than half of it is dead weight.
    fn maybe_compact(&mut self, id: u64) -> Result<(), StoreError> {
        if Some(id) == self.active_block_id() {
            return Ok(());
        }
        let Some(block) = self.blocks.get(&id) else {
            return Ok(());
        };
        if block.live == 0 || block.len == 0 || block.dead_bytes * 2 <= block.len {
            return Ok(());
        }

        let path = block_path(&self.dir, id);
        let mut buf = Vec::new();
        File::open(&path)?.read_to_end(&mut buf)?;

        let mut kept: Vec<(Seq, u64, Vec<u8>)> = Vec::new();
        let mut offset = 0usize;
        while let Some((rec, used)) = record::decode_frame(&buf[offset..])? {
            if rec.kind == REC_MSG {
                if let Some(loc) = self.index.get(&rec.seq) {
                    if loc.block == id && loc.offset == offset as u64 {
                        kept.push((rec.seq, 0, buf[offset..offset + used].to_vec()));
                    }
                }
            }
            offset += used;
        }

        let tmp = path.with_extension("tmp");
        {
            let mut f = File::create(&tmp)?;
            let mut at = 0u64;
            for (_, new_offset, frame) in kept.iter_mut() {
                *new_offset = at;
                f.write_all(frame)?;
                at += frame.len() as u64;
            }
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        let mut new_len = 0u64;
        for (seq, new_offset, frame) in &kept {
            if let Some(loc) = self.index.get_mut(seq) {
                loc.offset = *new_offset;
            }
            new_len += frame.len() as u64;
        }
        if let Some(b) = self.blocks.get_mut(&id) {
            b.len = new_len;
            b.dead_bytes = 0;
            b.live = kept.len() as u64;
        }
        Ok(())
    }

    fn state(&self) -> StoreState {
        let first = self.index.iter().next();
        let last = self.index.iter().next_back();
        StoreState {
            msgs: self.index.len() as u64,
            bytes: self.bytes,
            first_seq: first.map(|(s, _)| *s).unwrap_or(self.last_seq + 1),
            last_seq: self.last_seq,
            first_time: first.map(|(_, l)| l.timestamp).unwrap_or(0),
            last_time: last.map(|(_, l)| l.timestamp).unwrap_or(0),
        }
    }
}

#[async_trait]
impl MessageStore for FileStore {
    async fn append(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: Bytes,
        timestamp: UnixMillis,
    ) -> Result<Seq, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        let seq = inner.last_seq + 1;
        let rec = Record {
            kind: REC_MSG,
            seq,
            timestamp,
            subject: subject.to_string(),
            headers: headers.clone(),
            payload,
        };
        let (block, offset, frame_len) = inner.write_record(&rec)?;
        let size = rec.payload.len() as u64 + record::encoded_headers_len(&rec.headers) as u64;
        inner.index.insert(
            seq,
            RecordLoc {
                block,
                offset,
                frame_len,
                size,
                timestamp,
            },
        );
        if let Some(b) = inner.blocks.get_mut(&block) {
            b.live += 1;
        }
        inner.bytes += size;
        inner.last_seq = seq;
        Ok(seq)
    }

    async fn restore_message(&self, msg: Message) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        if msg.seq <= inner.last_seq {
            return Err(StoreError::SeqOutOfOrder {
                expected: inner.last_seq,
                got: msg.seq,
            });
        }
        let rec = Record::message(&msg);
        let (block, offset, frame_len) = inner.write_record(&rec)?;
        let size = msg.size();
        inner.index.insert(
            msg.seq,
            RecordLoc {
                block,
                offset,
                frame_len,
                size,
                timestamp: msg.timestamp,
            },
        );
        if let Some(b) = inner.blocks.get_mut(&block) {
            b.live += 1;
        }
        inner.bytes += size;
        inner.last_seq = msg.seq;
        Ok(())
    }

    async fn get(&self, seq: Seq) -> Result<Message, StoreError> {
        let inner = self.inner.lock().await;
        inner.check_open()?;
        inner.get(seq)
    }

    async fn delete_msg(&self, seq: Seq) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        inner.delete(seq, plexus_util::unix_millis())?;
        Ok(true)
    }

    async fn remove_oldest(&self) -> Result<Option<Message>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        let Some(seq) = inner.index.keys().next().copied() else {
            return Ok(None);
        };
        let msg = inner.get(seq)?;
        inner.delete(seq, plexus_util::unix_millis())?;
        Ok(Some(msg))
    }

    async fn purge(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        let removed = inner.index.len() as u64;
        inner.active = None;
        let ids: Vec<u64> = inner.blocks.keys().copied().collect();
        for id in ids {
            fs::remove_file(block_path(&inner.dir, id))?;
        }
        inner.blocks.clear();
        inner.index.clear();
        inner.bytes = 0;
        Ok(removed)
    }

    async fn state(&self) -> StoreState {
        self.inner.lock().await.state()
    }

    async fn first_seq(&self) -> Seq {
        self.inner.lock().await.state().first_seq
    }

    async fn last_seq(&self) -> Seq {
        self.inner.lock().await.last_seq
    }

    async fn scan_from(&self, from: Seq, max: usize) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check_open()?;
        let locs: Vec<(Seq, RecordLoc)> = inner
            .index
            .range(from..)
            .take(max)
            .map(|(s, l)| (*s, *l))
            .collect();
        let mut out = Vec::with_capacity(locs.len());
        for (_, loc) in locs {
            out.push(inner.read_record(loc)?.into_message());
        }
        Ok(out)
    }

    async fn first_seq_since(&self, ts: UnixMillis) -> Result<Seq, StoreError> {
        let inner = self.inner.lock().await;
        inner.check_open()?;
        Ok(inner
            .index
            .iter()
            .find(|(_, l)| l.timestamp >= ts)
            .map(|(s, _)| *s)
            .unwrap_or(inner.last_seq + 1))
    }

    async fn stop(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(f) = inner.active.take() {
            f.sync_all()?;
        }
        inner.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FileStoreConfig {
        FileStoreConfig {
            block_max_bytes: 512,
            sync_writes: false,
        }
    }

    async fn fill(store: &FileStore, n: usize, size: usize) {
        for i in 0..n {
            store
                .append("foo", &HeaderMap::new(), Bytes::from(vec![b'a'; size]), i as u64 + 1)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path(), cfg()).await.unwrap();
            fill(&store, 10, 64).await;
            store.delete_msg(3).await.unwrap();
            store.stop().await.unwrap();
        }
        let store = FileStore::open(dir.path(), cfg()).await.unwrap();
        let st = store.state().await;
        assert_eq!(st.msgs, 9);
        assert_eq!(st.first_seq, 1);
        assert_eq!(st.last_seq, 10);
        assert!(matches!(store.get(3).await, Err(StoreError::NotFound)));
        assert_eq!(store.get(4).await.unwrap().payload.len(), 64);
    }

    #[tokio::test]
    async fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path(), cfg()).await.unwrap();
            fill(&store, 3, 32).await;
            store.stop().await.unwrap();
        }
        // Chop a few bytes off the newest block to simulate a torn write.
        let mut blocks: Vec<PathBuf> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        blocks.sort();
        let last = blocks.last().unwrap();
        let len = fs::metadata(last).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(last)
            .unwrap()
            .set_len(len - 5)
            .unwrap();

        let store = FileStore::open(dir.path(), cfg()).await.unwrap();
        let st = store.state().await;
        assert_eq!(st.msgs, 2);
        // The torn seq is gone; the next append must not reuse it.
        let seq = store
            .append("foo", &HeaderMap::new(), Bytes::from_static(b"x"), 9)
            .await
            .unwrap();
        assert!(seq >= 3);
    }

    #[tokio::test]
    async fn rolls_blocks_and_drops_empty_head() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), cfg()).await.unwrap();
        fill(&store, 20, 100).await; // a few blocks at 512 bytes max

        let count = fs::read_dir(dir.path()).unwrap().count();
        assert!(count > 1, "expected multiple blocks, got {count}");

        // Evict everything in the first block; its file should vanish.
        for _ in 0..10 {
            store.remove_oldest().await.unwrap();
        }
        let st = store.state().await;
        assert_eq!(st.msgs, 10);
        assert_eq!(st.first_seq, 11);
        let after = fs::read_dir(dir.path()).unwrap().count();
        assert!(after < count, "head blocks should be unlinked");
    }

    #[tokio::test]
    async fn purge_then_append_continues_seq() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), cfg()).await.unwrap();
        fill(&store, 5, 16).await;
        assert_eq!(store.purge().await.unwrap(), 5);
        let st = store.state().await;
        assert_eq!(st.msgs, 0);
        assert_eq!(st.bytes, 0);
        assert_eq!(st.first_seq, 6);
        let seq = store
            .append("foo", &HeaderMap::new(), Bytes::from_static(b"x"), 1)
            .await
            .unwrap();
        assert_eq!(seq, 6);
    }

    #[tokio::test]
    async fn headers_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), cfg()).await.unwrap();
        let headers = vec![("Plexus-Msg-Id".to_string(), vec!["id-1".to_string()])];
        store
            .append("foo.bar", &headers, Bytes::from_static(b"payload"), 77)
            .await
            .unwrap();
        let msg = store.get(1).await.unwrap();
        assert_eq!(msg.subject, "foo.bar");
        assert_eq!(msg.headers, headers);
        assert_eq!(msg.timestamp, 77);
    }
}
