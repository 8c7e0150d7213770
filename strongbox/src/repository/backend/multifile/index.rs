//! The index tracks where each chunk lives in the segment files.
//!
//! The index is not itself authoritative: it is always reconstructible by
//! scanning the segment log (`common::index::rebuild_from_segment_files`) up
//! to the last `COMMIT`. To avoid a full rescan on every open, the rebuilt
//! map is cached alongside a `Hints` sidecar and authenticated by an
//! `integrity.<txid>` MAC (`common::index::{read_sidecars, write_sidecars}`);
//! if that cache is missing, stale, or fails authentication, we fall back to
//! a full rescan of the segment log.
use crate::repository::backend::common::index::{self, rebuild_from_segment_files, Hints};
use crate::repository::backend::common::LockedFile;
use crate::repository::backend::{self, Result, SegmentDescriptor};
use crate::repository::{ChunkID, Key, HMAC};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::channel::oneshot;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;
use walkdir::WalkDir;

/// Time to wait for the index's advisory writer lock before failing with
/// `BackendError::LockTimeout`.
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);

fn list_segment_files(repository_path: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let data_path = repository_path.join("data");
    if !data_path.exists() {
        return Ok(Vec::new());
    }
    let mut segments: Vec<(u64, PathBuf)> = WalkDir::new(&data_path)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<u64>().ok())
                .map(|id| (id, e.path().to_path_buf()))
        })
        .collect();
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

/// Highest `integrity.<txid>` found directly under the repository root, if
/// any sidecar set has ever been written.
fn latest_sidecar_txid(repository_path: &Path) -> Option<u64> {
    std::fs::read_dir(repository_path)
        .ok()?
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?.to_string();
            name.strip_prefix("integrity.")?.parse::<u64>().ok()
        })
        .max()
}

struct InternalIndex {
    map: HashMap<ChunkID, SegmentDescriptor>,
    hints: Hints,
    repository_path: PathBuf,
    hmac: HMAC,
    key: Key,
    // Held for the lifetime of the index to enforce the advisory
    // single-writer lock; never read after acquisition.
    _lock: LockedFile,
    dirty: bool,
}

impl InternalIndex {
    fn open(
        repository_path: impl AsRef<Path>,
        hmac: HMAC,
        key: Key,
        lock_wait: Duration,
    ) -> Result<InternalIndex> {
        let repository_path = repository_path.as_ref().to_path_buf();
        let lock =
            LockedFile::open_read_write_waiting(repository_path.join("index.lock"), lock_wait)?;

        let segments = list_segment_files(&repository_path)?;
        let segment_ids: Vec<u64> = segments.iter().map(|(id, _)| *id).collect();

        let (map, hints) = match latest_sidecar_txid(&repository_path) {
            Some(txid) => match index::read_sidecars(&repository_path, txid, hmac, &key) {
                Ok((map, hints)) if hints.segments == segment_ids => (map, hints),
                _ => Self::rebuild(&segments, &segment_ids)?,
            },
            None => Self::rebuild(&segments, &segment_ids)?,
        };

        Ok(InternalIndex {
            map,
            hints,
            repository_path,
            hmac,
            key,
            _lock: lock,
            dirty: false,
        })
    }

    fn rebuild(
        segments: &[(u64, PathBuf)],
        segment_ids: &[u64],
    ) -> Result<(HashMap<ChunkID, SegmentDescriptor>, Hints)> {
        let (map, _last_commit, storage_quota_use) = rebuild_from_segment_files(segments)?;
        let hints = Hints {
            segments: segment_ids.to_vec(),
            storage_quota_use,
            ..Default::default()
        };
        Ok((map, hints))
    }

    /// Adds `bytes` to the running storage-quota counter. Called once per
    /// chunk actually written to disk (not for deduplicated writes, which
    /// never reach the backend).
    fn record_bytes_written(&mut self, bytes: u64) {
        self.hints.storage_quota_use += bytes;
        self.dirty = true;
    }

    fn quota_used(&self) -> u64 {
        self.hints.storage_quota_use
    }

    fn lookup_chunk(&mut self, id: ChunkID) -> Option<SegmentDescriptor> {
        self.map.get(&id).copied()
    }

    fn set_chunk(&mut self, id: ChunkID, location: SegmentDescriptor) -> Result<()> {
        if let Some(previous) = self.map.insert(id, location) {
            self.hints.shadow_index.insert(id, previous);
        }
        if !self.hints.segments.contains(&location.segment_id) {
            self.hints.segments.push(location.segment_id);
            self.hints.segments.sort_unstable();
        }
        self.dirty = true;
        Ok(())
    }

    fn delete_chunk(&mut self, id: ChunkID) -> Result<()> {
        if let Some(previous) = self.map.remove(&id) {
            self.hints.shadow_index.insert(id, previous);
        }
        self.dirty = true;
        Ok(())
    }

    fn known_chunks(&self) -> HashSet<ChunkID> {
        self.map.keys().copied().collect()
    }

    /// Persists the current in-memory state as the `index.<txid>`/
    /// `hints.<txid>`/`integrity.<txid>` sidecars, where `<txid>` is the
    /// highest segment id known to the index. Does not itself write the
    /// segment log's `COMMIT` record -- that is the segment handler's job
    /// (see `multifile::segment::InternalSegmentHandler::commit`), which
    /// this is always called alongside.
    fn commit_index(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let txid = self.hints.segments.iter().max().copied().unwrap_or(0);
        index::write_sidecars(
            &self.repository_path,
            txid,
            &self.map,
            &self.hints,
            self.hmac,
            &self.key,
        )?;
        self.hints.shadow_index.clear();
        self.dirty = false;
        Ok(())
    }

    fn count_chunk(&self) -> usize {
        self.map.len()
    }
}

enum IndexCommand {
    Lookup(ChunkID, oneshot::Sender<Option<SegmentDescriptor>>),
    Set(ChunkID, SegmentDescriptor, oneshot::Sender<Result<()>>),
    Delete(ChunkID, oneshot::Sender<Result<()>>),
    KnownChunks(oneshot::Sender<HashSet<ChunkID>>),
    Commit(oneshot::Sender<Result<()>>),
    Count(oneshot::Sender<usize>),
    RecordBytesWritten(u64, oneshot::Sender<()>),
    QuotaUsed(oneshot::Sender<u64>),
    Close(oneshot::Sender<()>),
}

/// A message-passing handle to a running index
///
/// # Warnings
///
/// In order to ensure the index file lock is freed and all entries are
/// flushed, you must call `close` before your program terminates.
#[derive(Clone)]
pub struct Index {
    input: mpsc::Sender<IndexCommand>,
    path: String,
}

impl Index {
    pub fn open(repository_path: impl AsRef<Path>, hmac: HMAC, key: Key) -> Result<Index> {
        Self::open_with_lock_wait(repository_path, hmac, key, DEFAULT_LOCK_WAIT)
    }

    /// As `open`, but with an explicit wait for the advisory index lock
    /// instead of `DEFAULT_LOCK_WAIT`.
    pub fn open_with_lock_wait(
        repository_path: impl AsRef<Path>,
        hmac: HMAC,
        key: Key,
        lock_wait: Duration,
    ) -> Result<Index> {
        let mut index = InternalIndex::open(repository_path.as_ref(), hmac, key, lock_wait)?;
        let path = repository_path.as_ref().to_path_buf();
        let (input, mut output) = mpsc::channel(500);
        task::spawn(async move {
            let mut final_ret = None;
            while let Some(command) = output.next().await {
                task::block_in_place(|| match command {
                    IndexCommand::Lookup(id, ret) => {
                        ret.send(index.lookup_chunk(id)).unwrap();
                    }
                    IndexCommand::Set(id, location, ret) => {
                        ret.send(index.set_chunk(id, location)).unwrap();
                    }
                    IndexCommand::Delete(id, ret) => {
                        ret.send(index.delete_chunk(id)).unwrap();
                    }
                    IndexCommand::KnownChunks(ret) => {
                        ret.send(index.known_chunks()).unwrap();
                    }
                    IndexCommand::Commit(ret) => {
                        ret.send(index.commit_index()).unwrap();
                    }
                    IndexCommand::Count(ret) => {
                        ret.send(index.count_chunk()).unwrap();
                    }
                    IndexCommand::RecordBytesWritten(bytes, ret) => {
                        index.record_bytes_written(bytes);
                        ret.send(()).unwrap();
                    }
                    IndexCommand::QuotaUsed(ret) => {
                        ret.send(index.quota_used()).unwrap();
                    }
                    IndexCommand::Close(ret) => {
                        final_ret = Some(ret);
                    }
                });
                if final_ret.is_some() {
                    break;
                }
            }
            std::mem::drop(index);
            std::mem::drop(output);
            if let Some(ret) = final_ret {
                ret.send(()).unwrap();
            }
        });

        Ok(Index {
            input,
            path: path.to_str().unwrap().to_string(),
        })
    }

    pub async fn close(&mut self) {
        let (i, o) = oneshot::channel();
        self.input.send(IndexCommand::Close(i)).await.unwrap();
        o.await.unwrap();
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Index: {:?}", self.path)
    }
}

#[async_trait]
impl backend::Index for Index {
    async fn lookup_chunk(&mut self, id: ChunkID) -> Option<SegmentDescriptor> {
        let (i, o) = oneshot::channel();
        self.input.send(IndexCommand::Lookup(id, i)).await.unwrap();
        o.await.unwrap()
    }
    async fn set_chunk(&mut self, id: ChunkID, location: SegmentDescriptor) -> Result<()> {
        let (i, o) = oneshot::channel();
        self.input
            .send(IndexCommand::Set(id, location, i))
            .await
            .unwrap();
        o.await?
    }
    async fn delete_chunk(&mut self, id: ChunkID) -> Result<()> {
        let (i, o) = oneshot::channel();
        self.input.send(IndexCommand::Delete(id, i)).await.unwrap();
        o.await?
    }
    async fn known_chunks(&mut self) -> HashSet<ChunkID> {
        let (i, o) = oneshot::channel();
        self.input
            .send(IndexCommand::KnownChunks(i))
            .await
            .unwrap();
        o.await.unwrap()
    }
    async fn commit_index(&mut self) -> Result<()> {
        let (i, o) = oneshot::channel();
        self.input.send(IndexCommand::Commit(i)).await.unwrap();
        o.await?
    }
    async fn count_chunk(&mut self) -> usize {
        let (i, o) = oneshot::channel();
        self.input.send(IndexCommand::Count(i)).await.unwrap();
        o.await.unwrap()
    }
    async fn record_bytes_written(&mut self, bytes: u64) -> Result<()> {
        let (i, o) = oneshot::channel();
        self.input
            .send(IndexCommand::RecordBytesWritten(bytes, i))
            .await
            .unwrap();
        o.await.unwrap();
        Ok(())
    }
    async fn quota_used(&mut self) -> u64 {
        let (i, o) = oneshot::channel();
        self.input.send(IndexCommand::QuotaUsed(i)).await.unwrap();
        o.await.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::backend::common::segment::Segment;
    use crate::repository::{Chunk, Compression, Encryption};
    use backend::Index as OtherIndex;
    use tempfile::tempdir;

    fn test_chunk(id: ChunkID, data: &[u8], key: &Key) -> Chunk {
        Chunk::pack_with_id(
            data.to_vec(),
            Compression::NoCompression,
            Encryption::NoEncryption,
            key,
            id,
        )
        .unwrap()
    }

    fn write_committed_segment(repository_path: &Path, segment_id: u64, id: ChunkID, key: &Key) {
        let data_dir = repository_path.join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        let segment_path = data_dir.join(segment_id.to_string());
        let file = std::fs::File::create(&segment_path).unwrap();
        let mut segment = Segment::new(file, 1_000_000).unwrap();
        segment
            .write_chunk(test_chunk(id, b"hello", key), id)
            .unwrap();
        segment.write_commit().unwrap();
    }

    #[tokio::test]
    async fn rebuilds_from_segments_on_first_open() {
        let tempdir = tempdir().unwrap();
        let path = tempdir.path().to_path_buf();
        let key = Key::random(32);
        let id = ChunkID::random_id();
        write_committed_segment(&path, 0, id, &key);

        let mut index = Index::open(&path, HMAC::Blake2b, key)
            .expect("index creation failed");
        assert_eq!(
            index.lookup_chunk(id).await,
            Some(SegmentDescriptor {
                segment_id: 0,
                start: 8,
            })
        );
        assert_eq!(index.count_chunk().await, 1);
        index.close().await;
    }

    #[tokio::test]
    async fn set_lookup_count() {
        let tempdir = tempdir().unwrap();
        let path = tempdir.path().to_path_buf();
        let key = Key::random(32);
        let mut index =
            Index::open(&path, HMAC::Blake2b, key).expect("index creation failed");

        let id = ChunkID::manifest_id();
        let location = SegmentDescriptor {
            segment_id: 0,
            start: 42,
        };
        index.set_chunk(id, location).await.unwrap();
        assert_eq!(index.lookup_chunk(id).await, Some(location));
        assert_eq!(index.count_chunk().await, 1);
        index.commit_index().await.unwrap();
        index.close().await;
    }

    #[tokio::test]
    async fn sidecar_cache_survives_restart() {
        let tempdir = tempdir().unwrap();
        let path = tempdir.path().to_path_buf();
        let key = Key::random(32);
        let id = ChunkID::random_id();
        write_committed_segment(&path, 0, id, &key);

        {
            let mut index = Index::open(&path, HMAC::Blake2b, key.clone())
                .expect("index creation failed");
            index.commit_index().await.unwrap();
            index.close().await;
        }
        assert!(path.join("integrity.0").exists());

        let mut index =
            Index::open(&path, HMAC::Blake2b, key).expect("index reopen failed");
        assert!(index.lookup_chunk(id).await.is_some());
        index.close().await;
    }
}
