#![allow(unused_variables)]
use crate::repository::backend::common::files::*;
use crate::repository::backend::*;
use crate::repository::{ChunkSettings, Key};

use super::Result;
use async_trait::async_trait;
use rmp_serde as rmps;
use std::fs::File;
use std::path::{Path, PathBuf};

pub mod index;
pub mod manifest;
pub mod segment;

#[derive(Debug, Clone)]
pub struct MultiFile {
    index_handle: index::Index,
    manifest_handle: manifest::Manifest,
    segment_handle: segment::SegmentHandler,
    path: PathBuf,
}

impl MultiFile {
    /// Opens a new `MultiFile` backend with default settings
    ///
    /// Subject to change in the near future
    ///
    /// # Errors
    ///
    /// Will error if creating or locking any of the index or manifest files
    /// fails (such as if the user does not have permissions for that
    /// directory), or if any other I/O error occurs
    pub async fn open_defaults(
        path: impl AsRef<Path>,
        chunk_settings: Option<ChunkSettings>,
        key: &Key,
    ) -> Result<MultiFile> {
        Self::open_defaults_with_lock_wait(path, chunk_settings, key, Self::DEFAULT_LOCK_WAIT).await
    }

    /// As `open_defaults`, but with an explicit wait for the advisory index
    /// lock instead of `DEFAULT_LOCK_WAIT`.
    pub async fn open_defaults_with_lock_wait(
        path: impl AsRef<Path>,
        chunk_settings: Option<ChunkSettings>,
        key: &Key,
        lock_wait: std::time::Duration,
    ) -> Result<MultiFile> {
        let size_limit = 2_000_000_000;
        let segments_per_directory = 100;
        let mut manifest_handle = manifest::Manifest::open(&path, chunk_settings, key)?;
        let hmac = match chunk_settings {
            Some(settings) => settings.hmac,
            None => {
                use crate::repository::backend::Manifest;
                manifest_handle.chunk_settings().await.hmac
            }
        };
        let index_handle = index::Index::open_with_lock_wait(&path, hmac, key.clone(), lock_wait)?;
        let segment_handle = segment::SegmentHandler::open(&path, size_limit, segments_per_directory)?;
        let path = path.as_ref().to_path_buf();
        Ok(MultiFile {
            index_handle,
            manifest_handle,
            segment_handle,
            path,
        })
    }

    /// Default wait for the advisory index lock when a caller doesn't
    /// specify one.
    pub const DEFAULT_LOCK_WAIT: std::time::Duration = std::time::Duration::from_secs(30);

    /// Reads the encrypted key off the disk
    ///
    /// Does not require that the repository be opened first
    ///
    /// Note: this path is the repository root path, not the key path
    ///
    /// # Errors
    ///
    /// Will error if the key is corrupted or deserialization otherwise fails
    pub fn read_key(path: impl AsRef<Path>) -> Result<EncryptedKey> {
        let key_path = path.as_ref().join("key");
        let file = File::open(&key_path)?;
        Ok(rmps::decode::from_read(&file)?)
    }
}

#[async_trait]
impl Backend for MultiFile {
    type Manifest = manifest::Manifest;
    type Index = index::Index;

    /// Clones the internal MFManifest
    fn get_index(&self) -> Self::Index {
        self.index_handle.clone()
    }
    /// Clones the internal MFIndex
    fn get_manifest(&self) -> Self::Manifest {
        self.manifest_handle.clone()
    }
    /// Locks the keyfile and writes the key
    ///
    /// Will return Err if writing the key fails
    async fn write_key(&self, key: &EncryptedKey) -> Result<()> {
        let key_path = self.path.join("key");
        let mut file =
            LockedFile::open_read_write(&key_path)?.ok_or(BackendError::FileLockError)?;
        Ok(rmps::encode::write(&mut file, key)?)
    }
    /// Attempts to read the key from the repository
    ///
    /// Returns Err if the key doesn't exist or of another error occurs
    async fn read_key(&self) -> Result<EncryptedKey> {
        let key_path = self.path.join("key");
        let file = File::open(&key_path)?;
        Ok(rmps::decode::from_read(&file)?)
    }

    /// Starts reading a chunk, and returns a oneshot recieve with the result of that process
    async fn read_chunk(&mut self, location: SegmentDescriptor) -> Result<Chunk> {
        self.segment_handle.read_chunk(location).await
    }

    /// Starts writing a chunk, and returns a oneshot reciever with the result of that process
    async fn write_chunk(&mut self, chunk: Chunk, id: ChunkID) -> Result<SegmentDescriptor> {
        self.segment_handle.write_chunk(chunk, id).await
    }

    /// Appends a DELETE record for the chunk to the currently open segment, and removes it
    /// from the index
    async fn delete_chunk(&mut self, id: ChunkID) -> Result<()> {
        self.segment_handle.delete_chunk(id).await?;
        self.index_handle.delete_chunk(id).await
    }

    /// Commits the currently open segment (fsync segment, write COMMIT, fsync segment, fsync
    /// the data directory), then flushes the in-memory index out to the hints/index/integrity
    /// sidecars
    async fn commit(&mut self) -> Result<()> {
        self.segment_handle.commit().await?;
        self.index_handle.commit_index().await
    }

    /// Lists the ids of every segment file currently on disk
    async fn list_segments(&self) -> Result<Vec<u64>> {
        self.segment_handle.list_segments().await
    }

    /// Unlinks a segment file, e.g. after compaction has copied its live records forward
    async fn retire_segment(&mut self, segment_id: u64) -> Result<()> {
        self.segment_handle.retire_segment(segment_id).await
    }

    /// Verifies `segment_ids`' on-disk contents, truncating torn or corrupt
    /// trailing writes when `repair` is set
    async fn verify_segments(&mut self, repair: bool, segment_ids: &[u64]) -> Result<Vec<u64>> {
        self.segment_handle
            .verify_segments(repair, segment_ids.to_vec())
            .await
    }

    /// Closes out the index, segment handler, and manifest cleanly, making sure all operations are
    /// completed and all drop impls from inside the tasks are called
    async fn close(&mut self) {
        self.index_handle.close().await;
        self.manifest_handle.close().await;
        self.segment_handle.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    // Utility function, sets up a tempdir and opens a MultiFile Backend
    async fn setup(key: &Key) -> (TempDir, MultiFile) {
        let tempdir = tempdir().unwrap();
        let path = tempdir.path().to_path_buf();
        let mf = MultiFile::open_defaults(path, Some(ChunkSettings::lightweight()), key)
            .await
            .unwrap();
        (tempdir, mf)
    }

    #[tokio::test]
    async fn key_store_load() {
        let key = Key::random(32);
        let (tempdir, mut mf) = setup(&key).await;
        // Encrypt the key and store it
        let enc_key = EncryptedKey::encrypt(&key, 1, b"");
        mf.write_key(&enc_key).await.expect("Unable to write key");
        // Load the key back out without unloading
        let enc_key = mf
            .read_key()
            .await
            .expect("Unable to read key (before drop)");
        // Decrypt it and verify equality
        let new_key = enc_key
            .decrypt(b"")
            .expect("Unable to decrypt key (before drop)");
        assert_eq!(key, new_key);
        // Drop the backend and try reading it from scratch
        mf.close().await;
        let enc_key = MultiFile::read_key(tempdir.path()).expect("Unable to read key (after drop)");
        let new_key = enc_key
            .decrypt(b"")
            .expect("Unable to decrypt key (after drop)");
        assert_eq!(key, new_key);
    }
}
