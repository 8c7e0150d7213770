/*!
Client-side cache: chunk reference counts, a files-cache for skipping
re-chunking of unmodified files, and a small amount of security
bookkeeping, kept as a single msgpack file per `(repository, user)` rather
than inside the repository itself.

None of this is authoritative -- the repository's index is. Losing the
cache just means the next `create` re-chunks every file and the next sync
re-derives every refcount by walking the manifest's archives.
*/
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use strongbox::manifest::StoredArchive;
use strongbox::repository::{BackendClone, ChunkID, Repository};

/// Which filesystem metadata fields `create` trusts to decide a file is
/// unchanged without re-chunking it. Any subset may be enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCacheFields {
    pub ctime: bool,
    pub mtime: bool,
    pub size: bool,
    pub inode: bool,
}

impl FileCacheFields {
    pub const ALL: FileCacheFields = FileCacheFields {
        ctime: true,
        mtime: true,
        size: true,
        inode: true,
    };
}

/// How the files-cache decides whether a file needs to be re-chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesCacheMode {
    /// Trusts the cached entry as long as none of these fields disagree
    /// with what's on disk now.
    Fields(FileCacheFields),
    /// Ignores any cached entry and always re-chunks.
    Rechunk,
    /// Never consults or updates the files-cache.
    Disabled,
}

impl Default for FilesCacheMode {
    fn default() -> Self {
        FilesCacheMode::Fields(FileCacheFields::ALL)
    }
}

/// A chunk's accounting: how many live archives reference it, and its size
/// before compression/encryption. Lets `info`-style reporting compute
/// dedup/compression ratios without re-reading the repository's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkCacheEntry {
    pub refcount: u64,
    pub plain_size: u64,
}

/// What `create` knew about a file's contents the last time it chunked it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCacheEntry {
    pub size: u64,
    pub inode: u64,
    pub mtime: i64,
    pub ctime: i64,
    pub chunk_ids: Vec<ChunkID>,
}

/// Key-fingerprint and sync-provenance bookkeeping, so a cache pointed at
/// the wrong repository (or one recreated under the same path) is
/// detectable, and `sync` knows how far back it needs to walk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSecurity {
    pub key_fingerprint: Option<String>,
    pub previous_location: Option<String>,
    pub last_seen_manifest_timestamp: Option<DateTime<FixedOffset>>,
}

/// The on-disk, per-repository cache: chunk refcounts, the files-cache, and
/// security bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cache {
    pub chunks: HashMap<ChunkID, ChunkCacheEntry>,
    pub files: HashMap<u64, FileCacheEntry>,
    pub security: CacheSecurity,
    /// Chunks whose refcount has dropped to zero since the last drain.
    /// Not persisted: a cache reload just means these deletes haven't
    /// happened yet, which is safe, only wasteful.
    #[serde(skip)]
    pending_deletes: HashSet<ChunkID>,
}

impl Cache {
    /// Loads a cache from `path`, or returns an empty one if it doesn't
    /// exist yet.
    pub fn load(path: &Path) -> Result<Cache> {
        if !path.exists() {
            return Ok(Cache::default());
        }
        let file =
            fs::File::open(path).with_context(|| format!("opening cache file {path:?}"))?;
        rmp_serde::decode::from_read(file)
            .with_context(|| format!("decoding cache file {path:?}"))
    }

    /// Writes the cache back out, creating its parent directory if needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating cache directory {parent:?}"))?;
        }
        let file =
            fs::File::create(path).with_context(|| format!("creating cache file {path:?}"))?;
        rmp_serde::encode::write(&mut BufWriter::new(file), self)
            .with_context(|| format!("encoding cache file {path:?}"))
    }

    /// Hashes a repository-relative path into the files-cache's lookup key.
    /// The files-cache is purely a local optimization hint, so a
    /// non-cryptographic hash is sufficient.
    pub fn path_key(path: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        hasher.finish()
    }

    /// Returns the cached chunking for `key` if `mode` and `current` agree
    /// the file hasn't changed since it was cached.
    pub fn lookup_file(
        &self,
        mode: FilesCacheMode,
        key: u64,
        current: &FileCacheEntry,
    ) -> Option<&[ChunkID]> {
        let fields = match mode {
            FilesCacheMode::Disabled | FilesCacheMode::Rechunk => return None,
            FilesCacheMode::Fields(fields) => fields,
        };
        let cached = self.files.get(&key)?;
        if fields.size && cached.size != current.size {
            return None;
        }
        if fields.inode && cached.inode != current.inode {
            return None;
        }
        if fields.mtime && cached.mtime != current.mtime {
            return None;
        }
        if fields.ctime && cached.ctime != current.ctime {
            return None;
        }
        Some(&cached.chunk_ids)
    }

    /// Records (or replaces) a file's chunking so a later, unmodified run
    /// can skip re-chunking it.
    pub fn record_file(&mut self, key: u64, entry: FileCacheEntry) {
        self.files.insert(key, entry);
    }

    /// Increments a chunk's refcount, inserting a fresh entry the first
    /// time this cache has seen the chunk.
    fn increment_chunk(&mut self, id: ChunkID, plain_size: u64) {
        let entry = self.chunks.entry(id).or_insert(ChunkCacheEntry {
            refcount: 0,
            plain_size,
        });
        entry.refcount += 1;
        self.pending_deletes.remove(&id);
    }

    /// Decrements a chunk's refcount, queuing it for repository deletion
    /// once it reaches zero. A chunk this cache never saw incremented is
    /// ignored rather than going negative.
    pub fn decrement_chunk(&mut self, id: ChunkID) {
        if let Some(entry) = self.chunks.get_mut(&id) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                self.pending_deletes.insert(id);
            }
        }
    }

    /// Drains the set of chunks whose refcount has dropped to zero, for the
    /// caller to `DELETE` at its next writer commit.
    pub fn take_pending_deletes(&mut self) -> Vec<ChunkID> {
        self.pending_deletes.drain().collect()
    }

    /// Walks every archive in `archives` newer than the manifest timestamp
    /// this cache last synced against, incrementing the refcount of every
    /// chunk its item stream references, then advances the sync point.
    pub async fn sync(
        &mut self,
        repo: &mut Repository<impl BackendClone>,
        archives: &[StoredArchive],
    ) -> Result<()> {
        let mut unseen: Vec<&StoredArchive> = archives
            .iter()
            .filter(|a| match self.security.last_seen_manifest_timestamp {
                Some(seen) => a.timestamp() > seen,
                None => true,
            })
            .collect();
        unseen.sort_by_key(|a| a.timestamp());

        for stored in unseen {
            let active = stored.load(repo).await.with_context(|| {
                format!("loading archive {:?} while syncing cache", stored.name())
            })?;
            let archive = active.into_archive().await;
            for locations in archive.objects.values() {
                for location in locations {
                    self.increment_chunk(location.id, location.length);
                }
            }
            let seen = self.security.last_seen_manifest_timestamp;
            if seen.is_none() || stored.timestamp() > seen.unwrap() {
                self.security.last_seen_manifest_timestamp = Some(stored.timestamp());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strongbox::repository::ChunkID;
    use tempfile::tempdir;

    fn id(byte: u8) -> ChunkID {
        ChunkID::new(&[byte; 32])
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache");

        let mut cache = Cache::default();
        cache.increment_chunk(id(1), 100);
        cache.increment_chunk(id(1), 100);
        cache.record_file(
            42,
            FileCacheEntry {
                size: 100,
                inode: 7,
                mtime: 123,
                ctime: 123,
                chunk_ids: vec![id(1)],
            },
        );
        cache.save(&path).unwrap();

        let reloaded = Cache::load(&path).unwrap();
        assert_eq!(reloaded.chunks.get(&id(1)).unwrap().refcount, 2);
        assert_eq!(reloaded.files.get(&42).unwrap().inode, 7);
    }

    #[test]
    fn missing_cache_file_loads_empty() {
        let dir = tempdir().unwrap();
        let cache = Cache::load(&dir.path().join("does-not-exist")).unwrap();
        assert!(cache.chunks.is_empty());
        assert!(cache.files.is_empty());
    }

    #[test]
    fn lookup_file_rejects_on_any_disagreeing_field() {
        let mut cache = Cache::default();
        let key = Cache::path_key("some/path");
        cache.record_file(
            key,
            FileCacheEntry {
                size: 10,
                inode: 1,
                mtime: 5,
                ctime: 5,
                chunk_ids: vec![id(9)],
            },
        );

        let unchanged = FileCacheEntry {
            size: 10,
            inode: 1,
            mtime: 5,
            ctime: 5,
            chunk_ids: vec![],
        };
        assert_eq!(
            cache
                .lookup_file(FilesCacheMode::Fields(FileCacheFields::ALL), key, &unchanged)
                .unwrap(),
            &[id(9)]
        );

        let touched = FileCacheEntry {
            mtime: 6,
            ..unchanged.clone()
        };
        assert!(cache
            .lookup_file(FilesCacheMode::Fields(FileCacheFields::ALL), key, &touched)
            .is_none());

        assert!(cache
            .lookup_file(FilesCacheMode::Rechunk, key, &unchanged)
            .is_none());
        assert!(cache
            .lookup_file(FilesCacheMode::Disabled, key, &unchanged)
            .is_none());
    }

    #[test]
    fn decrement_queues_delete_only_at_zero() {
        let mut cache = Cache::default();
        cache.increment_chunk(id(3), 50);
        cache.increment_chunk(id(3), 50);
        cache.decrement_chunk(id(3));
        assert!(cache.take_pending_deletes().is_empty());
        cache.decrement_chunk(id(3));
        assert_eq!(cache.take_pending_deletes(), vec![id(3)]);
    }
}
