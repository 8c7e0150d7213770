//! Index rebuild, and the `hints`/`integrity` sidecars that cache it.
//!
//! The chunk index is not authoritative on its own: a repository's true
//! state is always reconstructible by scanning segments in ascending order
//! and replaying `PUT`/`DELETE` records up to the highest `COMMIT` found
//! (see `segment.rs`). `index.<txid>`/`hints.<txid>`/`integrity.<txid>` are a
//! cache of that scan, written once per commit so a reopen doesn't have to
//! rescan the whole segment log; if they're missing, stale, or fail
//! integrity verification, the caller falls back to a full rescan.
use crate::repository::backend::common::segment::{scan_segment, RecordTag};
use crate::repository::backend::{BackendError, Result, SegmentDescriptor};
use crate::repository::{ChunkID, Key, HMAC};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Packed `hints.<txid>` sidecar: bookkeeping about the repository as of
/// the transaction this index snapshot covers.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Default)]
pub struct Hints {
    /// Every segment id that existed as of this transaction.
    pub segments: Vec<u64>,
    /// Segment ids whose live-to-total ratio made them compaction
    /// candidates as of this transaction.
    pub compact: Vec<u64>,
    /// Running count of on-disk bytes used, checked against the
    /// repository's storage quota at put time.
    pub storage_quota_use: u64,
    /// Locations superseded within the transaction that produced this
    /// snapshot (a key written, then overwritten or deleted, before the
    /// commit). Kept so compaction and crash recovery can find a key's
    /// previous location without a full rescan.
    pub shadow_index: HashMap<ChunkID, SegmentDescriptor>,
}

fn sidecar_paths(repository_path: &Path, txid: u64) -> (PathBuf, PathBuf, PathBuf) {
    (
        repository_path.join(format!("index.{}", txid)),
        repository_path.join(format!("hints.{}", txid)),
        repository_path.join(format!("integrity.{}", txid)),
    )
}

/// Writes `index.<txid>`, `hints.<txid>`, and an `integrity.<txid>` MAC
/// covering the two of them, using the repository's own HMAC algorithm and
/// key so a reader without the key can't forge a cache entry.
pub fn write_sidecars(
    repository_path: &Path,
    txid: u64,
    index: &HashMap<ChunkID, SegmentDescriptor>,
    hints: &Hints,
    hmac: HMAC,
    key: &Key,
) -> Result<()> {
    let (index_path, hints_path, integrity_path) = sidecar_paths(repository_path, txid);
    let index_bytes = rmp_serde::encode::to_vec(index)?;
    let hints_bytes = rmp_serde::encode::to_vec(hints)?;
    std::fs::write(&index_path, &index_bytes)?;
    std::fs::write(&hints_path, &hints_bytes)?;

    let mut combined = index_bytes;
    combined.extend_from_slice(&hints_bytes);
    let mac = hmac.mac(&combined, key);
    std::fs::write(&integrity_path, &mac)?;
    Ok(())
}

/// Loads and authenticates the `index.<txid>`/`hints.<txid>` pair against
/// its `integrity.<txid>` MAC. Returns `Err` if a sidecar is missing or the
/// MAC doesn't match, so the caller can fall back to `rebuild_from_segment_files`
/// instead of trusting a stale or tampered cache.
pub fn read_sidecars(
    repository_path: &Path,
    txid: u64,
    hmac: HMAC,
    key: &Key,
) -> Result<(HashMap<ChunkID, SegmentDescriptor>, Hints)> {
    let (index_path, hints_path, integrity_path) = sidecar_paths(repository_path, txid);
    let index_bytes = std::fs::read(&index_path)?;
    let hints_bytes = std::fs::read(&hints_path)?;
    let expected_mac = std::fs::read(&integrity_path)?;

    let mut combined = index_bytes.clone();
    combined.extend_from_slice(&hints_bytes);
    if !hmac.verify_hmac(&expected_mac, &combined, key) {
        return Err(BackendError::IntegrityError(format!(
            "hints/index sidecars for transaction {} failed integrity verification",
            txid
        )));
    }

    let index = rmp_serde::decode::from_slice(&index_bytes)?;
    let hints = rmp_serde::decode::from_slice(&hints_bytes)?;
    Ok((index, hints))
}

/// Rebuilds the chunk index by scanning `segments` (must be in ascending
/// segment-id order) and replaying `PUT`/`DELETE` records in order, up to
/// the highest `COMMIT` found across all of them. Records after that point
/// — whether trailing in the same segment or in a later, uncommitted one —
/// are invisible, matching the append-only crash-safety invariant: a
/// segment file ending without a `COMMIT` has no effect on reopen.
///
/// Returns the rebuilt map, the id of the segment containing the defining
/// `COMMIT` (`None` if nothing has ever been committed), and the total
/// on-disk bytes of every `PUT` record up to that point (quota usage is
/// never reclaimed by a `DELETE` in an append-only log, only by
/// compaction, so this counts every `PUT` seen, not just currently-live
/// ones).
pub fn rebuild_from_segment_files(
    segments: &[(u64, PathBuf)],
) -> Result<(HashMap<ChunkID, SegmentDescriptor>, Option<u64>, u64)> {
    let mut scanned = Vec::with_capacity(segments.len());
    let mut last_commit: Option<(u64, u64)> = None;
    for (segment_id, path) in segments {
        let mut file = std::fs::File::open(path)?;
        let records = scan_segment(&mut file)?;
        for record in &records {
            if record.tag == RecordTag::Commit {
                last_commit = Some((*segment_id, record.offset));
            }
        }
        scanned.push((*segment_id, records));
    }

    let mut map = HashMap::new();
    let mut storage_quota_use = 0_u64;
    if let Some((commit_segment, commit_offset)) = last_commit {
        'outer: for (segment_id, records) in &scanned {
            for record in records {
                if *segment_id > commit_segment
                    || (*segment_id == commit_segment && record.offset > commit_offset)
                {
                    break 'outer;
                }
                match record.tag {
                    RecordTag::Put => {
                        map.insert(
                            record.key,
                            SegmentDescriptor {
                                segment_id: *segment_id,
                                start: record.offset,
                            },
                        );
                        storage_quota_use += record.payload.len() as u64;
                    }
                    RecordTag::Delete => {
                        map.remove(&record.key);
                    }
                    RecordTag::Commit => {}
                }
            }
        }
    }
    Ok((map, last_commit.map(|(s, _)| s), storage_quota_use))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::backend::common::segment::Segment;
    use crate::repository::{Chunk, Compression, Encryption};
    use tempfile::tempdir;

    fn test_chunk(id: ChunkID, data: &[u8]) -> Chunk {
        Chunk::pack_with_id(
            data.to_vec(),
            Compression::NoCompression,
            Encryption::NoEncryption,
            &Key::random(32),
            id,
        )
        .unwrap()
    }

    #[test]
    fn rebuild_stops_at_last_commit() {
        let dir = tempdir().unwrap();

        // Segment 0: PUT a, COMMIT.
        let id_a = ChunkID::random_id();
        let path_0 = dir.path().join("0");
        {
            let file = std::fs::File::create(&path_0).unwrap();
            let mut segment = Segment::new(file, 1_000_000).unwrap();
            segment.write_chunk(test_chunk(id_a, b"a"), id_a).unwrap();
            segment.write_commit().unwrap();
        }

        // Segment 1: PUT b, with no COMMIT -- uncommitted, must be invisible.
        let id_b = ChunkID::random_id();
        let path_1 = dir.path().join("1");
        {
            let file = std::fs::File::create(&path_1).unwrap();
            let mut segment = Segment::new(file, 1_000_000).unwrap();
            segment.write_chunk(test_chunk(id_b, b"b"), id_b).unwrap();
        }

        let (map, last_commit, quota_use) =
            rebuild_from_segment_files(&[(0, path_0), (1, path_1)]).unwrap();
        assert_eq!(last_commit, Some(0));
        assert!(map.contains_key(&id_a));
        assert!(!map.contains_key(&id_b));
        assert!(quota_use > 0);
    }

    #[test]
    fn rebuild_applies_delete() {
        let dir = tempdir().unwrap();
        let id = ChunkID::random_id();
        let path = dir.path().join("0");
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut segment = Segment::new(file, 1_000_000).unwrap();
            segment.write_chunk(test_chunk(id, b"x"), id).unwrap();
            segment.write_delete(id).unwrap();
            segment.write_commit().unwrap();
        }

        let (map, last_commit, _quota_use) = rebuild_from_segment_files(&path_pair(0, &path)).unwrap();
        assert_eq!(last_commit, Some(0));
        assert!(!map.contains_key(&id));

        // DELETE hides the chunk from the rebuilt index, but an append-only
        // log never actually erases the PUT record: the segment still
        // contains it and a raw scan still sees it, which is exactly what
        // lets compaction and crash recovery find a chunk's prior location.
        let mut file = std::fs::File::open(&path).unwrap();
        let records = scan_segment(&mut file).unwrap();
        assert!(records
            .iter()
            .any(|r| r.tag == RecordTag::Put && r.key == id));
    }

    fn path_pair(id: u64, path: &Path) -> Vec<(u64, PathBuf)> {
        vec![(id, path.to_path_buf())]
    }

    #[test]
    fn sidecars_round_trip_and_detect_tampering() {
        let dir = tempdir().unwrap();
        let key = Key::random(32);
        let hmac = HMAC::Blake2b;
        let mut index = HashMap::new();
        index.insert(
            ChunkID::random_id(),
            SegmentDescriptor {
                segment_id: 0,
                start: 8,
            },
        );
        let hints = Hints {
            segments: vec![0],
            ..Default::default()
        };

        write_sidecars(dir.path(), 1, &index, &hints, hmac, &key).unwrap();
        let (loaded_index, loaded_hints) = read_sidecars(dir.path(), 1, hmac, &key).unwrap();
        assert_eq!(loaded_index, index);
        assert_eq!(loaded_hints.segments, hints.segments);

        // Tamper with the hints file; integrity check must now fail.
        let (_, hints_path, _) = sidecar_paths(dir.path(), 1);
        std::fs::write(&hints_path, b"tampered").unwrap();
        assert!(read_sidecars(dir.path(), 1, hmac, &key).is_err());
    }
}
