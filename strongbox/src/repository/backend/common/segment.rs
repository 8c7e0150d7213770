//! Segment file format.
//!
//! A segment is an append-only log of records. Each segment file starts with
//! an 8-byte magic number, followed by a sequence of records:
//!
//! `tag(1) | key(32) | size(4, big endian) | crc32(4, big endian) | payload(size)`
//!
//! `PUT` carries a chunk as its payload; `DELETE` and `COMMIT` carry no
//! payload (`size` is zero) and their crc32 covers the header bytes
//! (`tag | key | size`) instead of a payload. `COMMIT` uses the all-zero key.
//!
//! The highest segment containing a `COMMIT` record defines the committed
//! transaction id; records written after it (in that segment or a later,
//! uncommitted one) are discarded on the next open. A record whose payload or
//! CRC can't be read in full (a torn write at end-of-file) is treated the
//! same way: scanning simply stops there.
use crate::repository::backend::{BackendError, Result, SegmentDescriptor};
use crate::repository::{Chunk, ChunkID};
use futures::channel;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use rmp_serde as rpms;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use tokio::task;

/// Magic number at the start of every segment file.
pub const SEGMENT_MAGIC: [u8; 8] = *b"BORG_SEG";

const HEADER_LEN: usize = 1 + 32 + 4;

/// The kind of a record in a segment log.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RecordTag {
    Put,
    Delete,
    Commit,
}

impl RecordTag {
    fn to_u8(self) -> u8 {
        match self {
            RecordTag::Put => 0,
            RecordTag::Delete => 1,
            RecordTag::Commit => 2,
        }
    }

    fn from_u8(b: u8) -> Option<RecordTag> {
        match b {
            0 => Some(RecordTag::Put),
            1 => Some(RecordTag::Delete),
            2 => Some(RecordTag::Commit),
            _ => None,
        }
    }
}

/// A single decoded record and the offset it starts at.
#[derive(Clone, Debug)]
pub struct Record {
    pub offset: u64,
    pub tag: RecordTag,
    pub key: ChunkID,
    pub payload: Vec<u8>,
}

fn crc_of(header: &[u8], payload: &[u8]) -> u32 {
    if payload.is_empty() {
        crc32fast::hash(header)
    } else {
        crc32fast::hash(payload)
    }
}

fn write_record<T: Write>(handle: &mut T, tag: RecordTag, key: ChunkID, payload: &[u8]) -> Result<u64> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.push(tag.to_u8());
    header.extend_from_slice(key.as_bytes());
    header.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    let crc = crc_of(&header, payload);
    handle.write_all(&header)?;
    handle.write_all(&crc.to_be_bytes())?;
    handle.write_all(payload)?;
    Ok((header.len() + 4 + payload.len()) as u64)
}

/// Reads one record starting at the handle's current position.
///
/// Returns `Ok(None)` both on a clean end-of-file and on a torn/corrupt
/// trailing record (missing bytes or a CRC mismatch) — either way, there is
/// nothing more to scan from this position.
fn read_record<T: Read>(handle: &mut T) -> Result<Option<Record>> {
    let mut header = [0_u8; HEADER_LEN];
    match read_exact_or_eof(handle, &mut header)? {
        false => return Ok(None),
        true => {}
    }
    let tag = match RecordTag::from_u8(header[0]) {
        Some(tag) => tag,
        None => return Ok(None),
    };
    let key = ChunkID::new(&header[1..33]);
    let size = u32::from_be_bytes([header[33], header[34], header[35], header[36]]) as usize;
    let mut crc_bytes = [0_u8; 4];
    if !read_exact_or_eof(handle, &mut crc_bytes)? {
        return Ok(None);
    }
    let expected_crc = u32::from_be_bytes(crc_bytes);
    let mut payload = vec![0_u8; size];
    if !read_exact_or_eof(handle, &mut payload)? {
        return Ok(None);
    }
    if crc_of(&header, &payload) != expected_crc {
        return Ok(None);
    }
    Ok(Some(Record {
        offset: 0,
        tag,
        key,
        payload,
    }))
}

/// Like `Read::read_exact`, but treats hitting EOF before any bytes of `buf`
/// have been filled as `Ok(false)` rather than an error, and hitting EOF
/// partway through as `Ok(false)` too (a torn record).
fn read_exact_or_eof<T: Read>(handle: &mut T, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match handle.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Scans a segment file and returns the byte length of its valid prefix:
/// the magic header plus every record that parses cleanly, stopping at the
/// first torn or corrupt record (or at a clean end-of-file). A return value
/// shorter than the file's actual length means the tail is torn or corrupt
/// and should be truncated before any further record is appended --
/// `scan_segment`/`rebuild_from_segment_files` simply stop reading at that
/// point, but a writer that blindly appends past it would bury the new
/// records behind garbage no future scan can get past.
pub fn valid_segment_length<T: Read + Seek>(handle: &mut T) -> Result<u64> {
    handle.seek(SeekFrom::Start(0))?;
    let mut magic = [0_u8; 8];
    if !read_exact_or_eof(handle, &mut magic)? {
        return Ok(0);
    }
    if magic != SEGMENT_MAGIC {
        return Err(BackendError::UnsupportedFormat(
            "segment does not start with the expected magic header".to_string(),
        ));
    }
    let mut valid_end = handle.stream_position()?;
    while read_record(handle)?.is_some() {
        valid_end = handle.stream_position()?;
    }
    Ok(valid_end)
}

/// Scans a whole segment file (any `Read + Seek`), returning every complete,
/// valid record found after the magic header, in file order. Stops at the
/// first record that can't be fully read or fails its CRC.
pub fn scan_segment<T: Read + Seek>(handle: &mut T) -> Result<Vec<Record>> {
    handle.seek(SeekFrom::Start(0))?;
    let mut magic = [0_u8; 8];
    if !read_exact_or_eof(handle, &mut magic)? {
        return Ok(Vec::new());
    }
    if magic != SEGMENT_MAGIC {
        return Err(BackendError::UnsupportedFormat(
            "segment does not start with the expected magic header".to_string(),
        ));
    }
    let mut records = Vec::new();
    loop {
        let offset = handle.stream_position()?;
        match read_record(handle)? {
            Some(mut record) => {
                record.offset = offset;
                records.push(record);
            }
            None => break,
        }
    }
    Ok(records)
}

/// Generic segment implementation wrapping any `Read + Write + Seek`.
#[derive(Debug)]
pub struct Segment<T> {
    handle: T,
    size_limit: u64,
}

impl<T: Read + Write + Seek> Segment<T> {
    /// Creates a new segment given a reader and a maximum size.
    ///
    /// Writes the magic header if the underlying handle is empty, otherwise
    /// validates the existing header.
    pub fn new(handle: T, size_limit: u64) -> Result<Segment<T>> {
        let mut s = Segment { handle, size_limit };
        if !s.write_header()? {
            if !s.validate_header()? {
                return Err(BackendError::UnsupportedFormat(
                    "segment does not start with the expected magic header".to_string(),
                ));
            }
        }
        Ok(s)
    }

    /// Writes the magic header if the segment is currently empty.
    ///
    /// Returns `Ok(true)` if the header was written (the segment was empty),
    /// `Ok(false)` if it already had content.
    pub fn write_header(&mut self) -> Result<bool> {
        let end = self.handle.seek(SeekFrom::End(0))?;
        if end == 0 {
            self.handle.seek(SeekFrom::Start(0))?;
            self.handle.write_all(&SEGMENT_MAGIC)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Validates the magic header of an existing segment.
    pub fn validate_header(&mut self) -> Result<bool> {
        self.handle.seek(SeekFrom::Start(0))?;
        let mut magic = [0_u8; 8];
        self.handle.read_exact(&mut magic)?;
        Ok(magic == SEGMENT_MAGIC)
    }

    /// Returns the size in bytes of the segment.
    pub fn size(&mut self) -> u64 {
        self.handle.seek(SeekFrom::End(0)).unwrap()
    }

    async fn free_bytes(&mut self) -> u64 {
        let end = self.handle.seek(SeekFrom::End(0)).unwrap();
        self.size_limit.saturating_sub(end)
    }

    pub fn read_chunk(&mut self, start: u64, _length: u64) -> Result<Chunk> {
        self.handle.seek(SeekFrom::Start(start))?;
        let record = read_record(&mut self.handle)?.ok_or_else(|| {
            BackendError::SegmentError("no valid record at that offset".to_string())
        })?;
        if record.tag != RecordTag::Put {
            return Err(BackendError::SegmentError(
                "record at that offset is not a PUT".to_string(),
            ));
        }
        Ok(rpms::decode::from_read(&record.payload[..])?)
    }

    pub fn write_chunk(&mut self, chunk: Chunk, id: ChunkID) -> Result<(u64, u64)> {
        let mut payload = Vec::new();
        rpms::encode::write(&mut payload, &chunk)?;
        let start = self.handle.seek(SeekFrom::End(0))?;
        let length = write_record(&mut self.handle, RecordTag::Put, id, &payload)?;
        Ok((start, length))
    }

    /// Appends a DELETE record for `id`, marking it as removed as of this
    /// point in the log.
    pub fn write_delete(&mut self, id: ChunkID) -> Result<(u64, u64)> {
        let start = self.handle.seek(SeekFrom::End(0))?;
        let length = write_record(&mut self.handle, RecordTag::Delete, id, &[])?;
        Ok((start, length))
    }

    /// Appends a COMMIT record, marking every record up to and including it
    /// as part of the committed transaction.
    ///
    /// Durability (fsyncing the file and its containing directory) is the
    /// caller's responsibility, since this type has no knowledge of whether
    /// its handle is backed by a real file.
    pub fn write_commit(&mut self) -> Result<u64> {
        let start = self.handle.seek(SeekFrom::End(0))?;
        write_record(&mut self.handle, RecordTag::Commit, ChunkID::manifest_id(), &[])?;
        self.handle.flush()?;
        Ok(start)
    }

    /// Unwraps the segment, returning the underlying handle.
    pub fn into_inner(self) -> T {
        self.handle
    }

    pub fn into_read_segment(self) -> ReadSegment<T> {
        ReadSegment {
            handle: BufReader::with_capacity(1_000_000, self.handle),
            size_limit: self.size_limit,
        }
    }

    pub fn into_write_segment(self) -> WriteSegment<T> {
        WriteSegment {
            handle: BufWriter::with_capacity(1_000_000, self.handle),
            size_limit: self.size_limit,
        }
    }
}

#[derive(Debug)]
pub struct ReadSegment<T> {
    handle: BufReader<T>,
    size_limit: u64,
}

impl<T: Read + Seek> ReadSegment<T> {
    pub fn read_chunk(&mut self, start: u64, _length: u64) -> Result<Chunk> {
        self.handle.seek(SeekFrom::Start(start))?;
        let record = read_record(&mut self.handle)?.ok_or_else(|| {
            BackendError::SegmentError("no valid record at that offset".to_string())
        })?;
        if record.tag != RecordTag::Put {
            return Err(BackendError::SegmentError(
                "record at that offset is not a PUT".to_string(),
            ));
        }
        Ok(rpms::decode::from_read(&record.payload[..])?)
    }
}

#[derive(Debug)]
pub struct WriteSegment<T: Write> {
    handle: BufWriter<T>,
    size_limit: u64,
}

impl<T: Write + Seek> WriteSegment<T> {
    /// Returns the size in bytes of the segment.
    pub fn size(&mut self) -> u64 {
        self.handle.seek(SeekFrom::End(0)).unwrap()
    }

    pub fn write_chunk(&mut self, chunk: Chunk, id: ChunkID) -> Result<(u64, u64)> {
        let mut payload = Vec::new();
        rpms::encode::write(&mut payload, &chunk)?;
        let start = self.handle.seek(SeekFrom::End(0))?;
        let length = write_record(&mut self.handle, RecordTag::Put, id, &payload)?;
        Ok((start, length))
    }

    pub fn write_delete(&mut self, id: ChunkID) -> Result<(u64, u64)> {
        let start = self.handle.seek(SeekFrom::End(0))?;
        let length = write_record(&mut self.handle, RecordTag::Delete, id, &[])?;
        Ok((start, length))
    }

    /// Appends a COMMIT record and flushes the buffered writer. The caller
    /// is responsible for fsyncing the underlying file (and its directory)
    /// before and after, per the write-commit durability protocol.
    pub fn write_commit(&mut self) -> Result<u64> {
        let start = self.handle.seek(SeekFrom::End(0))?;
        write_record(&mut self.handle, RecordTag::Commit, ChunkID::manifest_id(), &[])?;
        self.handle.flush()?;
        Ok(start)
    }
}

impl WriteSegment<crate::repository::backend::common::files::LockedFile> {
    /// Flushes the buffered writer and fsyncs the underlying file.
    pub fn sync_all(&mut self) -> Result<()> {
        self.handle.flush()?;
        self.handle.get_ref().sync_all()?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct SegmentStats {
    /// The used space in this segment
    pub size: u64,
    /// Number of bytes left in the segment before it hits quota
    pub free: u64,
    /// Quota of this segment
    pub quota: u64,
}

/// Describes a command that can be run on a segment
#[derive(Debug)]
pub enum SegmentCommand {
    Write(
        Chunk,
        ChunkID,
        channel::oneshot::Sender<Result<SegmentDescriptor>>,
    ),
    Read(SegmentDescriptor, channel::oneshot::Sender<Result<Chunk>>),
    Stats(channel::oneshot::Sender<SegmentStats>),
    Close(channel::oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct TaskedSegment<R> {
    command_tx: channel::mpsc::Sender<SegmentCommand>,
    phantom: PhantomData<R>,
}

impl<R: Read + Write + Seek + Send + 'static> TaskedSegment<R> {
    pub fn new(reader: R, size_limit: u64, segment_id: u64) -> TaskedSegment<R> {
        let (tx, mut rx) = channel::mpsc::channel(100);
        task::spawn(async move {
            let mut segment = Segment::new(reader, size_limit).unwrap();
            let mut final_ret = None;
            while let Some(command) = rx.next().await {
                match command {
                    SegmentCommand::Write(data, id, ret) => {
                        let res = segment.write_chunk(data, id);
                        let out = res.map(|(start, _)| SegmentDescriptor { segment_id, start });
                        ret.send(out).unwrap();
                    }
                    SegmentCommand::Read(location, ret) => {
                        let chunk = segment.read_chunk(location.start, 0);
                        ret.send(chunk).unwrap();
                    }
                    SegmentCommand::Stats(ret) => {
                        let size = segment.size();
                        let free = segment.free_bytes().await;
                        let quota = segment.size_limit;
                        let stats = SegmentStats { size, free, quota };
                        ret.send(stats).unwrap();
                    }
                    SegmentCommand::Close(ret) => {
                        final_ret = Some(ret);
                        break;
                    }
                }
            }
            // Ensure that our internals are dropped before returning
            std::mem::drop(segment);
            std::mem::drop(rx);
            if let Some(ret) = final_ret {
                ret.send(()).unwrap();
            };
        });
        TaskedSegment {
            command_tx: tx,
            phantom: PhantomData,
        }
    }

    pub async fn write_chunk(&mut self, chunk: Chunk, id: ChunkID) -> Result<SegmentDescriptor> {
        let (tx, rx) = channel::oneshot::channel();
        self.command_tx
            .send(SegmentCommand::Write(chunk, id, tx))
            .await
            .unwrap();
        rx.await?
    }

    pub async fn read_chunk(&mut self, location: SegmentDescriptor) -> Result<Chunk> {
        let (tx, rx) = channel::oneshot::channel();
        self.command_tx
            .send(SegmentCommand::Read(location, tx))
            .await
            .unwrap();
        rx.await?
    }

    pub async fn stats(&mut self) -> channel::oneshot::Receiver<SegmentStats> {
        let (tx, rx) = channel::oneshot::channel();
        self.command_tx
            .send(SegmentCommand::Stats(tx))
            .await
            .unwrap();
        rx
    }

    pub async fn close(&mut self) {
        let (tx, rx) = channel::oneshot::channel();
        self.command_tx
            .send(SegmentCommand::Close(tx))
            .await
            .unwrap();
        rx.await.unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn segment_header_sanity() {
        let cursor = Cursor::new(Vec::<u8>::new());
        let mut segment = Segment::new(cursor, 100).unwrap();
        assert!(segment.validate_header().unwrap());
    }

    fn test_chunk(id: ChunkID, data: &[u8]) -> Chunk {
        Chunk::pack_with_id(
            data.to_vec(),
            crate::repository::Compression::NoCompression,
            crate::repository::Encryption::NoEncryption,
            &crate::repository::Key::random(32),
            id,
        )
        .unwrap()
    }

    #[test]
    fn put_delete_commit_roundtrip() {
        let cursor = Cursor::new(Vec::<u8>::new());
        let mut segment = Segment::new(cursor, 1_000_000).unwrap();
        let id = ChunkID::random_id();
        let chunk = test_chunk(id, b"hello world");
        let (start, _) = segment.write_chunk(chunk, id).unwrap();
        segment.write_delete(id).unwrap();
        segment.write_commit().unwrap();

        let read_back = segment.read_chunk(start, 0).unwrap();
        assert_eq!(read_back.get_id(), id);
    }

    #[test]
    fn scan_sees_put_delete_commit_in_order() {
        let cursor = Cursor::new(Vec::<u8>::new());
        let mut segment = Segment::new(cursor, 1_000_000).unwrap();
        let id = ChunkID::random_id();
        let chunk = test_chunk(id, b"data");
        segment.write_chunk(chunk, id).unwrap();
        segment.write_delete(id).unwrap();
        segment.write_commit().unwrap();

        let mut cursor = segment.into_inner();
        let records = scan_segment(&mut cursor).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].tag, RecordTag::Put);
        assert_eq!(records[1].tag, RecordTag::Delete);
        assert_eq!(records[2].tag, RecordTag::Commit);
    }
}
