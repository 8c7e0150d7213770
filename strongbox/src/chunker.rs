//! Bridges the synchronous chunking algorithms in `strongbox-chunker` into
//! the async stream interface the archive driver consumes.
//!
//! Chunking is CPU-bound, not I/O-bound, so this is a thin adapter over the
//! underlying iterator rather than genuine concurrency. It lets the driver
//! `.await` chunk boundaries alongside the async chunk writes that follow
//! each one.
use futures::stream::Stream;
use std::io::Read;
use std::pin::Pin;

pub use strongbox_chunker::*;

/// A boxed stream of chunk slices, or the first error encountered while
/// producing them.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ChunkerError>>>>;

/// A `Chunker` driven as an async stream.
pub trait AsyncChunker: Send + Sync {
    fn async_chunk<R: Read + Send + 'static>(&self, read: R) -> ChunkStream;
}

impl<C: Chunker + Send + Sync + 'static> AsyncChunker for C {
    fn async_chunk<R: Read + Send + 'static>(&self, read: R) -> ChunkStream {
        Box::pin(futures::stream::iter(self.chunk(read)))
    }
}
