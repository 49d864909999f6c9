//! Contract between the iteration loop and the catalog storage.
//!
//! The relational backend lives elsewhere; the loop only needs the two
//! streaming reads below plus the entry types they yield.

use bytes::Bytes;
use futures::stream::BoxStream;
use time::OffsetDateTime;
use uuid::Uuid;

/// Failure of the catalog backend.
#[derive(Debug, thiserror::Error)]
#[error("catalog backend: {0}")]
pub struct Error(#[from] anyhow::Error);

impl Error {
    pub fn backend(error: impl Into<anyhow::Error>) -> Self {
        Self(error.into())
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// One object row as seen by the iteration loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopObjectEntry {
    pub project_id: Uuid,
    pub bucket_name: String,
    pub object_key: Bytes,
    pub stream_id: Uuid,
    pub expires_at: Option<OffsetDateTime>,
    /// Declared number of segments; drives batch sizing, not delivery.
    pub segment_count: u32,
}

/// Position of a segment within its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SegmentPosition {
    pub part: u32,
    pub index: u32,
}

impl SegmentPosition {
    pub fn encode(self) -> u64 {
        u64::from(self.part) << 32 | u64::from(self.index)
    }
}

/// A piece of a remote segment held by one storage node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePiece {
    pub number: u16,
    pub storage_node: Uuid,
}

/// One segment row as seen by the iteration loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSegmentEntry {
    pub stream_id: Uuid,
    pub position: SegmentPosition,
    pub created_at: Option<OffsetDateTime>,
    pub encrypted_size: u32,
    pub plain_size: u32,
    pub remote_pieces: Vec<RemotePiece>,
    pub inline_data: Bytes,
}

impl LoopSegmentEntry {
    /// Inline segments keep their payload in the catalog row itself.
    pub fn is_inline(&self) -> bool {
        self.remote_pieces.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IterateObjects {
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct IterateStreams {
    pub stream_ids: Vec<Uuid>,
    /// Read timestamp fixed at the beginning of the pass, so every batch of
    /// a pass observes the same catalog state.
    pub as_of_system_time: OffsetDateTime,
}

pub type SegmentStream = BoxStream<'static, Result<LoopSegmentEntry>>;

/// Segments of one requested stream id.
pub struct LoopStream {
    pub stream_id: Uuid,
    pub segments: SegmentStream,
}

pub trait CatalogDb: Send + Sync {
    /// Streams every object entry in the catalog, fetching `batch_size`
    /// rows per query.
    fn iterate_objects(&self, opts: IterateObjects) -> BoxStream<'_, Result<LoopObjectEntry>>;

    /// Streams the segments of the requested stream ids, in unspecified
    /// stream order, as of the fixed read timestamp.
    fn iterate_streams(&self, opts: IterateStreams) -> BoxStream<'_, Result<LoopStream>>;
}
