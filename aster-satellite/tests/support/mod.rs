#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aster_satellite::metabase::{
    CatalogDb, IterateObjects, IterateStreams, LoopObjectEntry, LoopSegmentEntry, LoopStream, RemotePiece,
    Result as DbResult, SegmentPosition,
};
use aster_satellite::metaloop::{Object, Observer, Segment};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt as _;
use parking_lot::Mutex;
use uuid::Uuid;

/// In-memory catalog used to drive the iteration loop in tests.
#[derive(Default)]
pub struct TestCatalog {
    objects: Vec<LoopObjectEntry>,
    segments: HashMap<Uuid, Vec<LoopSegmentEntry>>,
    /// Stream ids silently dropped from `iterate_streams` answers.
    omit_streams: HashSet<Uuid>,
    /// Fail the object stream after yielding this many entries.
    fail_objects_after: Option<usize>,
    pub stream_iterations: AtomicUsize,
}

impl TestCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&mut self, entry: LoopObjectEntry, segments: Vec<LoopSegmentEntry>) {
        self.segments.insert(entry.stream_id, segments);
        self.objects.push(entry);
    }

    pub fn omit_stream(&mut self, stream_id: Uuid) {
        self.omit_streams.insert(stream_id);
    }

    pub fn fail_objects_after(&mut self, yielded: usize) {
        self.fail_objects_after = Some(yielded);
    }

    pub fn stream_iterations(&self) -> usize {
        self.stream_iterations.load(Ordering::SeqCst)
    }
}

impl CatalogDb for TestCatalog {
    fn iterate_objects(&self, _opts: IterateObjects) -> BoxStream<'_, DbResult<LoopObjectEntry>> {
        let mut items: Vec<DbResult<LoopObjectEntry>> = self.objects.iter().cloned().map(Ok).collect();

        if let Some(yielded) = self.fail_objects_after {
            items.truncate(yielded);
            items.push(Err(aster_satellite::metabase::Error::backend(anyhow::anyhow!(
                "injected object iteration failure"
            ))));
        }

        stream::iter(items).boxed()
    }

    fn iterate_streams(&self, opts: IterateStreams) -> BoxStream<'_, DbResult<LoopStream>> {
        self.stream_iterations.fetch_add(1, Ordering::SeqCst);

        let items: Vec<DbResult<LoopStream>> = opts
            .stream_ids
            .iter()
            .filter(|stream_id| !self.omit_streams.contains(stream_id))
            .map(|stream_id| {
                let segments = self.segments.get(stream_id).cloned().unwrap_or_default();
                Ok(LoopStream {
                    stream_id: *stream_id,
                    segments: stream::iter(segments.into_iter().map(Ok)).boxed(),
                })
            })
            .collect();

        stream::iter(items).boxed()
    }
}

pub fn object(n: u128, segment_count: u32) -> LoopObjectEntry {
    LoopObjectEntry {
        project_id: Uuid::from_u128(0xa57e2),
        bucket_name: "fixtures".to_owned(),
        object_key: Bytes::from(format!("objects/{n}")),
        stream_id: Uuid::from_u128(n),
        expires_at: None,
        segment_count,
    }
}

pub fn inline_segment(stream_id: Uuid, index: u32) -> LoopSegmentEntry {
    LoopSegmentEntry {
        stream_id,
        position: SegmentPosition { part: 0, index },
        created_at: None,
        encrypted_size: 64,
        plain_size: 48,
        remote_pieces: Vec::new(),
        inline_data: Bytes::from_static(b"inline payload"),
    }
}

pub fn remote_segment(stream_id: Uuid, index: u32) -> LoopSegmentEntry {
    LoopSegmentEntry {
        stream_id,
        position: SegmentPosition { part: 0, index },
        created_at: None,
        encrypted_size: 1024,
        plain_size: 1000,
        remote_pieces: vec![RemotePiece {
            number: 0,
            storage_node: Uuid::from_u128(0xfeed),
        }],
        inline_data: Bytes::new(),
    }
}

/// What a [`RecordingObserver`] saw, in callback order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Object(Uuid),
    Remote(Uuid, SegmentPosition),
    Inline(Uuid, SegmentPosition),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FailOn {
    Object(Uuid),
    Segment(Uuid, u32),
}

/// Observer recording every callback, optionally failing at a chosen one.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Event>>,
    fail_on: Mutex<Option<FailOn>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on_object(self: Arc<Self>, stream_id: Uuid) -> Arc<Self> {
        *self.fail_on.lock() = Some(FailOn::Object(stream_id));
        self
    }

    pub fn fail_on_segment(self: Arc<Self>, stream_id: Uuid, index: u32) -> Arc<Self> {
        *self.fail_on.lock() = Some(FailOn::Segment(stream_id, index));
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn record(&self, event: Event) -> anyhow::Result<()> {
        let fail = match (&event, &*self.fail_on.lock()) {
            (Event::Object(stream_id), Some(FailOn::Object(target))) => stream_id == target,
            (Event::Remote(stream_id, position) | Event::Inline(stream_id, position), Some(FailOn::Segment(target, index))) => {
                stream_id == target && position.index == *index
            }
            _ => false,
        };

        self.events.lock().push(event);

        if fail {
            anyhow::bail!("injected observer failure");
        }
        Ok(())
    }
}

#[async_trait]
impl Observer for RecordingObserver {
    async fn object(&self, object: &Object) -> anyhow::Result<()> {
        self.record(Event::Object(object.stream_id))
    }

    async fn remote_segment(&self, segment: &Segment) -> anyhow::Result<()> {
        self.record(Event::Remote(segment.stream_id, segment.location.position))
    }

    async fn inline_segment(&self, segment: &Segment) -> anyhow::Result<()> {
        self.record(Event::Inline(segment.stream_id, segment.location.position))
    }
}
