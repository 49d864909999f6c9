use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{stats, Error};
use crate::metabase::{LoopObjectEntry, LoopSegmentEntry, SegmentPosition};

/// Object info passed to observers by the catalog loop.
#[derive(Debug, Clone)]
pub struct Object(pub LoopObjectEntry);

impl Object {
    /// Checks if the object expired relative to `now`.
    pub fn expired(&self, now: OffsetDateTime) -> bool {
        matches!(self.0.expires_at, Some(expires_at) if expires_at < now)
    }
}

impl Deref for Object {
    type Target = LoopObjectEntry;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Where a segment lives in the object namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLocation {
    pub project_id: Uuid,
    pub bucket_name: String,
    pub object_key: Bytes,
    pub position: SegmentPosition,
}

/// Segment info passed to observers by the catalog loop.
#[derive(Debug, Clone)]
pub struct Segment {
    pub location: SegmentLocation,
    /// Not populated yet; kept until the data source is settled.
    pub creation_date: Option<OffsetDateTime>,
    /// Inherited from the owning object.
    pub expiration_date: Option<OffsetDateTime>,
    /// Not populated yet; kept until the data source is settled.
    pub last_repaired: Option<OffsetDateTime>,
    pub entry: LoopSegmentEntry,
}

impl Segment {
    /// Checks if the segment expired relative to `now`.
    pub fn expired(&self, now: OffsetDateTime) -> bool {
        matches!(self.expiration_date, Some(expiration) if expiration < now)
    }

    pub fn is_inline(&self) -> bool {
        self.entry.is_inline()
    }
}

impl Deref for Segment {
    type Target = LoopSegmentEntry;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

/// An observer subscribed to the catalog loop.
///
/// Callbacks returning an error unsubscribe the observer from the pass in
/// flight; the error is reported back through its join call.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Instrumentation key; defaults to the implementing type's name.
    fn name(&self) -> &'static str {
        core::any::type_name::<Self>()
    }

    async fn object(&self, object: &Object) -> anyhow::Result<()>;

    async fn remote_segment(&self, segment: &Segment) -> anyhow::Result<()>;

    async fn inline_segment(&self, segment: &Segment) -> anyhow::Result<()>;
}

/// An observer that does nothing. Useful for joining and ensuring the
/// catalog loop runs once before you use a real observer.
pub struct NullObserver;

#[async_trait]
impl Observer for NullObserver {
    async fn object(&self, _object: &Object) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remote_segment(&self, _segment: &Segment) -> anyhow::Result<()> {
        Ok(())
    }

    async fn inline_segment(&self, _segment: &Segment) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Book-keeping the pass driver holds per subscribed observer: the ambient
/// cancellation scope of its joiner, the single-shot completion channel and
/// the callback latency recorders.
pub(crate) struct ObserverContext {
    observer: Arc<dyn Observer>,
    pub(crate) cancel: CancellationToken,
    completion: Option<oneshot::Sender<Result<(), Error>>>,
    object_durations: stats::LocalDurations,
    remote_durations: stats::LocalDurations,
    inline_durations: stats::LocalDurations,
}

impl ObserverContext {
    pub(crate) fn new(
        cancel: CancellationToken,
        observer: Arc<dyn Observer>,
    ) -> (Self, oneshot::Receiver<Result<(), Error>>) {
        let (completion_tx, completion_rx) = oneshot::channel();
        let name = observer.name();

        let context = Self {
            cancel,
            completion: Some(completion_tx),
            object_durations: stats::local_timer(name, stats::KIND_OBJECT),
            remote_durations: stats::local_timer(name, stats::KIND_REMOTE),
            inline_durations: stats::local_timer(name, stats::KIND_INLINE),
            observer,
        };

        (context, completion_rx)
    }

    pub(crate) async fn object(&mut self, object: &Object) -> anyhow::Result<()> {
        let start = Instant::now();
        let result = self.observer.object(object).await;
        self.object_durations.observe(start.elapsed().as_secs_f64());
        result
    }

    pub(crate) async fn remote_segment(&mut self, segment: &Segment) -> anyhow::Result<()> {
        let start = Instant::now();
        let result = self.observer.remote_segment(segment).await;
        self.remote_durations.observe(start.elapsed().as_secs_f64());
        result
    }

    pub(crate) async fn inline_segment(&mut self, segment: &Segment) -> anyhow::Result<()> {
        let start = Instant::now();
        let result = self.observer.inline_segment(segment).await;
        self.inline_durations.observe(start.elapsed().as_secs_f64());
        result
    }

    /// Reports `result` if it is an error and tells whether the observer is
    /// done for this pass.
    pub(crate) fn handle_error(&mut self, result: Result<(), Error>) -> bool {
        match result {
            Ok(()) => false,
            Err(error) => {
                self.complete(Err(error));
                true
            }
        }
    }

    pub(crate) fn fail(&mut self, error: Error) {
        self.complete(Err(error));
    }

    pub(crate) fn finish(&mut self) {
        self.complete(Ok(()));
    }

    fn complete(&mut self, result: Result<(), Error>) {
        if let Some(completion) = self.completion.take() {
            // The joiner may have walked away; nothing to do then.
            let _ = completion.send(result);
        }

        self.object_durations.flush();
        self.remote_durations.flush();
        self.inline_durations.flush();
    }
}
