//! Catalog iteration loop.
//!
//! A singleton pass driver coalesces joining observers for a short window,
//! then streams the entire object catalog through every surviving observer
//! exactly once, under a global rate limit. Observers are isolated from one
//! another: a failing observer drops out of the pass, the rest continue.

mod observer;
mod stats;

pub use self::observer::{NullObserver, Object, Observer, Segment, SegmentLocation};

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt as _;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use self::observer::ObserverContext;
use crate::config::LoopConfig;
use crate::metabase::{CatalogDb, IterateObjects, IterateStreams, LoopObjectEntry, LoopSegmentEntry, LoopStream};

/// Hard ceiling for the catalog batch size.
const BATCH_SIZE_LIMIT: usize = 2500;

/// Batch size requested by the standalone [`iterate_database`].
const STANDALONE_LIST_LIMIT: usize = 10_000;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("catalog loop closed")]
    Closed,

    #[error("catalog loop interrupted")]
    Canceled,

    #[error("observer failed: {0}")]
    Observer(Arc<anyhow::Error>),

    #[error("catalog iteration failed: {0}")]
    Db(Arc<crate::metabase::Error>),

    #[error("unable to find corresponding object: {stream_id}")]
    MissingObject { stream_id: Uuid },

    #[error("{count} objects left unhandled after stream iteration")]
    UnhandledObjects { count: usize },

    #[error("{} observers failed", .0.len())]
    Multiple(Vec<Error>),
}

/// The catalog loop service.
///
/// Observers subscribe through [`Loop::join`] from any task; a single driver
/// task runs [`Loop::run`].
pub struct Loop {
    config: LoopConfig,
    db: Arc<dyn CatalogDb>,
    join_tx: mpsc::Sender<Vec<ObserverContext>>,
    join_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<ObserverContext>>>,
    done: CancellationToken,
    running: AtomicBool,
}

impl Loop {
    pub fn new(config: LoopConfig, db: Arc<dyn CatalogDb>) -> Self {
        let (join_tx, join_rx) = mpsc::channel(1);

        Self {
            config,
            db,
            join_tx,
            join_rx: tokio::sync::Mutex::new(join_rx),
            done: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Subscribes `observers` to the next pass and blocks until that pass
    /// completes for them. Returns `Ok` only after a fully completed pass.
    ///
    /// Safe to call concurrently. `cancel` is the ambient scope of these
    /// observers: once it fires they stop receiving callbacks and the call
    /// returns [`Error::Canceled`].
    pub async fn join<I>(&self, cancel: CancellationToken, observers: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = Arc<dyn Observer>>,
    {
        let mut contexts = Vec::new();
        let mut completions = Vec::new();

        for observer in observers {
            let (context, completion) = ObserverContext::new(cancel.clone(), observer);
            contexts.push(context);
            completions.push(completion);
        }

        tokio::select! {
            biased;
            _ = self.done.cancelled() => return Err(Error::Closed),
            _ = cancel.cancelled() => return Err(Error::Canceled),
            sent = self.join_tx.send(contexts) => {
                if sent.is_err() {
                    return Err(Error::Closed);
                }
            }
        }

        let mut errors = Vec::new();

        for mut completion in completions {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Canceled),
                result = &mut completion => result.unwrap_or(Err(Error::Closed)),
            };

            if let Err(error) = result {
                errors.push(error);
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.swap_remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }

    /// Runs passes until one fails.
    ///
    /// May only be called once per loop instance.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        assert!(
            !self.running.swap(true, Ordering::SeqCst),
            "catalog loop may only be run once"
        );

        loop {
            self.run_once(&cancel).await?;
        }
    }

    /// Waits for observers, coalesces late joiners, then makes exactly one
    /// pass over the catalog.
    ///
    /// Not safe to call concurrently with [`Loop::run`].
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let mut join_rx = self
            .join_rx
            .try_lock()
            .expect("another pass is already running");

        let mut observers: Vec<ObserverContext> = Vec::new();

        // Wait for the first joiner.
        tokio::select! {
            batch = join_rx.recv() => match batch {
                Some(batch) => observers.extend(batch),
                None => return Err(Error::Closed),
            },
            _ = cancel.cancelled() => return Err(Error::Canceled),
        }

        // Collect everyone else arriving inside the coalescing window.
        let timer = tokio::time::sleep(self.config.coalesce_duration);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => break,
                batch = join_rx.recv() => if let Some(batch) = batch {
                    observers.extend(batch);
                },
                _ = cancel.cancelled() => {
                    finish_observers(observers);
                    return Err(Error::Canceled);
                }
            }
        }

        iterate(
            cancel,
            self.db.as_ref(),
            observers,
            self.config.list_limit,
            self.config.rate_limit,
        )
        .await
    }

    /// Closes the loop. Pending joiners receive [`Error::Closed`].
    ///
    /// Must not be called more than once.
    pub fn close(&self) {
        assert!(!self.done.is_cancelled(), "catalog loop already closed");
        self.done.cancel();

        // Resolve batches that were queued but never picked up by a pass.
        if let Ok(mut join_rx) = self.join_rx.try_lock() {
            while let Ok(batch) = join_rx.try_recv() {
                for mut context in batch {
                    context.fail(Error::Closed);
                }
            }
        }
    }

    /// Waits until the loop is closed. Safe to call concurrently.
    pub async fn wait(&self) {
        self.done.cancelled().await;
    }
}

#[async_trait]
impl aster_task::Task for Arc<Loop> {
    type Output = Result<(), Error>;

    const NAME: &'static str = "catalog loop";

    async fn run(self, cancel: CancellationToken) -> Self::Output {
        Loop::run(&self, cancel).await
    }
}

/// Performs a one-shot pass over `db` without coalescing.
pub async fn iterate_database(
    cancel: &CancellationToken,
    rate_limit: u32,
    db: &dyn CatalogDb,
    observers: Vec<Arc<dyn Observer>>,
) -> Result<(), Error> {
    let contexts = observers
        .into_iter()
        .map(|observer| ObserverContext::new(cancel.clone(), observer).0)
        .collect();

    iterate(cancel, db, contexts, STANDALONE_LIST_LIMIT, rate_limit).await
}

async fn iterate(
    cancel: &CancellationToken,
    db: &dyn CatalogDb,
    mut observers: Vec<ObserverContext>,
    list_limit: usize,
    rate_limit: u32,
) -> Result<(), Error> {
    match iterate_objects(cancel, db, &mut observers, list_limit, rate_limit).await {
        Ok(()) => {
            finish_observers(observers);
            Ok(())
        }
        Err(error) => {
            for mut context in observers {
                context.fail(error.clone());
            }
            Err(error)
        }
    }
}

async fn iterate_objects(
    cancel: &CancellationToken,
    db: &dyn CatalogDb,
    observers: &mut Vec<ObserverContext>,
    list_limit: usize,
    rate_limit: u32,
) -> Result<(), Error> {
    let limit = clamp_list_limit(list_limit);
    let started_at = OffsetDateTime::now_utc();
    let limiter = rate_limiter(rate_limit);

    let mut objects: HashMap<Uuid, LoopObjectEntry> = HashMap::new();
    let mut ids: Vec<Uuid> = Vec::with_capacity(limit);
    let mut segments_in_batch: usize = 0;

    let mut entries = db.iterate_objects(IterateObjects { batch_size: limit });

    while let Some(entry) = entries.next().await {
        let entry = entry.map_err(|error| Error::Db(Arc::new(error)))?;
        wait_for_slot(cancel, limiter.as_ref()).await?;

        // The +1 keeps objects with no segments from accumulating without bound.
        let cost = entry.segment_count as usize + 1;

        if !objects.is_empty() && segments_in_batch + cost >= limit {
            match process_batch(cancel, db, observers, &mut objects, &mut ids, started_at).await? {
                ControlFlow::Break(()) => return Ok(()),
                ControlFlow::Continue(()) => {}
            }
            segments_in_batch = 0;
        }

        ids.push(entry.stream_id);
        objects.insert(entry.stream_id, entry);
        segments_in_batch += cost;
    }

    if let ControlFlow::Break(()) = process_batch(cancel, db, observers, &mut objects, &mut ids, started_at).await? {
        return Ok(());
    }

    Ok(())
}

async fn process_batch(
    cancel: &CancellationToken,
    db: &dyn CatalogDb,
    observers: &mut Vec<ObserverContext>,
    objects: &mut HashMap<Uuid, LoopObjectEntry>,
    ids: &mut Vec<Uuid>,
    as_of_system_time: OffsetDateTime,
) -> Result<ControlFlow<()>, Error> {
    if objects.is_empty() {
        ids.clear();
        return Ok(ControlFlow::Continue(()));
    }

    let mut streams = db.iterate_streams(IterateStreams {
        stream_ids: ids.clone(),
        as_of_system_time,
    });

    while let Some(stream) = streams.next().await {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        let LoopStream {
            stream_id,
            mut segments,
        } = stream.map_err(|error| Error::Db(Arc::new(error)))?;

        // Exactly one delivery per object: serving a stream id consumes it.
        let entry = objects.remove(&stream_id).ok_or(Error::MissingObject { stream_id })?;

        let object = Object(entry.clone());
        deliver_to_all(observers, Delivery::Object(&object)).await;
        if observers.is_empty() {
            return Ok(ControlFlow::Break(()));
        }

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }

            let Some(segment_entry) = segments.next().await else {
                break;
            };
            let segment_entry = segment_entry.map_err(|error| Error::Db(Arc::new(error)))?;
            let segment = build_segment(&entry, segment_entry);

            deliver_to_all(observers, Delivery::Segment(&segment)).await;
            if observers.is_empty() {
                return Ok(ControlFlow::Break(()));
            }
        }
    }

    drop(streams);

    if !objects.is_empty() {
        return Err(Error::UnhandledObjects { count: objects.len() });
    }

    ids.clear();
    Ok(ControlFlow::Continue(()))
}

#[derive(Clone, Copy)]
enum Delivery<'a> {
    Object(&'a Object),
    Segment(&'a Segment),
}

async fn deliver_to_all(observers: &mut Vec<ObserverContext>, delivery: Delivery<'_>) {
    let mut kept = Vec::with_capacity(observers.len());

    for mut context in observers.drain(..) {
        if deliver(&mut context, delivery).await {
            kept.push(context);
        }
    }

    *observers = kept;
}

/// Returns whether the observer stays subscribed.
async fn deliver(context: &mut ObserverContext, delivery: Delivery<'_>) -> bool {
    let result = match delivery {
        Delivery::Object(object) => context.object(object).await,
        Delivery::Segment(segment) if segment.is_inline() => context.inline_segment(segment).await,
        Delivery::Segment(segment) => context.remote_segment(segment).await,
    };

    if context.handle_error(result.map_err(|error| Error::Observer(Arc::new(error)))) {
        return false;
    }

    if context.cancel.is_cancelled() {
        context.fail(Error::Canceled);
        return false;
    }

    true
}

fn build_segment(object: &LoopObjectEntry, entry: LoopSegmentEntry) -> Segment {
    Segment {
        location: SegmentLocation {
            project_id: object.project_id,
            bucket_name: object.bucket_name.clone(),
            object_key: object.object_key.clone(),
            position: entry.position,
        },
        creation_date: None,
        expiration_date: object.expires_at,
        last_repaired: None,
        entry,
    }
}

fn finish_observers(observers: Vec<ObserverContext>) {
    for mut context in observers {
        context.finish();
    }
}

fn clamp_list_limit(limit: usize) -> usize {
    if limit == 0 || limit > BATCH_SIZE_LIMIT {
        BATCH_SIZE_LIMIT
    } else {
        limit
    }
}

fn rate_limiter(rate_limit: u32) -> Option<DefaultDirectRateLimiter> {
    let rate = NonZeroU32::new(rate_limit)?;
    Some(RateLimiter::direct(Quota::per_second(rate).allow_burst(NonZeroU32::MIN)))
}

async fn wait_for_slot(cancel: &CancellationToken, limiter: Option<&DefaultDirectRateLimiter>) -> Result<(), Error> {
    match limiter {
        Some(limiter) => tokio::select! {
            _ = cancel.cancelled() => Err(Error::Canceled),
            _ = limiter.until_ready() => Ok(()),
        },
        None if cancel.is_cancelled() => Err(Error::Canceled),
        None => Ok(()),
    }
}
