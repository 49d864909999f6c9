use std::future::Future;

use async_trait::async_trait;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Aborts the running task when dropped.
/// Also see https://github.com/tokio-rs/tokio/issues/1830 for some background.
#[must_use]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(tokio::task::spawn(future))
    }

    pub async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    /// Immediately abort the task
    pub fn abort(&self) {
        self.0.abort();
    }

    /// Drop without aborting the task
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> From<JoinHandle<T>> for ChildTask<T> {
    fn from(value: JoinHandle<T>) -> Self {
        Self(value)
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

/// A set of sibling tasks waited on as a unit.
///
/// `wait` returns only once every spawned task has returned, and reports the
/// first failure observed. Secondary failures are logged and discarded.
/// Cooperative cancellation is the caller's business: hand each task a
/// [`CancellationToken`] (or a [`tokio_util::sync::DropGuard`] over one) and
/// the group merely collects the results.
pub struct TaskGroup {
    set: JoinSet<anyhow::Result<()>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self { set: JoinSet::new() }
    }

    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.set.spawn(future);
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub async fn wait(mut self) -> anyhow::Result<()> {
        let mut first_error: Option<anyhow::Error> = None;

        while let Some(joined) = self.set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_error) if join_error.is_panic() => {
                    Err(anyhow::anyhow!("a task panicked: {join_error}"))
                }
                // Aborted tasks are not failures; the group only aborts on drop.
                Err(_) => Ok(()),
            };

            if let Err(error) = result {
                if first_error.is_none() {
                    first_error = Some(error);
                } else {
                    warn!(error = format!("{error:#}"), "Secondary task failure");
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, cancel: CancellationToken) -> Self::Output;
}

pub fn spawn_task<T>(task: T, cancel: CancellationToken) -> ChildTask<T::Output>
where
    T: Task + Send + 'static,
{
    let task_fut = task.run(cancel);
    ChildTask(tokio::task::spawn(task_fut))
}
