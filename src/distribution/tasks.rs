//! Child-task supervision primitives.
//!
//! The control core spawns many short- and long-lived tasks that must be
//! awaited and cancelled as a unit: the audit supervisor's children, the
//! steady-state graph's components, background tombstone cleanup. This module
//! provides:
//!
//! - [`TaskGroup`]: a set of spawned tasks with aggregate completion. Tasks
//!   can add further tasks to the same group while running; the group can be
//!   drained ([`TaskGroup::wait_all`]), raced to the first error
//!   ([`TaskGroup::wait_any`]), or aborted ([`TaskGroup::cancel_all`]).
//! - [`ReadySignal`]: a one-shot latch other tasks can await, replacing the
//!   "promise fired once init finished" pattern.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

use super::error::{DistributionError, DistributionResult};

/// A one-shot latch. Fire once; every waiter past or future observes it.
#[derive(Clone)]
pub struct ReadySignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadySignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Latch the signal. Idempotent.
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal fires. Resolves immediately if already fired.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct GroupInner {
    handles: Vec<JoinHandle<DistributionResult<()>>>,
    aborts: Vec<AbortHandle>,
    cancelled: bool,
}

/// A set of spawned tasks with aggregate completion and cancellation.
///
/// Cloning shares the same group, so a running child can add siblings.
/// Once cancelled, the group stays cancelled: late adds are aborted
/// immediately, which closes the race between a cancelling supervisor and a
/// child that was about to spawn more work.
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<Mutex<GroupInner>>,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(GroupInner {
                handles: Vec::new(),
                aborts: Vec::new(),
                cancelled: false,
            })),
        }
    }

    /// Spawn a task into the group.
    pub fn add<F>(&self, task: F)
    where
        F: Future<Output = DistributionResult<()>> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut inner = self.inner.lock().expect("task group lock poisoned");
        if inner.cancelled {
            handle.abort();
            return;
        }
        inner.aborts.push(handle.abort_handle());
        inner.handles.push(handle);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().expect("task group lock poisoned").cancelled
    }

    fn take_handles(&self) -> Vec<JoinHandle<DistributionResult<()>>> {
        let mut inner = self.inner.lock().expect("task group lock poisoned");
        std::mem::take(&mut inner.handles)
    }

    /// Await every task in the group, including tasks added while waiting.
    /// Returns the first error observed; remaining tasks keep running until
    /// awaited or cancelled.
    pub async fn wait_all(&self) -> DistributionResult<()> {
        loop {
            let handle = {
                let mut inner = self.inner.lock().expect("task group lock poisoned");
                if inner.handles.is_empty() {
                    return Ok(());
                }
                inner.handles.remove(0)
            };
            join_one(handle).await?;
        }
    }

    /// Await the group, resolving as soon as any task errors or when every
    /// task has completed. Tasks added after a batch started are picked up
    /// once the batch drains.
    pub async fn wait_any(&self) -> DistributionResult<()> {
        loop {
            let batch = self.take_handles();
            if batch.is_empty() {
                return Ok(());
            }
            let mut running: FuturesUnordered<_> = batch.into_iter().collect();
            while let Some(joined) = running.next().await {
                flatten_join(joined)?;
            }
        }
    }

    /// Abort every outstanding task and reject future adds.
    pub fn cancel_all(&self) {
        let mut inner = self.inner.lock().expect("task group lock poisoned");
        inner.cancelled = true;
        for abort in inner.aborts.drain(..) {
            abort.abort();
        }
        inner.handles.clear();
    }
}

async fn join_one(handle: JoinHandle<DistributionResult<()>>) -> DistributionResult<()> {
    flatten_join(handle.await)
}

fn flatten_join(
    joined: Result<DistributionResult<()>, tokio::task::JoinError>,
) -> DistributionResult<()> {
    match joined {
        Ok(result) => result,
        Err(join_err) if join_err.is_cancelled() => Err(DistributionError::Cancelled),
        Err(join_err) => Err(DistributionError::Internal(format!(
            "task panicked: {join_err}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_ready_signal_fires_once() {
        let signal = ReadySignal::new();
        assert!(!signal.is_ready());
        signal.fire();
        assert!(signal.is_ready());
        signal.wait().await;
        signal.fire();
        signal.wait().await;
    }

    #[tokio::test]
    async fn test_ready_signal_wakes_waiter() {
        let signal = ReadySignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.fire();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_task_group_wait_all_drains() {
        let group = TaskGroup::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            group.add(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        group.wait_all().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_task_group_child_adds_sibling() {
        let group = TaskGroup::new();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let inner_group = group.clone();
            let counter = counter.clone();
            group.add(async move {
                let counter2 = counter.clone();
                inner_group.add(async move {
                    counter2.fetch_add(10, Ordering::SeqCst);
                    Ok(())
                });
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        group.wait_all().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_task_group_wait_all_surfaces_error() {
        let group = TaskGroup::new();
        group.add(async { Ok(()) });
        group.add(async { Err(DistributionError::BrokenPromise) });
        assert_eq!(
            group.wait_all().await,
            Err(DistributionError::BrokenPromise)
        );
    }

    #[tokio::test]
    async fn test_task_group_wait_any_returns_first_error() {
        let group = TaskGroup::new();
        group.add(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        group.add(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(DistributionError::ConfigChanged)
        });
        let result =
            tokio::time::timeout(Duration::from_secs(5), group.wait_any()).await.unwrap();
        assert_eq!(result, Err(DistributionError::ConfigChanged));
        group.cancel_all();
    }

    #[tokio::test]
    async fn test_task_group_cancel_rejects_late_adds() {
        let group = TaskGroup::new();
        group.cancel_all();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = counter.clone();
            group.add(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        group.wait_all().await.unwrap();
        assert!(group.is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_task_group_cancel_aborts_running() {
        let group = TaskGroup::new();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = counter.clone();
            group.add(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        group.cancel_all();
        group.wait_all().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
