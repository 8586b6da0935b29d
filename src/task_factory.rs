//! Task-spawning factory, plus a test double that drains re-entrantly
//! spawned work.
//!
//! Per `spec.md` §4.6: a production [`TaskFactory`] spawns cooperative
//! tasks on the host runtime, and a [`TestTaskFactory`] records every
//! task it spawns so tests can drain them deterministically with
//! [`TestTaskFactory::run_until_idle`].
//!
//! Tokio tasks do not carry priority or task-local inheritance the way
//! the host runtime this crate's contract was distilled from implies —
//! `task()` and `detached()` are therefore identical on this runtime.
//! The distinction is kept in the API because callers porting code from
//! a richer-runtime host still expect both names, and a future
//! runtime-aware implementation (e.g. propagating a `tracing::Span`)
//! would give them different bodies.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;

/// Spawns cooperative tasks on the host runtime.
///
/// `task` and `detached` spawn identically on Tokio; see the module docs
/// for why the contract still distinguishes them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskFactory;

impl TaskFactory {
    /// Creates a new factory. Stateless — any number of factories behave
    /// identically.
    pub fn new() -> Self {
        Self
    }

    /// Spawns `op` as a new task, returning its `JoinHandle`.
    pub fn task<T, F>(&self, op: F) -> JoinHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        tokio::spawn(op)
    }

    /// Spawns `op` without inheriting caller context.
    ///
    /// Identical to [`TaskFactory::task`] on this runtime; kept as a
    /// distinct entry point for API parity with the host contract.
    pub fn detached<T, F>(&self, op: F) -> JoinHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        tokio::spawn(op)
    }
}

/// A [`TaskFactory`] stand-in for tests: records every spawned task so a
/// test can deterministically drain them with [`run_until_idle`].
///
/// [`run_until_idle`]: TestTaskFactory::run_until_idle
pub struct TestTaskFactory {
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for TestTaskFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TestTaskFactory {
    /// Creates an empty test factory.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Spawns `op`, discarding its result, and records the task so
    /// [`TestTaskFactory::run_until_idle`] will wait for it.
    pub fn task<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(op);
        self.pending.lock().unwrap().push(handle);
    }

    /// Identical to [`TestTaskFactory::task`]; kept for API parity with
    /// [`TaskFactory::detached`].
    pub fn detached<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.task(op)
    }

    /// Awaits every recorded task, including ones spawned by tasks that
    /// are themselves being awaited here, until none remain.
    ///
    /// Safe against re-entrant additions: each iteration dequeues and
    /// awaits exactly one task, then re-checks the list, so a task that
    /// calls back into `self.task(...)` while it runs is picked up by a
    /// later iteration rather than racing the drain.
    pub async fn run_until_idle(&self) {
        loop {
            let next = self.pending.lock().unwrap().pop();
            match next {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn task_factory_runs_and_returns_result() {
        let factory = TaskFactory::new();
        let handle = factory.task(async { 1 + 1 });
        assert_eq!(handle.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn detached_runs_independently_of_caller() {
        let factory = TaskFactory::new();
        let ran = Arc::new(AtomicU32::new(0));
        let r = ran.clone();
        let handle = factory.detached(async move {
            r.fetch_add(1, Ordering::SeqCst);
        });
        handle.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_until_idle_drains_all_recorded_tasks() {
        let factory = TestTaskFactory::new();
        let count = Arc::new(AtomicU32::new(0));

        for _ in 0..5 {
            let c = count.clone();
            factory.task(async move {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        factory.run_until_idle().await;
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn run_until_idle_drains_tasks_spawned_reentrantly() {
        let factory = Arc::new(TestTaskFactory::new());
        let count = Arc::new(AtomicU32::new(0));

        let f = factory.clone();
        let c = count.clone();
        factory.task(async move {
            c.fetch_add(1, Ordering::SeqCst);
            let c2 = c.clone();
            f.task(async move {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });

        factory.run_until_idle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
