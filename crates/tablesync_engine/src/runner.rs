//! Serial task execution.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Runs asynchronous tasks one at a time, in submission order.
///
/// A task starts only after the previous one settled. A failing or
/// panicking task does not block later ones: each caller receives its
/// own result. Clones share the same queue.
///
/// # Thread Safety
///
/// Built on `tokio::sync::Mutex`, which grants the lock to waiters in
/// the order they first asked for it, so no submitted task starves.
///
/// # Example
///
/// ```rust
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use tablesync_engine::TaskRunner;
///
/// let runner = TaskRunner::new();
/// let value = runner.run(|| async { 40 + 2 }).await;
/// assert_eq!(value, 42);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct TaskRunner {
    gate: Arc<Mutex<()>>,
    pending: Arc<AtomicUsize>,
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskRunner {
    /// Creates an empty runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `task` and returns its output once it ran.
    pub async fn run<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _pending = PendingGuard(&self.pending);
        let _turn = self.gate.lock().await;
        task().await
    }

    /// Number of tasks submitted and not yet finished, including the
    /// running one.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Returns true if no task is queued or running.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_in_submission_order() {
        let runner = TaskRunner::new();
        let log = Arc::new(SyncMutex::new(Vec::new()));
        let (release, released) = tokio::sync::oneshot::channel::<()>();
        let mut released = Some(released);
        let mut handles = Vec::new();

        for i in 0..5u64 {
            let log = Arc::clone(&log);
            let cloned = runner.clone();
            let hold = released.take();
            handles.push(tokio::spawn(async move {
                cloned
                    .run(|| async move {
                        log.lock().push(format!("start {i}"));
                        match hold {
                            // The first task holds the runner until every task is queued.
                            Some(hold) => {
                                let _ = hold.await;
                            }
                            None => tokio::time::sleep(Duration::from_millis(5 - i)).await,
                        }
                        log.lock().push(format!("end {i}"));
                    })
                    .await
            }));
            while runner.pending() < (i + 1) as usize {
                tokio::task::yield_now().await;
            }
        }
        release.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("start {i}"), format!("end {i}")])
            .collect();
        assert_eq!(*log.lock(), expected);
        assert!(runner.is_idle());
    }

    #[tokio::test]
    async fn failure_does_not_block_next_task() {
        let runner = TaskRunner::new();
        let first: Result<(), &str> = runner.run(|| async { Err("boom") }).await;
        let second: Result<u32, &str> = runner.run(|| async { Ok(7) }).await;
        assert_eq!(first, Err("boom"));
        assert_eq!(second, Ok(7));
    }

    #[tokio::test]
    async fn panicking_task_releases_the_runner() {
        let runner = TaskRunner::new();
        let cloned = runner.clone();
        let handle = tokio::spawn(async move {
            cloned
                .run(|| async {
                    panic!("task failed");
                })
                .await
        });
        assert!(handle.await.is_err());
        assert_eq!(runner.run(|| async { 1 }).await, 1);
        assert!(runner.is_idle());
    }
}
