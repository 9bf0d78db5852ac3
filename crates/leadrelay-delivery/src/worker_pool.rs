//! Supervised worker tasks with structured shutdown.
//!
//! A pool owns the join handles of one group of long-running tasks
//! (consumers, senders, the scheduler) and the cancellation token they
//! watch. Shutdown cancels the token and joins every task within a time
//! budget.

use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::PipelineError;

struct Worker {
    name: String,
    handle: JoinHandle<Result<(), PipelineError>>,
}

/// Group of supervised tasks sharing one cancellation token.
pub struct WorkerPool {
    group: &'static str,
    cancellation_token: CancellationToken,
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Creates an empty pool whose tasks watch `cancellation_token`.
    pub fn new(group: &'static str, cancellation_token: CancellationToken) -> Self {
        Self { group, cancellation_token, workers: Vec::new() }
    }

    /// Token handed to the pool's tasks.
    pub fn token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Spawns a task built from the pool's token.
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        let name = name.into();
        let group = self.group;
        let future = task(self.cancellation_token.clone());
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let result = future.await;
            if let Err(ref error) = result {
                error!(group, worker = %task_name, error = %error, "worker terminated with error");
            } else {
                info!(group, worker = %task_name, "worker stopped");
            }
            result
        });

        self.workers.push(Worker { name, handle });
    }

    /// Number of spawned tasks.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no task was spawned.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Whether any task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.workers.iter().any(|w| !w.handle.is_finished())
    }

    /// Cancels every task and waits for all of them to finish.
    ///
    /// # Errors
    ///
    /// `ShutdownTimeout` if the tasks outlive `timeout`, `WorkerPanic` if a
    /// task panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<(), PipelineError> {
        info!(
            group = self.group,
            worker_count = self.workers.len(),
            timeout_seconds = timeout.as_secs(),
            "stopping workers"
        );

        self.cancellation_token.cancel();
        let workers = std::mem::take(&mut self.workers);
        let group = self.group;

        let join_all = async move {
            let mut panicked = None;
            for worker in workers {
                match worker.handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(err)) => {
                        warn!(group, worker = %worker.name, error = %err, "worker exited with error");
                    },
                    Err(join_error) => {
                        error!(group, worker = %worker.name, error = %join_error, "worker panicked");
                        panicked.get_or_insert(format!("{}: {join_error}", worker.name));
                    },
                }
            }
            panicked
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(None) => {
                info!(group, "workers stopped");
                Ok(())
            },
            Ok(Some(panic)) => Err(PipelineError::WorkerPanic(panic)),
            Err(_elapsed) => {
                error!(
                    group,
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(PipelineError::ShutdownTimeout { timeout_secs: timeout.as_secs() })
            },
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("group", &self.group)
            .field("workers", &self.workers.iter().map(|w| w.name.as_str()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.workers.iter().filter(|w| !w.handle.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                group = self.group,
                active_workers = active,
                "worker pool dropped without shutdown; cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn shutdown_waits_for_workers_to_observe_cancellation() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new("test", CancellationToken::new());

        for id in 0..3 {
            let finished = finished.clone();
            pool.spawn(format!("worker-{id}"), move |cancel| async move {
                cancel.cancelled().await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(pool.len(), 3);
        assert!(pool.has_active_workers());

        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn worker_errors_do_not_fail_shutdown() {
        let mut pool = WorkerPool::new("test", CancellationToken::new());
        pool.spawn("failing", |_| async {
            Err::<(), _>(PipelineError::Configuration("boom".into()))
        });

        assert!(pool.shutdown_graceful(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn panics_are_reported() {
        let mut pool = WorkerPool::new("test", CancellationToken::new());
        pool.spawn("panicky", |_| async {
            let exploded = true;
            if exploded {
                panic!("worker exploded");
            }
            Ok::<(), PipelineError>(())
        });

        let err = pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, PipelineError::WorkerPanic(ref msg) if msg.starts_with("panicky")));
    }

    #[tokio::test]
    async fn stuck_workers_hit_the_timeout() {
        let mut pool = WorkerPool::new("test", CancellationToken::new());
        pool.spawn("stuck", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), PipelineError>(())
        });

        let err = pool.shutdown_graceful(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, PipelineError::ShutdownTimeout { .. }));
    }

    #[tokio::test]
    async fn dropping_an_active_pool_cancels_its_token() {
        let token = CancellationToken::new();
        let mut pool = WorkerPool::new("test", token.clone());
        pool.spawn("idle", |cancel| async move {
            cancel.cancelled().await;
            Ok(())
        });

        drop(pool);
        assert!(token.is_cancelled());
    }
}
