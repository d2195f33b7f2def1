//! Named background tasks that share one cancellation scope.
//!
//! Every long-running component (cluster watcher, watcher manager, metric
//! manager) owns a `TaskGroup` for its loops. The group's token is a child of
//! the owner's token, so cancelling anything above it cascades down and
//! cancelling the group never touches siblings.
//!
//! ```rust,no_run
//! use fleetwatch::task_group::TaskGroup;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let root = CancellationToken::new();
//! let mut group = TaskGroup::new("cluster-watcher", root.child_token());
//!
//! group.spawn("metric_sync", async {
//!     loop {
//!         tokio::time::sleep(Duration::from_secs(30)).await;
//!     }
//! });
//!
//! group.shutdown(Duration::from_secs(5)).await;
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Status of a task in the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    /// Returned, panicked or was cancelled.
    Finished,
}

struct TaskInfo {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// A set of named tasks under one cancellation token.
pub struct TaskGroup {
    owner: String,
    token: CancellationToken,
    tasks: Vec<TaskInfo>,
}

impl TaskGroup {
    pub fn new(owner: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            owner: owner.into(),
            token,
            tasks: Vec::new(),
        }
    }

    /// The group's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Spawn a named task that is dropped at its next await point once the
    /// group is cancelled.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            warn!(owner = %self.owner, task = name, "Ignoring spawn on cancelled task group");
            return;
        }

        let token = self.token.clone();
        let owner = self.owner.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(owner = %owner, task = name, "Task cancelled");
                }
                _ = task => {
                    debug!(owner = %owner, task = name, "Task completed");
                }
            }
        });

        debug!(owner = %self.owner, task = name, "Spawned task");
        self.tasks.push(TaskInfo { name, handle });
    }

    /// Spawn a named task that watches the group token itself.
    ///
    /// The task is never dropped on cancellation; shutdown waits for it to
    /// return and only aborts it at the deadline.
    pub fn spawn_with_token<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            warn!(owner = %self.owner, task = name, "Ignoring spawn on cancelled task group");
            return;
        }

        let owner = self.owner.clone();
        let task = task(self.token.clone());
        let handle = tokio::spawn(async move {
            task.await;
            debug!(owner = %owner, task = name, "Task completed");
        });

        debug!(owner = %self.owner, task = name, "Spawned task");
        self.tasks.push(TaskInfo { name, handle });
    }

    /// Status of every task, in spawn order.
    pub fn health_check(&self) -> Vec<(&'static str, TaskStatus)> {
        self.tasks
            .iter()
            .map(|info| {
                let status = if info.handle.is_finished() {
                    TaskStatus::Finished
                } else {
                    TaskStatus::Running
                };
                (info.name, status)
            })
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|info| !info.handle.is_finished())
            .count()
    }

    /// Cancel the group and wait up to `timeout` for every task to finish.
    ///
    /// Tasks still running at the deadline are aborted. Calling this again
    /// is a no-op.
    pub async fn shutdown(&mut self, timeout: Duration) {
        self.token.cancel();
        let deadline = tokio::time::Instant::now() + timeout;

        for mut info in self.tasks.drain(..) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, &mut info.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    warn!(owner = %self.owner, task = info.name, error = %e, "Task panicked");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(owner = %self.owner, task = info.name, "Task did not stop before deadline, aborting");
                    info.handle.abort();
                }
            }
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.token.cancel();
        for info in self.tasks.drain(..) {
            info.handle.abort();
        }
    }
}
