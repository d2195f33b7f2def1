//! Key-sharded worker pool.
//!
//! Every task carries a routing key. A consistent-hash ring maps the key to
//! one of N workers, each with its own bounded FIFO queue, so tasks with the
//! same key run strictly in submission order while different keys proceed in
//! parallel. Submitting to a full queue waits for space.
//!
//! Cancelling the pipeline's token makes further submissions fail with
//! [`SyncError::PipelineClosed`]. Each worker finishes the task it is
//! running, then exits and drops whatever is still queued, so an action is
//! never cut off between two collaborator calls.

use std::time::Duration;

use conhash::{ConsistentHash, Node};
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::constants::VIRTUAL_NODES_PER_WORKER;
use crate::error::{SyncError, SyncResult};
use crate::task_group::TaskGroup;

/// A unit of pipeline work.
pub type Task = BoxFuture<'static, ()>;

#[derive(Debug, Clone)]
struct WorkerNode {
    index: usize,
}

impl Node for WorkerNode {
    fn name(&self) -> String {
        format!("worker-{}", self.index)
    }
}

/// Stable routing-key → worker mapping.
pub struct ShardRouter {
    ring: ConsistentHash<WorkerNode>,
    workers: usize,
}

impl ShardRouter {
    pub fn new(workers: usize) -> Self {
        let mut ring = ConsistentHash::new();
        for index in 0..workers {
            ring.add(&WorkerNode { index }, VIRTUAL_NODES_PER_WORKER);
        }
        Self { ring, workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Worker index for `key`.
    pub fn route(&self, key: &str) -> usize {
        self.ring.get_str(key).map(|node| node.index).unwrap_or(0)
    }
}

/// Running worker pool.
pub struct Pipeline {
    router: ShardRouter,
    queues: Vec<mpsc::Sender<Task>>,
    workers: TaskGroup,
}

impl Pipeline {
    /// Start `workers` workers with `capacity` queued tasks each.
    ///
    /// `workers` and `capacity` are clamped to at least 1.
    pub fn start(workers: usize, capacity: usize, token: CancellationToken) -> Self {
        let workers = workers.max(1);
        let capacity = capacity.max(1);
        let mut group = TaskGroup::new("pipeline", token);
        let mut queues = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = mpsc::channel(capacity);
            queues.push(tx);
            group.spawn_with_token("pipeline_worker", move |token| run_worker(index, rx, token));
        }

        info!(workers, capacity, "Pipeline started");
        Self {
            router: ShardRouter::new(workers),
            queues,
            workers: group,
        }
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn is_closed(&self) -> bool {
        self.workers.token().is_cancelled()
    }

    /// Queue `task` on the worker owning `key`, waiting while its queue is
    /// full.
    pub async fn submit(&self, key: &str, task: Task) -> SyncResult<()> {
        let token = self.workers.token();
        if token.is_cancelled() {
            return Err(SyncError::PipelineClosed);
        }
        let queue = &self.queues[self.router.route(key)];
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(SyncError::PipelineClosed),
            sent = queue.send(task) => sent.map_err(|_| SyncError::PipelineClosed),
        }
    }

    /// Stop the workers and wait up to `timeout` for the tasks they are
    /// running. Queued tasks are dropped.
    pub async fn shutdown(&mut self, timeout: Duration) {
        self.workers.shutdown(timeout).await;
        debug!("Pipeline stopped");
    }
}

async fn run_worker(index: usize, mut queue: mpsc::Receiver<Task>, token: CancellationToken) {
    loop {
        let task = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            task = queue.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        task.await;
    }
    queue.close();
    debug!(worker = index, "Pipeline worker stopped");
}
