//! Cluster discovery.
//!
//! The [`WatcherManager`] polls storage for the set of clusters that have
//! metric records and keeps exactly one [`ClusterWatcher`] running per
//! cluster. New clusters get a watcher on the next discovery pass; clusters
//! that disappear have theirs drained, then cancelled and awaited.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster_watcher::{ClusterWatcher, SyncContext};
use crate::constants::SHUTDOWN_TIMEOUT_SECS;
use crate::error::SyncResult;
use crate::metrics::{ACTIVE_CLUSTER_WATCHERS, clear_tracked_endpoints, record_collaborator_error};
use crate::task_group::TaskGroup;
use crate::types::MetricEvent;

struct RunningWatcher {
    watcher: Arc<ClusterWatcher>,
    tasks: TaskGroup,
}

impl RunningWatcher {
    async fn stop(mut self) {
        self.tasks
            .shutdown(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS))
            .await;
        self.watcher.mark_stopped();
        clear_tracked_endpoints(self.watcher.cluster_id());
        ACTIVE_CLUSTER_WATCHERS.dec();
    }
}

/// Keeps one cluster watcher per discovered cluster.
pub struct WatcherManager {
    ctx: SyncContext,
    events: mpsc::Sender<MetricEvent>,
    watchers: RwLock<HashMap<String, RunningWatcher>>,
    token: CancellationToken,
}

impl WatcherManager {
    /// Watchers run under children of `token`.
    pub fn new(ctx: SyncContext, events: mpsc::Sender<MetricEvent>, token: CancellationToken) -> Self {
        Self {
            ctx,
            events,
            watchers: RwLock::new(HashMap::new()),
            token,
        }
    }

    /// Run discovery until the token is cancelled, then stop every watcher.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.ctx.config.discovery_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.discover().await {
                        record_collaborator_error("storage");
                        warn!(error = %e, "Cluster discovery failed");
                    }
                }
            }
        }
        self.stop_all().await;
        debug!("Watcher manager stopped");
    }

    /// One discovery pass: start watchers for new clusters and stop those
    /// whose cluster is gone.
    ///
    /// A vanished cluster's watcher is drained first, so deletes its push
    /// watch may have missed still reach the queue. It keeps running until a
    /// drain leaves it with no known metric.
    pub async fn discover(&self) -> SyncResult<()> {
        let clusters = self.ctx.store.list_clusters().await?;
        if self.ctx.health.record_storage(true) {
            info!("Storage reachable again");
        }

        let vanished: Vec<Arc<ClusterWatcher>> = self
            .watchers
            .read()
            .await
            .iter()
            .filter(|(id, _)| !clusters.contains(*id))
            .map(|(_, running)| running.watcher.clone())
            .collect();
        let mut drained = Vec::with_capacity(vanished.len());
        for watcher in vanished {
            if watcher.drain().await {
                drained.push(watcher.cluster_id().to_string());
            } else {
                debug!(cluster_id = %watcher.cluster_id(), "Cluster gone but metrics still tracked, keeping watcher");
            }
        }

        let removed: Vec<RunningWatcher> = {
            let mut watchers = self.watchers.write().await;
            let removed = drained
                .iter()
                .filter_map(|id| watchers.remove(id))
                .collect();

            if !self.token.is_cancelled() {
                for cluster_id in &clusters {
                    if watchers.contains_key(cluster_id) {
                        continue;
                    }
                    let watcher =
                        ClusterWatcher::new(cluster_id.clone(), self.ctx.clone(), self.events.clone());
                    let tasks = watcher.start(self.token.child_token());
                    ACTIVE_CLUSTER_WATCHERS.inc();
                    info!(cluster_id = %cluster_id, "Cluster discovered, watcher started");
                    watchers.insert(cluster_id.clone(), RunningWatcher { watcher, tasks });
                }
            }
            removed
        };

        for running in removed {
            info!(cluster_id = %running.watcher.cluster_id(), "Cluster gone, stopping watcher");
            running.stop().await;
        }
        Ok(())
    }

    /// IDs of clusters with a running watcher, sorted.
    pub async fn running_clusters(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.watchers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn watcher(&self, cluster_id: &str) -> Option<Arc<ClusterWatcher>> {
        self.watchers
            .read()
            .await
            .get(cluster_id)
            .map(|running| running.watcher.clone())
    }

    /// Stop and await every running watcher.
    pub async fn stop_all(&self) {
        let running: Vec<RunningWatcher> = self.watchers.write().await.drain().map(|(_, r)| r).collect();
        if running.is_empty() {
            return;
        }
        info!(count = running.len(), "Stopping all cluster watchers");
        futures::future::join_all(running.into_iter().map(RunningWatcher::stop)).await;
    }
}
