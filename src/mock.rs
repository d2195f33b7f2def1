//! In-memory collaborators for testing.
//!
//! Available with the `test-utilities` feature or in unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! fleetwatch = { path = ".", features = ["test-utilities"] }
//! ```
//!
//! - [`MockMetricStore`]: records, subscriptions, injected watch breaks and
//!   failures, call counters
//! - [`MockCoordinationStore`]: node tree with child watches
//! - [`MockApplicationApi`]: applied applications and call counters

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::error::{SyncError, SyncResult};
use crate::traits::{ApplicationApi, CoordinationStore, MetricStore};
use crate::types::{
    ApplicationManifest, CollectorConfig, Kind, Metric, MetricTask, QueryFilter, StoreEvent,
    StoreRecord, Workload,
};

const SUBSCRIPTION_CAPACITY: usize = 256;

// =============================================================================
// MockMetricStore
// =============================================================================

#[derive(Debug, Clone)]
struct MockRecord {
    namespace: String,
    name: String,
    value: Bytes,
}

#[derive(Default)]
struct StoreState {
    /// (cluster, kind) → id → record
    records: HashMap<(String, Kind), BTreeMap<String, MockRecord>>,
    subscribers: HashMap<(String, Kind), Vec<mpsc::Sender<StoreEvent>>>,
    saves: HashMap<Kind, usize>,
    deletes: HashMap<Kind, usize>,
}

impl StoreState {
    fn notify(&mut self, cluster_id: &str, kind: Kind, event: StoreEvent) {
        if let Some(subscribers) = self.subscribers.get_mut(&(cluster_id.to_string(), kind)) {
            subscribers.retain(|tx| !tx.is_closed());
            for tx in subscribers.iter() {
                let _ = tx.try_send(event.clone());
            }
        }
    }
}

/// In-memory [`MetricStore`].
#[derive(Default)]
pub struct MockMetricStore {
    state: RwLock<StoreState>,
    failing: AtomicBool,
    drop_push_events: AtomicBool,
}

impl MockMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a storage error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Apply changes without notifying subscribers, as if push events were
    /// lost in transit.
    pub fn set_drop_push_events(&self, drop: bool) {
        self.drop_push_events.store(drop, Ordering::SeqCst);
    }

    fn check(&self) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(SyncError::Storage("mock storage unavailable".into()))
        } else {
            Ok(())
        }
    }

    /// Insert or replace a record under an explicit ID.
    pub async fn put(
        &self,
        cluster_id: &str,
        kind: Kind,
        id: &str,
        namespace: &str,
        name: &str,
        value: Bytes,
    ) {
        let mut state = self.state.write().await;
        let previous = state
            .records
            .entry((cluster_id.to_string(), kind))
            .or_default()
            .insert(
                id.to_string(),
                MockRecord {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    value: value.clone(),
                },
            );
        if !self.drop_push_events.load(Ordering::SeqCst) {
            let record = StoreRecord::new(id, value);
            let event = if previous.is_some() {
                StoreEvent::Change(record)
            } else {
                StoreEvent::Add(record)
            };
            state.notify(cluster_id, kind, event);
        }
    }

    /// Remove a record by ID.
    pub async fn remove(&self, cluster_id: &str, kind: Kind, id: &str) {
        let mut state = self.state.write().await;
        let removed = state
            .records
            .get_mut(&(cluster_id.to_string(), kind))
            .and_then(|records| records.remove(id));
        if let Some(record) = removed {
            if !self.drop_push_events.load(Ordering::SeqCst) {
                state.notify(
                    cluster_id,
                    kind,
                    StoreEvent::Delete(StoreRecord::new(id, record.value)),
                );
            }
        }
    }

    pub async fn put_metric(&self, metric: &Metric) {
        let value = Bytes::from(serde_json::to_vec(metric).unwrap_or_default());
        self.put(
            &metric.cluster_id,
            Kind::Metric,
            &metric.id,
            &metric.namespace,
            &metric.name,
            value,
        )
        .await;
    }

    pub async fn remove_metric(&self, metric: &Metric) {
        self.remove(&metric.cluster_id, Kind::Metric, &metric.id)
            .await;
    }

    pub async fn put_workload(&self, cluster_id: &str, workload: &Workload) {
        let value = Bytes::from(serde_json::to_vec(workload).unwrap_or_default());
        self.put(
            cluster_id,
            Kind::Dynamic,
            &workload.id,
            &workload.namespace,
            &workload.name,
            value,
        )
        .await;
    }

    pub async fn remove_workload(&self, cluster_id: &str, workload_id: &str) {
        self.remove(cluster_id, Kind::Dynamic, workload_id).await;
    }

    pub async fn put_metric_task(&self, cluster_id: &str, task: &MetricTask) {
        let value = Bytes::from(serde_json::to_vec(task).unwrap_or_default());
        let id = format!("{}/{}", task.namespace, task.metric_name);
        self.put(
            cluster_id,
            Kind::MetricTask,
            &id,
            &task.namespace,
            &task.metric_name,
            value,
        )
        .await;
    }

    /// Send a watch break to every subscriber of (cluster, kind) and drop
    /// the subscriptions.
    pub async fn break_watches(&self, cluster_id: &str, kind: Kind) {
        let mut state = self.state.write().await;
        if let Some(subscribers) = state.subscribers.remove(&(cluster_id.to_string(), kind)) {
            for tx in subscribers {
                let _ = tx.try_send(StoreEvent::WatchBreak);
            }
        }
    }

    /// Number of subscriptions whose receiver is still alive.
    pub async fn active_subscriptions(&self) -> usize {
        let state = self.state.read().await;
        state
            .subscribers
            .values()
            .flatten()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    pub async fn save_count(&self, kind: Kind) -> usize {
        self.state.read().await.saves.get(&kind).copied().unwrap_or(0)
    }

    pub async fn delete_count(&self, kind: Kind) -> usize {
        self.state
            .read()
            .await
            .deletes
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    pub async fn collector_config(
        &self,
        cluster_id: &str,
        namespace: &str,
        metric_name: &str,
    ) -> Option<CollectorConfig> {
        let bytes = self
            .lookup(cluster_id, Kind::CollectorConfig, namespace, metric_name)
            .await?;
        CollectorConfig::decode(&bytes).ok()
    }

    pub async fn has_record(&self, cluster_id: &str, kind: Kind, namespace: &str, name: &str) -> bool {
        self.lookup(cluster_id, kind, namespace, name).await.is_some()
    }

    async fn lookup(&self, cluster_id: &str, kind: Kind, namespace: &str, name: &str) -> Option<Bytes> {
        let state = self.state.read().await;
        state
            .records
            .get(&(cluster_id.to_string(), kind))?
            .values()
            .find(|r| r.namespace == namespace && r.name == name)
            .map(|r| r.value.clone())
    }
}

#[async_trait]
impl MetricStore for MockMetricStore {
    async fn list_clusters(&self) -> SyncResult<Vec<String>> {
        self.check()?;
        let state = self.state.read().await;
        let mut clusters: Vec<String> = state
            .records
            .iter()
            .filter(|((_, kind), records)| *kind == Kind::Metric && !records.is_empty())
            .map(|((cluster, _), _)| cluster.clone())
            .collect();
        clusters.sort();
        Ok(clusters)
    }

    async fn query(
        &self,
        cluster_id: &str,
        kind: Kind,
        filter: &QueryFilter,
    ) -> SyncResult<Vec<StoreRecord>> {
        self.check()?;
        let state = self.state.read().await;
        let Some(records) = state.records.get(&(cluster_id.to_string(), kind)) else {
            return Ok(Vec::new());
        };
        Ok(records
            .iter()
            .filter(|(_, r)| {
                filter.namespace.as_ref().is_none_or(|ns| *ns == r.namespace)
                    && filter.name.as_ref().is_none_or(|n| *n == r.name)
            })
            .map(|(id, r)| StoreRecord::new(id.clone(), r.value.clone()))
            .collect())
    }

    async fn subscribe(
        &self,
        cluster_id: &str,
        kind: Kind,
    ) -> SyncResult<mpsc::Receiver<StoreEvent>> {
        self.check()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.state
            .write()
            .await
            .subscribers
            .entry((cluster_id.to_string(), kind))
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn get(
        &self,
        cluster_id: &str,
        kind: Kind,
        namespace: &str,
        name: &str,
    ) -> SyncResult<Option<Bytes>> {
        self.check()?;
        Ok(self.lookup(cluster_id, kind, namespace, name).await)
    }

    async fn save(
        &self,
        cluster_id: &str,
        kind: Kind,
        namespace: &str,
        name: &str,
        data: Bytes,
    ) -> SyncResult<()> {
        self.check()?;
        let id = {
            let mut state = self.state.write().await;
            *state.saves.entry(kind).or_default() += 1;
            state
                .records
                .get(&(cluster_id.to_string(), kind))
                .and_then(|records| {
                    records
                        .iter()
                        .find(|(_, r)| r.namespace == namespace && r.name == name)
                        .map(|(id, _)| id.clone())
                })
                .unwrap_or_else(|| format!("{}/{}", namespace, name))
        };
        self.put(cluster_id, kind, &id, namespace, name, data).await;
        Ok(())
    }

    async fn delete(
        &self,
        cluster_id: &str,
        kind: Kind,
        namespace: &str,
        name: &str,
    ) -> SyncResult<()> {
        self.check()?;
        let id = {
            let mut state = self.state.write().await;
            *state.deletes.entry(kind).or_default() += 1;
            state
                .records
                .get(&(cluster_id.to_string(), kind))
                .and_then(|records| {
                    records
                        .iter()
                        .find(|(_, r)| r.namespace == namespace && r.name == name)
                        .map(|(id, _)| id.clone())
                })
        };
        if let Some(id) = id {
            self.remove(cluster_id, kind, &id).await;
        }
        Ok(())
    }
}

// =============================================================================
// MockCoordinationStore
// =============================================================================

#[derive(Default)]
struct TreeState {
    nodes: BTreeMap<String, Bytes>,
    watches: HashMap<String, Vec<oneshot::Sender<()>>>,
    failing: HashSet<String>,
}

impl TreeState {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|node| parent_of(node) == path)
            .filter_map(|node| node.rsplit('/').next().map(String::from))
            .collect()
    }

    fn fire(&mut self, path: &str) {
        if let Some(watchers) = self.watches.remove(path) {
            for tx in watchers {
                let _ = tx.send(());
            }
        }
    }

    fn check(&self, path: &str) -> SyncResult<()> {
        if self.failing.contains(path) {
            return Err(SyncError::Coordination(format!("mock failure at {}", path)));
        }
        if !self.exists(path) {
            return Err(SyncError::NoNode(path.to_string()));
        }
        Ok(())
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

/// In-memory [`CoordinationStore`].
#[derive(Default)]
pub struct MockCoordinationStore {
    state: RwLock<TreeState>,
    watch_calls: AtomicUsize,
}

impl MockCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `path` (and any missing ancestors) with `data`.
    pub async fn create(&self, path: &str, data: impl Into<Bytes>) {
        let mut state = self.state.write().await;
        let mut created = Vec::new();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if !state.nodes.contains_key(&current) {
                state.nodes.insert(current.clone(), Bytes::new());
                created.push(current.clone());
            }
        }
        state.nodes.insert(path.to_string(), data.into());
        for node in created {
            state.fire(parent_of(&node));
        }
    }

    /// Remove `path` and everything below it.
    pub async fn remove(&self, path: &str) {
        let mut state = self.state.write().await;
        let prefix = format!("{}/", path);
        let removed: Vec<String> = state
            .nodes
            .keys()
            .filter(|node| *node == path || node.starts_with(&prefix))
            .cloned()
            .collect();
        for node in &removed {
            state.nodes.remove(node);
        }
        for node in &removed {
            state.fire(node);
            state.fire(parent_of(node));
        }
    }

    /// Number of `watch_children` calls so far.
    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Make every call on exactly `path` fail with a coordination error.
    pub async fn set_failing(&self, path: &str, failing: bool) {
        let mut state = self.state.write().await;
        if failing {
            state.failing.insert(path.to_string());
        } else {
            state.failing.remove(path);
        }
    }
}

#[async_trait]
impl CoordinationStore for MockCoordinationStore {
    async fn get_children(&self, path: &str) -> SyncResult<Vec<String>> {
        let state = self.state.read().await;
        state.check(path)?;
        Ok(state.children(path))
    }

    async fn watch_children(&self, path: &str) -> SyncResult<(Vec<String>, oneshot::Receiver<()>)> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        state.check(path)?;
        let (tx, rx) = oneshot::channel();
        let watchers = state.watches.entry(path.to_string()).or_default();
        watchers.retain(|w| !w.is_closed());
        watchers.push(tx);
        Ok((state.children(path), rx))
    }

    async fn get(&self, path: &str) -> SyncResult<Bytes> {
        let state = self.state.read().await;
        state.check(path)?;
        Ok(state.nodes.get(path).cloned().unwrap_or_default())
    }
}

// =============================================================================
// MockApplicationApi
// =============================================================================

type AppKey = (String, String, String);

/// In-memory [`ApplicationApi`].
#[derive(Default)]
pub struct MockApplicationApi {
    applied: RwLock<HashMap<AppKey, ApplicationManifest>>,
    apply_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    failing: AtomicBool,
    apply_delay_ms: AtomicU64,
}

impl MockApplicationApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make `apply` take effect at once but return only after `delay`.
    pub fn set_apply_delay(&self, delay: Duration) {
        self.apply_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Successful and failed `apply` calls.
    pub fn apply_count(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub async fn is_applied(&self, cluster_id: &str, namespace: &str, name: &str) -> bool {
        self.applied.read().await.contains_key(&(
            cluster_id.to_string(),
            namespace.to_string(),
            name.to_string(),
        ))
    }

    pub async fn applied_count(&self) -> usize {
        self.applied.read().await.len()
    }

    fn check(&self) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(SyncError::Api("mock api unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ApplicationApi for MockApplicationApi {
    async fn apply(&self, manifest: &ApplicationManifest) -> SyncResult<()> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.applied.write().await.insert(
            (
                manifest.cluster_id.clone(),
                manifest.namespace.clone(),
                manifest.name.clone(),
            ),
            manifest.clone(),
        );
        let delay = self.apply_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }

    async fn remove(&self, cluster_id: &str, namespace: &str, name: &str) -> SyncResult<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.applied.write().await.remove(&(
            cluster_id.to_string(),
            namespace.to_string(),
            name.to_string(),
        ));
        Ok(())
    }
}
