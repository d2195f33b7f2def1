//! Per-cluster reconciliation.
//!
//! A [`ClusterWatcher`] keeps two views of one cluster in memory and turns
//! every difference into [`MetricEvent`]s:
//!
//! - the known-metric map (storage ID → last observed [`Metric`])
//! - the placement snapshot (workloads, or coordination-tree endpoints for
//!   the components pseudo-cluster) plus per-metric target overrides
//!
//! Each data kind is fed by two loops. The full-sync loop runs once at start
//! and then every `full_sync_interval`, diffing a storage snapshot against
//! memory; it is the source of truth for existence. The push-watch loop
//! applies subscription events as they arrive and, when the subscription
//! breaks, waits `watch_reconnect_delay`, re-subscribes and triggers an
//! immediate full sync of that kind.
//!
//! First and Last flags:
//!
//! - First: one storage read of the namespace's collector application
//!   record before emitting an update. A namespace that got a First event
//!   within the last sync interval is not reported First again until its
//!   record shows up.
//! - Last: computed on delete from the known-metric map alone, atomically
//!   with the removal.
//!
//! Locks are never held across a collaborator call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::{Notify, RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::constants::TREE_EVENT_QUEUE_CAPACITY;
use crate::driver::{ClusterDriver, DriverRegistry, Placement};
use crate::error::SyncError;
use crate::health::HealthState;
use crate::metrics::{
    record_collaborator_error, record_dropped_event, record_event, record_full_sync,
    record_watch_break, set_tracked_endpoints,
};
use crate::task_group::TaskGroup;
use crate::traits::{CoordinationStore, MetricStore};
use crate::tree_watcher::{PathTemplate, TreeWatcher};
use crate::types::{
    CollectorConfig, EndpointChange, EndpointEvent, EventType, IpMetaMap, Kind, Metric,
    MetricEvent, MetricTask, ObjectMeta, QueryFilter, StoreEvent, Workload, WatcherState,
};

/// Collaborators and settings shared by every cluster watcher.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn MetricStore>,
    pub coordination: Arc<dyn CoordinationStore>,
    pub drivers: DriverRegistry,
    pub config: Arc<SyncConfig>,
    pub health: Arc<HealthState>,
}

/// (namespace, metric name)
type MetricKey = (String, String);

#[derive(Default)]
struct PlacementState {
    workloads: Placement,
    tasks: HashMap<MetricKey, IpMetaMap>,
}

impl PlacementState {
    fn ip_meta(&self, driver: &dyn ClusterDriver, metric: &Metric) -> IpMetaMap {
        let mut ip_meta = driver.ip_meta(metric, &self.workloads);
        if let Some(overrides) = self
            .tasks
            .get(&(metric.namespace.clone(), metric.name.clone()))
        {
            ip_meta.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        ip_meta
    }
}

/// The single scrape target `workload` contributes to `metric`, if any.
fn contribution(
    driver: &dyn ClusterDriver,
    metric: &Metric,
    workload: Option<&Workload>,
) -> Option<(String, ObjectMeta)> {
    let workload = workload.filter(|w| driver.selects(metric, w))?;
    let address = driver.target_address(metric, workload)?;
    Some((address, ObjectMeta::from_workload(workload)))
}

/// Reconciliation state for one cluster.
pub struct ClusterWatcher {
    cluster_id: String,
    ctx: SyncContext,
    events: mpsc::Sender<MetricEvent>,
    known: RwLock<HashMap<String, Metric>>,
    placement: RwLock<PlacementState>,
    /// Namespace → when a First event was emitted for it.
    pending_first: RwLock<HashMap<String, Instant>>,
    state: watch::Sender<WatcherState>,
    reconnecting: AtomicUsize,
    metric_resync: Notify,
    placement_resync: Notify,
}

impl ClusterWatcher {
    pub fn new(
        cluster_id: impl Into<String>,
        ctx: SyncContext,
        events: mpsc::Sender<MetricEvent>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(WatcherState::Stopped);
        Arc::new(Self {
            cluster_id: cluster_id.into(),
            ctx,
            events,
            known: RwLock::new(HashMap::new()),
            placement: RwLock::new(PlacementState::default()),
            pending_first: RwLock::new(HashMap::new()),
            state,
            reconnecting: AtomicUsize::new(0),
            metric_resync: Notify::new(),
            placement_resync: Notify::new(),
        })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Snapshot of the known-metric map, sorted by ID.
    pub async fn known_metrics(&self) -> Vec<Metric> {
        let mut metrics: Vec<Metric> = self.known.read().await.values().cloned().collect();
        metrics.sort_by(|a, b| a.id.cmp(&b.id));
        metrics
    }

    fn is_components(&self) -> bool {
        self.ctx.config.is_components_cluster(&self.cluster_id)
    }

    /// Start every loop under a child of `token`.
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> TaskGroup {
        self.state.send_replace(WatcherState::Starting);
        let mut group = TaskGroup::new(format!("cluster-watcher:{}", self.cluster_id), token);

        group.spawn("metric_sync", self.clone().metric_sync_loop());
        group.spawn("metric_watch", self.clone().metric_watch_loop());
        group.spawn("placement_sync", self.clone().placement_sync_loop());

        if self.is_components() {
            let (tx, rx) = mpsc::channel(TREE_EVENT_QUEUE_CAPACITY);
            let tree = TreeWatcher::new(
                self.ctx.coordination.clone(),
                tx,
                self.ctx.config.tree_retry_delay,
                self.ctx.config.tree_resync_interval,
            );
            for raw in &self.ctx.config.component_paths {
                match PathTemplate::parse(raw) {
                    Ok(template) => {
                        let tree = tree.clone();
                        let tree_token = group.token().clone();
                        group.spawn("tree_watch", async move {
                            tree.run(template, tree_token).await
                        });
                    }
                    Err(e) => {
                        warn!(cluster_id = %self.cluster_id, error = %e, "Skipping component path");
                    }
                }
            }
            group.spawn("endpoint_consumer", self.clone().endpoint_loop(rx));
        } else {
            group.spawn("placement_watch", self.clone().placement_watch_loop());
        }

        info!(
            cluster_id = %self.cluster_id,
            components = self.is_components(),
            "Cluster watcher started"
        );
        group
    }

    /// Final metric pass before the watcher is stopped for a cluster that
    /// left discovery. Deletes for metrics no longer stored are queued with
    /// Last computed. True once nothing is known any more.
    pub async fn drain(&self) -> bool {
        self.full_sync_metrics().await;
        self.known.read().await.is_empty()
    }

    /// Record that the watcher's tasks have stopped.
    pub fn mark_stopped(&self) {
        self.state.send_replace(WatcherState::Stopped);
    }

    // =========================================================================
    // Loops
    // =========================================================================

    async fn metric_sync_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.ctx.config.full_sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.metric_resync.notified() => {}
            }
            self.full_sync_metrics().await;
            self.state.send_if_modified(|state| {
                if *state == WatcherState::Starting {
                    *state = WatcherState::Running;
                    true
                } else {
                    false
                }
            });
        }
    }

    async fn placement_sync_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.ctx.config.full_sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.placement_resync.notified() => {}
            }
            self.full_sync_placement().await;
        }
    }

    async fn metric_watch_loop(self: Arc<Self>) {
        self.watch_loop(Kind::Metric).await
    }

    async fn placement_watch_loop(self: Arc<Self>) {
        self.watch_loop(Kind::Dynamic).await
    }

    async fn watch_loop(&self, kind: Kind) {
        let mut waiting = false;
        loop {
            match self.ctx.store.subscribe(&self.cluster_id, kind).await {
                Ok(mut stream) => {
                    self.storage_ok();
                    if waiting {
                        waiting = false;
                        self.leave_reconnect_wait();
                        info!(cluster_id = %self.cluster_id, kind = %kind, "Watch re-subscribed, resyncing");
                        self.resync_notify(kind).notify_one();
                    }
                    while let Some(event) = stream.recv().await {
                        match event {
                            StoreEvent::WatchBreak => break,
                            event => self.on_store_event(kind, event).await,
                        }
                    }
                    record_watch_break(&self.cluster_id, kind.as_str());
                    warn!(
                        cluster_id = %self.cluster_id,
                        kind = %kind,
                        delay_ms = self.ctx.config.watch_reconnect_delay.as_millis() as u64,
                        "Watch broken, reconnecting after delay"
                    );
                }
                Err(e) => {
                    self.storage_failed("subscribe", &e);
                }
            }
            if !waiting {
                waiting = true;
                self.enter_reconnect_wait();
            }
            tokio::time::sleep(self.ctx.config.watch_reconnect_delay).await;
        }
    }

    async fn endpoint_loop(self: Arc<Self>, mut endpoints: mpsc::Receiver<EndpointEvent>) {
        while let Some(event) = endpoints.recv().await {
            debug!(
                cluster_id = %self.cluster_id,
                node = %event.node_path,
                change = ?event.change,
                "Endpoint change"
            );
            let workload = match event.change {
                EndpointChange::Up => Some(Workload::from_endpoint(&event.node_path, &event.endpoint)),
                EndpointChange::Down => None,
            };
            self.apply_placement_change(&event.node_path, workload).await;
            let count = self.placement.read().await.workloads.len();
            set_tracked_endpoints(&self.cluster_id, count);
        }
    }

    fn resync_notify(&self, kind: Kind) -> &Notify {
        match kind {
            Kind::Metric => &self.metric_resync,
            _ => &self.placement_resync,
        }
    }

    fn enter_reconnect_wait(&self) {
        if self.reconnecting.fetch_add(1, Ordering::SeqCst) == 0 {
            self.state.send_replace(WatcherState::ReconnectWait);
        }
    }

    fn leave_reconnect_wait(&self) {
        if self.reconnecting.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.send_replace(WatcherState::Running);
        }
    }

    // =========================================================================
    // Push events
    // =========================================================================

    async fn on_store_event(&self, kind: Kind, event: StoreEvent) {
        match (kind, event) {
            (Kind::Metric, StoreEvent::Add(record) | StoreEvent::Change(record)) => {
                let metric = match Metric::decode(&record) {
                    Ok(metric) => metric,
                    Err(e) => {
                        warn!(cluster_id = %self.cluster_id, id = %record.id, error = %e, "Skipping undecodable metric");
                        return;
                    }
                };
                let unchanged = self.known.read().await.get(&metric.id) == Some(&metric);
                if unchanged {
                    debug!(cluster_id = %self.cluster_id, id = %metric.id, "Duplicate metric event ignored");
                    return;
                }
                self.emit_update(metric).await;
            }
            (Kind::Metric, StoreEvent::Delete(record)) => {
                if let Some((metric, last)) = self.forget_metric(&record.id).await {
                    self.emit_delete(metric, last).await;
                }
            }
            (Kind::Dynamic, StoreEvent::Add(record) | StoreEvent::Change(record)) => {
                match Workload::decode(&record) {
                    Ok(workload) => {
                        self.apply_placement_change(&record.id, Some(workload))
                            .await
                    }
                    Err(e) => {
                        warn!(cluster_id = %self.cluster_id, id = %record.id, error = %e, "Skipping undecodable workload");
                    }
                }
            }
            (Kind::Dynamic, StoreEvent::Delete(record)) => {
                self.apply_placement_change(&record.id, None).await;
            }
            (kind, event) => {
                debug!(cluster_id = %self.cluster_id, kind = %kind, ?event, "Ignoring store event");
            }
        }
    }

    // =========================================================================
    // Full sync
    // =========================================================================

    async fn full_sync_metrics(&self) {
        let started = Instant::now();
        // Push events applied while the queries run are newer than the
        // snapshot. Only entries untouched since this copy are diffed.
        let before: HashMap<String, Metric> = self.known.read().await.clone();
        let records = match self
            .ctx
            .store
            .query(&self.cluster_id, Kind::Metric, &QueryFilter::all())
            .await
        {
            Ok(records) => {
                self.storage_ok();
                records
            }
            Err(e) => {
                self.storage_failed("metric full sync", &e);
                return;
            }
        };

        let mut snapshot: HashMap<String, Metric> = HashMap::with_capacity(records.len());
        for record in &records {
            match Metric::decode(record) {
                Ok(metric) => {
                    snapshot.insert(metric.id.clone(), metric);
                }
                Err(e) => {
                    warn!(cluster_id = %self.cluster_id, id = %record.id, error = %e, "Skipping undecodable metric");
                }
            }
        }
        let stored = self.stored_configs().await;

        for (id, seen) in before.iter().filter(|(id, _)| !snapshot.contains_key(*id)) {
            if let Some((metric, last)) = self.forget_unchanged(seen).await {
                info!(cluster_id = %self.cluster_id, id = %id, "Metric gone from storage");
                self.emit_delete(metric, last).await;
            }
        }

        let mut metrics: Vec<Metric> = snapshot.into_values().collect();
        metrics.sort_by(|a, b| a.id.cmp(&b.id));
        let mut updated_namespaces = HashSet::new();
        for metric in metrics {
            let current = self.known.read().await.get(&metric.id).cloned();
            if current.as_ref() != before.get(&metric.id) {
                debug!(cluster_id = %self.cluster_id, id = %metric.id, "Metric changed during sync, skipping");
                continue;
            }
            let unchanged = current.as_ref() == Some(&metric);
            // Any version difference against the last saved config means the
            // config is dirty.
            let stale = stored.as_ref().is_some_and(|configs| {
                configs
                    .get(&(metric.namespace.clone(), metric.name.clone()))
                    .is_none_or(|config| config.version != metric.version)
            });
            if !unchanged || stale {
                updated_namespaces.insert(metric.namespace.clone());
                self.emit_update(metric).await;
            }
        }

        self.heal_applications(&updated_namespaces).await;
        record_full_sync(Kind::Metric.as_str(), started.elapsed().as_secs_f64());
    }

    /// Re-emit First for namespaces whose application record has vanished.
    async fn heal_applications(&self, skip: &HashSet<String>) {
        let mut by_namespace: HashMap<String, Metric> = HashMap::new();
        for metric in self.known.read().await.values() {
            if skip.contains(&metric.namespace) {
                continue;
            }
            let entry = by_namespace
                .entry(metric.namespace.clone())
                .or_insert_with(|| metric.clone());
            if metric.id < entry.id {
                *entry = metric.clone();
            }
        }

        for (namespace, metric) in by_namespace {
            if self.is_pending_first(&namespace).await {
                continue;
            }
            match self
                .ctx
                .store
                .get(
                    &self.cluster_id,
                    Kind::CollectorApp,
                    &namespace,
                    &self.ctx.config.collector_app_name,
                )
                .await
            {
                Ok(Some(_)) => {}
                Ok(None) => {
                    info!(
                        cluster_id = %self.cluster_id,
                        namespace = %namespace,
                        "Collector application record missing, re-emitting"
                    );
                    self.emit_update(metric).await;
                }
                Err(e) => self.storage_failed("application check", &e),
            }
        }
    }

    async fn full_sync_placement(&self) {
        let started = Instant::now();

        if !self.is_components() {
            match self
                .ctx
                .store
                .query(&self.cluster_id, Kind::Dynamic, &QueryFilter::all())
                .await
            {
                Ok(records) => {
                    self.storage_ok();
                    let workloads: Placement = records
                        .iter()
                        .filter_map(|record| match Workload::decode(record) {
                            Ok(workload) => Some((workload.id.clone(), workload)),
                            Err(e) => {
                                warn!(cluster_id = %self.cluster_id, id = %record.id, error = %e, "Skipping undecodable workload");
                                None
                            }
                        })
                        .collect();
                    self.placement.write().await.workloads = workloads;
                }
                Err(e) => {
                    self.storage_failed("placement full sync", &e);
                    return;
                }
            }
        }

        match self
            .ctx
            .store
            .query(&self.cluster_id, Kind::MetricTask, &QueryFilter::all())
            .await
        {
            Ok(records) => {
                let tasks: HashMap<MetricKey, IpMetaMap> = records
                    .iter()
                    .filter_map(|record| match MetricTask::decode(record) {
                        Ok(task) => Some(((task.namespace, task.metric_name), task.targets)),
                        Err(e) => {
                            warn!(cluster_id = %self.cluster_id, id = %record.id, error = %e, "Skipping undecodable metric task");
                            None
                        }
                    })
                    .collect();
                self.placement.write().await.tasks = tasks;
            }
            // Keep the previous overrides.
            Err(e) => self.storage_failed("metric task sync", &e),
        }

        self.reconcile_targets().await;
        record_full_sync(Kind::Dynamic.as_str(), started.elapsed().as_secs_f64());
    }

    /// Emit DynamicUpdate for every known metric whose targets differ from
    /// its stored collector config.
    async fn reconcile_targets(&self) {
        let Some(stored) = self.stored_configs().await else {
            return;
        };
        let metrics: Vec<Metric> = self.known.read().await.values().cloned().collect();

        let mut drifted = Vec::new();
        {
            let placement = self.placement.read().await;
            for metric in metrics {
                let Ok(driver) = self.ctx.drivers.get(metric.cluster_type) else {
                    continue;
                };
                let ip_meta = placement.ip_meta(driver.as_ref(), &metric);
                let expected = CollectorConfig::from_metric(
                    &metric,
                    &ip_meta,
                    &self.ctx.config.default_metrics_path,
                );
                let in_sync = stored
                    .get(&(metric.namespace.clone(), metric.name.clone()))
                    .is_some_and(|config| config.targets == expected.targets);
                if !in_sync {
                    drifted.push((metric, ip_meta));
                }
            }
        }

        for (metric, ip_meta) in drifted {
            debug!(cluster_id = %self.cluster_id, key = %metric.routing_key(), "Targets drifted");
            self.emit_dynamic(metric, ip_meta).await;
        }
    }

    async fn stored_configs(&self) -> Option<HashMap<MetricKey, CollectorConfig>> {
        match self
            .ctx
            .store
            .query(&self.cluster_id, Kind::CollectorConfig, &QueryFilter::all())
            .await
        {
            Ok(records) => Some(
                records
                    .iter()
                    .filter_map(|record| CollectorConfig::decode(&record.value).ok())
                    .map(|config| ((config.namespace.clone(), config.metric_name.clone()), config))
                    .collect(),
            ),
            Err(e) => {
                self.storage_failed("collector config query", &e);
                None
            }
        }
    }

    // =========================================================================
    // Placement changes
    // =========================================================================

    /// Apply one workload change and emit DynamicUpdate for every metric
    /// whose targets it changes.
    async fn apply_placement_change(&self, id: &str, new: Option<Workload>) {
        let metrics: Vec<Metric> = self.known.read().await.values().cloned().collect();
        let mut changed = Vec::new();
        {
            let mut placement = self.placement.write().await;
            let old = match &new {
                Some(workload) => placement.workloads.insert(id.to_string(), workload.clone()),
                None => placement.workloads.remove(id),
            };
            if old == new {
                return;
            }

            for metric in metrics {
                let Ok(driver) = self.ctx.drivers.get(metric.cluster_type) else {
                    continue;
                };
                let before = contribution(driver.as_ref(), &metric, old.as_ref());
                let after = contribution(driver.as_ref(), &metric, new.as_ref());
                if before != after {
                    let ip_meta = placement.ip_meta(driver.as_ref(), &metric);
                    changed.push((metric, ip_meta));
                }
            }
        }

        for (metric, ip_meta) in changed {
            self.emit_dynamic(metric, ip_meta).await;
        }
    }

    // =========================================================================
    // Event production
    // =========================================================================

    /// Record `metric` as known and emit MetricUpdate.
    async fn emit_update(&self, metric: Metric) {
        let previous = self.known.read().await.get(&metric.id).cloned();
        if let Some(previous) = previous {
            if previous.namespace != metric.namespace || previous.name != metric.name {
                if let Some((old, last)) = self.forget_metric(&previous.id).await {
                    self.emit_delete(old, last).await;
                }
            }
        }

        let driver = match self.ctx.drivers.get(metric.cluster_type) {
            Ok(driver) => driver,
            Err(e) => {
                warn!(cluster_id = %self.cluster_id, id = %metric.id, error = %e, "Dropping metric event");
                record_dropped_event("unknown_cluster_type");
                self.known.write().await.insert(metric.id.clone(), metric);
                return;
            }
        };

        let first = match self.compute_first(&metric).await {
            Ok(first) => first,
            Err(e) => {
                // Not recorded as known, so the next full sync retries it.
                self.storage_failed("first check", &e);
                record_dropped_event("first_check_failed");
                return;
            }
        };
        let ip_meta = self.placement.read().await.ip_meta(driver.as_ref(), &metric);
        self.known
            .write()
            .await
            .insert(metric.id.clone(), metric.clone());

        self.send(MetricEvent {
            id: metric.id.clone(),
            event_type: EventType::MetricUpdate,
            metric,
            first,
            last: false,
            ip_meta,
        })
        .await;
    }

    async fn emit_dynamic(&self, metric: Metric, ip_meta: IpMetaMap) {
        if !self.known.read().await.contains_key(&metric.id) {
            return;
        }
        let first = match self.compute_first(&metric).await {
            Ok(first) => first,
            Err(e) => {
                self.storage_failed("first check", &e);
                record_dropped_event("first_check_failed");
                return;
            }
        };
        self.send(MetricEvent {
            id: metric.id.clone(),
            event_type: EventType::DynamicUpdate,
            metric,
            first,
            last: false,
            ip_meta,
        })
        .await;
    }

    async fn emit_delete(&self, metric: Metric, last: bool) {
        if let Err(e) = self.ctx.drivers.get(metric.cluster_type) {
            warn!(cluster_id = %self.cluster_id, id = %metric.id, error = %e, "Dropping metric event");
            record_dropped_event("unknown_cluster_type");
            return;
        }
        if last {
            self.pending_first.write().await.remove(&metric.namespace);
        }
        self.send(MetricEvent {
            id: metric.id.clone(),
            event_type: EventType::MetricDelete,
            metric,
            first: false,
            last,
            ip_meta: IpMetaMap::new(),
        })
        .await;
    }

    /// Remove a metric and report whether it was the namespace's last one.
    async fn forget_metric(&self, id: &str) -> Option<(Metric, bool)> {
        let mut known = self.known.write().await;
        let metric = known.remove(id)?;
        let last = !known.values().any(|m| m.namespace == metric.namespace);
        Some((metric, last))
    }

    /// Like [`Self::forget_metric`], but only while the known entry still
    /// equals `seen`.
    async fn forget_unchanged(&self, seen: &Metric) -> Option<(Metric, bool)> {
        let mut known = self.known.write().await;
        if known.get(&seen.id) != Some(seen) {
            return None;
        }
        let metric = known.remove(&seen.id)?;
        let last = !known.values().any(|m| m.namespace == metric.namespace);
        Some((metric, last))
    }

    /// The namespace is reserved before the record is read, so concurrent
    /// loops cannot both report First for it.
    async fn compute_first(&self, metric: &Metric) -> Result<bool, SyncError> {
        {
            let mut pending = self.pending_first.write().await;
            let window = self.ctx.config.full_sync_interval;
            pending.retain(|_, emitted| emitted.elapsed() < window);
            if pending.contains_key(&metric.namespace) {
                return Ok(false);
            }
            pending.insert(metric.namespace.clone(), Instant::now());
        }

        let record = self
            .ctx
            .store
            .get(
                &self.cluster_id,
                Kind::CollectorApp,
                &metric.namespace,
                &self.ctx.config.collector_app_name,
            )
            .await;
        match record {
            Ok(None) => {
                self.storage_ok();
                Ok(true)
            }
            Ok(Some(_)) => {
                self.storage_ok();
                self.pending_first.write().await.remove(&metric.namespace);
                Ok(false)
            }
            Err(e) => {
                self.pending_first.write().await.remove(&metric.namespace);
                Err(e)
            }
        }
    }

    async fn is_pending_first(&self, namespace: &str) -> bool {
        let mut pending = self.pending_first.write().await;
        let window = self.ctx.config.full_sync_interval;
        pending.retain(|_, emitted| emitted.elapsed() < window);
        pending.contains_key(namespace)
    }

    async fn send(&self, event: MetricEvent) {
        record_event(&self.cluster_id, event.event_type.as_str());
        debug!(
            cluster_id = %self.cluster_id,
            key = %event.routing_key(),
            event_type = event.event_type.as_str(),
            first = event.first,
            last = event.last,
            "Emitting metric event"
        );
        if self.events.send(event).await.is_err() {
            debug!(cluster_id = %self.cluster_id, "Event queue closed");
        }
    }

    fn storage_ok(&self) {
        if self.ctx.health.record_storage(true) {
            info!("Storage reachable again");
        }
    }

    fn storage_failed(&self, operation: &str, error: &SyncError) {
        record_collaborator_error("storage");
        if error.is_transient() && self.ctx.health.record_storage(false) {
            warn!("Storage marked unreachable");
        }
        warn!(cluster_id = %self.cluster_id, operation, error = %error, "Storage call failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockApplicationApi, MockCoordinationStore, MockMetricStore};
    use crate::types::{ClusterType, PortMapping, Selector};
    use crate::error::SyncResult;
    use crate::types::StoreRecord;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use std::sync::{Mutex, OnceLock, Weak};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        store: Arc<MockMetricStore>,
        coordination: Arc<MockCoordinationStore>,
        ctx: SyncContext,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let store = Arc::new(MockMetricStore::new());
        let coordination = Arc::new(MockCoordinationStore::new());
        let api = Arc::new(MockApplicationApi::new());
        let ctx = SyncContext {
            store: store.clone(),
            coordination: coordination.clone(),
            drivers: DriverRegistry::with_defaults(api),
            config: Arc::new(config),
            health: Arc::new(HealthState::new()),
        };
        Fixture {
            store,
            coordination,
            ctx,
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            full_sync_interval: Duration::from_millis(200),
            watch_reconnect_delay: Duration::from_millis(50),
            tree_retry_delay: Duration::from_millis(50),
            tree_resync_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn metric(id: &str, namespace: &str, name: &str) -> Metric {
        Metric {
            id: id.into(),
            cluster_id: "c1".into(),
            cluster_type: ClusterType::Kubernetes,
            namespace: namespace.into(),
            name: name.into(),
            version: "1".into(),
            selector: Selector::from_labels([("app", name)]),
            port: Some(9100),
            path: None,
            method: None,
            scheme: None,
            tls_insecure: false,
            interval_secs: None,
            host_network: false,
        }
    }

    fn pod(id: &str, namespace: &str, app: &str, ip: &str) -> Workload {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), app.to_string());
        Workload {
            id: id.into(),
            name: id.into(),
            namespace: namespace.into(),
            kind: "pod".into(),
            labels,
            ip: ip.into(),
            host_ip: "192.168.0.1".into(),
            ports: vec![PortMapping {
                container_port: 9100,
                host_port: None,
                name: None,
            }],
            scheme: None,
            path: None,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<MetricEvent>) -> MetricEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for metric event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_first_and_last_flags() {
        let f = fixture(fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        let watcher = ClusterWatcher::new("c1", f.ctx.clone(), tx);

        let m1 = metric("m1", "payments", "latency");
        let m2 = metric("m2", "payments", "errors");
        watcher.emit_update(m1.clone()).await;
        watcher.emit_update(m2.clone()).await;

        let e1 = next(&mut rx).await;
        assert!(e1.first);
        // Suppressed while the first create is in flight.
        let e2 = next(&mut rx).await;
        assert!(!e2.first);

        let (gone, last) = watcher.forget_metric("m1").await.unwrap();
        assert_eq!(gone.id, "m1");
        assert!(!last);
        let (_, last) = watcher.forget_metric("m2").await.unwrap();
        assert!(last);
    }

    #[tokio::test]
    async fn test_first_false_when_record_exists() {
        let f = fixture(fast_config());
        f.store
            .save(
                "c1",
                Kind::CollectorApp,
                "payments",
                &f.ctx.config.collector_app_name,
                Bytes::from("{}"),
            )
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let watcher = ClusterWatcher::new("c1", f.ctx.clone(), tx);

        watcher.emit_update(metric("m1", "payments", "latency")).await;
        assert!(!next(&mut rx).await.first);
    }

    #[tokio::test]
    async fn test_failed_first_check_skips_event_and_known() {
        let f = fixture(fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        let watcher = ClusterWatcher::new("c1", f.ctx.clone(), tx);

        f.store.set_failing(true);
        watcher.emit_update(metric("m1", "payments", "latency")).await;
        assert!(rx.try_recv().is_err());
        assert!(watcher.known_metrics().await.is_empty());
        assert!(!f.ctx.health.storage_reachable());
    }

    #[tokio::test]
    async fn test_unknown_cluster_type_is_known_but_dropped() {
        let f = fixture(fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        let watcher = ClusterWatcher::new("c1", f.ctx.clone(), tx);

        let mut m = metric("m1", "payments", "latency");
        m.cluster_type = ClusterType::Unknown;
        watcher.emit_update(m).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(watcher.known_metrics().await.len(), 1);
    }

    #[tokio::test]
    async fn test_placement_change_emits_dynamic_update_for_matching_metric() {
        let f = fixture(fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        let watcher = ClusterWatcher::new("c1", f.ctx.clone(), tx);

        watcher.emit_update(metric("m1", "payments", "api")).await;
        watcher.emit_update(metric("m2", "payments", "worker")).await;
        next(&mut rx).await;
        next(&mut rx).await;

        watcher
            .apply_placement_change("p1", Some(pod("p1", "payments", "api", "10.0.0.1")))
            .await;
        let event = next(&mut rx).await;
        assert_eq!(event.event_type, EventType::DynamicUpdate);
        assert_eq!(event.metric.id, "m1");
        assert!(event.ip_meta.contains_key("10.0.0.1:9100"));
        assert!(rx.try_recv().is_err());

        // Same workload again changes nothing.
        watcher
            .apply_placement_change("p1", Some(pod("p1", "payments", "api", "10.0.0.1")))
            .await;
        assert!(rx.try_recv().is_err());

        watcher.apply_placement_change("p1", None).await;
        let event = next(&mut rx).await;
        assert_eq!(event.metric.id, "m1");
        assert!(event.ip_meta.is_empty());
    }

    #[tokio::test]
    async fn test_metric_task_overrides_are_merged() {
        let f = fixture(fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        let watcher = ClusterWatcher::new("c1", f.ctx.clone(), tx);

        let mut targets = IpMetaMap::new();
        targets.insert(
            "172.16.0.9:9999".into(),
            ObjectMeta {
                name: "external".into(),
                ..Default::default()
            },
        );
        f.store
            .put_metric_task(
                "c1",
                &MetricTask {
                    namespace: "payments".into(),
                    metric_name: "api".into(),
                    targets,
                },
            )
            .await;

        watcher.full_sync_placement().await;
        watcher.emit_update(metric("m1", "payments", "api")).await;
        let event = next(&mut rx).await;
        assert!(event.ip_meta.contains_key("172.16.0.9:9999"));
    }

    #[tokio::test]
    async fn test_full_sync_detects_target_drift() {
        let f = fixture(fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        let watcher = ClusterWatcher::new("c1", f.ctx.clone(), tx);

        let m = metric("m1", "payments", "api");
        watcher.emit_update(m.clone()).await;
        next(&mut rx).await;

        // Stored config has no targets; a pod appears only in storage.
        let config = CollectorConfig::from_metric(&m, &IpMetaMap::new(), "/metrics");
        f.store
            .save("c1", Kind::CollectorConfig, "payments", "api", config.encode().unwrap())
            .await
            .unwrap();
        f.store
            .put_workload("c1", &pod("p1", "payments", "api", "10.0.0.1"))
            .await;

        watcher.full_sync_placement().await;
        let event = next(&mut rx).await;
        assert_eq!(event.event_type, EventType::DynamicUpdate);
        assert_eq!(event.ip_meta.len(), 1);

        // Once the stored config matches, nothing more is emitted.
        let config = CollectorConfig::from_metric(&m, &event.ip_meta, "/metrics");
        f.store
            .save("c1", Kind::CollectorConfig, "payments", "api", config.encode().unwrap())
            .await
            .unwrap();
        watcher.full_sync_placement().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_version_tripwire_reemits() {
        let f = fixture(fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        let watcher = ClusterWatcher::new("c1", f.ctx.clone(), tx);

        let mut m = metric("m1", "payments", "api");
        m.version = "2".into();
        f.store.put_metric(&m).await;
        let mut old = CollectorConfig::from_metric(&m, &IpMetaMap::new(), "/metrics");
        old.version = "1".into();
        f.store
            .save("c1", Kind::CollectorConfig, "payments", "api", old.encode().unwrap())
            .await
            .unwrap();

        watcher.full_sync_metrics().await;
        assert_eq!(next(&mut rx).await.metric.version, "2");

        // Known and unchanged, but the stored config is still behind.
        watcher.full_sync_metrics().await;
        assert_eq!(next(&mut rx).await.event_type, EventType::MetricUpdate);
    }

    #[tokio::test]
    async fn test_namespace_move_deletes_old_key() {
        let f = fixture(fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        let watcher = ClusterWatcher::new("c1", f.ctx.clone(), tx);

        watcher.emit_update(metric("m1", "payments", "api")).await;
        next(&mut rx).await;

        watcher.emit_update(metric("m1", "billing", "api")).await;
        let delete = next(&mut rx).await;
        assert_eq!(delete.event_type, EventType::MetricDelete);
        assert_eq!(delete.metric.namespace, "payments");
        assert!(delete.last);
        let update = next(&mut rx).await;
        assert_eq!(update.metric.namespace, "billing");
    }

    enum Late {
        Add(Metric),
        Delete(Metric),
    }

    /// Applies a storage change, and its push event, right after the next
    /// metric snapshot has been read.
    struct MidSyncStore {
        inner: Arc<MockMetricStore>,
        watcher: OnceLock<Weak<ClusterWatcher>>,
        late: Mutex<Option<Late>>,
    }

    impl MidSyncStore {
        fn wrap(f: &Fixture) -> (Arc<Self>, Arc<ClusterWatcher>, mpsc::Receiver<MetricEvent>) {
            let store = Arc::new(Self {
                inner: f.store.clone(),
                watcher: OnceLock::new(),
                late: Mutex::new(None),
            });
            let ctx = SyncContext {
                store: store.clone(),
                ..f.ctx.clone()
            };
            let (tx, rx) = mpsc::channel(16);
            let watcher = ClusterWatcher::new("c1", ctx, tx);
            let _ = store.watcher.set(Arc::downgrade(&watcher));
            (store, watcher, rx)
        }

        fn take_late(&self, kind: Kind) -> Option<Late> {
            if kind == Kind::Metric {
                self.late.lock().unwrap().take()
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl MetricStore for MidSyncStore {
        async fn list_clusters(&self) -> SyncResult<Vec<String>> {
            self.inner.list_clusters().await
        }

        async fn query(
            &self,
            cluster_id: &str,
            kind: Kind,
            filter: &QueryFilter,
        ) -> SyncResult<Vec<StoreRecord>> {
            let records = self.inner.query(cluster_id, kind, filter).await?;
            let event = match self.take_late(kind) {
                Some(Late::Add(metric)) => {
                    self.inner.put_metric(&metric).await;
                    let value = Bytes::from(serde_json::to_vec(&metric).unwrap());
                    Some(StoreEvent::Add(StoreRecord::new(&metric.id, value)))
                }
                Some(Late::Delete(metric)) => {
                    self.inner.remove_metric(&metric).await;
                    Some(StoreEvent::Delete(StoreRecord::new(&metric.id, Bytes::new())))
                }
                None => None,
            };
            if let Some(event) = event {
                let watcher = self.watcher.get().and_then(Weak::upgrade).unwrap();
                watcher.on_store_event(Kind::Metric, event).await;
            }
            Ok(records)
        }

        async fn subscribe(
            &self,
            cluster_id: &str,
            kind: Kind,
        ) -> SyncResult<mpsc::Receiver<StoreEvent>> {
            self.inner.subscribe(cluster_id, kind).await
        }

        async fn get(
            &self,
            cluster_id: &str,
            kind: Kind,
            namespace: &str,
            name: &str,
        ) -> SyncResult<Option<Bytes>> {
            self.inner.get(cluster_id, kind, namespace, name).await
        }

        async fn save(
            &self,
            cluster_id: &str,
            kind: Kind,
            namespace: &str,
            name: &str,
            data: Bytes,
        ) -> SyncResult<()> {
            self.inner.save(cluster_id, kind, namespace, name, data).await
        }

        async fn delete(
            &self,
            cluster_id: &str,
            kind: Kind,
            namespace: &str,
            name: &str,
        ) -> SyncResult<()> {
            self.inner.delete(cluster_id, kind, namespace, name).await
        }
    }

    fn drain(rx: &mut mpsc::Receiver<MetricEvent>) -> Vec<MetricEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_metric_pushed_during_full_sync_is_not_deleted() {
        let f = fixture(fast_config());
        f.store.put_metric(&metric("m1", "payments", "latency")).await;
        let (store, watcher, mut rx) = MidSyncStore::wrap(&f);
        *store.late.lock().unwrap() = Some(Late::Add(metric("m2", "billing", "invoices")));

        watcher.full_sync_metrics().await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2, "{:?}", events);
        assert!(events.iter().all(|e| e.event_type == EventType::MetricUpdate));
        assert_eq!(watcher.known_metrics().await.len(), 2);

        // The next pass sees m2 in storage and still deletes nothing.
        watcher.full_sync_metrics().await;
        for event in drain(&mut rx) {
            assert_ne!(event.event_type, EventType::MetricDelete, "{:?}", event);
        }
        assert_eq!(watcher.known_metrics().await.len(), 2);
    }

    #[tokio::test]
    async fn test_metric_deleted_during_full_sync_is_not_revived() {
        let f = fixture(fast_config());
        let m1 = metric("m1", "payments", "latency");
        f.store.put_metric(&m1).await;
        let (store, watcher, mut rx) = MidSyncStore::wrap(&f);
        watcher.full_sync_metrics().await;
        assert_eq!(drain(&mut rx).len(), 1);

        // The snapshot still holds m1; the push Delete lands before the diff.
        *store.late.lock().unwrap() = Some(Late::Delete(m1));
        watcher.full_sync_metrics().await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1, "{:?}", events);
        assert_eq!(events[0].event_type, EventType::MetricDelete);
        assert!(events[0].last);
        assert!(watcher.known_metrics().await.is_empty());
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let f = fixture(fast_config());
        let (tx, _rx) = mpsc::channel(64);
        let watcher = ClusterWatcher::new("c1", f.ctx.clone(), tx);
        let mut state = watcher.state();
        assert_eq!(*state.borrow(), WatcherState::Stopped);

        let mut tasks = watcher.start(CancellationToken::new());
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == WatcherState::Running))
            .await
            .unwrap()
            .unwrap();

        f.store.break_watches("c1", Kind::Metric).await;
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == WatcherState::ReconnectWait))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == WatcherState::Running))
            .await
            .unwrap()
            .unwrap();

        tasks.shutdown(Duration::from_secs(1)).await;
        watcher.mark_stopped();
        assert_eq!(watcher.current_state(), WatcherState::Stopped);
        assert_eq!(f.store.active_subscriptions().await, 0);
    }

    #[tokio::test]
    async fn test_components_cluster_tracks_tree_endpoints() {
        let config = SyncConfig {
            component_paths: vec!["gateway:/services/*/nodes".into()],
            ..fast_config()
        };
        let f = fixture(config);
        let (tx, mut rx) = mpsc::channel(64);
        let watcher = ClusterWatcher::new("components", f.ctx.clone(), tx);

        let mut m = metric("c-m1", "platform", "gateway");
        m.cluster_id = "components".into();
        m.cluster_type = ClusterType::Components;
        m.selector = Selector::from_labels([("component", "gateway")]);
        f.store.put_metric(&m).await;

        let mut tasks = watcher.start(CancellationToken::new());
        let first = next(&mut rx).await;
        assert_eq!(first.event_type, EventType::MetricUpdate);

        f.coordination
            .create(
                "/services/edge/nodes/n1",
                Bytes::from(r#"{"ip":"10.9.0.1","port":8443,"scheme":"https"}"#),
            )
            .await;

        let event = loop {
            let event = next(&mut rx).await;
            if event.event_type == EventType::DynamicUpdate && !event.ip_meta.is_empty() {
                break event;
            }
        };
        let meta = event.ip_meta.get("10.9.0.1:8443").unwrap();
        assert_eq!(meta.scheme.as_deref(), Some("https"));

        tasks.shutdown(Duration::from_secs(1)).await;
    }
}
