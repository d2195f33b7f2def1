//! Configuration for the reconciliation engine.
//!
//! ```rust,no_run
//! use fleetwatch::config::SyncConfig;
//!
//! let config = SyncConfig::from_env().expect("invalid configuration");
//! if let Err(errors) = config.validate() {
//!     for e in errors {
//!         eprintln!("config: {}", e);
//!     }
//! }
//! ```

use std::time::Duration;

use crate::constants::{
    DEFAULT_COLLECTOR_APP_NAME, DEFAULT_COLLECTOR_IMAGE_BASE, DEFAULT_COMPONENTS_CLUSTER_ID,
    DEFAULT_DISCOVERY_INTERVAL_SECS, DEFAULT_EVENT_QUEUE_CAPACITY, DEFAULT_FULL_SYNC_INTERVAL_SECS,
    DEFAULT_METRICS_PATH, DEFAULT_PIPELINE_WORKERS, DEFAULT_TREE_RESYNC_INTERVAL_SECS,
    DEFAULT_TREE_RETRY_DELAY_SECS, DEFAULT_WATCH_RECONNECT_DELAY_SECS,
    DEFAULT_WORKER_QUEUE_CAPACITY,
};

/// Engine configuration.
///
/// Cadences are fixed delays. There is deliberately no backoff or jitter
/// setting for the loops.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Period of each cluster watcher's full-sync loops.
    ///
    /// Default: 30 seconds
    pub full_sync_interval: Duration,

    /// Delay before re-subscribing after a push-watch breaks.
    ///
    /// Default: 5 seconds
    pub watch_reconnect_delay: Duration,

    /// Period of cluster discovery in the watcher manager.
    ///
    /// Default: 3 seconds
    pub discovery_interval: Duration,

    /// Delay before retrying a coordination-tree path that does not exist yet.
    ///
    /// Default: 10 seconds
    pub tree_retry_delay: Duration,

    /// Period at which tree levels re-check children without a notification.
    ///
    /// Default: 10 seconds
    pub tree_resync_interval: Duration,

    /// Number of pipeline workers.
    ///
    /// Default: 10
    pub pipeline_workers: usize,

    /// Capacity of each worker's task queue. A full queue blocks submission.
    ///
    /// Default: 64
    pub worker_queue_capacity: usize,

    /// Capacity of the merged event queue fed by all cluster watchers.
    ///
    /// Default: 256
    pub event_queue_capacity: usize,

    /// Cluster ID of the platform components pseudo-cluster.
    ///
    /// Default: "components"
    pub components_cluster_id: String,

    /// Coordination-tree templates watched for the components cluster,
    /// in `name:/path/*/leaf` form.
    ///
    /// Default: empty
    pub component_paths: Vec<String>,

    /// Image repository prefix for collector manifests.
    pub collector_image_base: String,

    /// Name under which a namespace's collector application is recorded.
    pub collector_app_name: String,

    /// Scrape path used when neither the metric nor the endpoint sets one.
    pub default_metrics_path: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            full_sync_interval: Duration::from_secs(DEFAULT_FULL_SYNC_INTERVAL_SECS),
            watch_reconnect_delay: Duration::from_secs(DEFAULT_WATCH_RECONNECT_DELAY_SECS),
            discovery_interval: Duration::from_secs(DEFAULT_DISCOVERY_INTERVAL_SECS),
            tree_retry_delay: Duration::from_secs(DEFAULT_TREE_RETRY_DELAY_SECS),
            tree_resync_interval: Duration::from_secs(DEFAULT_TREE_RESYNC_INTERVAL_SECS),
            pipeline_workers: DEFAULT_PIPELINE_WORKERS,
            worker_queue_capacity: DEFAULT_WORKER_QUEUE_CAPACITY,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            components_cluster_id: DEFAULT_COMPONENTS_CLUSTER_ID.to_string(),
            component_paths: Vec::new(),
            collector_image_base: DEFAULT_COLLECTOR_IMAGE_BASE.to_string(),
            collector_app_name: DEFAULT_COLLECTOR_APP_NAME.to_string(),
            default_metrics_path: DEFAULT_METRICS_PATH.to_string(),
        }
    }
}

impl SyncConfig {
    /// Returns true if `cluster_id` names the components pseudo-cluster.
    pub fn is_components_cluster(&self, cluster_id: &str) -> bool {
        self.components_cluster_id == cluster_id
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.full_sync_interval.is_zero() {
            errors.push("full_sync_interval must be greater than zero".to_string());
        }

        if self.discovery_interval.is_zero() {
            errors.push("discovery_interval must be greater than zero".to_string());
        }

        if self.tree_resync_interval.is_zero() {
            errors.push("tree_resync_interval must be greater than zero".to_string());
        }

        // A reconnect that takes longer than a full sync means the poll loop,
        // not the watch, is doing all the work.
        if self.watch_reconnect_delay >= self.full_sync_interval {
            errors.push(format!(
                "watch_reconnect_delay ({:?}) must be less than full_sync_interval ({:?})",
                self.watch_reconnect_delay, self.full_sync_interval
            ));
        }

        if self.pipeline_workers == 0 {
            errors.push("pipeline_workers must be at least 1".to_string());
        }

        if self.worker_queue_capacity == 0 {
            errors.push("worker_queue_capacity must be at least 1".to_string());
        }

        if self.event_queue_capacity == 0 {
            errors.push("event_queue_capacity must be at least 1".to_string());
        }

        if self.components_cluster_id.is_empty() {
            errors.push("components_cluster_id must not be empty".to_string());
        }

        if self.collector_app_name.is_empty() {
            errors.push("collector_app_name must not be empty".to_string());
        }

        for template in &self.component_paths {
            if let Err(e) = crate::tree_watcher::PathTemplate::parse(template) {
                errors.push(e.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Create a configuration from environment variables.
    ///
    /// - `FLEETWATCH_FULL_SYNC_SECS`: full-sync period (default: 30)
    /// - `FLEETWATCH_WATCH_RECONNECT_SECS`: push-watch reconnect delay (default: 5)
    /// - `FLEETWATCH_DISCOVERY_SECS`: cluster discovery period (default: 3)
    /// - `FLEETWATCH_TREE_RETRY_SECS`: missing tree path retry delay (default: 10)
    /// - `FLEETWATCH_TREE_RESYNC_SECS`: tree child re-check period (default: 10)
    /// - `FLEETWATCH_PIPELINE_WORKERS`: worker count (default: 10)
    /// - `FLEETWATCH_WORKER_QUEUE`: per-worker queue capacity (default: 64)
    /// - `FLEETWATCH_EVENT_QUEUE`: merged event queue capacity (default: 256)
    /// - `FLEETWATCH_COMPONENTS_CLUSTER`: components cluster ID (default: "components")
    /// - `FLEETWATCH_COMPONENT_PATHS`: comma-separated tree templates
    /// - `FLEETWATCH_IMAGE_BASE`: collector image repository prefix
    /// - `FLEETWATCH_APP_NAME`: collector application record name
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Self::default();

        let full_sync_interval = env_secs("FLEETWATCH_FULL_SYNC_SECS")?
            .unwrap_or(defaults.full_sync_interval);
        let watch_reconnect_delay = env_secs("FLEETWATCH_WATCH_RECONNECT_SECS")?
            .unwrap_or(defaults.watch_reconnect_delay);
        let discovery_interval = env_secs("FLEETWATCH_DISCOVERY_SECS")?
            .unwrap_or(defaults.discovery_interval);
        let tree_retry_delay =
            env_secs("FLEETWATCH_TREE_RETRY_SECS")?.unwrap_or(defaults.tree_retry_delay);
        let tree_resync_interval = env_secs("FLEETWATCH_TREE_RESYNC_SECS")?
            .unwrap_or(defaults.tree_resync_interval);

        let pipeline_workers =
            env_usize("FLEETWATCH_PIPELINE_WORKERS")?.unwrap_or(defaults.pipeline_workers);
        let worker_queue_capacity =
            env_usize("FLEETWATCH_WORKER_QUEUE")?.unwrap_or(defaults.worker_queue_capacity);
        let event_queue_capacity =
            env_usize("FLEETWATCH_EVENT_QUEUE")?.unwrap_or(defaults.event_queue_capacity);

        let components_cluster_id = std::env::var("FLEETWATCH_COMPONENTS_CLUSTER")
            .unwrap_or(defaults.components_cluster_id);

        let component_paths = std::env::var("FLEETWATCH_COMPONENT_PATHS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let collector_image_base =
            std::env::var("FLEETWATCH_IMAGE_BASE").unwrap_or(defaults.collector_image_base);
        let collector_app_name =
            std::env::var("FLEETWATCH_APP_NAME").unwrap_or(defaults.collector_app_name);

        Ok(Self {
            full_sync_interval,
            watch_reconnect_delay,
            discovery_interval,
            tree_retry_delay,
            tree_resync_interval,
            pipeline_workers,
            worker_queue_capacity,
            event_queue_capacity,
            components_cluster_id,
            component_paths,
            collector_image_base,
            collector_app_name,
            ..defaults
        })
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>, Box<dyn std::error::Error>> {
    match std::env::var(key) {
        Ok(v) => {
            let secs: u64 = v
                .parse()
                .map_err(|e| format!("Invalid {}: {}", key, e))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}

fn env_usize(key: &str) -> Result<Option<usize>, Box<dyn std::error::Error>> {
    match std::env::var(key) {
        Ok(v) => Ok(Some(
            v.parse().map_err(|e| format!("Invalid {}: {}", key, e))?,
        )),
        Err(_) => Ok(None),
    }
}
