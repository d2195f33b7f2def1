//! Centralized cadence and default constants.
//!
//! The reconciliation engine runs on fixed delays rather than exponential
//! backoff: a stuck storage backend is retried at the same cadence forever,
//! and the full-sync loop bounds how stale any cluster can get.
//!
//! # Categories
//!
//! - **Cadences**: loop periods and reconnect delays
//! - **Capacities**: bounded queue sizes that provide backpressure
//! - **Naming**: well-known identifiers shared with the storage layer

// =============================================================================
// Cadences
// =============================================================================

/// Period of the per-cluster full-sync loop, in seconds.
///
/// One full sync also runs immediately when a cluster watcher starts.
pub const DEFAULT_FULL_SYNC_INTERVAL_SECS: u64 = 30;

/// Delay before a broken push-watch subscription is re-opened, in seconds.
pub const DEFAULT_WATCH_RECONNECT_DELAY_SECS: u64 = 5;

/// Period of cluster discovery in the watcher manager, in seconds.
pub const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 3;

/// Delay before retrying a coordination-tree path that does not exist yet, in seconds.
pub const DEFAULT_TREE_RETRY_DELAY_SECS: u64 = 10;

/// Period at which every tree level re-checks its children even without a
/// change notification, in seconds.
///
/// This bounds how long a sub-watch that terminated itself can stay down.
pub const DEFAULT_TREE_RESYNC_INTERVAL_SECS: u64 = 10;

/// How long a stopping component waits for its tasks before aborting them, in seconds.
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

// =============================================================================
// Capacities
// =============================================================================

/// Number of pipeline workers.
pub const DEFAULT_PIPELINE_WORKERS: usize = 10;

/// Capacity of each pipeline worker's task queue.
pub const DEFAULT_WORKER_QUEUE_CAPACITY: usize = 64;

/// Capacity of the merged event queue shared by all cluster watchers.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

/// Capacity of the endpoint event queue owned by a tree watcher.
pub const TREE_EVENT_QUEUE_CAPACITY: usize = 128;

/// Virtual nodes per worker on the shard ring.
pub const VIRTUAL_NODES_PER_WORKER: usize = 64;

// =============================================================================
// Naming
// =============================================================================

/// Cluster ID of the platform components pseudo-cluster.
pub const DEFAULT_COMPONENTS_CLUSTER_ID: &str = "components";

/// Name under which the per-namespace collector application is recorded.
pub const DEFAULT_COLLECTOR_APP_NAME: &str = "metric-collector";

/// Image repository prefix used when rendering collector manifests.
pub const DEFAULT_COLLECTOR_IMAGE_BASE: &str = "registry.local/platform";

/// Image name of the collector, appended to the image base.
pub const COLLECTOR_IMAGE_NAME: &str = "metric-collector:stable";

/// Scrape path used when neither the metric nor the endpoint names one.
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Label carrying a component's name on endpoints discovered in the coordination tree.
pub const COMPONENT_LABEL: &str = "component";
