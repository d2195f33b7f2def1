//! # Fleetwatch
//! Leader-gated watch and reconciliation engine for per-cluster metric collection.
//!
//! Fleetwatch watches metric declarations and workload placement for every
//! managed cluster, and keeps one collector configuration per metric and one
//! collector application per namespace in step with them. Only the process
//! holding the master role acts; the others stay idle until promoted.
//!
//! # Goals
//! - Converge: whatever a push event misses, the next full sync repairs
//! - Order side effects per metric, parallelize across metrics
//! - Tear everything down cleanly when leadership is lost
//!
//! ## Moving parts
//! - [`MetricManager`](metric_manager::MetricManager) turns Master/Slave
//!   notifications into start/stop of everything below
//! - [`WatcherManager`](watcher_manager::WatcherManager) discovers clusters
//!   and runs one [`ClusterWatcher`](cluster_watcher::ClusterWatcher) each
//! - [`TreeWatcher`](tree_watcher::TreeWatcher) follows wildcard templates in
//!   the coordination tree for the platform components pseudo-cluster
//! - [`Pipeline`](pipeline::Pipeline) runs the resulting
//!   [`actions`] on workers sharded by `namespace/name`
//!
//! Storage, coordination tree and backend application API are reached
//! through the traits in [`traits`]; backends plug in as
//! [`ClusterDriver`](driver::ClusterDriver)s.
//!
//! ## Getting started
//! ```rust,no_run
//! use std::sync::Arc;
//! use fleetwatch::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(
//! #     store: Arc<dyn MetricStore>,
//! #     coordination: Arc<dyn CoordinationStore>,
//! #     api: Arc<dyn ApplicationApi>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::from_env()?;
//! config.validate().map_err(|errors| errors.join("; "))?;
//! let ctx = SyncContext {
//!     store,
//!     coordination,
//!     drivers: DriverRegistry::with_defaults(api),
//!     config: Arc::new(config),
//!     health: Arc::new(HealthState::new()),
//! };
//!
//! let (roles_tx, roles_rx) = tokio::sync::mpsc::channel(8);
//! let manager = MetricManager::new(ctx, CancellationToken::new());
//! roles_tx.send(Role::Master).await?;
//! manager.run(roles_rx).await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod actions;
pub mod cluster_watcher;
pub mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod health;
pub mod metric_manager;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod task_group;
pub mod telemetry;
pub mod traits;
pub mod tree_watcher;
pub mod types;
pub mod watcher_manager;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock;

pub mod prelude {
    //! Main exports for embedding the engine.
    pub use crate::cluster_watcher::{ClusterWatcher, SyncContext};
    pub use crate::config::SyncConfig;
    pub use crate::driver::{ClusterDriver, DriverRegistry};
    pub use crate::error::{SyncError, SyncResult};
    pub use crate::health::{HealthState, HealthStatus};
    pub use crate::metric_manager::MetricManager;
    pub use crate::traits::{ApplicationApi, CoordinationStore, MetricStore};
    pub use crate::types::{Kind, Metric, MetricEvent, Role, StoreEvent, WatcherState};
    pub use crate::watcher_manager::WatcherManager;

    pub use bytes;
}
