//! Collaborator traits.
//!
//! The engine owns no I/O of its own. Everything it reads or changes goes
//! through one of these traits:
//!
//! - [`MetricStore`]: metric, placement and derived records, with push
//!   subscriptions
//! - [`CoordinationStore`]: hierarchical registration tree with child watches
//! - [`ApplicationApi`]: backend calls that create or remove a collector
//!   application
//!
//! In-memory implementations for tests live in [`crate::mock`].

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::SyncResult;
use crate::types::{ApplicationManifest, Kind, QueryFilter, StoreEvent, StoreRecord};

/// Record storage with query and subscription support.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// IDs of all clusters that have at least one stored metric.
    async fn list_clusters(&self) -> SyncResult<Vec<String>>;

    /// Snapshot of every record of `kind` in a cluster matching `filter`.
    async fn query(
        &self,
        cluster_id: &str,
        kind: Kind,
        filter: &QueryFilter,
    ) -> SyncResult<Vec<StoreRecord>>;

    /// Subscribe to changes of `kind` in a cluster.
    ///
    /// The stream ends with [`StoreEvent::WatchBreak`] when the backend
    /// drops the subscription. Dropping the receiver unsubscribes.
    async fn subscribe(&self, cluster_id: &str, kind: Kind)
    -> SyncResult<mpsc::Receiver<StoreEvent>>;

    /// Fetch a single record by its logical key.
    async fn get(
        &self,
        cluster_id: &str,
        kind: Kind,
        namespace: &str,
        name: &str,
    ) -> SyncResult<Option<Bytes>>;

    /// Create or replace a record.
    async fn save(
        &self,
        cluster_id: &str,
        kind: Kind,
        namespace: &str,
        name: &str,
        data: Bytes,
    ) -> SyncResult<()>;

    /// Delete a record. Deleting a missing record succeeds.
    async fn delete(&self, cluster_id: &str, kind: Kind, namespace: &str, name: &str)
    -> SyncResult<()>;
}

/// Hierarchical coordination store.
///
/// A path that does not exist yields [`SyncError::NoNode`](crate::error::SyncError::NoNode).
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get_children(&self, path: &str) -> SyncResult<Vec<String>>;

    /// Current children plus a one-shot signal that fires on the next change
    /// to the child list (or the path's removal).
    async fn watch_children(&self, path: &str) -> SyncResult<(Vec<String>, oneshot::Receiver<()>)>;

    /// Payload of a node.
    async fn get(&self, path: &str) -> SyncResult<Bytes>;
}

/// Backend API for collector applications.
#[async_trait]
pub trait ApplicationApi: Send + Sync {
    async fn apply(&self, manifest: &ApplicationManifest) -> SyncResult<()>;

    /// Remove an application. Removing a missing application succeeds.
    async fn remove(&self, cluster_id: &str, namespace: &str, name: &str) -> SyncResult<()>;
}
