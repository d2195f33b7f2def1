//! Error types for the reconciliation engine.
//!
//! # Error Handling Patterns
//!
//! The engine is driven entirely by background loops, so almost nothing is
//! propagated to a caller. Two patterns are used:
//!
//! ## Propagate
//!
//! Collaborator wrappers and constructors return [`SyncResult`] so callers can
//! decide what a failure means:
//!
//! ```text
//! let records = store.query(cluster_id, Kind::Metric, &QueryFilter::all()).await?;
//! ```
//!
//! ## Log and Continue
//!
//! Loops and pipeline actions log the error, skip the offending record or call,
//! and keep running. The next full sync re-derives whatever was missed:
//!
//! ```text
//! let records = match store.query(..).await {
//!     Ok(r) => r,
//!     Err(e) => {
//!         warn!(cluster_id, error = %e, "Full sync query failed");
//!         return;
//!     }
//! };
//! ```
//!
//! ## Taxonomy
//!
//! - **Transient remote** ([`SyncError::Storage`], [`SyncError::Coordination`],
//!   [`SyncError::Decode`], [`SyncError::Api`]): logged, skipped
//! - **Missing path** ([`SyncError::NoNode`]): retried after a fixed delay
//! - **Configuration fatal** ([`SyncError::UnknownClusterType`]): event dropped
//! - **Shutdown** ([`SyncError::PipelineClosed`]): not a failure, the caller stops

use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors produced by the engine and its collaborators.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Storage backend call failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Coordination store call failed for a reason other than a missing path.
    #[error("Coordination store error: {0}")]
    Coordination(String),

    /// The coordination path does not exist (yet).
    #[error("Coordination path {0} does not exist")]
    NoNode(String),

    /// A stored record could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// No cluster driver is registered for this cluster type.
    #[error("No driver for cluster type {0}")]
    UnknownClusterType(String),

    /// The backend application API rejected a call.
    #[error("Application API error: {0}")]
    Api(String),

    /// A coordination-tree path template is malformed.
    #[error("Invalid path template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The pipeline stopped accepting tasks.
    #[error("Pipeline closed")]
    PipelineClosed,
}

impl SyncError {
    /// Returns true if the error means "path does not exist yet".
    #[inline]
    pub fn is_no_node(&self) -> bool {
        matches!(self, SyncError::NoNode(_))
    }

    /// Returns true if retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Storage(_)
                | SyncError::Coordination(_)
                | SyncError::NoNode(_)
                | SyncError::Api(_)
        )
    }

    /// Returns a short label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            SyncError::Storage(_) => "storage",
            SyncError::Coordination(_) => "coordination",
            SyncError::NoNode(_) => "no_node",
            SyncError::Decode(_) => "decode",
            SyncError::UnknownClusterType(_) => "unknown_cluster_type",
            SyncError::Api(_) => "api",
            SyncError::InvalidTemplate { .. } => "invalid_template",
            SyncError::Config(_) => "config",
            SyncError::PipelineClosed => "pipeline_closed",
        }
    }
}
