//! Shared health flags consumed by an external health-check endpoint.
//!
//! The engine returns no errors to callers, so reachability of its two
//! collaborator families is the only externally visible failure signal.
//! Every loop that calls storage or the application API records the outcome
//! here.

use std::sync::atomic::{AtomicBool, Ordering};

/// Overall health derived from the reachability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Storage and application API both reachable.
    Healthy,
    /// One of the collaborators is unreachable.
    Degraded,
    /// Neither collaborator is reachable.
    Unhealthy,
}

impl HealthStatus {
    /// HTTP status code for this health status.
    pub fn http_status_code(&self) -> u16 {
        match self {
            HealthStatus::Healthy => 200,
            HealthStatus::Degraded => 503,
            HealthStatus::Unhealthy => 500,
        }
    }
}

/// Storage and application API reachability.
///
/// Both flags start out `true`; the first failed call flips them.
#[derive(Debug)]
pub struct HealthState {
    storage_reachable: AtomicBool,
    api_reachable: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            storage_reachable: AtomicBool::new(true),
            api_reachable: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn storage_reachable(&self) -> bool {
        self.storage_reachable.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn api_reachable(&self) -> bool {
        self.api_reachable.load(Ordering::SeqCst)
    }

    /// Record the outcome of a storage call.
    ///
    /// Returns true if this call changed the flag, so callers can log
    /// transitions once instead of on every failure.
    pub fn record_storage(&self, ok: bool) -> bool {
        self.storage_reachable.swap(ok, Ordering::SeqCst) != ok
    }

    /// Record the outcome of an application API call.
    pub fn record_api(&self, ok: bool) -> bool {
        self.api_reachable.swap(ok, Ordering::SeqCst) != ok
    }

    pub fn status(&self) -> HealthStatus {
        match (self.storage_reachable(), self.api_reachable()) {
            (true, true) => HealthStatus::Healthy,
            (false, false) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        }
    }
}
