//! Backend-specific cluster drivers.
//!
//! A driver translates a metric plus the live placement snapshot into the
//! addresses to scrape, renders the collector application manifest for its
//! backend, and forwards create/delete calls to the [`ApplicationApi`].
//!
//! Drivers are looked up by [`ClusterType`] through a [`DriverRegistry`]. A
//! metric whose type has no registered driver is a configuration error: its
//! events are dropped with a log entry.

mod components;
mod kubernetes;
mod swarm;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

pub use components::ComponentsDriver;
pub use kubernetes::KubernetesDriver;
pub use swarm::SwarmDriver;

use crate::constants::COLLECTOR_IMAGE_NAME;
use crate::error::{SyncError, SyncResult};
use crate::traits::ApplicationApi;
use crate::types::{ApplicationManifest, ClusterType, IpMetaMap, Metric, ObjectMeta, Workload};

/// Live placement of one cluster, keyed by workload ID.
pub type Placement = BTreeMap<String, Workload>;

/// Strategy for one backend type.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    fn cluster_type(&self) -> ClusterType;

    /// Address ("ip:port") to scrape `workload` at for `metric`, if it
    /// exposes one.
    fn target_address(&self, metric: &Metric, workload: &Workload) -> Option<String>;

    /// Returns true if `metric`'s selector covers `workload`.
    fn selects(&self, metric: &Metric, workload: &Workload) -> bool {
        (metric.selector.all_namespaces || workload.namespace == metric.namespace)
            && metric.selector.matches(&workload.labels)
    }

    /// Resolve the IP-metadata map of `metric` against a placement snapshot.
    fn ip_meta(&self, metric: &Metric, placement: &Placement) -> IpMetaMap {
        placement
            .values()
            .filter(|w| self.selects(metric, w))
            .filter_map(|w| {
                self.target_address(metric, w)
                    .map(|address| (address, ObjectMeta::from_workload(w)))
            })
            .collect()
    }

    /// Render the collector application for a namespace.
    fn application_manifest(
        &self,
        cluster_id: &str,
        namespace: &str,
        image_base: &str,
        app_name: &str,
    ) -> ApplicationManifest;

    async fn create_application(&self, manifest: &ApplicationManifest) -> SyncResult<()>;

    async fn delete_application(
        &self,
        cluster_id: &str,
        namespace: &str,
        app_name: &str,
    ) -> SyncResult<()>;
}

/// Full collector image reference for an image repository prefix.
pub(crate) fn collector_image(image_base: &str) -> String {
    format!(
        "{}/{}",
        image_base.trim_end_matches('/'),
        COLLECTOR_IMAGE_NAME
    )
}

/// Drivers by cluster type.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<ClusterType, Arc<dyn ClusterDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Kubernetes, Swarm and Components drivers, all
    /// sharing one application API.
    pub fn with_defaults(api: Arc<dyn ApplicationApi>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(KubernetesDriver::new(api.clone())));
        registry.register(Arc::new(SwarmDriver::new(api.clone())));
        registry.register(Arc::new(ComponentsDriver::new(api)));
        registry
    }

    /// Register a driver, replacing any previous driver for its type.
    pub fn register(&mut self, driver: Arc<dyn ClusterDriver>) {
        self.drivers.insert(driver.cluster_type(), driver);
    }

    pub fn get(&self, cluster_type: ClusterType) -> SyncResult<Arc<dyn ClusterDriver>> {
        self.drivers
            .get(&cluster_type)
            .cloned()
            .ok_or_else(|| SyncError::UnknownClusterType(cluster_type.to_string()))
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("types", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}
