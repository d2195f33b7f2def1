use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{ClusterDriver, collector_image};
use crate::error::SyncResult;
use crate::traits::ApplicationApi;
use crate::types::{ApplicationManifest, ClusterType, Metric, Workload};

/// Platform components pseudo-cluster.
///
/// Placement comes from coordination-tree endpoints rather than storage.
/// Components are not namespaced, so selection ignores the metric namespace,
/// and the endpoint's own scheme and path win over the metric's.
pub struct ComponentsDriver {
    api: Arc<dyn ApplicationApi>,
}

impl ComponentsDriver {
    pub fn new(api: Arc<dyn ApplicationApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ClusterDriver for ComponentsDriver {
    fn cluster_type(&self) -> ClusterType {
        ClusterType::Components
    }

    fn selects(&self, metric: &Metric, workload: &Workload) -> bool {
        metric.selector.matches(&workload.labels)
    }

    fn target_address(&self, _metric: &Metric, workload: &Workload) -> Option<String> {
        let port = workload.first_port()?.container_port;
        Some(format!("{}:{}", workload.ip, port))
    }

    fn application_manifest(
        &self,
        cluster_id: &str,
        namespace: &str,
        image_base: &str,
        app_name: &str,
    ) -> ApplicationManifest {
        let image = collector_image(image_base);
        let spec = json!({
            "name": app_name,
            "image": image,
            "env": {
                "COLLECTOR_CLUSTER": cluster_id,
                "COLLECTOR_NAMESPACE": namespace,
            },
        });

        ApplicationManifest {
            cluster_id: cluster_id.to_string(),
            cluster_type: ClusterType::Components,
            namespace: namespace.to_string(),
            name: app_name.to_string(),
            image,
            spec,
        }
    }

    async fn create_application(&self, manifest: &ApplicationManifest) -> SyncResult<()> {
        self.api.apply(manifest).await
    }

    async fn delete_application(
        &self,
        cluster_id: &str,
        namespace: &str,
        app_name: &str,
    ) -> SyncResult<()> {
        self.api.remove(cluster_id, namespace, app_name).await
    }
}
