use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{ClusterDriver, collector_image};
use crate::error::SyncResult;
use crate::traits::ApplicationApi;
use crate::types::{ApplicationManifest, ClusterType, Metric, Workload};

/// Kubernetes backend: scrapes pod IPs, or the node IP for host-network pods.
pub struct KubernetesDriver {
    api: Arc<dyn ApplicationApi>,
}

impl KubernetesDriver {
    pub fn new(api: Arc<dyn ApplicationApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ClusterDriver for KubernetesDriver {
    fn cluster_type(&self) -> ClusterType {
        ClusterType::Kubernetes
    }

    fn target_address(&self, metric: &Metric, workload: &Workload) -> Option<String> {
        let ip = if metric.host_network {
            &workload.host_ip
        } else {
            &workload.ip
        };
        // Pods without an IP are still being scheduled.
        if ip.is_empty() {
            return None;
        }
        let port = metric
            .port
            .or_else(|| workload.first_port().map(|p| p.container_port))?;
        Some(format!("{}:{}", ip, port))
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
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": app_name,
                "namespace": namespace,
                "labels": { "app": app_name },
            },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": app_name } },
                "template": {
                    "metadata": { "labels": { "app": app_name } },
                    "spec": {
                        "containers": [{
                            "name": app_name,
                            "image": image,
                            "env": [
                                { "name": "COLLECTOR_CLUSTER", "value": cluster_id },
                                { "name": "COLLECTOR_NAMESPACE", "value": namespace },
                            ],
                        }],
                    },
                },
            },
        });

        ApplicationManifest {
            cluster_id: cluster_id.to_string(),
            cluster_type: ClusterType::Kubernetes,
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
