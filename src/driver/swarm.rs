use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{ClusterDriver, collector_image};
use crate::error::SyncResult;
use crate::traits::ApplicationApi;
use crate::types::{ApplicationManifest, ClusterType, Metric, Workload};

/// Docker Swarm backend.
///
/// Task IPs live on overlay networks the collector may not reach, so targets
/// are the host IP plus the published port of the wanted container port.
pub struct SwarmDriver {
    api: Arc<dyn ApplicationApi>,
}

impl SwarmDriver {
    pub fn new(api: Arc<dyn ApplicationApi>) -> Self {
        Self { api }
    }

    /// Swarm has no namespaces, so the service name carries it.
    fn service_name(namespace: &str, app_name: &str) -> String {
        format!("{}-{}", namespace, app_name)
    }
}

#[async_trait]
impl ClusterDriver for SwarmDriver {
    fn cluster_type(&self) -> ClusterType {
        ClusterType::Swarm
    }

    fn target_address(&self, metric: &Metric, workload: &Workload) -> Option<String> {
        if workload.host_ip.is_empty() {
            return None;
        }
        let mapping = match metric.port {
            Some(port) => workload.ports.iter().find(|p| p.container_port == port)?,
            None => workload.first_port()?,
        };
        // Unpublished ports are unreachable from outside the overlay.
        let host_port = mapping.host_port?;
        Some(format!("{}:{}", workload.host_ip, host_port))
    }

    fn application_manifest(
        &self,
        cluster_id: &str,
        namespace: &str,
        image_base: &str,
        app_name: &str,
    ) -> ApplicationManifest {
        let image = collector_image(image_base);
        let service = Self::service_name(namespace, app_name);
        let spec = json!({
            "Name": service,
            "Labels": {
                "namespace": namespace,
                "app": app_name,
            },
            "TaskTemplate": {
                "ContainerSpec": {
                    "Image": image,
                    "Env": [
                        format!("COLLECTOR_CLUSTER={}", cluster_id),
                        format!("COLLECTOR_NAMESPACE={}", namespace),
                    ],
                },
            },
            "Mode": { "Replicated": { "Replicas": 1 } },
        });

        ApplicationManifest {
            cluster_id: cluster_id.to_string(),
            cluster_type: ClusterType::Swarm,
            namespace: namespace.to_string(),
            name: service,
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
        self.api
            .remove(cluster_id, namespace, &Self::service_name(namespace, app_name))
            .await
    }
}
