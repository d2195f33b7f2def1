//! Side-effecting actions for reconciled events.
//!
//! Each [`MetricEvent`] becomes one pipeline task:
//!
//! - update (metric or placement): persist the derived [`CollectorConfig`];
//!   if the event is First, create the namespace's collector application
//!   and record it
//! - delete: remove the collector config; if the event is Last, delete the
//!   collector application and its record
//!
//! Failures are logged, counted and reflected in the shared health flags.
//! Nothing is returned to the caller: the next full sync re-derives whatever
//! a failed action left undone.

use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::driver::{ClusterDriver, DriverRegistry};
use crate::error::SyncError;
use crate::health::HealthState;
use crate::metrics::{record_collaborator_error, record_pipeline_task};
use crate::pipeline::Task;
use crate::retry::{with_api_policy, with_storage_policy};
use crate::traits::MetricStore;
use crate::types::{CollectorConfig, EventType, Kind, Metric, MetricEvent};

/// Collaborators shared by every action.
pub struct ActionContext {
    store: Arc<dyn MetricStore>,
    drivers: DriverRegistry,
    health: Arc<HealthState>,
    config: Arc<SyncConfig>,
}

impl ActionContext {
    pub fn new(
        store: Arc<dyn MetricStore>,
        drivers: DriverRegistry,
        health: Arc<HealthState>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            store,
            drivers,
            health,
            config,
        }
    }

    /// Wrap the handling of `event` as a pipeline task.
    pub fn task(self: &Arc<Self>, event: MetricEvent) -> Task {
        let ctx = self.clone();
        async move { ctx.handle(event).await }.boxed()
    }

    pub async fn handle(&self, event: MetricEvent) {
        debug!(
            cluster_id = %event.metric.cluster_id,
            key = %event.routing_key(),
            event_type = event.event_type.as_str(),
            first = event.first,
            last = event.last,
            targets = event.ip_meta.len(),
            "Handling metric event"
        );
        match event.event_type {
            EventType::MetricUpdate | EventType::DynamicUpdate => self.apply_update(&event).await,
            EventType::MetricDelete => self.apply_delete(&event).await,
        }
    }

    async fn apply_update(&self, event: &MetricEvent) {
        let metric = &event.metric;
        let config =
            CollectorConfig::from_metric(metric, &event.ip_meta, &self.config.default_metrics_path);

        match config.encode() {
            Ok(data) => {
                let result = with_storage_policy("save_collector_config", || {
                    self.store.save(
                        &metric.cluster_id,
                        Kind::CollectorConfig,
                        &metric.namespace,
                        &metric.name,
                        data.clone(),
                    )
                })
                .await;
                record_pipeline_task("save_config", result.is_ok());
                if let Err(e) = result {
                    self.storage_failed(metric, "save collector config", &e);
                } else {
                    self.storage_ok();
                }
            }
            Err(e) => {
                record_pipeline_task("save_config", false);
                warn!(key = %metric.routing_key(), error = %e, "Failed to encode collector config");
            }
        }

        if event.first {
            self.ensure_application(metric).await;
        }
    }

    async fn ensure_application(&self, metric: &Metric) {
        let driver = match self.drivers.get(metric.cluster_type) {
            Ok(driver) => driver,
            Err(e) => {
                warn!(cluster_id = %metric.cluster_id, error = %e, "Cannot create collector application");
                return;
            }
        };
        let app_name = &self.config.collector_app_name;

        // Another term or another metric may have created it since the
        // event was produced.
        let existing = with_storage_policy("get_collector_app", || {
            self.store.get(
                &metric.cluster_id,
                Kind::CollectorApp,
                &metric.namespace,
                app_name,
            )
        })
        .await;
        match existing {
            Ok(Some(_)) => {
                debug!(
                    cluster_id = %metric.cluster_id,
                    namespace = %metric.namespace,
                    "Collector application already recorded, skipping create"
                );
                return;
            }
            Ok(None) => self.storage_ok(),
            Err(e) => {
                self.storage_failed(metric, "read collector application record", &e);
                return;
            }
        }

        let manifest = driver.application_manifest(
            &metric.cluster_id,
            &metric.namespace,
            &self.config.collector_image_base,
            app_name,
        );
        let created = with_api_policy("create_application", || {
            driver.create_application(&manifest)
        })
        .await;
        record_pipeline_task("create_application", created.is_ok());
        if let Err(e) = created {
            self.api_failed(metric, "create collector application", &e);
            return;
        }
        self.api_ok();
        info!(
            cluster_id = %metric.cluster_id,
            namespace = %metric.namespace,
            image = %manifest.image,
            "Created collector application"
        );

        let data = match manifest.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to encode application manifest");
                return;
            }
        };
        let saved = with_storage_policy("save_collector_app", || {
            self.store.save(
                &metric.cluster_id,
                Kind::CollectorApp,
                &metric.namespace,
                app_name,
                data.clone(),
            )
        })
        .await;
        match saved {
            Ok(()) => self.storage_ok(),
            Err(e) => self.storage_failed(metric, "save collector application record", &e),
        }
    }

    async fn apply_delete(&self, event: &MetricEvent) {
        let metric = &event.metric;

        let deleted = with_storage_policy("delete_collector_config", || {
            self.store.delete(
                &metric.cluster_id,
                Kind::CollectorConfig,
                &metric.namespace,
                &metric.name,
            )
        })
        .await;
        record_pipeline_task("delete_config", deleted.is_ok());
        match deleted {
            Ok(()) => self.storage_ok(),
            Err(e) => self.storage_failed(metric, "delete collector config", &e),
        }

        if event.last {
            match self.drivers.get(metric.cluster_type) {
                Ok(driver) => self.remove_application(metric, driver.as_ref()).await,
                Err(e) => {
                    warn!(cluster_id = %metric.cluster_id, error = %e, "Cannot delete collector application");
                }
            }
        }
    }

    async fn remove_application(&self, metric: &Metric, driver: &dyn ClusterDriver) {
        let app_name = &self.config.collector_app_name;

        let removed = with_api_policy("delete_application", || {
            driver.delete_application(&metric.cluster_id, &metric.namespace, app_name)
        })
        .await;
        record_pipeline_task("delete_application", removed.is_ok());
        if let Err(e) = removed {
            // Keep the record: the application still exists.
            self.api_failed(metric, "delete collector application", &e);
            return;
        }
        self.api_ok();
        info!(
            cluster_id = %metric.cluster_id,
            namespace = %metric.namespace,
            "Deleted collector application"
        );

        let deleted = with_storage_policy("delete_collector_app", || {
            self.store.delete(
                &metric.cluster_id,
                Kind::CollectorApp,
                &metric.namespace,
                app_name,
            )
        })
        .await;
        match deleted {
            Ok(()) => self.storage_ok(),
            Err(e) => self.storage_failed(metric, "delete collector application record", &e),
        }
    }

    fn storage_ok(&self) {
        if self.health.record_storage(true) {
            info!("Storage reachable again");
        }
    }

    fn storage_failed(&self, metric: &Metric, action: &str, error: &SyncError) {
        record_collaborator_error("storage");
        if error.is_transient() && self.health.record_storage(false) {
            warn!("Storage marked unreachable");
        }
        warn!(
            cluster_id = %metric.cluster_id,
            key = %metric.routing_key(),
            action,
            error = %error,
            "Pipeline action failed"
        );
    }

    fn api_ok(&self) {
        if self.health.record_api(true) {
            info!("Application API reachable again");
        }
    }

    fn api_failed(&self, metric: &Metric, action: &str, error: &SyncError) {
        record_collaborator_error("api");
        if error.is_transient() && self.health.record_api(false) {
            warn!("Application API marked unreachable");
        }
        warn!(
            cluster_id = %metric.cluster_id,
            key = %metric.routing_key(),
            action,
            error = %error,
            "Pipeline action failed"
        );
    }
}
