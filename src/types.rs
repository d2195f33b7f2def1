//! Data model shared by watchers, drivers and the pipeline.
//!
//! Records are exchanged with storage as JSON. A record's storage ID is
//! carried next to its payload ([`StoreRecord`]) and copied into the decoded
//! value, so payloads never need to repeat it.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;

// =============================================================================
// Storage envelope
// =============================================================================

/// Storage record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Metric collection intents.
    Metric,
    /// Live workload placement.
    Dynamic,
    /// Derived per-metric scrape configuration.
    CollectorConfig,
    /// Per-namespace collector application record.
    CollectorApp,
    /// Explicit target overrides for a metric.
    MetricTask,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Metric => "metric",
            Kind::Dynamic => "dynamic",
            Kind::CollectorConfig => "collector_config",
            Kind::CollectorApp => "collector_app",
            Kind::MetricTask => "metric_task",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRecord {
    pub id: String,
    pub value: Bytes,
}

impl StoreRecord {
    pub fn new(id: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
        }
    }
}

/// One item from a storage subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Add(StoreRecord),
    Change(StoreRecord),
    /// The value may be empty; only the ID is guaranteed.
    Delete(StoreRecord),
    /// The subscription is broken and will produce nothing further.
    WatchBreak,
}

/// Namespace / name filter for storage queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl QueryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: None,
        }
    }
}

// =============================================================================
// Metrics
// =============================================================================

/// Backend type of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    Kubernetes,
    Swarm,
    Components,
    /// Any type this build has no driver for.
    #[serde(other)]
    Unknown,
}

impl ClusterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Kubernetes => "kubernetes",
            ClusterType::Swarm => "swarm",
            ClusterType::Components => "components",
            ClusterType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label-match selector.
///
/// An empty selector matches nothing. Unless `all_namespaces` is set, only
/// workloads in the metric's own namespace are candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Selector {
    pub match_labels: BTreeMap<String, String>,
    pub all_namespaces: bool,
}

impl Selector {
    pub fn from_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            all_namespaces: false,
        }
    }

    /// Returns true if every selector label is present with the same value.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.match_labels.is_empty()
            && self
                .match_labels
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// A metric collection intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    /// Storage ID, filled in from the record envelope.
    #[serde(default)]
    pub id: String,
    pub cluster_id: String,
    pub cluster_type: ClusterType,
    pub namespace: String,
    pub name: String,
    /// Opaque version token. Any change means the metric must be reprocessed.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub selector: Selector,
    /// Target port. Falls back to the workload's first port.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub tls_insecure: bool,
    /// Scrape interval in seconds.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Scrape the workload's host address instead of its own.
    #[serde(default)]
    pub host_network: bool,
}

impl Metric {
    /// Decode a stored metric, taking its ID from the envelope.
    pub fn decode(record: &StoreRecord) -> SyncResult<Self> {
        let mut metric: Metric = serde_json::from_slice(&record.value)?;
        metric.id = record.id.clone();
        Ok(metric)
    }

    /// Pipeline routing key.
    pub fn routing_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Placement
// =============================================================================

/// A port exposed by a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    /// Port published on the host, if any.
    #[serde(default)]
    pub host_port: Option<u16>,
    #[serde(default)]
    pub name: Option<String>,
}

/// A running workload (pod, swarm task, or registered component endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl Workload {
    pub fn decode(record: &StoreRecord) -> SyncResult<Self> {
        let mut workload: Workload = serde_json::from_slice(&record.value)?;
        workload.id = record.id.clone();
        Ok(workload)
    }

    /// Build the placement entry for a registered component endpoint.
    ///
    /// The endpoint's template name becomes the `component` label, so
    /// component metrics select endpoints the same way other metrics select
    /// pods.
    pub fn from_endpoint(node_path: &str, endpoint: &Endpoint) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(
            crate::constants::COMPONENT_LABEL.to_string(),
            endpoint.name.clone(),
        );
        Self {
            id: node_path.to_string(),
            name: endpoint.name.clone(),
            namespace: String::new(),
            kind: "component".to_string(),
            labels,
            ip: endpoint.ip.clone(),
            host_ip: endpoint.ip.clone(),
            ports: vec![PortMapping {
                container_port: endpoint.port,
                host_port: Some(endpoint.port),
                name: None,
            }],
            scheme: endpoint.scheme.clone(),
            path: endpoint.path.clone(),
        }
    }

    pub fn first_port(&self) -> Option<&PortMapping> {
        self.ports.first()
    }
}

/// Metadata of the object behind one scrape address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl ObjectMeta {
    pub fn from_workload(workload: &Workload) -> Self {
        Self {
            name: workload.name.clone(),
            namespace: workload.namespace.clone(),
            kind: workload.kind.clone(),
            labels: workload.labels.clone(),
            scheme: workload.scheme.clone(),
            path: workload.path.clone(),
        }
    }
}

/// "ip[:port]" → object metadata.
pub type IpMetaMap = BTreeMap<String, ObjectMeta>;

/// Explicit targets for one metric, merged into its computed IP map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricTask {
    pub namespace: String,
    pub metric_name: String,
    #[serde(default)]
    pub targets: IpMetaMap,
}

impl MetricTask {
    pub fn decode(record: &StoreRecord) -> SyncResult<Self> {
        Ok(serde_json::from_slice(&record.value)?)
    }
}

// =============================================================================
// Derived records
// =============================================================================

/// One scrape target of a collector config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeTarget {
    pub address: String,
    pub scheme: String,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub tls_insecure: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Persisted scrape configuration for one metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub cluster_id: String,
    pub namespace: String,
    pub metric_name: String,
    pub version: String,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Sorted by address.
    pub targets: Vec<ScrapeTarget>,
}

impl CollectorConfig {
    /// Derive the config for `metric` from its resolved IP map.
    ///
    /// Endpoint-provided scheme and path take precedence over the metric's.
    pub fn from_metric(metric: &Metric, ip_meta: &IpMetaMap, default_path: &str) -> Self {
        let targets = ip_meta
            .iter()
            .map(|(address, meta)| {
                let mut labels = meta.labels.clone();
                labels.insert("name".to_string(), meta.name.clone());
                if !meta.namespace.is_empty() {
                    labels.insert("namespace".to_string(), meta.namespace.clone());
                }
                ScrapeTarget {
                    address: address.clone(),
                    scheme: meta
                        .scheme
                        .clone()
                        .or_else(|| metric.scheme.clone())
                        .unwrap_or_else(|| "http".to_string()),
                    path: meta
                        .path
                        .clone()
                        .or_else(|| metric.path.clone())
                        .unwrap_or_else(|| default_path.to_string()),
                    method: metric.method.clone().unwrap_or_else(|| "GET".to_string()),
                    tls_insecure: metric.tls_insecure,
                    labels,
                }
            })
            .collect();

        Self {
            cluster_id: metric.cluster_id.clone(),
            namespace: metric.namespace.clone(),
            metric_name: metric.name.clone(),
            version: metric.version.clone(),
            interval_secs: metric.interval_secs,
            targets,
        }
    }

    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> SyncResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Collector workload description handed to the application API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationManifest {
    pub cluster_id: String,
    pub cluster_type: ClusterType,
    pub namespace: String,
    pub name: String,
    pub image: String,
    /// Backend-specific body.
    pub spec: serde_json::Value,
}

impl ApplicationManifest {
    pub fn encode(&self) -> SyncResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    MetricUpdate,
    MetricDelete,
    DynamicUpdate,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MetricUpdate => "metric_update",
            EventType::MetricDelete => "metric_delete",
            EventType::DynamicUpdate => "dynamic_update",
        }
    }
}

/// A reconciled event for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricEvent {
    pub id: String,
    pub event_type: EventType,
    pub metric: Metric,
    /// No collector application existed when the event was produced.
    pub first: bool,
    /// No other known metric remains in the namespace.
    pub last: bool,
    pub ip_meta: IpMetaMap,
}

impl MetricEvent {
    pub fn routing_key(&self) -> String {
        self.metric.routing_key()
    }
}

// =============================================================================
// Coordination tree
// =============================================================================

/// Payload of a registration node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// A registered endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
    pub scheme: Option<String>,
    /// Name of the template that discovered the endpoint.
    pub name: String,
    pub path: Option<String>,
}

impl Endpoint {
    pub fn from_server_info(name: &str, info: ServerInfo) -> Self {
        Self {
            ip: info.ip,
            port: info.port,
            scheme: info.scheme,
            name: name.to_string(),
            path: info.path,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointChange {
    Up,
    Down,
}

/// Endpoint registration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointEvent {
    pub change: EndpointChange,
    /// Full path of the registration node.
    pub node_path: String,
    pub endpoint: Endpoint,
}

// =============================================================================
// Roles and states
// =============================================================================

/// Leader-election notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// Lifecycle state of a cluster watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Starting,
    Running,
    /// At least one push-watch is waiting to re-subscribe.
    ReconnectWait,
}
