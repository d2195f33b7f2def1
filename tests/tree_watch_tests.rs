//! Coordination-tree watching through the public API.
//!
//! Covers multi-wildcard templates on their own and the components
//! pseudo-cluster end to end, where registered endpoints become scrape
//! targets.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fleetwatch::cluster_watcher::SyncContext;
use fleetwatch::config::SyncConfig;
use fleetwatch::driver::DriverRegistry;
use fleetwatch::health::HealthState;
use fleetwatch::metric_manager::MetricManager;
use fleetwatch::mock::{MockApplicationApi, MockCoordinationStore, MockMetricStore};
use fleetwatch::tree_watcher::{PathTemplate, TreeWatcher};
use fleetwatch::types::{ClusterType, EndpointChange, EndpointEvent, Metric, Role, Selector};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn server_info(ip: &str, port: u16) -> Bytes {
    Bytes::from(format!(r#"{{"ip":"{}","port":{}}}"#, ip, port))
}

async fn next(rx: &mut mpsc::Receiver<EndpointEvent>) -> EndpointEvent {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for endpoint event")
        .expect("endpoint channel closed")
}

macro_rules! eventually {
    ($cond:expr) => {{
        let mut ok = false;
        for _ in 0..150 {
            if $cond {
                ok = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        ok
    }};
}

#[tokio::test]
async fn test_two_wildcards_isolate_each_subtree() {
    let store = Arc::new(MockCoordinationStore::new());
    store
        .create("/dc/east/svc/api/nodes/n1", server_info("10.1.0.1", 80))
        .await;
    store
        .create("/dc/east/svc/web/nodes/n1", server_info("10.1.0.2", 80))
        .await;
    store
        .create("/dc/west/svc/api/nodes/n1", server_info("10.2.0.1", 80))
        .await;

    let (tx, mut rx) = mpsc::channel(64);
    let watcher = TreeWatcher::new(
        store.clone(),
        tx,
        Duration::from_millis(50),
        Duration::from_millis(100),
    );
    let template = PathTemplate::parse("edge:/dc/*/svc/*/nodes").unwrap();
    assert_eq!(template.wildcard_count(), 2);
    let token = CancellationToken::new();
    let task = tokio::spawn({
        let watcher = watcher.clone();
        let token = token.clone();
        async move { watcher.run(template, token).await }
    });

    let mut ups = BTreeSet::new();
    for _ in 0..3 {
        let event = next(&mut rx).await;
        assert_eq!(event.change, EndpointChange::Up);
        assert_eq!(event.endpoint.name, "edge");
        ups.insert(event.endpoint.address());
    }
    assert_eq!(
        ups,
        ["10.1.0.1:80", "10.1.0.2:80", "10.2.0.1:80"]
            .into_iter()
            .map(String::from)
            .collect()
    );

    // Dropping one service in one datacenter touches nothing else.
    store.remove("/dc/east/svc/web").await;
    let down = next(&mut rx).await;
    assert_eq!(down.change, EndpointChange::Down);
    assert_eq!(down.node_path, "/dc/east/svc/web/nodes/n1");

    store
        .create("/dc/west/svc/api/nodes/n2", server_info("10.2.0.2", 80))
        .await;
    let up = next(&mut rx).await;
    assert_eq!(up.change, EndpointChange::Up);
    assert_eq!(up.node_path, "/dc/west/svc/api/nodes/n2");

    // A whole datacenter going away reports every endpoint below it.
    store.remove("/dc/west").await;
    let mut downs = BTreeSet::new();
    for _ in 0..2 {
        let event = next(&mut rx).await;
        assert_eq!(event.change, EndpointChange::Down);
        downs.insert(event.node_path);
    }
    assert!(downs.contains("/dc/west/svc/api/nodes/n1"));
    assert!(downs.contains("/dc/west/svc/api/nodes/n2"));

    token.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(watcher.active_watches(), 0);
}

#[tokio::test]
async fn test_components_cluster_scrapes_registered_endpoints() {
    let store = Arc::new(MockMetricStore::new());
    let coordination = Arc::new(MockCoordinationStore::new());
    let api = Arc::new(MockApplicationApi::new());
    let ctx = SyncContext {
        store: store.clone(),
        coordination: coordination.clone(),
        drivers: DriverRegistry::with_defaults(api.clone()),
        config: Arc::new(SyncConfig {
            full_sync_interval: Duration::from_millis(300),
            watch_reconnect_delay: Duration::from_millis(50),
            discovery_interval: Duration::from_millis(20),
            tree_retry_delay: Duration::from_millis(50),
            tree_resync_interval: Duration::from_millis(100),
            component_paths: vec!["scheduler:/platform/scheduler/*/members".into()],
            ..Default::default()
        }),
        health: Arc::new(HealthState::new()),
    };
    let manager = MetricManager::new(ctx, CancellationToken::new());

    store
        .put_metric(&Metric {
            id: "sched".into(),
            cluster_id: "components".into(),
            cluster_type: ClusterType::Components,
            namespace: "platform".into(),
            name: "scheduler".into(),
            version: "1".into(),
            selector: Selector::from_labels([("component", "scheduler")]),
            port: None,
            path: None,
            method: None,
            scheme: None,
            tls_insecure: false,
            interval_secs: None,
            host_network: false,
        })
        .await;
    coordination
        .create(
            "/platform/scheduler/shard-0/members/m0",
            Bytes::from(r#"{"ip":"10.5.0.1","port":9400,"scheme":"https","path":"/internal/metrics"}"#),
        )
        .await;

    manager.apply_role(Role::Master).await;
    assert!(eventually!(
        store
            .collector_config("components", "platform", "scheduler")
            .await
            .is_some_and(|c| c.targets.len() == 1)
    ));
    let config = store
        .collector_config("components", "platform", "scheduler")
        .await
        .unwrap();
    assert_eq!(config.targets[0].address, "10.5.0.1:9400");
    assert_eq!(config.targets[0].scheme, "https");
    assert_eq!(config.targets[0].path, "/internal/metrics");

    coordination
        .create("/platform/scheduler/shard-1/members/m0", server_info("10.5.0.2", 9400))
        .await;
    assert!(eventually!(
        store
            .collector_config("components", "platform", "scheduler")
            .await
            .is_some_and(|c| c.targets.len() == 2)
    ));

    coordination.remove("/platform/scheduler/shard-0").await;
    assert!(eventually!(
        store
            .collector_config("components", "platform", "scheduler")
            .await
            .is_some_and(|c| c.targets.len() == 1 && c.targets[0].address == "10.5.0.2:9400")
    ));

    manager.apply_role(Role::Slave).await;
}
