//! Recursive watcher over the coordination tree.
//!
//! A template such as `"gateway:/services/*/nodes"` names the endpoints it
//! discovers (`gateway`) and a path in which every `*` segment expands to
//! all children present at that level. The watcher splits the path at the
//! first `*`, watches the child list of the fixed prefix, and runs an
//! independent sub-watch rooted at every child for the rest of the
//! template. With no wildcard left, the level is terminal: every child is a
//! registration node whose payload decodes to [`ServerInfo`].
//!
//! Every sub-watch has its own [`CancellationToken`], a child of its parent
//! level's token, so the tree of tasks mirrors the tree of paths:
//!
//! - a vanished child cancels exactly its sub-watch, and the parent reports
//!   every endpoint that sub-watch still held as `Down`
//! - a sub-watch whose watch call fails cancels itself and returns; the
//!   parent re-creates it on the next change notification or resync tick,
//!   handing it the endpoints it held so nothing is reported twice
//! - the root of a template is supervised and restarted after the retry
//!   delay
//! - a path that does not exist yet is retried after the retry delay
//!
//! Between signals each level re-reads its child list every resync interval
//! and only re-arms its watch when that list or a sub-watch has changed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::metrics::ACTIVE_TREE_WATCHES;
use crate::traits::CoordinationStore;
use crate::types::{Endpoint, EndpointChange, EndpointEvent, ServerInfo};

/// Endpoints held by a sub-watch, keyed by registration node path.
type Endpoints = BTreeMap<String, Endpoint>;

const WILDCARD: &str = "*";

/// Parsed `name:/path` template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    name: String,
    segments: Vec<String>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> SyncResult<Self> {
        let invalid = |reason: &str| SyncError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let (name, path) = template
            .split_once(':')
            .ok_or_else(|| invalid("expected name:/path"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        if !path.starts_with('/') {
            return Err(invalid("path must be absolute"));
        }

        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if segments.is_empty() {
            return Err(invalid("path must not be the root"));
        }
        if segments.iter().any(|s| s != WILDCARD && s.contains('*')) {
            return Err(invalid("wildcards must be whole segments"));
        }

        Ok(Self {
            name: name.to_string(),
            segments,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> String {
        join_path("", &self.segments)
    }

    pub fn wildcard_count(&self) -> usize {
        self.segments.iter().filter(|s| *s == WILDCARD).count()
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.path())
    }
}

fn join_path(base: &str, segments: &[String]) -> String {
    let mut path = base.trim_end_matches('/').to_string();
    for segment in segments {
        path.push('/');
        path.push_str(segment);
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

fn child_path(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child)
}

/// Remove and return every endpoint below `base`.
fn take_subtree(endpoints: &mut Endpoints, base: &str) -> Endpoints {
    let prefix = format!("{}/", base);
    let keys: Vec<String> = endpoints
        .keys()
        .filter(|k| k.starts_with(&prefix))
        .cloned()
        .collect();
    keys.into_iter()
        .filter_map(|k| endpoints.remove_entry(&k))
        .collect()
}

/// Counts running levels, including ones dropped mid-await.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        ACTIVE_TREE_WATCHES.inc();
        Self(counter.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        ACTIVE_TREE_WATCHES.dec();
    }
}

struct SubWatch {
    token: CancellationToken,
    handle: JoinHandle<Endpoints>,
}

impl SubWatch {
    async fn stop(self) -> Endpoints {
        self.token.cancel();
        self.join().await
    }

    async fn join(self) -> Endpoints {
        match self.handle.await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(error = %e, "Tree sub-watch failed, its endpoints are lost");
                Endpoints::new()
            }
        }
    }
}

/// Coordination-tree watcher emitting endpoint up/down events.
#[derive(Clone)]
pub struct TreeWatcher {
    store: Arc<dyn CoordinationStore>,
    events: mpsc::Sender<EndpointEvent>,
    retry_delay: Duration,
    resync_interval: Duration,
    active: Arc<AtomicUsize>,
}

impl TreeWatcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        events: mpsc::Sender<EndpointEvent>,
        retry_delay: Duration,
        resync_interval: Duration,
    ) -> Self {
        Self {
            store,
            events,
            retry_delay,
            resync_interval,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of watch levels currently running, root levels included.
    pub fn active_watches(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Watch `template` until `token` is cancelled.
    pub async fn run(&self, template: PathTemplate, token: CancellationToken) {
        let name: Arc<str> = Arc::from(template.name());
        let mut known = Endpoints::new();
        info!(template = %template, "Starting tree watch");

        loop {
            known = self
                .clone()
                .watch_level(
                    name.clone(),
                    String::new(),
                    template.segments.clone(),
                    token.child_token(),
                    known,
                )
                .await;

            if token.is_cancelled() {
                break;
            }
            warn!(
                template = %template,
                delay_ms = self.retry_delay.as_millis() as u64,
                "Tree watch root terminated, restarting"
            );
            if !self.pause(&token, self.retry_delay).await {
                break;
            }
        }

        debug!(template = %template, "Tree watch stopped");
    }

    fn watch_level(
        self,
        name: Arc<str>,
        base: String,
        remainder: Vec<String>,
        token: CancellationToken,
        inherited: Endpoints,
    ) -> BoxFuture<'static, Endpoints> {
        async move {
            let _guard = ActiveGuard::new(&self.active);
            match remainder.iter().position(|s| s == WILDCARD) {
                Some(i) => {
                    let fixed = join_path(&base, &remainder[..i]);
                    let rest = remainder[i + 1..].to_vec();
                    self.watch_branch(&name, fixed, rest, &token, inherited)
                        .await
                }
                None => {
                    let path = join_path(&base, &remainder);
                    self.watch_terminal(&name, path, &token, inherited).await
                }
            }
        }
        .boxed()
    }

    fn spawn_level(
        &self,
        name: Arc<str>,
        base: String,
        remainder: Vec<String>,
        parent: &CancellationToken,
        carried: Endpoints,
    ) -> SubWatch {
        let token = parent.child_token();
        let handle = tokio::spawn(self.clone().watch_level(
            name,
            base,
            remainder,
            token.clone(),
            carried,
        ));
        SubWatch { token, handle }
    }

    /// Level with a wildcard: one sub-watch per child of `fixed`.
    async fn watch_branch(
        &self,
        name: &Arc<str>,
        fixed: String,
        rest: Vec<String>,
        token: &CancellationToken,
        inherited: Endpoints,
    ) -> Endpoints {
        let mut children: HashMap<String, SubWatch> = HashMap::new();
        // Endpoints not owned by any running sub-watch.
        let mut orphaned = inherited;

        while !token.is_cancelled() {
            let (names, signal) = match self.store.watch_children(&fixed).await {
                Ok(watch) => watch,
                Err(e) if e.is_no_node() => {
                    debug!(path = %fixed, "Tree path does not exist yet");
                    for (_, sub) in children.drain() {
                        orphaned.extend(sub.stop().await);
                    }
                    self.emit_down_all(token, &mut orphaned).await;
                    if !self.pause(token, self.retry_delay).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(path = %fixed, error = %e, "Tree watch failed, terminating sub-watch");
                    token.cancel();
                    break;
                }
            };
            let present: BTreeSet<String> = names.into_iter().collect();

            let removed: Vec<String> = children
                .keys()
                .filter(|c| !present.contains(*c))
                .cloned()
                .collect();
            for child in removed {
                if let Some(sub) = children.remove(&child) {
                    debug!(path = %fixed, child = %child, "Child removed, cancelling sub-watch");
                    orphaned.extend(sub.stop().await);
                }
            }

            let dead: Vec<String> = children
                .iter()
                .filter(|(_, sub)| sub.handle.is_finished())
                .map(|(child, _)| child.clone())
                .collect();
            for child in dead {
                if let Some(sub) = children.remove(&child) {
                    info!(path = %fixed, child = %child, "Re-creating terminated sub-watch");
                    orphaned.extend(sub.join().await);
                }
            }

            for child in &present {
                if !children.contains_key(child) {
                    let base = child_path(&fixed, child);
                    let carried = take_subtree(&mut orphaned, &base);
                    let sub = self.spawn_level(name.clone(), base, rest.clone(), token, carried);
                    children.insert(child.clone(), sub);
                }
            }

            // Whatever no sub-watch took over is gone.
            self.emit_down_all(token, &mut orphaned).await;

            let settled = |names: &[String]| {
                names.len() == children.len()
                    && names.iter().all(|child| children.contains_key(child))
                    && !children.values().any(|sub| sub.handle.is_finished())
            };
            if !self.wait_for_change(&fixed, token, signal, settled).await {
                break;
            }
        }

        let mut endpoints = orphaned;
        for (_, sub) in children.drain() {
            endpoints.extend(sub.stop().await);
        }
        endpoints
    }

    /// Level without wildcards: every child of `path` is a registration node.
    async fn watch_terminal(
        &self,
        name: &Arc<str>,
        path: String,
        token: &CancellationToken,
        inherited: Endpoints,
    ) -> Endpoints {
        let mut known = inherited;

        while !token.is_cancelled() {
            let (names, signal) = match self.store.watch_children(&path).await {
                Ok(watch) => watch,
                Err(e) if e.is_no_node() => {
                    debug!(path = %path, "Registration path does not exist yet");
                    self.emit_down_all(token, &mut known).await;
                    if !self.pause(token, self.retry_delay).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Tree watch failed, terminating sub-watch");
                    token.cancel();
                    break;
                }
            };
            let present: BTreeSet<String> =
                names.iter().map(|child| child_path(&path, child)).collect();

            let gone_keys: Vec<String> = known
                .keys()
                .filter(|k| !present.contains(*k))
                .cloned()
                .collect();
            let mut gone = Endpoints::new();
            for key in gone_keys {
                if let Some(endpoint) = known.remove(&key) {
                    gone.insert(key, endpoint);
                }
            }
            self.emit_down_all(token, &mut gone).await;
            known.extend(gone);

            let added: Vec<String> = present
                .iter()
                .filter(|p| !known.contains_key(*p))
                .cloned()
                .collect();
            for node_path in added {
                let Some(endpoint) = self.read_endpoint(name, &node_path).await else {
                    continue;
                };
                if !self
                    .emit(token, EndpointChange::Up, &node_path, &endpoint)
                    .await
                {
                    break;
                }
                known.insert(node_path, endpoint);
            }

            let settled = |names: &[String]| {
                names.len() == known.len()
                    && names
                        .iter()
                        .all(|child| known.contains_key(&child_path(&path, child)))
            };
            if !self.wait_for_change(&path, token, signal, settled).await {
                break;
            }
        }

        known
    }

    /// Wait for the child-list signal of `path`. Every resync tick re-reads
    /// the children and returns early unless `settled` accepts them, so a
    /// quiet level keeps its armed watch. False once `token` is cancelled.
    async fn wait_for_change<F>(
        &self,
        path: &str,
        token: &CancellationToken,
        mut signal: oneshot::Receiver<()>,
        settled: F,
    ) -> bool
    where
        F: Fn(&[String]) -> bool,
    {
        loop {
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = &mut signal => return true,
                _ = tokio::time::sleep(self.resync_interval) => {
                    match self.store.get_children(path).await {
                        Ok(names) if settled(&names) => {}
                        Ok(_) => return true,
                        Err(e) => {
                            debug!(path = %path, error = %e, "Resync read failed, re-watching");
                            return true;
                        }
                    }
                }
            }
        }
    }

    async fn read_endpoint(&self, name: &str, node_path: &str) -> Option<Endpoint> {
        match self.store.get(node_path).await {
            Ok(bytes) => match serde_json::from_slice::<ServerInfo>(&bytes) {
                Ok(info) => Some(Endpoint::from_server_info(name, info)),
                Err(e) => {
                    warn!(node = %node_path, error = %e, "Undecodable server info");
                    None
                }
            },
            // Deregistered between list and read.
            Err(e) if e.is_no_node() => None,
            Err(e) => {
                warn!(node = %node_path, error = %e, "Failed to read server info");
                None
            }
        }
    }

    /// Emit `Down` for every endpoint, removing each one that was delivered.
    async fn emit_down_all(&self, token: &CancellationToken, endpoints: &mut Endpoints) {
        while let Some((node_path, endpoint)) = endpoints.pop_first() {
            if !self
                .emit(token, EndpointChange::Down, &node_path, &endpoint)
                .await
            {
                endpoints.insert(node_path, endpoint);
                return;
            }
        }
    }

    async fn emit(
        &self,
        token: &CancellationToken,
        change: EndpointChange,
        node_path: &str,
        endpoint: &Endpoint,
    ) -> bool {
        let event = EndpointEvent {
            change,
            node_path: node_path.to_string(),
            endpoint: endpoint.clone(),
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    /// Sleep for `delay`; false if cancelled first.
    async fn pause(&self, token: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCoordinationStore;
    use bytes::Bytes;

    const WAIT: Duration = Duration::from_secs(2);

    fn server_info(ip: &str, port: u16) -> Bytes {
        Bytes::from(format!(r#"{{"ip":"{}","port":{}}}"#, ip, port))
    }

    fn start(
        store: Arc<MockCoordinationStore>,
        template: &str,
    ) -> (TreeWatcher, mpsc::Receiver<EndpointEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(64);
        let watcher = TreeWatcher::new(
            store,
            tx,
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        let token = CancellationToken::new();
        let template = PathTemplate::parse(template).unwrap();
        let runner = watcher.clone();
        let run_token = token.clone();
        tokio::spawn(async move { runner.run(template, run_token).await });
        (watcher, rx, token)
    }

    async fn next(rx: &mut mpsc::Receiver<EndpointEvent>) -> EndpointEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for endpoint event")
            .expect("event channel closed")
    }

    #[test]
    fn test_parse_template() {
        let template = PathTemplate::parse("gateway:/services/*/nodes").unwrap();
        assert_eq!(template.name(), "gateway");
        assert_eq!(template.path(), "/services/*/nodes");
        assert_eq!(template.wildcard_count(), 1);
        assert_eq!(template.to_string(), "gateway:/services/*/nodes");
    }

    #[test]
    fn test_parse_rejects_malformed_templates() {
        for bad in [
            "no-name-separator",
            ":/a/b",
            "name:relative/path",
            "name:/",
            "name:/a/b*/c",
        ] {
            let err = PathTemplate::parse(bad).unwrap_err();
            assert!(matches!(err, SyncError::InvalidTemplate { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_take_subtree() {
        let endpoint = Endpoint {
            ip: "10.0.0.1".into(),
            port: 1,
            scheme: None,
            name: "x".into(),
            path: None,
        };
        let mut endpoints = Endpoints::new();
        endpoints.insert("/s/a/nodes/n1".into(), endpoint.clone());
        endpoints.insert("/s/ab/nodes/n1".into(), endpoint.clone());
        endpoints.insert("/s/b/nodes/n1".into(), endpoint);

        let taken = take_subtree(&mut endpoints, "/s/a");
        assert_eq!(taken.len(), 1);
        assert!(taken.contains_key("/s/a/nodes/n1"));
        assert_eq!(endpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_up_and_down() {
        let store = Arc::new(MockCoordinationStore::new());
        store
            .create("/services/gw/nodes/n1", server_info("10.0.0.1", 8080))
            .await;

        let (_watcher, mut rx, token) = start(store.clone(), "gateway:/services/gw/nodes");

        let up = next(&mut rx).await;
        assert_eq!(up.change, EndpointChange::Up);
        assert_eq!(up.node_path, "/services/gw/nodes/n1");
        assert_eq!(up.endpoint.name, "gateway");
        assert_eq!(up.endpoint.address(), "10.0.0.1:8080");

        store.remove("/services/gw/nodes/n1").await;
        let down = next(&mut rx).await;
        assert_eq!(down.change, EndpointChange::Down);
        assert_eq!(down.node_path, "/services/gw/nodes/n1");

        token.cancel();
    }

    #[tokio::test]
    async fn test_removed_subtree_only_affects_its_endpoints() {
        let store = Arc::new(MockCoordinationStore::new());
        store
            .create("/services/a/nodes/n1", server_info("10.0.0.1", 80))
            .await;
        store
            .create("/services/b/nodes/n1", server_info("10.0.0.2", 80))
            .await;

        let (watcher, mut rx, token) = start(store.clone(), "svc:/services/*/nodes");

        let mut ups = BTreeSet::new();
        for _ in 0..2 {
            let event = next(&mut rx).await;
            assert_eq!(event.change, EndpointChange::Up);
            ups.insert(event.node_path);
        }
        assert!(ups.contains("/services/a/nodes/n1"));
        assert!(ups.contains("/services/b/nodes/n1"));
        // Root branch plus one terminal level per service.
        assert_eq!(watcher.active_watches(), 3);

        store.remove("/services/a").await;
        let down = next(&mut rx).await;
        assert_eq!(down.change, EndpointChange::Down);
        assert_eq!(down.node_path, "/services/a/nodes/n1");

        // Service b keeps running untouched.
        assert!(
            tokio::time::timeout(Duration::from_millis(300), rx.recv())
                .await
                .is_err()
        );
        assert_eq!(watcher.active_watches(), 2);

        token.cancel();
    }

    #[tokio::test]
    async fn test_missing_path_is_retried() {
        let store = Arc::new(MockCoordinationStore::new());
        let (_watcher, mut rx, token) = start(store.clone(), "svc:/services/*/nodes");

        tokio::time::sleep(Duration::from_millis(120)).await;
        store
            .create("/services/a/nodes/n1", server_info("10.0.0.1", 80))
            .await;

        let up = next(&mut rx).await;
        assert_eq!(up.change, EndpointChange::Up);
        assert_eq!(up.node_path, "/services/a/nodes/n1");

        token.cancel();
    }

    #[tokio::test]
    async fn test_failed_sub_watch_is_recreated_by_parent() {
        let store = Arc::new(MockCoordinationStore::new());
        store
            .create("/services/a/nodes/n1", server_info("10.0.0.1", 80))
            .await;
        store.set_failing("/services/a/nodes", true).await;

        let (_watcher, mut rx, token) = start(store.clone(), "svc:/services/*/nodes");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());

        store.set_failing("/services/a/nodes", false).await;
        let up = next(&mut rx).await;
        assert_eq!(up.change, EndpointChange::Up);

        token.cancel();
    }

    #[tokio::test]
    async fn test_recreated_sub_watch_does_not_repeat_up() {
        let store = Arc::new(MockCoordinationStore::new());
        store
            .create("/services/a/nodes/n1", server_info("10.0.0.1", 80))
            .await;

        let (_watcher, mut rx, token) = start(store.clone(), "svc:/services/*/nodes");
        assert_eq!(next(&mut rx).await.change, EndpointChange::Up);

        // Kill the terminal level, then let it come back.
        store.set_failing("/services/a/nodes", true).await;
        store
            .create("/services/a/nodes/n2", server_info("10.0.0.2", 80))
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        store.set_failing("/services/a/nodes", false).await;

        let event = next(&mut rx).await;
        assert_eq!(event.change, EndpointChange::Up);
        assert_eq!(event.node_path, "/services/a/nodes/n2");
        assert!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );

        token.cancel();
    }

    #[tokio::test]
    async fn test_quiet_resync_keeps_armed_watches() {
        let store = Arc::new(MockCoordinationStore::new());
        store
            .create("/services/a/nodes/n1", server_info("10.0.0.1", 80))
            .await;

        let (_watcher, mut rx, token) = start(store.clone(), "svc:/services/*/nodes");
        assert_eq!(next(&mut rx).await.change, EndpointChange::Up);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Several resync ticks with nothing changed.
        let calls = store.watch_calls();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.watch_calls(), calls);

        // The armed watches still fire.
        store
            .create("/services/b/nodes/n1", server_info("10.0.0.2", 80))
            .await;
        let up = next(&mut rx).await;
        assert_eq!(up.node_path, "/services/b/nodes/n1");

        token.cancel();
    }

    #[tokio::test]
    async fn test_cancel_stops_every_level() {
        let store = Arc::new(MockCoordinationStore::new());
        for svc in ["a", "b", "c"] {
            store
                .create(
                    &format!("/services/{}/nodes/n1", svc),
                    server_info("10.0.0.1", 80),
                )
                .await;
        }

        let (watcher, mut rx, token) = start(store.clone(), "svc:/services/*/nodes");
        for _ in 0..3 {
            next(&mut rx).await;
        }
        assert_eq!(watcher.active_watches(), 4);

        token.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(watcher.active_watches(), 0);
    }
}
