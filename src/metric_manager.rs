//! Role gating.
//!
//! The [`MetricManager`] consumes leader-election notifications. Becoming
//! Master starts a *term*: a fresh event queue, a [`Pipeline`], a
//! [`WatcherManager`] and the dispatch loop that feeds one into the other.
//! Becoming Slave (or shutting down) cancels the term's token and awaits
//! everything it started, so no watcher, subscription or queued action
//! outlives the role.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fleetwatch::metric_manager::MetricManager;
//! use fleetwatch::types::Role;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(ctx: fleetwatch::cluster_watcher::SyncContext) {
//! let (roles_tx, roles_rx) = tokio::sync::mpsc::channel(8);
//! let manager = Arc::new(MetricManager::new(ctx, CancellationToken::new()));
//!
//! let runner = manager.clone();
//! tokio::spawn(async move { runner.run(roles_rx).await });
//! roles_tx.send(Role::Master).await.ok();
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actions::ActionContext;
use crate::cluster_watcher::SyncContext;
use crate::constants::SHUTDOWN_TIMEOUT_SECS;
use crate::metrics::{record_dropped_event, set_master};
use crate::pipeline::Pipeline;
use crate::types::{MetricEvent, Role};
use crate::watcher_manager::WatcherManager;

/// Everything started for one Master term.
struct Term {
    token: CancellationToken,
    watchers: Arc<WatcherManager>,
    discovery: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

impl Term {
    async fn stop(self) {
        self.token.cancel();
        let timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        for (name, handle) in [("discovery", self.discovery), ("dispatch", self.dispatch)] {
            match tokio::time::timeout(timeout * 2, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "Term task failed"),
                Err(_) => warn!(task = name, "Term task did not stop in time"),
            }
        }
    }
}

/// Starts and stops the reconciliation engine as the role changes.
pub struct MetricManager {
    ctx: SyncContext,
    actions: Arc<ActionContext>,
    is_master: Arc<AtomicBool>,
    term: RwLock<Option<Term>>,
    token: CancellationToken,
}

impl MetricManager {
    /// `token` is the top-level scope; every term runs under a child of it.
    pub fn new(ctx: SyncContext, token: CancellationToken) -> Self {
        let actions = Arc::new(ActionContext::new(
            ctx.store.clone(),
            ctx.drivers.clone(),
            ctx.health.clone(),
            ctx.config.clone(),
        ));
        Self {
            ctx,
            actions,
            is_master: Arc::new(AtomicBool::new(false)),
            term: RwLock::new(None),
            token,
        }
    }

    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }

    /// Clusters watched in the current term. Empty while Slave.
    pub async fn running_clusters(&self) -> Vec<String> {
        match self.term.read().await.as_ref() {
            Some(term) => term.watchers.running_clusters().await,
            None => Vec::new(),
        }
    }

    /// Apply role notifications until the queue closes or the token is
    /// cancelled, then tear down the current term.
    pub async fn run(&self, mut roles: mpsc::Receiver<Role>) {
        loop {
            let role = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                role = roles.recv() => match role {
                    Some(role) => role,
                    None => break,
                },
            };
            self.apply_role(role).await;
        }
        self.apply_role(Role::Slave).await;
        debug!("Metric manager stopped");
    }

    /// Switch to `role`. Repeating the current role is a no-op.
    pub async fn apply_role(&self, role: Role) {
        match role {
            Role::Master => self.become_master().await,
            Role::Slave => self.become_slave().await,
        }
    }

    async fn become_master(&self) {
        let mut term = self.term.write().await;
        if term.is_some() || self.token.is_cancelled() {
            return;
        }

        let token = self.token.child_token();
        let (events_tx, events_rx) = mpsc::channel(self.ctx.config.event_queue_capacity.max(1));
        let pipeline = Pipeline::start(
            self.ctx.config.pipeline_workers,
            self.ctx.config.worker_queue_capacity,
            token.child_token(),
        );
        let watchers = Arc::new(WatcherManager::new(
            self.ctx.clone(),
            events_tx,
            token.child_token(),
        ));

        self.is_master.store(true, Ordering::SeqCst);
        set_master(true);

        let discovery = tokio::spawn({
            let watchers = watchers.clone();
            async move { watchers.run().await }
        });
        let dispatch = tokio::spawn(dispatch(
            events_rx,
            pipeline,
            self.actions.clone(),
            self.is_master.clone(),
            token.clone(),
        ));

        *term = Some(Term {
            token,
            watchers,
            discovery,
            dispatch,
        });
        info!("Became master, reconciliation started");
    }

    async fn become_slave(&self) {
        let Some(term) = self.term.write().await.take() else {
            return;
        };
        self.is_master.store(false, Ordering::SeqCst);
        set_master(false);
        info!("Lost master role, stopping reconciliation");
        term.stop().await;
        info!("Reconciliation stopped");
    }
}

async fn dispatch(
    mut events: mpsc::Receiver<MetricEvent>,
    mut pipeline: Pipeline,
    actions: Arc<ActionContext>,
    is_master: Arc<AtomicBool>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        // Events produced just before a role change are discarded.
        if !is_master.load(Ordering::SeqCst) {
            debug!(key = %event.routing_key(), "Not master, dropping event");
            record_dropped_event("not_master");
            continue;
        }

        let key = event.routing_key();
        if let Err(e) = pipeline.submit(&key, actions.task(event)).await {
            debug!(error = %e, "Pipeline closed, stopping dispatch");
            break;
        }
    }
    pipeline
        .shutdown(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS))
        .await;
}
