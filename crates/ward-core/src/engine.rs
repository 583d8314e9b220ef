//! Dispatches actions onto worker pools and tracks them.
//!
//! Top-level actions and child actions run on two independent pools: a
//! parent blocked on its children never occupies a slot the children need.

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::{Action, ActionContext, ActionError, ActionLogic, ActionStatus};
use crate::cluster::Cluster;
use crate::collaborators::{Alert, AlertLevel, Collaborators};
use crate::config::WardConfig;
use crate::error::{Result, WardError};
use crate::pool::WorkerPool;

const ALERT_LOG_CAPACITY: usize = 1_024;

pub struct ActionEngine {
    cluster: Arc<Cluster>,
    config: WardConfig,
    collaborators: Collaborators,
    parent_pool: WorkerPool,
    child_pool: WorkerPool,
    tracked: RwLock<BTreeMap<Uuid, Arc<Action>>>,
    alert_log: Mutex<VecDeque<Alert>>,
    /// Top-level actions queued or running.
    active: AtomicUsize,
    shutdown: CancellationToken,
}

impl ActionEngine {
    /// Validate `config`, spawn both worker pools and the prune task.
    /// Must be called from within a tokio runtime.
    pub fn start(
        cluster: Arc<Cluster>,
        config: WardConfig,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>> {
        config.ensure_valid()?;
        tokio::runtime::Handle::try_current().map_err(|_| WardError::NoRuntime)?;

        let shutdown = CancellationToken::new();
        let engine = Arc::new_cyclic(|weak| {
            let parent_pool = WorkerPool::spawn(
                "parent",
                config.engine.parent_workers,
                config.engine.parent_queue,
                weak.clone(),
                shutdown.clone(),
            );
            let child_pool = WorkerPool::spawn(
                "child",
                config.engine.child_workers,
                config.engine.child_queue,
                weak.clone(),
                shutdown.clone(),
            );
            Self {
                cluster,
                config,
                collaborators,
                parent_pool,
                child_pool,
                tracked: RwLock::new(BTreeMap::new()),
                alert_log: Mutex::new(VecDeque::new()),
                active: AtomicUsize::new(0),
                shutdown,
            }
        });
        engine.spawn_pruner();
        info!(
            cluster = %engine.cluster.name(),
            parent_workers = engine.config.engine.parent_workers,
            child_workers = engine.config.engine.child_workers,
            "action engine started"
        );
        Ok(engine)
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn config(&self) -> &WardConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Submit a top-level action. The action must carry an owner.
    pub async fn dispatch(self: &Arc<Self>, action: Action) -> Result<Arc<Action>> {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.dispatch_reserved(action).await
    }

    /// Dispatch only when no other top-level action is queued or running.
    /// Returns `None` when something is already in flight.
    pub async fn dispatch_now(self: &Arc<Self>, action: Action) -> Result<Option<Arc<Action>>> {
        if let Err(active) = self
            .active
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
        {
            debug!(action = %action.name(), active, "engine busy, not dispatching");
            return Ok(None);
        }
        self.dispatch_reserved(action).await.map(Some)
    }

    /// Dispatch with a slot in `active` already taken. The slot is given
    /// back when the action is refused.
    async fn dispatch_reserved(self: &Arc<Self>, action: Action) -> Result<Arc<Action>> {
        let action = match self.admit(action) {
            Ok(action) => action,
            Err(e) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };

        let name = action.name();
        let owner = action.owner().unwrap_or_default();
        info!(action_id = %action.id(), action = %name, %owner, "action dispatched");
        self.alert(
            AlertLevel::Medium,
            format!(
                "{name} triggered on cluster {} by {owner}",
                self.cluster.name()
            ),
        )
        .await;
        Ok(action)
    }

    fn admit(self: &Arc<Self>, mut action: Action) -> Result<Arc<Action>> {
        let name = action.name();
        if action.owner().is_none() {
            return Err(WardError::MissingOwner(name));
        }
        let kind = action.kind().kind_name();
        if self.config.engine.blocked_actions.iter().any(|b| b == kind) {
            warn!(action = %name, kind, cluster = %self.cluster.name(), "action is blocked");
            return Err(WardError::Blocked {
                action: name,
                cluster: self.cluster.name().to_string(),
            });
        }
        action.initialize(&self.config)?;

        let action = Arc::new(action);
        action.bind_engine(self);
        self.write_tracked().insert(action.id(), action.clone());
        if let Err(reason) = self.parent_pool.submit(action.clone()) {
            self.write_tracked().remove(&action.id());
            warn!(action = %name, %reason, "dispatch rejected");
            return Err(WardError::Rejected { action: name, reason });
        }
        Ok(action)
    }

    /// Submit `child` on behalf of a running `parent`. The child takes the
    /// parent's owner and engine and is appended to the parent's children.
    pub fn dispatch_child(self: &Arc<Self>, parent: &Arc<Action>, mut child: Action) -> Result<Arc<Action>> {
        if parent.status() != ActionStatus::Running {
            return Err(WardError::ParentNotRunning(parent.name()));
        }
        if let Some(owner) = parent.owner() {
            child.set_owner(owner);
        }
        child.initialize(&self.config)?;

        let child = Arc::new(child);
        child.bind_engine(self);
        child.bind_parent(parent.id());
        parent.push_child(child.clone())?;
        if let Err(reason) = self.child_pool.submit(child.clone()) {
            // Already visible to the parent; settle it so nobody waits forever.
            child.mark_failed(format!("rejected: {reason}"));
            warn!(parent = %parent.name(), child = %child.name(), %reason, "child dispatch rejected");
            return Err(WardError::Rejected {
                action: child.name(),
                reason,
            });
        }
        debug!(parent = %parent.name(), child = %child.name(), "child dispatched");
        Ok(child)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    pub(crate) async fn execute(self: Arc<Self>, action: Arc<Action>) {
        if action.begin() {
            let ctx = ActionContext::new(action.clone(), self.clone());
            let outcome = AssertUnwindSafe(action.kind().run(&ctx))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {
                    action.mark_succeeded();
                }
                Ok(Err(ActionError::Cancelled)) => {
                    action.mark_cancelled();
                }
                Ok(Err(e)) => {
                    let timed_out = matches!(e, ActionError::Timeout { .. });
                    warn!(action_id = %action.id(), action = %action.name(), timed_out, error = %e, "action failed");
                    action.mark_failed(&e);
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(action_id = %action.id(), action = %action.name(), %message, "action panicked");
                    action.mark_failed(format!("action panicked: {message}"));
                }
            }
        } else {
            debug!(action_id = %action.id(), "skipping action cancelled before it started");
        }

        if action.parent_id().is_none() {
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.audit(&action).await;
        }
    }

    async fn audit(&self, action: &Action) {
        let Some(auditor) = self.collaborators.auditor.clone() else {
            return;
        };
        let record = action.audit_record(self.cluster.name());
        let written = tokio::task::spawn_blocking(move || auditor.record(&record)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(action_id = %action.id(), error = %e, "failed to audit action"),
            Err(e) => warn!(action_id = %action.id(), error = %e, "audit task join error"),
        }
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    /// Forward an alert. Delivery failures are logged, never returned.
    pub async fn alert(&self, level: AlertLevel, message: impl Into<String>) {
        let alert = Alert {
            level,
            cluster: self.cluster.name().to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        };
        {
            let mut log = self.alert_log.lock().unwrap_or_else(PoisonError::into_inner);
            if log.len() == ALERT_LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(alert.clone());
        }
        if let Err(e) = self.collaborators.alerts.send(&alert).await {
            warn!(level = %alert.level, message = %alert.message, error = %e, "failed to deliver alert");
        }
    }

    /// Recent alerts, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alert_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Tracked actions
    // -----------------------------------------------------------------------

    pub fn tracked(&self, id: Uuid) -> Option<Arc<Action>> {
        self.read_tracked().get(&id).cloned()
    }

    /// Tracked top-level actions, oldest first.
    pub fn tracked_actions(&self) -> Vec<Arc<Action>> {
        let mut actions: Vec<Arc<Action>> = self.read_tracked().values().cloned().collect();
        actions.sort_by_key(|a| a.created_at());
        actions
    }

    pub fn active_actions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Drop finished actions that completed more than the configured TTL
    /// before `now`. Returns how many were removed.
    pub fn prune_tracked(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.config.engine.tracked_action_ttl())
            .unwrap_or(chrono::Duration::MAX);
        let mut tracked = self.write_tracked();
        let before = tracked.len();
        tracked.retain(|_, a| match a.completed_at() {
            Some(done) if a.is_done() => now - done <= ttl,
            _ => true,
        });
        before - tracked.len()
    }

    fn spawn_pruner(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let every = self.config.engine.prune_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                let Some(engine) = weak.upgrade() else { break };
                let pruned = engine.prune_tracked(Utc::now());
                if pruned > 0 {
                    debug!(pruned, "pruned expired actions");
                }
            }
        });
    }

    /// Cancel every unfinished top-level action and stop the workers once
    /// their current action returns.
    pub fn shutdown(&self) {
        for action in self.read_tracked().values() {
            if !action.is_done() {
                action.cancel(true);
            }
        }
        self.shutdown.cancel();
        info!(cluster = %self.cluster.name(), "action engine shutting down");
    }

    fn read_tracked(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<Uuid, Arc<Action>>> {
        self.tracked.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tracked(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<Uuid, Arc<Action>>> {
        self.tracked.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ActionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionEngine")
            .field("cluster", &self.cluster.name())
            .field("active", &self.active_actions())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
