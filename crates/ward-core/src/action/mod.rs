//! Long-running, cancellable, hierarchical units of work.
//!
//! An [`Action`] is built with an [`ActionKind`], configured, then handed
//! to the [`ActionEngine`](crate::engine::ActionEngine), which wraps it in
//! an `Arc` and runs it on a worker. From then on the handle is shared by
//! the engine, the parent (for children) and any number of waiters.
//!
//! Status lives on a `watch` channel: transitions are compare-and-set under
//! the channel lock, so the first terminal status wins and every waiter
//! observes the same result.

pub mod kind;
pub mod node_task;
pub mod recovery;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::attribute::{Attribute, AttributeStore};
use crate::cluster::Cluster;
use crate::collaborators::{AlertLevel, CollaboratorError};
use crate::config::WardConfig;
use crate::engine::ActionEngine;
use crate::error::WardError;

pub use kind::ActionKind;

// ---------------------------------------------------------------------------
// ActionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionStatus::Succeeded | ActionStatus::Failed | ActionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Running => "running",
            ActionStatus::Succeeded => "succeeded",
            ActionStatus::Failed => "failed",
            ActionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why an action's run did not succeed.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("{what} did not complete in time (waited {after:?})")]
    Timeout { what: String, after: Duration },

    #[error("{call} failed: {source}")]
    Collaborator {
        call: String,
        source: CollaboratorError,
    },

    #[error("{0}")]
    Failed(String),

    /// Not a failure: the run unwound after a cancellation request.
    #[error("action cancelled")]
    Cancelled,
}

impl ActionError {
    pub fn collaborator(call: impl Into<String>, source: CollaboratorError) -> Self {
        ActionError::Collaborator {
            call: call.into(),
            source,
        }
    }
}

impl From<WardError> for ActionError {
    fn from(e: WardError) -> Self {
        ActionError::Precondition(e.to_string())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum WaitError {
    #[error("timed out after {after:?} waiting for action '{action}'")]
    Timeout { action: String, after: Duration },
}

// ---------------------------------------------------------------------------
// ActionResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub out: String,
    pub err: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl ActionResult {
    fn append(buf: &mut String, line: &str) {
        if !buf.is_empty() && !buf.ends_with('\n') {
            buf.push('\n');
        }
        buf.push_str(line);
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub key: String,
    pub description: String,
    pub required: bool,
}

impl SchemaField {
    pub fn required(key: &str, description: &str) -> Self {
        Self {
            key: key.to_string(),
            description: description.to_string(),
            required: true,
        }
    }

    pub fn optional(key: &str, description: &str) -> Self {
        Self {
            key: key.to_string(),
            description: description.to_string(),
            required: false,
        }
    }
}

/// Attributes an action reads, for callers building dispatch requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSchema {
    pub action: String,
    pub fields: Vec<SchemaField>,
}

// ---------------------------------------------------------------------------
// ActionLogic
// ---------------------------------------------------------------------------

/// Capability interface every action variant implements.
#[async_trait]
pub trait ActionLogic: Send + Sync {
    /// Stable kind name, used for blocking and audit.
    fn kind_name(&self) -> &'static str;

    /// Short human name without per-invocation context.
    fn label(&self) -> String;

    fn display_name(&self, _attributes: &AttributeStore) -> String {
        self.label()
    }

    /// Apply static configuration. Errors abort dispatch.
    fn initialize(&mut self, _config: &WardConfig) -> crate::Result<()> {
        Ok(())
    }

    fn schema(&self) -> AttributeSchema;

    async fn run(&self, ctx: &ActionContext) -> Result<(), ActionError>;
}

/// Builds a fresh child variant for each target node.
pub type ChildFactory = Arc<dyn Fn() -> ActionKind + Send + Sync>;

// ---------------------------------------------------------------------------
// AuditRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub cluster: String,
    pub kind: String,
    pub name: String,
    pub owner: Option<String>,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: ActionResult,
    #[serde(default)]
    pub children: Vec<Uuid>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

pub struct Action {
    id: Uuid,
    kind: ActionKind,
    owner: RwLock<Option<String>>,
    attributes: AttributeStore,
    children: Mutex<Vec<Arc<Action>>>,
    result: Mutex<ActionResult>,
    status: watch::Sender<ActionStatus>,
    cancel_requested: CancellationToken,
    interrupt: CancellationToken,
    parent: OnceLock<Uuid>,
    engine: OnceLock<Weak<ActionEngine>>,
    created_at: DateTime<Utc>,
    completed_at: Mutex<Option<DateTime<Utc>>>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        let (status, _) = watch::channel(ActionStatus::Pending);
        Self {
            id: Uuid::new_v4(),
            kind,
            owner: RwLock::new(None),
            attributes: AttributeStore::new(),
            children: Mutex::new(Vec::new()),
            result: Mutex::new(ActionResult::default()),
            status,
            cancel_requested: CancellationToken::new(),
            interrupt: CancellationToken::new(),
            parent: OnceLock::new(),
            engine: OnceLock::new(),
            created_at: Utc::now(),
            completed_at: Mutex::new(None),
        }
    }

    pub fn with_owner(self, owner: impl Into<String>) -> Self {
        self.set_owner(owner);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    pub fn name(&self) -> String {
        self.kind.display_name(&self.attributes)
    }

    pub fn owner(&self) -> Option<String> {
        self.owner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_owner(&self, owner: impl Into<String>) {
        *self.owner.write().unwrap_or_else(PoisonError::into_inner) = Some(owner.into());
    }

    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent.get().copied()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.completed_at)
    }

    /// Apply static configuration before dispatch.
    pub fn initialize(&mut self, config: &WardConfig) -> crate::Result<()> {
        self.kind.initialize(config)
    }

    pub(crate) fn bind_engine(&self, engine: &Arc<ActionEngine>) {
        let _ = self.engine.set(Arc::downgrade(engine));
    }

    pub(crate) fn bind_parent(&self, parent: Uuid) {
        let _ = self.parent.set(parent);
    }

    /// The engine this action was dispatched on, if it is still alive.
    pub fn engine(&self) -> Option<Arc<ActionEngine>> {
        self.engine.get().and_then(Weak::upgrade)
    }

    // -----------------------------------------------------------------------
    // Children
    // -----------------------------------------------------------------------

    pub fn children(&self) -> Vec<Arc<Action>> {
        lock(&self.children).clone()
    }

    pub(crate) fn push_child(&self, child: Arc<Action>) -> crate::Result<()> {
        let mut children = lock(&self.children);
        if self.status() != ActionStatus::Running {
            return Err(WardError::ParentNotRunning(self.name()));
        }
        children.push(child);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Result buffer
    // -----------------------------------------------------------------------

    pub fn result(&self) -> ActionResult {
        lock(&self.result).clone()
    }

    pub fn append_out(&self, line: &str) {
        ActionResult::append(&mut lock(&self.result).out, line);
    }

    pub fn append_err(&self, line: &str) {
        ActionResult::append(&mut lock(&self.result).err, line);
    }

    pub fn set_exit_code(&self, code: i32) {
        lock(&self.result).exit_code = Some(code);
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn status(&self) -> ActionStatus {
        *self.status.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.is_cancelled() || self.status() == ActionStatus::Cancelled
    }

    /// Pending -> Running. False if the action was cancelled before it ran.
    pub(crate) fn begin(&self) -> bool {
        let started = self.status.send_if_modified(|s| {
            if *s == ActionStatus::Pending {
                *s = ActionStatus::Running;
                true
            } else {
                false
            }
        });
        if started {
            debug!(action_id = %self.id, action = %self.name(), "action running");
        }
        started
    }

    fn finish(&self, status: ActionStatus) -> bool {
        let changed = self.status.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = status;
                true
            }
        });
        if changed {
            *lock(&self.completed_at) = Some(Utc::now());
            info!(action_id = %self.id, action = %self.name(), status = %status, "action finished");
        }
        changed
    }

    /// First terminal status wins; later calls are no-ops.
    pub fn mark_succeeded(&self) -> bool {
        self.finish(ActionStatus::Succeeded)
    }

    pub fn mark_failed(&self, reason: impl std::fmt::Display) -> bool {
        let reason = reason.to_string();
        let changed = self.finish(ActionStatus::Failed);
        if changed {
            self.append_err(&reason);
        }
        changed
    }

    pub(crate) fn mark_cancelled(&self) -> bool {
        self.finish(ActionStatus::Cancelled)
    }

    /// Request cooperative cancellation. A pending action is cancelled on
    /// the spot; a running one sees `is_cancelled()` at its next safe point,
    /// and with `may_interrupt` its suspended waits wake early. Returns
    /// false if the action had already finished.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        if self.is_done() {
            return false;
        }
        self.cancel_requested.cancel();
        if may_interrupt {
            self.interrupt.cancel();
        }
        let was_pending = self.status.send_if_modified(|s| {
            if *s == ActionStatus::Pending {
                *s = ActionStatus::Cancelled;
                true
            } else {
                false
            }
        });
        if was_pending {
            *lock(&self.completed_at) = Some(Utc::now());
        }
        info!(action_id = %self.id, action = %self.name(), may_interrupt, "cancellation requested");
        true
    }

    /// Wait for a terminal status.
    pub async fn wait(&self) -> ActionStatus {
        let mut rx = self.status.subscribe();
        let status = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(s) => *s,
            Err(_) => self.status(),
        };
        status
    }

    /// Wait for a terminal status, up to `timeout` when given.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<ActionStatus, WaitError> {
        match timeout {
            None => Ok(self.wait().await),
            Some(after) => tokio::time::timeout(after, self.wait())
                .await
                .map_err(|_| WaitError::Timeout {
                    action: self.name(),
                    after,
                }),
        }
    }

    pub fn audit_record(&self, cluster: &str) -> AuditRecord {
        AuditRecord {
            id: self.id,
            cluster: cluster.to_string(),
            kind: self.kind.kind_name().to_string(),
            name: self.name(),
            owner: self.owner(),
            status: self.status(),
            created_at: self.created_at,
            completed_at: self.completed_at(),
            result: self.result(),
            children: self.children().iter().map(|c| c.id()).collect(),
            attributes: self.attributes.exposed(),
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// ActionContext
// ---------------------------------------------------------------------------

/// What a running action sees: itself and the engine it runs on.
#[derive(Clone)]
pub struct ActionContext {
    action: Arc<Action>,
    engine: Arc<ActionEngine>,
}

impl ActionContext {
    pub(crate) fn new(action: Arc<Action>, engine: Arc<ActionEngine>) -> Self {
        Self { action, engine }
    }

    pub fn action(&self) -> &Arc<Action> {
        &self.action
    }

    pub fn engine(&self) -> &Arc<ActionEngine> {
        &self.engine
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        self.engine.cluster()
    }

    pub fn config(&self) -> &WardConfig {
        self.engine.config()
    }

    pub fn attributes(&self) -> &AttributeStore {
        self.action.attributes()
    }

    pub fn is_cancelled(&self) -> bool {
        self.action.is_cancelled()
    }

    /// Sleep for `duration`. Returns false when woken by an interrupting
    /// cancellation.
    pub async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.action.interrupt.cancelled() => false,
        }
    }

    /// Resolves once any cancellation has been requested, interrupting or
    /// not.
    pub async fn cancel_requested(&self) {
        self.action.cancel_requested.cancelled().await
    }

    pub async fn alert(&self, level: AlertLevel, message: impl Into<String>) {
        self.engine.alert(level, message).await;
    }

    pub fn dispatch_child(&self, child: Action) -> crate::Result<Arc<Action>> {
        self.engine.dispatch_child(&self.action, child)
    }

    /// Wait for `child` to settle. Cancelling this action, cooperatively or
    /// not, interrupts the child before waiting for it to unwind.
    pub async fn await_child(&self, child: &Arc<Action>) -> ActionStatus {
        tokio::select! {
            status = child.wait() => status,
            _ = self.action.cancel_requested.cancelled() => {
                child.cancel(true);
                child.wait().await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
