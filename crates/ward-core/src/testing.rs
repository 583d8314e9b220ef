//! In-memory collaborators for tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::action::node_task::{MaintenancePolicy, NodeOperation, NodeTask};
use crate::action::{Action, ActionContext, ActionError, ActionKind, AuditRecord};
use crate::attribute::keys;
use crate::cluster::{Cluster, ClusterSnapshot};
use crate::collaborators::{
    ActionAuditor, Alert, AlertSink, CollaboratorError, ComputeLifecycle, HealthSignal,
    InstanceState, NodeHealthReport, NodeHealthSource, ShardReplicas, StateSink, TopologySource,
};
use crate::config::WardConfig;
use crate::node::Node;

/// Config with millisecond intervals and no post-operation health wait.
pub fn fast_config() -> WardConfig {
    let mut config = WardConfig::default();
    config.cluster.id = "test".to_string();
    config.cluster.name = Some("test".to_string());
    config.scheduler.checking_interval_ms = 10;
    config.node_task.wait_for_recovery = false;
    config.node_task.health_check_interval_ms = 5;
    config.recovery.retry_backoff_ms = 1;
    config.engine.prune_interval_secs = 3_600;
    config
}

/// A cluster named `test` with healthy nodes `"0"` .. `n-1`.
pub fn test_cluster(n: usize) -> Arc<Cluster> {
    let cluster = Cluster::new("test", "test");
    let now = Utc::now();
    for i in 0..n {
        let mut node = Node::new(i.to_string());
        node.agent = Some(HealthSignal::new(true, now));
        node.service = Some(HealthSignal::new(true, now));
        cluster.upsert_node(node);
    }
    Arc::new(cluster)
}

pub fn node_action(op: &Arc<ScriptedOperation>, node_id: &str) -> Action {
    let action = Action::new(ActionKind::Node(NodeTask::new(op.clone())));
    action
        .attributes()
        .set(keys::NODE_ID, &node_id.to_string())
        .expect("node id serializes");
    action
}

pub fn noop_kind() -> ActionKind {
    ActionKind::Node(NodeTask::new(Arc::new(ScriptedOperation::new("noop"))))
}

pub fn shard(name: &str, replicas: &[&str]) -> ShardReplicas {
    ShardReplicas {
        shard: name.to_string(),
        replicas: replicas.iter().map(|s| s.to_string()).collect(),
        in_sync: replicas.iter().map(|s| s.to_string()).collect(),
    }
}

// ---------------------------------------------------------------------------
// ScriptedOperation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Outcome {
    ExitCode(i32),
    Error(String),
    /// Succeed after sleeping; interrupting cancellation cuts it short.
    Sleep(Duration),
    Panic,
}

/// Node operation whose per-node behavior is scripted, recording every
/// start and the set of nodes running at that moment.
pub struct ScriptedOperation {
    name: String,
    delay: Duration,
    outcomes: HashMap<String, Outcome>,
    started: Mutex<Vec<String>>,
    running: Mutex<BTreeSet<String>>,
    concurrent: Mutex<Vec<BTreeSet<String>>>,
    max_running: AtomicUsize,
    maintenance: MaintenancePolicy,
    maintenance_seen: Mutex<Vec<bool>>,
}

impl ScriptedOperation {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            outcomes: HashMap::new(),
            started: Mutex::new(Vec::new()),
            running: Mutex::new(BTreeSet::new()),
            concurrent: Mutex::new(Vec::new()),
            max_running: AtomicUsize::new(0),
            maintenance: MaintenancePolicy::None,
            maintenance_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_maintenance(mut self, policy: MaintenancePolicy) -> Self {
        self.maintenance = policy;
        self
    }

    /// The node's maintenance flag as seen at each start.
    pub fn maintenance_seen(&self) -> Vec<bool> {
        self.maintenance_seen.lock().unwrap().clone()
    }

    /// Default run time for nodes without a scripted outcome.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_outcome(mut self, node_id: &str, outcome: Outcome) -> Self {
        self.outcomes.insert(node_id.to_string(), outcome);
        self
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Running sets observed at each start.
    pub fn concurrent_sets(&self) -> Vec<BTreeSet<String>> {
        self.concurrent.lock().unwrap().clone()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

struct RunningGuard<'a> {
    op: &'a ScriptedOperation,
    node: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.op.running.lock().unwrap().remove(&self.node);
    }
}

#[async_trait]
impl NodeOperation for ScriptedOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn maintenance_policy(&self) -> MaintenancePolicy {
        self.maintenance
    }

    async fn execute(&self, node: &Node, ctx: &ActionContext) -> Result<i32, ActionError> {
        self.started.lock().unwrap().push(node.id.clone());
        self.maintenance_seen
            .lock()
            .unwrap()
            .push(ctx.cluster().node(&node.id).is_some_and(|n| n.maintenance));
        {
            let mut running = self.running.lock().unwrap();
            running.insert(node.id.clone());
            self.max_running.fetch_max(running.len(), Ordering::SeqCst);
            self.concurrent.lock().unwrap().push(running.clone());
        }
        let _guard = RunningGuard {
            op: self,
            node: node.id.clone(),
        };

        match self.outcomes.get(&node.id).cloned() {
            Some(Outcome::ExitCode(code)) => {
                ctx.pause(self.delay).await;
                Ok(code)
            }
            Some(Outcome::Error(message)) => {
                ctx.pause(self.delay).await;
                Err(ActionError::Failed(message))
            }
            Some(Outcome::Sleep(d)) => {
                if ctx.pause(d).await {
                    Ok(0)
                } else {
                    Err(ActionError::Cancelled)
                }
            }
            Some(Outcome::Panic) => panic!("scripted panic on node {}", node.id),
            None => {
                if ctx.pause(self.delay).await {
                    Ok(0)
                } else {
                    Err(ActionError::Cancelled)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Alerting / audit / state
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.alerts().into_iter().map(|a| a.message).collect()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), CollaboratorError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

pub struct FailingAlertSink;

#[async_trait]
impl AlertSink for FailingAlertSink {
    async fn send(&self, _alert: &Alert) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Terminal("pager unreachable".to_string()))
    }
}

#[derive(Default)]
pub struct MemoryAuditor {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditor {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl ActionAuditor for MemoryAuditor {
    fn record(&self, record: &AuditRecord) -> crate::Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStateSink {
    snapshots: Mutex<HashMap<String, ClusterSnapshot>>,
}

impl StateSink for MemoryStateSink {
    fn serialize(&self, snapshot: &ClusterSnapshot) -> crate::Result<()> {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    fn deserialize(&self, cluster_id: &str) -> crate::Result<Option<ClusterSnapshot>> {
        Ok(self.snapshots.lock().unwrap().get(cluster_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Topology / health / compute
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StaticTopology {
    shards: Mutex<Vec<ShardReplicas>>,
    calls: AtomicUsize,
}

impl StaticTopology {
    pub fn new(shards: Vec<ShardReplicas>) -> Self {
        Self {
            shards: Mutex::new(shards),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, shards: Vec<ShardReplicas>) {
        *self.shards.lock().unwrap() = shards;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TopologySource for StaticTopology {
    async fn shards(&self, _cluster_id: &str) -> Result<Vec<ShardReplicas>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.shards.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct StaticHealth {
    reports: Mutex<Vec<NodeHealthReport>>,
}

impl StaticHealth {
    pub fn set(&self, reports: Vec<NodeHealthReport>) {
        *self.reports.lock().unwrap() = reports;
    }
}

#[async_trait]
impl NodeHealthSource for StaticHealth {
    async fn node_health(
        &self,
        _cluster_id: &str,
    ) -> Result<Vec<NodeHealthReport>, CollaboratorError> {
        Ok(self.reports.lock().unwrap().clone())
    }
}

/// Compute collaborator that records calls. `launch` fails transiently
/// `launch_failures` times before succeeding.
#[derive(Default)]
pub struct FakeCompute {
    calls: Mutex<Vec<String>>,
    launch_failures: AtomicUsize,
    settle_state: Mutex<Option<InstanceState>>,
}

impl FakeCompute {
    pub fn failing_launches(n: usize) -> Self {
        Self {
            launch_failures: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    pub fn settling_in(state: InstanceState) -> Self {
        Self {
            settle_state: Mutex::new(Some(state)),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComputeLifecycle for FakeCompute {
    async fn terminate(&self, node_id: &str) -> Result<(), CollaboratorError> {
        self.calls.lock().unwrap().push(format!("terminate {node_id}"));
        Ok(())
    }

    async fn launch(&self, node_id: &str) -> Result<String, CollaboratorError> {
        self.calls.lock().unwrap().push(format!("launch {node_id}"));
        let remaining = self.launch_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.launch_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(CollaboratorError::Transient("capacity".to_string()));
        }
        Ok(format!("i-{node_id}"))
    }

    async fn wait_for_state(
        &self,
        instance_id: &str,
        _targets: &[InstanceState],
    ) -> Result<InstanceState, CollaboratorError> {
        self.calls.lock().unwrap().push(format!("wait {instance_id}"));
        Ok(self
            .settle_state
            .lock()
            .unwrap()
            .unwrap_or(InstanceState::Running))
    }
}
