//! Contracts for the systems the control plane talks to but does not
//! implement: node health, replication topology, compute lifecycle,
//! alerting, snapshot persistence and auditing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::action::node_task::NodeOperation;
use crate::action::AuditRecord;
use crate::cluster::ClusterSnapshot;
use crate::node::NodeInfo;

// ---------------------------------------------------------------------------
// CollaboratorError / retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    /// Worth another attempt (timeouts, throttling, connection resets).
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("{0}")]
    Terminal(String),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Transient(_))
    }
}

/// Run `call` up to `attempts` times, doubling `backoff` after each
/// transient failure. Terminal failures return immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    name: &str,
    attempts: u32,
    backoff: Duration,
    mut call: F,
) -> Result<T, CollaboratorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let attempts = attempts.max(1);
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(call = name, attempt, error = %e, "collaborator call failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Replica placement of one data shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReplicas {
    pub shard: String,
    pub replicas: Vec<String>,
    #[serde(default)]
    pub in_sync: Vec<String>,
}

impl ShardReplicas {
    pub fn out_of_sync(&self) -> usize {
        self.replicas.len().saturating_sub(self.in_sync.len())
    }

    pub fn is_fully_replicated(&self) -> bool {
        self.out_of_sync() == 0
    }
}

#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn shards(&self, cluster_id: &str) -> Result<Vec<ShardReplicas>, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Node health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSignal {
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
}

impl HealthSignal {
    pub fn new(healthy: bool, timestamp: DateTime<Utc>) -> Self {
        Self { healthy, timestamp }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealthReport {
    pub node_id: String,
    #[serde(default)]
    pub info: Option<NodeInfo>,
    #[serde(default)]
    pub agent: Option<HealthSignal>,
    #[serde(default)]
    pub service: Option<HealthSignal>,
}

#[async_trait]
pub trait NodeHealthSource: Send + Sync {
    async fn node_health(&self, cluster_id: &str)
        -> Result<Vec<NodeHealthReport>, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Compute lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Terminated,
}

#[async_trait]
pub trait ComputeLifecycle: Send + Sync {
    async fn terminate(&self, node_id: &str) -> Result<(), CollaboratorError>;

    /// Launch a replacement built from the template of `node_id`; returns
    /// the new instance id.
    async fn launch(&self, node_id: &str) -> Result<String, CollaboratorError>;

    async fn wait_for_state(
        &self,
        instance_id: &str,
        targets: &[InstanceState],
    ) -> Result<InstanceState, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Alerting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertLevel::Low => "low",
            AlertLevel::Medium => "medium",
            AlertLevel::High => "high",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub cluster: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), CollaboratorError>;
}

/// Sink that only writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), CollaboratorError> {
        info!(level = %alert.level, cluster = %alert.cluster, "{}", alert.message);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Cluster snapshot persistence. `deserialize` returns `None` on cold start.
pub trait StateSink: Send + Sync {
    fn serialize(&self, snapshot: &ClusterSnapshot) -> crate::Result<()>;
    fn deserialize(&self, cluster_id: &str) -> crate::Result<Option<ClusterSnapshot>>;
}

pub trait ActionAuditor: Send + Sync {
    fn record(&self, record: &AuditRecord) -> crate::Result<()>;
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Everything the engine and its actions call out to.
#[derive(Clone)]
pub struct Collaborators {
    pub alerts: Arc<dyn AlertSink>,
    pub topology: Option<Arc<dyn TopologySource>>,
    pub compute: Option<Arc<dyn ComputeLifecycle>>,
    pub auditor: Option<Arc<dyn ActionAuditor>>,
    /// Operation used by targeted recovery before falling back to replacement.
    pub restart: Option<Arc<dyn NodeOperation>>,
}

impl Collaborators {
    pub fn new(alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            alerts,
            topology: None,
            compute: None,
            auditor: None,
            restart: None,
        }
    }

    pub fn with_topology(mut self, topology: Arc<dyn TopologySource>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn with_compute(mut self, compute: Arc<dyn ComputeLifecycle>) -> Self {
        self.compute = Some(compute);
        self
    }

    pub fn with_auditor(mut self, auditor: Arc<dyn ActionAuditor>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    pub fn with_restart(mut self, restart: Arc<dyn NodeOperation>) -> Self {
        self.restart = Some(restart);
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::new(Arc::new(LogAlertSink))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn shard_replication_state() {
        let shard = ShardReplicas {
            shard: "logs-0".to_string(),
            replicas: vec!["1".into(), "2".into(), "3".into()],
            in_sync: vec!["1".into(), "2".into()],
        };
        assert_eq!(shard.out_of_sync(), 1);
        assert!(!shard.is_fully_replicated());
    }

    #[tokio::test]
    async fn retry_stops_after_success() {
        let calls = AtomicU32::new(0);
        let out = retry_with_backoff("launch", 3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CollaboratorError::Transient("throttled".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = retry_with_backoff("terminate", 2, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CollaboratorError::Transient("timeout".into())) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = retry_with_backoff("launch", 5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CollaboratorError::Terminal("no capacity".into())) }
        })
        .await;
        assert_eq!(out, Err(CollaboratorError::Terminal("no capacity".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
