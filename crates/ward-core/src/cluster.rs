use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::attribute::{Attribute, AttributeStore};
use crate::collaborators::{NodeHealthReport, StateSink};
use crate::config::ClusterConfig;
use crate::error::{Result, WardError};
use crate::node::Node;

// ---------------------------------------------------------------------------
// ClusterSnapshot
// ---------------------------------------------------------------------------

/// Serialized form of a cluster: node map plus exposed attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
    pub taken_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

pub struct Cluster {
    id: String,
    name: String,
    nodes: RwLock<HashMap<String, Node>>,
    attributes: AttributeStore,
    maintenance: AtomicBool,
    /// Held by cluster-wide strategies for their whole dispatch-and-wait
    /// sequence so two of them never interleave node visitation.
    strategy_lock: Mutex<()>,
}

impl Cluster {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: RwLock::new(HashMap::new()),
            attributes: AttributeStore::new(),
            maintenance: AtomicBool::new(false),
            strategy_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.id.clone(), config.display_name())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    pub fn node(&self, id: &str) -> Option<Node> {
        self.read_nodes().get(id).cloned()
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.read_nodes().contains_key(id)
    }

    /// All node ids, sorted.
    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read_nodes().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.read_nodes().values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn upsert_node(&self, node: Node) {
        self.write_nodes().insert(node.id.clone(), node);
    }

    /// Merge a health report, creating the node on its first heartbeat.
    pub fn apply_health(&self, report: &NodeHealthReport) {
        let mut nodes = self.write_nodes();
        let node = nodes.entry(report.node_id.clone()).or_insert_with(|| {
            info!(cluster = %self.name, node = %report.node_id, "discovered node");
            Node::new(report.node_id.clone())
        });
        node.apply(report);
    }

    /// Remove a decommissioned node.
    pub fn remove_node(&self, id: &str) -> Option<Node> {
        self.write_nodes().remove(id)
    }

    pub fn set_node_maintenance(&self, id: &str, maintenance: bool) -> Result<()> {
        let mut nodes = self.write_nodes();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| WardError::UnknownNode(id.to_string()))?;
        node.maintenance = maintenance;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Maintenance / mutual exclusion
    // -----------------------------------------------------------------------

    pub fn is_under_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    pub fn set_maintenance(&self, maintenance: bool) {
        self.maintenance.store(maintenance, Ordering::SeqCst);
    }

    pub async fn lock_for_strategy(&self) -> MutexGuard<'_, ()> {
        self.strategy_lock.lock().await
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            maintenance: self.is_under_maintenance(),
            nodes: self
                .read_nodes()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            attributes: self.attributes.exposed(),
            taken_at: Utc::now(),
        }
    }

    pub fn restore(&self, snapshot: ClusterSnapshot) {
        self.set_maintenance(snapshot.maintenance);
        *self.write_nodes() = snapshot.nodes.into_iter().collect();
        self.attributes.replace_all(snapshot.attributes);
    }

    /// Restore state from `sink`. Returns false on a cold start.
    pub fn initialize(&self, sink: &dyn StateSink) -> Result<bool> {
        match sink.deserialize(&self.id)? {
            Some(snapshot) => {
                info!(
                    cluster = %self.name,
                    nodes = snapshot.nodes.len(),
                    taken_at = %snapshot.taken_at,
                    "restored cluster snapshot"
                );
                self.restore(snapshot);
                Ok(true)
            }
            None => {
                warn!(cluster = %self.name, "no snapshot found, starting cold");
                Ok(false)
            }
        }
    }

    pub fn checkpoint(&self, sink: &dyn StateSink) -> Result<()> {
        let snapshot = self.snapshot();
        debug!(cluster = %self.name, nodes = snapshot.nodes.len(), "checkpointing cluster");
        sink.serialize(&snapshot)
    }

    fn read_nodes(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Node>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_nodes(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Node>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("nodes", &self.read_nodes().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::keys;
    use crate::collaborators::HealthSignal;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemorySink {
        stored: StdMutex<Option<ClusterSnapshot>>,
    }

    impl StateSink for MemorySink {
        fn serialize(&self, snapshot: &ClusterSnapshot) -> Result<()> {
            *self.stored.lock().unwrap() = Some(snapshot.clone());
            Ok(())
        }

        fn deserialize(&self, _cluster_id: &str) -> Result<Option<ClusterSnapshot>> {
            Ok(self.stored.lock().unwrap().clone())
        }
    }

    #[test]
    fn first_heartbeat_creates_node() {
        let cluster = Cluster::new("c1", "logs");
        assert!(!cluster.contains_node("4"));
        cluster.apply_health(&NodeHealthReport {
            node_id: "4".to_string(),
            info: None,
            agent: Some(HealthSignal::new(true, Utc::now())),
            service: None,
        });
        assert!(cluster.contains_node("4"));
        assert_eq!(cluster.node_ids(), vec!["4".to_string()]);
        assert!(cluster.remove_node("4").is_some());
        assert!(cluster.node_ids().is_empty());
    }

    #[test]
    fn node_maintenance_requires_known_node() {
        let cluster = Cluster::new("c1", "logs");
        cluster.upsert_node(Node::new("1"));
        cluster.set_node_maintenance("1", true).unwrap();
        assert!(cluster.node("1").unwrap().maintenance);
        assert!(matches!(
            cluster.set_node_maintenance("9", true),
            Err(WardError::UnknownNode(_))
        ));
    }

    #[test]
    fn cold_start_then_checkpoint_and_restore() {
        let sink = MemorySink::default();
        let cluster = Cluster::new("c1", "logs");
        assert!(!cluster.initialize(&sink).unwrap());

        cluster.upsert_node(Node::new("1"));
        cluster.upsert_node(Node::new("2"));
        cluster.set_maintenance(true);
        cluster.attributes().set(keys::NODE_ID, &"1".to_string()).unwrap();
        cluster.attributes().set_hidden(keys::TRY_RESTART, &true).unwrap();
        cluster.checkpoint(&sink).unwrap();

        let restored = Cluster::new("c1", "logs");
        assert!(restored.initialize(&sink).unwrap());
        assert_eq!(restored.node_ids(), vec!["1".to_string(), "2".to_string()]);
        assert!(restored.is_under_maintenance());
        assert!(restored.attributes().contains(keys::NODE_ID));
        assert!(!restored.attributes().contains(keys::TRY_RESTART));
    }

    #[tokio::test]
    async fn strategy_lock_is_exclusive() {
        let cluster = Cluster::new("c1", "logs");
        let guard = cluster.lock_for_strategy().await;
        assert!(cluster.strategy_lock.try_lock().is_err());
        drop(guard);
        assert!(cluster.strategy_lock.try_lock().is_ok());
    }
}
