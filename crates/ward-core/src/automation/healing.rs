use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::cooldown::{Cooldown, CooldownDecision};
use super::sensor::SensorIntervals;
use super::Operator;
use crate::action::recovery::RecoverNodeAction;
use crate::action::{Action, ActionKind};
use crate::attribute::{keys, Attribute};
use crate::cluster::Cluster;
use crate::collaborators::{AlertLevel, ShardReplicas};
use crate::config::{HealingConfig, WardConfig};
use crate::engine::ActionEngine;
use crate::strategy::join_nodes;

/// Nodes whose share of out-of-sync replica assignments reaches `ratio`.
///
/// A node qualifies when it holds more replicas than in-sync replicas and
/// `(replicas - in_sync) >= ratio * replicas`. The bound is inclusive.
pub fn under_replicated_nodes(shards: &[ShardReplicas], ratio: f64) -> BTreeSet<String> {
    let mut assigned: BTreeMap<&str, u64> = BTreeMap::new();
    let mut in_sync: HashMap<&str, u64> = HashMap::new();
    for shard in shards {
        for replica in &shard.replicas {
            *assigned.entry(replica.as_str()).or_default() += 1;
        }
        for replica in &shard.in_sync {
            *in_sync.entry(replica.as_str()).or_default() += 1;
        }
    }
    assigned
        .into_iter()
        .filter(|(node, replicas)| {
            let isr = in_sync.get(node).copied().unwrap_or(0);
            *replicas > isr && (replicas - isr) as f64 >= ratio * *replicas as f64
        })
        .map(|(node, _)| node.to_string())
        .collect()
}

/// What one healing tick concluded about the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthAssessment {
    pub under_replicated: BTreeSet<String>,
    /// Agent absent, stale or unhealthy; maintenance excluded.
    pub agent_dead: BTreeSet<String>,
    /// Agent healthy but the service has not reported healthy recently.
    pub service_unhealthy: BTreeSet<String>,
    /// Under-replicated nodes the cluster does not know about.
    pub unknown: BTreeSet<String>,
    pub dead: BTreeSet<String>,
    pub maybe_dead: BTreeSet<String>,
}

impl HealthAssessment {
    pub fn candidates(&self) -> BTreeSet<String> {
        self.dead.union(&self.maybe_dead).cloned().collect()
    }
}

/// Per-node count of consecutive ticks in a bad state.
#[derive(Debug, Default)]
struct Streaks {
    counts: HashMap<String, u32>,
}

impl Streaks {
    /// Advance every node in `current`, forget the rest, and return the
    /// nodes that just reached `threshold`. Their count starts over.
    fn observe(&mut self, current: &BTreeSet<String>, threshold: u32) -> BTreeSet<String> {
        self.counts.retain(|node, _| current.contains(node));
        let mut reached = BTreeSet::new();
        for node in current {
            let count = self.counts.entry(node.clone()).or_insert(0);
            *count += 1;
            if *count >= threshold {
                reached.insert(node.clone());
            }
        }
        for node in &reached {
            self.counts.remove(node);
        }
        reached
    }
}

/// Recovers a single unhealthy node at a time.
///
/// A node is dead when it is under-replicated and its agent is down, or
/// when it is under-replicated and unknown to the cluster. It is maybe
/// dead when it is under-replicated and its agent reports the service
/// down; recovery then tries a restart before replacing. More than one
/// candidate outside the cooldown raises an alert instead of acting.
pub struct NodeHealingOperator {
    settings: HealingConfig,
    heartbeat: Duration,
    interval: Duration,
    owner: String,
    sensors: SensorIntervals,
    cooldown: Cooldown,
    agent_streaks: Mutex<Streaks>,
    service_streaks: Mutex<Streaks>,
}

impl NodeHealingOperator {
    pub const NAME: &'static str = "node-healing";

    pub fn new(config: &WardConfig, sensors: SensorIntervals) -> Self {
        let automation = &config.automation;
        Self {
            settings: automation.healing.clone(),
            heartbeat: automation.agent_heartbeat(),
            interval: automation.operator_interval(),
            owner: automation.owner.clone(),
            sensors,
            cooldown: Cooldown::new(automation.healing.cooldown()),
            agent_streaks: Mutex::new(Streaks::default()),
            service_streaks: Mutex::new(Streaks::default()),
        }
    }

    pub fn assess(
        &self,
        cluster: &Cluster,
        shards: &[ShardReplicas],
        now: DateTime<Utc>,
    ) -> HealthAssessment {
        let under_replicated =
            under_replicated_nodes(shards, self.settings.under_replicated_ratio_threshold);
        let threshold = chrono::Duration::from_std(self.settings.dead_service_threshold())
            .unwrap_or(chrono::Duration::MAX);
        let since = now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut known = BTreeSet::new();
        let mut agent_dead = BTreeSet::new();
        let mut service_unhealthy = BTreeSet::new();
        for node in cluster.nodes() {
            known.insert(node.id.clone());
            if node.maintenance {
                continue;
            }
            if !node.is_agent_healthy(now, self.heartbeat) {
                agent_dead.insert(node.id.clone());
            } else if !node.is_service_healthy_since(since) {
                service_unhealthy.insert(node.id.clone());
            }
        }

        let unknown: BTreeSet<String> = under_replicated.difference(&known).cloned().collect();
        let dead = under_replicated
            .intersection(&agent_dead)
            .chain(unknown.iter())
            .cloned()
            .collect();
        let maybe_dead = under_replicated
            .intersection(&service_unhealthy)
            .cloned()
            .collect();
        HealthAssessment {
            under_replicated,
            agent_dead,
            service_unhealthy,
            unknown,
            dead,
            maybe_dead,
        }
    }

    fn is_stale(&self, attr: &Attribute, now: DateTime<Utc>) -> bool {
        let Some(interval) = self.sensors.max_for(&attr.publishers) else {
            return false;
        };
        let limit = interval.saturating_mul(self.settings.max_stale_intervals);
        match chrono::Duration::from_std(limit) {
            Ok(limit) => attr.age(now) > limit,
            Err(_) => false,
        }
    }

    async fn alert_streaks(&self, engine: &ActionEngine, assessment: &HealthAssessment) {
        let threshold = self.settings.unhealthy_alert_threshold;
        let agents: BTreeSet<String> = assessment
            .agent_dead
            .difference(&assessment.dead)
            .cloned()
            .collect();
        let services: BTreeSet<String> = assessment
            .service_unhealthy
            .difference(&assessment.dead)
            .cloned()
            .collect();
        let agents = lock(&self.agent_streaks).observe(&agents, threshold);
        let services = lock(&self.service_streaks).observe(&services, threshold);

        let cluster = engine.cluster().name();
        if !agents.is_empty() {
            engine
                .alert(
                    AlertLevel::High,
                    format!(
                        "Agents on {cluster} are unhealthy with no under-replicated shards: {}",
                        join_nodes(&agents)
                    ),
                )
                .await;
        }
        if !services.is_empty() {
            engine
                .alert(
                    AlertLevel::High,
                    format!(
                        "Service on {cluster} is unhealthy with no under-replicated shards: {}",
                        join_nodes(&services)
                    ),
                )
                .await;
        }
    }

    /// One healing pass at `now`. Returns the recovery action it
    /// dispatched, if any.
    pub async fn evaluate(
        &self,
        engine: &Arc<ActionEngine>,
        now: DateTime<Utc>,
    ) -> crate::Result<Option<Arc<Action>>> {
        let cluster = engine.cluster();
        let Some(topology) = cluster.attributes().get_raw(keys::TOPOLOGY.name()) else {
            info!(cluster = %cluster.name(), "topology unavailable, skipping healing tick");
            return Ok(None);
        };
        if self.is_stale(&topology, now) {
            engine
                .alert(
                    AlertLevel::Medium,
                    format!(
                        "Stale topology data on {}: node healing is paused until the sensors catch up",
                        cluster.name()
                    ),
                )
                .await;
            return Ok(None);
        }

        let shards = cluster.attributes().get(keys::TOPOLOGY)?.unwrap_or_default();
        let assessment = self.assess(cluster, &shards, now);
        debug!(
            cluster = %cluster.name(),
            under_replicated = %join_nodes(&assessment.under_replicated),
            agent_dead = %join_nodes(&assessment.agent_dead),
            service_unhealthy = %join_nodes(&assessment.service_unhealthy),
            unknown = %join_nodes(&assessment.unknown),
            "health assessed"
        );
        self.alert_streaks(engine, &assessment).await;

        match self
            .cooldown
            .evaluate(cluster.attributes(), &assessment.candidates(), now)?
        {
            CooldownDecision::Idle => Ok(None),
            CooldownDecision::AllRecovering(nodes) => {
                warn!(
                    cluster = %cluster.name(),
                    nodes = %join_nodes(&nodes),
                    "unhealthy nodes are already recovering"
                );
                Ok(None)
            }
            CooldownDecision::TooMany(nodes) => {
                error!(
                    cluster = %cluster.name(),
                    dead = %join_nodes(&assessment.dead),
                    maybe_dead = %join_nodes(&assessment.maybe_dead),
                    "more than one node is unhealthy, not acting"
                );
                engine
                    .alert(
                        AlertLevel::High,
                        format!(
                            "{} nodes on {} are unhealthy: {}",
                            nodes.len(),
                            cluster.name(),
                            join_nodes(&nodes)
                        ),
                    )
                    .await;
                Ok(None)
            }
            CooldownDecision::Recover(node) => {
                let action = Action::new(ActionKind::Recover(RecoverNodeAction::new()))
                    .with_owner(&self.owner);
                let attrs = action.attributes();
                attrs.set_with_publishers(keys::NODE_ID, &node, topology.publishers.iter().cloned())?;
                let try_restart = assessment.maybe_dead.contains(&node);
                attrs.set(keys::TRY_RESTART, &try_restart)?;
                if assessment.unknown.contains(&node) {
                    attrs.set(keys::NODE_EXISTS, &false)?;
                }
                info!(cluster = %cluster.name(), node = %node, try_restart, "dispatching node recovery");
                let action = engine.dispatch(action).await?;
                self.cooldown.record(cluster.attributes(), &node, now)?;
                Ok(Some(action))
            }
        }
    }
}

#[async_trait]
impl Operator for NodeHealingOperator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self, engine: &Arc<ActionEngine>) -> crate::Result<()> {
        self.evaluate(engine, Utc::now()).await.map(|_| ())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::sensor::TopologySensor;
    use crate::collaborators::{Collaborators, HealthSignal};
    use crate::node::Node;
    use crate::testing::{fast_config, shard, test_cluster, FakeCompute, RecordingAlertSink};

    fn lagging(name: &str, replicas: &[&str], in_sync: &[&str]) -> ShardReplicas {
        ShardReplicas {
            in_sync: in_sync.iter().map(|s| s.to_string()).collect(),
            ..shard(name, replicas)
        }
    }

    fn set(v: &[&str]) -> BTreeSet<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn intervals() -> SensorIntervals {
        [(TopologySensor::NAME.to_string(), Duration::from_secs(60))]
            .into_iter()
            .collect()
    }

    struct Harness {
        engine: Arc<ActionEngine>,
        alerts: Arc<RecordingAlertSink>,
        operator: NodeHealingOperator,
    }

    fn harness(nodes: usize, shards: Vec<ShardReplicas>) -> Harness {
        let mut config = fast_config();
        config.recovery.dry_run = true;
        let cluster = test_cluster(nodes);
        cluster
            .attributes()
            .set_with_publishers(keys::TOPOLOGY, &shards, [TopologySensor::NAME])
            .unwrap();
        let alerts = Arc::new(RecordingAlertSink::default());
        let collaborators =
            Collaborators::new(alerts.clone()).with_compute(Arc::new(FakeCompute::default()));
        let operator = NodeHealingOperator::new(&config, intervals());
        let engine = ActionEngine::start(cluster, config, collaborators).unwrap();
        Harness {
            engine,
            alerts,
            operator,
        }
    }

    fn break_agent(cluster: &Cluster, id: &str) {
        let mut node = cluster.node(id).unwrap();
        node.agent = Some(HealthSignal::new(false, Utc::now()));
        cluster.upsert_node(node);
    }

    fn break_service(cluster: &Cluster, id: &str) {
        let mut node = cluster.node(id).unwrap();
        node.service = Some(HealthSignal::new(false, Utc::now()));
        cluster.upsert_node(node);
    }

    #[test]
    fn under_replication_counts_per_node_assignments() {
        let shards = vec![
            lagging("p0", &["0", "1", "2"], &["0", "2"]),
            lagging("p1", &["1", "2", "3"], &["1", "2", "3"]),
            lagging("p2", &["3", "4"], &["4"]),
        ];
        // Node 1 is out of sync on half its replicas, node 3 on half of its.
        assert_eq!(under_replicated_nodes(&shards, 0.0), set(&["1", "3"]));
        assert_eq!(under_replicated_nodes(&shards, 0.5), set(&["1", "3"]));
        assert_eq!(under_replicated_nodes(&shards, 0.6), set(&[]));
        assert_eq!(under_replicated_nodes(&[shard("p0", &["0", "1"])], 0.0), set(&[]));
    }

    #[tokio::test]
    async fn healthy_cluster_is_left_alone() {
        let h = harness(3, vec![shard("p0", &["0", "1", "2"])]);
        let dispatched = h.operator.evaluate(&h.engine, Utc::now()).await.unwrap();
        assert!(dispatched.is_none());
        assert!(h.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn dead_node_is_recovered_once_per_cooldown() {
        let h = harness(3, vec![lagging("p0", &["0", "1", "2"], &["0", "2"])]);
        break_agent(h.engine.cluster(), "1");

        let now = Utc::now();
        let action = h.operator.evaluate(&h.engine, now).await.unwrap().unwrap();
        assert_eq!(action.attributes().get(keys::NODE_ID).unwrap(), Some("1".to_string()));
        assert_eq!(action.attributes().get(keys::TRY_RESTART).unwrap(), Some(false));
        assert!(!action.attributes().contains(keys::NODE_EXISTS));
        assert_eq!(action.owner().as_deref(), Some("ward-automation"));
        assert!(action
            .attributes()
            .get_raw("nodeId")
            .unwrap()
            .publishers
            .contains(TopologySensor::NAME));
        assert_eq!(
            h.engine.cluster().attributes().get(keys::RECOVERING_NODES).unwrap(),
            Some(set(&["1"]))
        );

        // Same input on the next tick: the node is cooling down.
        let again = h
            .operator
            .evaluate(&h.engine, now + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn service_down_with_live_agent_tries_a_restart() {
        let h = harness(3, vec![lagging("p0", &["0", "1", "2"], &["1", "2"])]);
        break_service(h.engine.cluster(), "0");

        let action = h.operator.evaluate(&h.engine, Utc::now()).await.unwrap().unwrap();
        assert_eq!(action.attributes().get(keys::NODE_ID).unwrap(), Some("0".to_string()));
        assert_eq!(action.attributes().get(keys::TRY_RESTART).unwrap(), Some(true));
    }

    #[tokio::test]
    async fn unknown_under_replicated_node_is_replaced() {
        let h = harness(2, vec![lagging("p0", &["0", "1", "9"], &["0", "1"])]);

        let action = h.operator.evaluate(&h.engine, Utc::now()).await.unwrap().unwrap();
        assert_eq!(action.attributes().get(keys::NODE_ID).unwrap(), Some("9".to_string()));
        assert_eq!(action.attributes().get(keys::NODE_EXISTS).unwrap(), Some(false));
    }

    #[tokio::test]
    async fn several_dead_nodes_alert_instead_of_acting() {
        let h = harness(4, vec![lagging("p0", &["0", "1", "2", "3"], &["0", "3"])]);
        break_agent(h.engine.cluster(), "1");
        break_agent(h.engine.cluster(), "2");

        let dispatched = h.operator.evaluate(&h.engine, Utc::now()).await.unwrap();
        assert!(dispatched.is_none());
        assert!(h.engine.tracked_actions().is_empty());
        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::High);
        assert_eq!(alerts[0].message, "2 nodes on test are unhealthy: 1, 2");
    }

    #[tokio::test]
    async fn nodes_in_maintenance_are_ignored() {
        let h = harness(3, vec![lagging("p0", &["0", "1", "2"], &["0", "2"])]);
        let cluster = h.engine.cluster();
        break_agent(cluster, "1");
        cluster.set_node_maintenance("1", true).unwrap();

        assert!(h.operator.evaluate(&h.engine, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_topology_pauses_healing() {
        let h = harness(3, vec![lagging("p0", &["0", "1", "2"], &["0", "2"])]);
        break_agent(h.engine.cluster(), "1");

        let later = Utc::now() + chrono::Duration::minutes(10);
        assert!(h.operator.evaluate(&h.engine, later).await.unwrap().is_none());
        assert!(h.alerts.messages()[0].starts_with("Stale topology data on test"));
    }

    #[tokio::test]
    async fn missing_topology_is_a_quiet_no_op() {
        let h = harness(3, Vec::new());
        h.engine.cluster().attributes().remove("topology");
        assert!(h.operator.evaluate(&h.engine, Utc::now()).await.unwrap().is_none());
        assert!(h.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn dead_agents_without_under_replication_alert_after_a_streak() {
        let h = harness(3, vec![shard("p0", &["0", "1", "2"])]);
        break_agent(h.engine.cluster(), "2");

        let now = Utc::now();
        for _ in 0..2 {
            h.operator.evaluate(&h.engine, now).await.unwrap();
        }
        assert!(h.alerts.alerts().is_empty());
        h.operator.evaluate(&h.engine, now).await.unwrap();
        assert_eq!(
            h.alerts.messages(),
            vec!["Agents on test are unhealthy with no under-replicated shards: 2"]
        );
        // The streak starts over after alerting.
        h.operator.evaluate(&h.engine, now).await.unwrap();
        assert_eq!(h.alerts.alerts().len(), 1);
    }

    #[test]
    fn streaks_reset_when_a_node_recovers() {
        let mut streaks = Streaks::default();
        assert!(streaks.observe(&set(&["a"]), 2).is_empty());
        assert!(streaks.observe(&set(&[]), 2).is_empty());
        assert!(streaks.observe(&set(&["a"]), 2).is_empty());
        assert_eq!(streaks.observe(&set(&["a"]), 2), set(&["a"]));
    }

    #[test]
    fn assessment_splits_dead_from_maybe_dead() {
        let config = fast_config();
        let operator = NodeHealingOperator::new(&config, intervals());
        let cluster = Cluster::new("c", "c");
        let now = Utc::now();
        for (id, agent, service) in [("a", true, true), ("b", false, false), ("c", true, false)] {
            let mut node = Node::new(id);
            node.agent = Some(HealthSignal::new(agent, now));
            node.service = Some(HealthSignal::new(service, now));
            cluster.upsert_node(node);
        }
        let shards = vec![lagging("p0", &["a", "b", "c", "z"], &["a"])];
        let assessment = operator.assess(&cluster, &shards, now);

        assert_eq!(assessment.under_replicated, set(&["b", "c", "z"]));
        assert_eq!(assessment.agent_dead, set(&["b"]));
        assert_eq!(assessment.service_unhealthy, set(&["c"]));
        assert_eq!(assessment.unknown, set(&["z"]));
        assert_eq!(assessment.dead, set(&["b", "z"]));
        assert_eq!(assessment.maybe_dead, set(&["c"]));
        assert_eq!(assessment.candidates(), set(&["b", "c", "z"]));
    }
}
