use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::action::{
    ActionContext, ActionError, ActionLogic, AttributeSchema, SchemaField,
};
use crate::attribute::{keys, AttributeStore};
use crate::config::{NodeTaskConfig, WardConfig};
use crate::node::Node;

// ---------------------------------------------------------------------------
// NodeOperation
// ---------------------------------------------------------------------------

/// How a node task treats the node's maintenance flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaintenancePolicy {
    #[default]
    None,
    /// Set maintenance for the run, then restore the previous value.
    EnableAndRestore,
    /// Set maintenance and leave it set.
    EnableBefore,
    /// Clear maintenance once the operation succeeds.
    DisableAfter,
}

/// The per-node work a [`NodeTask`] performs (restart, reconfigure,
/// upgrade...). Implementations talk to the node's agent.
#[async_trait]
pub trait NodeOperation: Send + Sync {
    fn name(&self) -> &str;

    /// Run against `node`; the returned exit code is non-zero on failure.
    async fn execute(&self, node: &Node, ctx: &ActionContext) -> Result<i32, ActionError>;

    fn maintenance_policy(&self) -> MaintenancePolicy {
        MaintenancePolicy::None
    }
}

// ---------------------------------------------------------------------------
// NodeTask
// ---------------------------------------------------------------------------

/// Runs one [`NodeOperation`] against the node named by `nodeId`, then
/// waits for the node's service to report healthy again.
pub struct NodeTask {
    op: Arc<dyn NodeOperation>,
    settings: NodeTaskConfig,
    require_agent: bool,
}

impl NodeTask {
    pub fn new(op: Arc<dyn NodeOperation>) -> Self {
        Self {
            op,
            settings: NodeTaskConfig::default(),
            require_agent: false,
        }
    }

    /// Refuse to run unless the node's agent has reported recently.
    pub fn requiring_agent(mut self) -> Self {
        self.require_agent = true;
        self
    }

    pub fn settings(&self) -> &NodeTaskConfig {
        &self.settings
    }

    async fn execute_on(&self, ctx: &ActionContext, node: &Node) -> Result<(), ActionError> {
        let action = ctx.action();
        let started = Utc::now();
        let timeout = match action.attributes().get(keys::ACTION_TIMEOUT_SECS)? {
            Some(secs) => Duration::from_secs(secs),
            None => self.settings.action_timeout(),
        };

        let code = match tokio::time::timeout(timeout, self.op.execute(node, ctx)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ActionError::Timeout {
                    what: format!("{} on node {}", self.op.name(), node.id),
                    after: timeout,
                })
            }
        };
        action.set_exit_code(code);
        if code != 0 {
            return Err(ActionError::Failed(format!(
                "{} on node {} exited with code {code}",
                self.op.name(),
                node.id
            )));
        }
        action.append_out(&format!(
            "{} completed on node {}, validating recovery",
            self.op.name(),
            node.id
        ));

        if self.settings.wait_for_recovery {
            self.wait_for_recovery(ctx, &node.id, started).await?;
            action.append_out("service health check passed");
        }
        Ok(())
    }

    async fn wait_for_recovery(
        &self,
        ctx: &ActionContext,
        node_id: &str,
        since: chrono::DateTime<Utc>,
    ) -> Result<(), ActionError> {
        let timeout = self.settings.recovery_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let healthy = ctx
                .cluster()
                .node(node_id)
                .is_some_and(|n| n.is_service_healthy_since(since));
            if healthy {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ActionError::Timeout {
                    what: format!("service recovery on node {node_id}"),
                    after: timeout,
                });
            }
            if !ctx.pause(self.settings.health_check_interval()).await {
                return Err(ActionError::Cancelled);
            }
        }
    }
}

#[async_trait]
impl ActionLogic for NodeTask {
    fn kind_name(&self) -> &'static str {
        "node"
    }

    fn label(&self) -> String {
        self.op.name().to_string()
    }

    fn display_name(&self, attributes: &AttributeStore) -> String {
        match attributes.get(keys::NODE_ID) {
            Ok(Some(id)) => format!("{} on node {id}", self.op.name()),
            _ => self.label(),
        }
    }

    fn initialize(&mut self, config: &WardConfig) -> crate::Result<()> {
        self.settings = config.node_task.clone();
        Ok(())
    }

    fn schema(&self) -> AttributeSchema {
        AttributeSchema {
            action: self.label(),
            fields: vec![
                SchemaField::required(keys::NODE_ID.name(), "Node to run on"),
                SchemaField::optional(
                    keys::ACTION_TIMEOUT_SECS.name(),
                    "Seconds before the node operation counts as stuck",
                ),
            ],
        }
    }

    async fn run(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let node_id = ctx
            .attributes()
            .get(keys::NODE_ID)?
            .ok_or_else(|| ActionError::Precondition("nodeId is not set".to_string()))?;
        let node = ctx
            .cluster()
            .node(&node_id)
            .ok_or_else(|| ActionError::Precondition(format!("node {node_id} not found")))?;
        if self.require_agent
            && !node.is_agent_present(Utc::now(), ctx.config().automation.agent_heartbeat())
        {
            return Err(ActionError::Precondition(format!(
                "no agent present on node {node_id}"
            )));
        }
        if ctx.is_cancelled() {
            return Err(ActionError::Cancelled);
        }

        let cluster = ctx.cluster();
        let policy = self.op.maintenance_policy();
        let previous = node.maintenance;
        if matches!(
            policy,
            MaintenancePolicy::EnableAndRestore | MaintenancePolicy::EnableBefore
        ) {
            cluster.set_node_maintenance(&node_id, true)?;
        }

        info!(node = %node_id, op = self.op.name(), "running node operation");
        let outcome = self.execute_on(ctx, &node).await;

        let restore = match policy {
            MaintenancePolicy::EnableAndRestore => Some(previous),
            MaintenancePolicy::DisableAfter if outcome.is_ok() => Some(false),
            _ => None,
        };
        if let Some(flag) = restore {
            if let Err(e) = cluster.set_node_maintenance(&node_id, flag) {
                warn!(node = %node_id, error = %e, "could not reset node maintenance");
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionKind, ActionStatus};
    use crate::collaborators::Collaborators;
    use crate::engine::ActionEngine;
    use crate::testing::{fast_config, test_cluster, Outcome, RecordingAlertSink, ScriptedOperation};

    fn engine(nodes: usize) -> Arc<ActionEngine> {
        let collaborators = Collaborators::new(Arc::new(RecordingAlertSink::default()));
        ActionEngine::start(test_cluster(nodes), fast_config(), collaborators).unwrap()
    }

    fn task(task: NodeTask, node: &str) -> Action {
        let action = Action::new(ActionKind::Node(task)).with_owner("oncall");
        action.attributes().set(keys::NODE_ID, &node.to_string()).unwrap();
        action
    }

    async fn run(engine: &Arc<ActionEngine>, op: &Arc<ScriptedOperation>, node: &str) -> ActionStatus {
        let action = engine.dispatch(task(NodeTask::new(op.clone()), node)).await.unwrap();
        action.wait().await
    }

    fn in_maintenance(engine: &ActionEngine, node: &str) -> bool {
        engine.cluster().node(node).is_some_and(|n| n.maintenance)
    }

    #[tokio::test]
    async fn no_policy_leaves_maintenance_alone() {
        let engine = engine(2);
        let op = Arc::new(ScriptedOperation::new("restart"));
        assert_eq!(run(&engine, &op, "1").await, ActionStatus::Succeeded);
        assert_eq!(op.maintenance_seen(), vec![false]);
        assert!(!in_maintenance(&engine, "1"));
    }

    #[tokio::test]
    async fn enable_and_restore_brackets_the_operation() {
        let engine = engine(2);
        let op = Arc::new(
            ScriptedOperation::new("restart").with_maintenance(MaintenancePolicy::EnableAndRestore),
        );
        assert_eq!(run(&engine, &op, "1").await, ActionStatus::Succeeded);
        assert_eq!(op.maintenance_seen(), vec![true]);
        assert!(!in_maintenance(&engine, "1"));
    }

    #[tokio::test]
    async fn enable_and_restore_keeps_a_flag_that_was_already_set() {
        let engine = engine(2);
        engine.cluster().set_node_maintenance("1", true).unwrap();
        let op = Arc::new(
            ScriptedOperation::new("restart")
                .with_maintenance(MaintenancePolicy::EnableAndRestore)
                .with_outcome("1", Outcome::ExitCode(3)),
        );
        assert_eq!(run(&engine, &op, "1").await, ActionStatus::Failed);
        assert!(in_maintenance(&engine, "1"));
    }

    #[tokio::test]
    async fn enable_before_leaves_the_node_in_maintenance() {
        let engine = engine(2);
        let op = Arc::new(
            ScriptedOperation::new("decommission").with_maintenance(MaintenancePolicy::EnableBefore),
        );
        assert_eq!(run(&engine, &op, "0").await, ActionStatus::Succeeded);
        assert_eq!(op.maintenance_seen(), vec![true]);
        assert!(in_maintenance(&engine, "0"));
    }

    #[tokio::test]
    async fn disable_after_clears_maintenance_only_on_success() {
        let engine = engine(2);
        engine.cluster().set_node_maintenance("0", true).unwrap();
        engine.cluster().set_node_maintenance("1", true).unwrap();
        let op = Arc::new(
            ScriptedOperation::new("commission")
                .with_maintenance(MaintenancePolicy::DisableAfter)
                .with_outcome("1", Outcome::ExitCode(1)),
        );

        assert_eq!(run(&engine, &op, "0").await, ActionStatus::Succeeded);
        assert!(!in_maintenance(&engine, "0"));

        assert_eq!(run(&engine, &op, "1").await, ActionStatus::Failed);
        assert!(in_maintenance(&engine, "1"));
        assert_eq!(op.maintenance_seen(), vec![true, true]);
    }

    #[tokio::test]
    async fn requiring_agent_refuses_nodes_without_a_heartbeat() {
        let engine = engine(1);
        engine.cluster().upsert_node(Node::new("silent"));
        let op = Arc::new(ScriptedOperation::new("restart"));

        let silent = engine
            .dispatch(task(NodeTask::new(op.clone()).requiring_agent(), "silent"))
            .await
            .unwrap();
        assert_eq!(silent.wait().await, ActionStatus::Failed);
        assert!(silent.result().err.contains("no agent present on node silent"));

        let healthy = engine
            .dispatch(task(NodeTask::new(op.clone()).requiring_agent(), "0"))
            .await
            .unwrap();
        assert_eq!(healthy.wait().await, ActionStatus::Succeeded);
        assert_eq!(op.started(), vec!["0"]);
    }

    #[tokio::test]
    async fn nonzero_exit_code_fails_the_task() {
        let engine = engine(1);
        let op = Arc::new(ScriptedOperation::new("restart").with_outcome("0", Outcome::ExitCode(4)));
        let action = engine.dispatch(task(NodeTask::new(op.clone()), "0")).await.unwrap();
        assert_eq!(action.wait().await, ActionStatus::Failed);
        assert_eq!(action.result().exit_code, Some(4));
        assert!(action.result().err.contains("restart on node 0 exited with code 4"));
    }
}
