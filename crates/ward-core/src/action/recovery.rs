use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::action::node_task::NodeTask;
use crate::action::{
    Action, ActionContext, ActionError, ActionKind, ActionLogic, ActionStatus, AttributeSchema,
    SchemaField,
};
use crate::attribute::{keys, AttributeStore};
use crate::collaborators::{retry_with_backoff, AlertLevel, ComputeLifecycle, InstanceState};
use crate::config::{RecoveryConfig, WardConfig};

fn target_node(attributes: &AttributeStore) -> Result<String, ActionError> {
    attributes
        .get(keys::NODE_ID)?
        .ok_or_else(|| ActionError::Precondition("nodeId is not set".to_string()))
}

fn named(prefix: &str, attributes: &AttributeStore) -> String {
    match attributes.get(keys::NODE_ID) {
        Ok(Some(id)) => format!("{prefix} {id}"),
        _ => prefix.to_string(),
    }
}

// ---------------------------------------------------------------------------
// ReplaceNodeAction
// ---------------------------------------------------------------------------

/// Terminate a node's instance and launch a replacement from its template.
#[derive(Default)]
pub struct ReplaceNodeAction {
    settings: RecoveryConfig,
}

impl ReplaceNodeAction {
    pub fn new() -> Self {
        Self::default()
    }

    fn compute(ctx: &ActionContext) -> Result<Arc<dyn ComputeLifecycle>, ActionError> {
        ctx.engine().collaborators().compute.clone().ok_or_else(|| {
            ActionError::Precondition("no compute lifecycle collaborator configured".to_string())
        })
    }
}

#[async_trait]
impl ActionLogic for ReplaceNodeAction {
    fn kind_name(&self) -> &'static str {
        "replace"
    }

    fn label(&self) -> String {
        "Replace node".to_string()
    }

    fn display_name(&self, attributes: &AttributeStore) -> String {
        named("Replace node", attributes)
    }

    fn initialize(&mut self, config: &WardConfig) -> crate::Result<()> {
        self.settings = config.recovery.clone();
        Ok(())
    }

    fn schema(&self) -> AttributeSchema {
        AttributeSchema {
            action: self.label(),
            fields: vec![
                SchemaField::required(keys::NODE_ID.name(), "Node to replace"),
                SchemaField::optional(
                    keys::NODE_EXISTS.name(),
                    "False when the node's instance is already gone",
                ),
            ],
        }
    }

    async fn run(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let action = ctx.action();
        let node_id = target_node(ctx.attributes())?;
        let node_exists = ctx.attributes().get(keys::NODE_EXISTS)?.unwrap_or(true);

        if self.settings.dry_run {
            action.append_out(&format!("dry run: skipping replacement of node {node_id}"));
            return Ok(());
        }
        let compute = Self::compute(ctx)?;
        let attempts = self.settings.collaborator_retries;
        let backoff = self.settings.retry_backoff();

        if node_exists {
            retry_with_backoff("terminate", attempts, backoff, || compute.terminate(&node_id))
                .await
                .map_err(|e| ActionError::collaborator("terminate", e))?;
            action.append_out(&format!("terminated node {node_id}"));
        }
        if ctx.is_cancelled() {
            return Err(ActionError::Cancelled);
        }

        let instance = retry_with_backoff("launch", attempts, backoff, || compute.launch(&node_id))
            .await
            .map_err(|e| ActionError::collaborator("launch", e))?;
        action.append_out(&format!("launched instance {instance} to replace node {node_id}"));
        info!(node = %node_id, instance = %instance, "replacement launched");

        let timeout = self.settings.launch_timeout();
        let wait = retry_with_backoff("wait_for_state", attempts, backoff, || {
            compute.wait_for_state(&instance, &[InstanceState::Running])
        });
        let state = match tokio::time::timeout(timeout, wait).await {
            Ok(state) => state.map_err(|e| ActionError::collaborator("wait_for_state", e))?,
            Err(_) => {
                return Err(ActionError::Timeout {
                    what: format!("launch of instance {instance}"),
                    after: timeout,
                })
            }
        };
        if state != InstanceState::Running {
            return Err(ActionError::Failed(format!(
                "instance {instance} settled in state {state:?} instead of running"
            )));
        }
        action.append_out(&format!("instance {instance} is running"));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecoverNodeAction
// ---------------------------------------------------------------------------

/// Targeted recovery of one node: restart first when asked to, replace
/// when the restart does not bring it back.
#[derive(Default)]
pub struct RecoverNodeAction {
    settings: RecoveryConfig,
}

impl RecoverNodeAction {
    pub fn new() -> Self {
        Self::default()
    }

    async fn try_restart(&self, ctx: &ActionContext, node_id: &str) -> Result<bool, ActionError> {
        let Some(op) = ctx.engine().collaborators().restart.clone() else {
            warn!(node = %node_id, "restart requested but no restart operation configured");
            return Ok(false);
        };
        let restart = Action::new(ActionKind::Node(NodeTask::new(op)));
        restart.attributes().copy_from(ctx.attributes(), keys::NODE_ID.name(), keys::NODE_ID.name());
        let restart = ctx.dispatch_child(restart)?;
        match ctx.await_child(&restart).await {
            ActionStatus::Succeeded => {
                ctx.action()
                    .append_out(&format!("node {node_id} recovered after restart"));
                ctx.alert(
                    AlertLevel::Medium,
                    format!(
                        "Node {node_id} on {} recovered after restart",
                        ctx.cluster().name()
                    ),
                )
                .await;
                Ok(true)
            }
            ActionStatus::Cancelled => Err(ActionError::Cancelled),
            status => {
                warn!(node = %node_id, %status, "restart did not recover node, replacing");
                ctx.action()
                    .append_out(&format!("restart of node {node_id} ended {status}, replacing"));
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl ActionLogic for RecoverNodeAction {
    fn kind_name(&self) -> &'static str {
        "recover"
    }

    fn label(&self) -> String {
        "Recover node".to_string()
    }

    fn display_name(&self, attributes: &AttributeStore) -> String {
        named("Recover node", attributes)
    }

    fn initialize(&mut self, config: &WardConfig) -> crate::Result<()> {
        self.settings = config.recovery.clone();
        Ok(())
    }

    fn schema(&self) -> AttributeSchema {
        AttributeSchema {
            action: self.label(),
            fields: vec![
                SchemaField::required(keys::NODE_ID.name(), "Node to recover"),
                SchemaField::optional(keys::TRY_RESTART.name(), "Restart before replacing"),
                SchemaField::optional(
                    keys::NODE_EXISTS.name(),
                    "False when the cluster no longer knows the node",
                ),
            ],
        }
    }

    async fn run(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let node_id = target_node(ctx.attributes())?;
        let node_exists = ctx.attributes().get(keys::NODE_EXISTS)?.unwrap_or(true);
        let try_restart = ctx.attributes().get(keys::TRY_RESTART)?.unwrap_or(false);
        ctx.action()
            .append_out(&format!("recovery of node {node_id} started"));

        if node_exists {
            if !ctx.cluster().contains_node(&node_id) {
                return Err(ActionError::Precondition(format!("node {node_id} not found")));
            }
            if try_restart && !self.settings.dry_run && self.try_restart(ctx, &node_id).await? {
                return Ok(());
            }
        }
        if ctx.is_cancelled() {
            return Err(ActionError::Cancelled);
        }

        let replace = Action::new(ActionKind::Replace(ReplaceNodeAction::new()));
        replace.attributes().copy_from(ctx.attributes(), keys::NODE_ID.name(), keys::NODE_ID.name());
        replace.attributes().set(keys::NODE_EXISTS, &node_exists)?;
        let replace = ctx.dispatch_child(replace)?;
        match ctx.await_child(&replace).await {
            ActionStatus::Succeeded => Ok(()),
            ActionStatus::Cancelled => Err(ActionError::Cancelled),
            _ => Err(ActionError::Failed(format!("failed to replace node {node_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use crate::engine::ActionEngine;
    use crate::testing::{
        fast_config, test_cluster, FakeCompute, Outcome, RecordingAlertSink, ScriptedOperation,
    };
    use std::time::Duration;

    fn recover(node: &str, try_restart: bool, node_exists: bool) -> Action {
        let action = Action::new(ActionKind::Recover(RecoverNodeAction::new())).with_owner("healer");
        action.attributes().set(keys::NODE_ID, &node.to_string()).unwrap();
        action.attributes().set(keys::TRY_RESTART, &try_restart).unwrap();
        action.attributes().set(keys::NODE_EXISTS, &node_exists).unwrap();
        action
    }

    async fn run(engine: &Arc<ActionEngine>, action: Action) -> Arc<Action> {
        let action = engine.dispatch(action).await.unwrap();
        let status = action.get(Some(Duration::from_secs(5))).await.unwrap();
        assert!(status.is_terminal());
        action
    }

    #[tokio::test]
    async fn replace_terminates_then_launches() {
        let compute = Arc::new(FakeCompute::default());
        let engine = ActionEngine::start(
            test_cluster(3),
            fast_config(),
            Collaborators::default().with_compute(compute.clone()),
        )
        .unwrap();
        let action = Action::new(ActionKind::Replace(ReplaceNodeAction::new())).with_owner("a");
        action.attributes().set(keys::NODE_ID, &"2".to_string()).unwrap();
        let action = run(&engine, action).await;

        assert_eq!(action.status(), ActionStatus::Succeeded);
        assert_eq!(action.name(), "Replace node 2");
        assert_eq!(compute.calls(), vec!["terminate 2", "launch 2", "wait i-2"]);
        assert!(action.result().out.contains("instance i-2 is running"));
    }

    #[tokio::test]
    async fn replace_retries_transient_launch_failures() {
        let compute = Arc::new(FakeCompute::failing_launches(2));
        let engine = ActionEngine::start(
            test_cluster(3),
            fast_config(),
            Collaborators::default().with_compute(compute.clone()),
        )
        .unwrap();
        let action = Action::new(ActionKind::Replace(ReplaceNodeAction::new())).with_owner("a");
        action.attributes().set(keys::NODE_ID, &"1".to_string()).unwrap();
        let action = run(&engine, action).await;

        assert_eq!(action.status(), ActionStatus::Succeeded);
        let launches = compute.calls().iter().filter(|c| *c == "launch 1").count();
        assert_eq!(launches, 3);
    }

    #[tokio::test]
    async fn replace_fails_when_instance_never_runs() {
        let compute = Arc::new(FakeCompute::settling_in(InstanceState::Terminated));
        let engine = ActionEngine::start(
            test_cluster(3),
            fast_config(),
            Collaborators::default().with_compute(compute),
        )
        .unwrap();
        let action = Action::new(ActionKind::Replace(ReplaceNodeAction::new())).with_owner("a");
        action.attributes().set(keys::NODE_ID, &"1".to_string()).unwrap();
        let action = run(&engine, action).await;

        assert_eq!(action.status(), ActionStatus::Failed);
        assert!(action.result().err.contains("instead of running"));
    }

    #[tokio::test]
    async fn replace_without_compute_is_a_precondition_failure() {
        let engine = ActionEngine::start(test_cluster(1), fast_config(), Collaborators::default()).unwrap();
        let action = Action::new(ActionKind::Replace(ReplaceNodeAction::new())).with_owner("a");
        action.attributes().set(keys::NODE_ID, &"0".to_string()).unwrap();
        let action = run(&engine, action).await;
        assert_eq!(action.status(), ActionStatus::Failed);
        assert!(action.result().err.contains("no compute lifecycle"));
    }

    #[tokio::test]
    async fn restart_that_recovers_skips_replacement() {
        let compute = Arc::new(FakeCompute::default());
        let alerts = Arc::new(RecordingAlertSink::default());
        let restart = Arc::new(ScriptedOperation::new("restart"));
        let engine = ActionEngine::start(
            test_cluster(3),
            fast_config(),
            Collaborators::new(alerts.clone())
                .with_compute(compute.clone())
                .with_restart(restart.clone()),
        )
        .unwrap();
        let action = run(&engine, recover("1", true, true)).await;

        assert_eq!(action.status(), ActionStatus::Succeeded);
        assert_eq!(restart.started(), vec!["1"]);
        assert!(compute.calls().is_empty());
        assert_eq!(action.children().len(), 1);
        assert!(alerts
            .messages()
            .contains(&"Node 1 on test recovered after restart".to_string()));
    }

    #[tokio::test]
    async fn failed_restart_falls_back_to_replacement() {
        let compute = Arc::new(FakeCompute::default());
        let restart =
            Arc::new(ScriptedOperation::new("restart").with_outcome("1", Outcome::ExitCode(1)));
        let engine = ActionEngine::start(
            test_cluster(3),
            fast_config(),
            Collaborators::default()
                .with_compute(compute.clone())
                .with_restart(restart),
        )
        .unwrap();
        let action = run(&engine, recover("1", true, true)).await;

        assert_eq!(action.status(), ActionStatus::Succeeded);
        assert_eq!(action.children().len(), 2);
        assert!(action.result().out.contains("restart of node 1 ended failed, replacing"));
        assert_eq!(compute.calls(), vec!["terminate 1", "launch 1", "wait i-1"]);
    }

    #[tokio::test]
    async fn unknown_node_goes_straight_to_launch() {
        let compute = Arc::new(FakeCompute::default());
        let restart = Arc::new(ScriptedOperation::new("restart"));
        let engine = ActionEngine::start(
            test_cluster(3),
            fast_config(),
            Collaborators::default()
                .with_compute(compute.clone())
                .with_restart(restart.clone()),
        )
        .unwrap();
        let action = run(&engine, recover("7", true, false)).await;

        assert_eq!(action.status(), ActionStatus::Succeeded);
        assert!(restart.started().is_empty());
        assert_eq!(compute.calls(), vec!["launch 7", "wait i-7"]);
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let compute = Arc::new(FakeCompute::default());
        let restart = Arc::new(ScriptedOperation::new("restart"));
        let mut config = fast_config();
        config.recovery.dry_run = true;
        let engine = ActionEngine::start(
            test_cluster(3),
            config,
            Collaborators::default()
                .with_compute(compute.clone())
                .with_restart(restart.clone()),
        )
        .unwrap();
        let action = run(&engine, recover("1", true, true)).await;

        assert_eq!(action.status(), ActionStatus::Succeeded);
        assert!(restart.started().is_empty());
        assert!(compute.calls().is_empty());
        assert!(action.children()[0]
            .result()
            .out
            .contains("dry run: skipping replacement of node 1"));
    }
}
