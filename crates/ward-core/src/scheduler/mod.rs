//! Dependency-aware concurrent execution across a cluster.
//!
//! A [`ConcurrentAction`] runs one child per target node, admitting at most
//! `maxConcurrency` at a time and never two nodes that hold replicas of a
//! common shard. On the first failure it stops admitting, waits for the
//! in-flight children to settle, and reports what never ran.

pub mod graph;
pub mod plan;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::action::{
    Action, ActionContext, ActionError, ActionLogic, ActionStatus, AttributeSchema, ChildFactory,
    SchemaField,
};
use crate::attribute::{keys, AttributeStore};
use crate::collaborators::{retry_with_backoff, AlertLevel, ShardReplicas};
use crate::config::{SchedulerConfig, WardConfig};
use crate::strategy::{build_child, join_nodes, select_nodes};

pub use graph::DependencyGraph;
pub use plan::AdmissionPlan;

pub struct ConcurrentAction {
    child: ChildFactory,
    settings: SchedulerConfig,
}

impl ConcurrentAction {
    pub fn new(child: ChildFactory) -> Self {
        Self {
            child,
            settings: SchedulerConfig::default(),
        }
    }

    fn child_label(&self) -> String {
        (self.child)().label()
    }

    /// Shard placement from the topology collaborator when configured,
    /// otherwise from the cluster's published topology attribute.
    async fn topology(&self, ctx: &ActionContext) -> Result<Vec<ShardReplicas>, ActionError> {
        if let Some(source) = ctx.engine().collaborators().topology.clone() {
            let recovery = &ctx.config().recovery;
            let cluster_id = ctx.cluster().id().to_string();
            return retry_with_backoff(
                "topology",
                recovery.collaborator_retries,
                recovery.retry_backoff(),
                || source.shards(&cluster_id),
            )
            .await
            .map_err(|e| ActionError::collaborator("topology", e));
        }
        ctx.cluster().attributes().get(keys::TOPOLOGY)?.ok_or_else(|| {
            ActionError::Precondition(
                "no topology available to build the dependency graph".to_string(),
            )
        })
    }

    fn settle_finished(
        current: &mut BTreeMap<String, Arc<Action>>,
        plan: &mut AdmissionPlan,
        failed: &mut BTreeSet<String>,
    ) {
        let finished: Vec<String> = current
            .iter()
            .filter(|(_, child)| child.is_done())
            .map(|(node, _)| node.clone())
            .collect();
        for node in finished {
            if let Some(child) = current.remove(&node) {
                if child.status() != ActionStatus::Succeeded {
                    failed.insert(node.clone());
                }
            }
            plan.settle(&node);
        }
    }

    async fn drain(
        &self,
        ctx: &ActionContext,
        mut current: BTreeMap<String, Arc<Action>>,
        mut plan: AdmissionPlan,
        mut failed: BTreeSet<String>,
        interval: Duration,
    ) -> Result<(), ActionError> {
        let cluster = ctx.cluster().name().to_string();
        let action = ctx.action();
        warn!(
            action = %action.name(),
            failed = %join_nodes(&failed),
            in_flight = %join_nodes(plan.in_flight()),
            "concurrent action failed, draining"
        );
        ctx.alert(
            AlertLevel::High,
            format!(
                "Concurrent action {} failed on {cluster} (nodes: {}), draining current actions: {}",
                action.name(),
                join_nodes(&failed),
                join_nodes(plan.in_flight()),
            ),
        )
        .await;

        let mut interrupted = false;
        loop {
            Self::settle_finished(&mut current, &mut plan, &mut failed);
            if current.is_empty() {
                break;
            }
            if interrupted {
                tokio::time::sleep(interval).await;
            } else if !ctx.pause(interval).await {
                interrupted = true;
                for child in current.values() {
                    child.cancel(true);
                }
                ctx.alert(
                    AlertLevel::High,
                    format!(
                        "Draining of {} on {cluster} was interrupted, cancelling: {}",
                        action.name(),
                        join_nodes(current.keys()),
                    ),
                )
                .await;
            }
        }

        ctx.alert(
            AlertLevel::Medium,
            format!("Draining of {} on {cluster} is complete", action.name()),
        )
        .await;
        Err(ActionError::Failed(format!(
            "Failed to complete action on {}, remaining nodes that haven't performed the action: {}",
            join_nodes(&failed),
            join_nodes(plan.remaining()),
        )))
    }

    async fn abandon(
        &self,
        ctx: &ActionContext,
        current: &BTreeMap<String, Arc<Action>>,
        plan: &AdmissionPlan,
    ) -> Result<(), ActionError> {
        for child in current.values() {
            child.cancel(true);
        }
        let action = ctx.action();
        info!(action = %action.name(), in_flight = current.len(), "concurrent action cancelled");
        ctx.alert(
            AlertLevel::Medium,
            format!(
                "{} cancelled on cluster {}; cancelling in-flight nodes: {}; never started: {}",
                action.name(),
                ctx.cluster().name(),
                join_nodes(current.keys()),
                join_nodes(plan.remaining()),
            ),
        )
        .await;
        action.append_err("Action cancelled");
        Err(ActionError::Cancelled)
    }
}

#[async_trait]
impl ActionLogic for ConcurrentAction {
    fn kind_name(&self) -> &'static str {
        "concurrent"
    }

    fn label(&self) -> String {
        format!("Concurrent-{}", self.child_label())
    }

    fn display_name(&self, attributes: &AttributeStore) -> String {
        match attributes.get(keys::NODE_IDS) {
            Ok(Some(ids)) => format!("{} on {} nodes", self.label(), ids.len()),
            _ => self.label(),
        }
    }

    fn initialize(&mut self, config: &WardConfig) -> crate::Result<()> {
        self.settings = config.scheduler.clone();
        Ok(())
    }

    fn schema(&self) -> AttributeSchema {
        let mut fields = vec![
            if self.settings.fail_if_no_node_ids {
                SchemaField::required(keys::NODE_IDS.name(), "Nodes to act on")
            } else {
                SchemaField::optional(keys::NODE_IDS.name(), "Nodes to act on, default all")
            },
            SchemaField::optional(keys::MAX_CONCURRENCY.name(), "Nodes acted on at once"),
            SchemaField::optional(
                keys::CHECKING_INTERVAL_MS.name(),
                "Milliseconds between admission ticks",
            ),
        ];
        fields.extend(
            (self.child)()
                .schema()
                .fields
                .into_iter()
                .filter(|f| f.key != keys::NODE_ID.name()),
        );
        AttributeSchema {
            action: self.label(),
            fields,
        }
    }

    async fn run(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let attrs = ctx.attributes();
        let nodes = select_nodes(ctx, self.settings.fail_if_no_node_ids)?;
        let max_concurrency = attrs
            .get(keys::MAX_CONCURRENCY)?
            .unwrap_or(self.settings.max_concurrency);
        if max_concurrency == 0 {
            return Err(ActionError::Precondition(
                "maxConcurrency must be at least 1".to_string(),
            ));
        }
        let interval = attrs
            .get(keys::CHECKING_INTERVAL_MS)?
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.settings.checking_interval());

        let shards = self.topology(ctx).await?;
        let mut plan = AdmissionPlan::new(DependencyGraph::from_shards(&nodes, &shards), max_concurrency);
        let mut current: BTreeMap<String, Arc<Action>> = BTreeMap::new();
        info!(
            action = %ctx.action().name(),
            nodes = nodes.len(),
            max_concurrency,
            "concurrent action started"
        );

        loop {
            if ctx.is_cancelled() {
                return self.abandon(ctx, &current, &plan).await;
            }
            let mut failed = BTreeSet::new();
            Self::settle_finished(&mut current, &mut plan, &mut failed);
            if !failed.is_empty() {
                return self.drain(ctx, current, plan, failed, interval).await;
            }
            if plan.is_complete() {
                break;
            }

            let admitted = plan.admit();
            for node in &admitted {
                let dispatched = build_child(ctx, &self.child, node)
                    .and_then(|child| ctx.dispatch_child(child).map_err(ActionError::from));
                match dispatched {
                    Ok(child) => {
                        current.insert(node.clone(), child);
                    }
                    Err(e) => {
                        warn!(node = %node, error = %e, "could not start child");
                        plan.settle(node);
                        failed.insert(node.clone());
                    }
                }
            }
            if !failed.is_empty() {
                return self.drain(ctx, current, plan, failed, interval).await;
            }
            if !admitted.is_empty() {
                let remaining = join_nodes(plan.remaining());
                info!(started = %join_nodes(&admitted), %remaining, "admitted nodes");
                ctx.action().append_out(&format!("Remaining nodes: {remaining}"));
            }

            ctx.pause(interval).await;
        }

        ctx.alert(
            AlertLevel::Medium,
            format!(
                "{} completed on cluster {}",
                ctx.action().name(),
                ctx.cluster().name()
            ),
        )
        .await;
        Ok(())
    }
}
