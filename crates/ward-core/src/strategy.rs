//! Cluster-wide strategies that apply one child action per node.
//!
//! Both strategies hold the cluster's strategy lock for their whole run, so
//! at most one of them touches a given cluster at a time.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{info, warn};

use crate::action::{
    Action, ActionContext, ActionError, ActionLogic, ActionStatus, AttributeSchema, ChildFactory,
    SchemaField,
};
use crate::attribute::{keys, AttributeStore};
use crate::collaborators::AlertLevel;
use crate::config::{StrategyConfig, WardConfig};

/// Target nodes from `nodeIds`, or every cluster node when the attribute is
/// absent and `require_explicit` is false. Unknown nodes are rejected.
pub(crate) fn select_nodes(
    ctx: &ActionContext,
    require_explicit: bool,
) -> Result<Vec<String>, ActionError> {
    let cluster = ctx.cluster();
    match ctx.attributes().get(keys::NODE_IDS)? {
        Some(ids) if !ids.is_empty() => {
            let mut selected: Vec<String> = Vec::with_capacity(ids.len());
            for id in ids {
                if !cluster.contains_node(&id) {
                    return Err(ActionError::Precondition(format!(
                        "node {id} is not part of cluster {}",
                        cluster.name()
                    )));
                }
                if !selected.contains(&id) {
                    selected.push(id);
                }
            }
            Ok(selected)
        }
        _ if require_explicit => Err(ActionError::Precondition(
            "No nodes provided in attribute nodeIds".to_string(),
        )),
        _ => Ok(cluster.node_ids()),
    }
}

/// A fresh child for `node` carrying a copy of the parent's attributes.
pub(crate) fn build_child(
    ctx: &ActionContext,
    factory: &ChildFactory,
    node: &str,
) -> Result<Action, ActionError> {
    let child = Action::new(factory());
    child.attributes().copy_all_from(ctx.attributes());
    child.attributes().set(keys::NODE_ID, &node.to_string())?;
    Ok(child)
}

pub(crate) fn join_nodes<I>(nodes: I) -> String
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let joined: Vec<String> = nodes.into_iter().map(|n| n.as_ref().to_string()).collect();
    if joined.is_empty() {
        "none".to_string()
    } else {
        joined.join(", ")
    }
}

fn display_with_nodes(label: String, attributes: &AttributeStore) -> String {
    match attributes.get(keys::NODE_IDS) {
        Ok(Some(ids)) if !ids.is_empty() => format!("{label} on {} nodes", ids.len()),
        _ => format!("{label} on all nodes"),
    }
}

fn strategy_schema(label: String, child: &ChildFactory) -> AttributeSchema {
    let mut fields = vec![
        SchemaField::optional(keys::NODE_IDS.name(), "Nodes to act on, default all"),
        SchemaField::optional(
            keys::CANCEL_ALL_IF_FAILED.name(),
            "Stop at the first failed node",
        ),
    ];
    fields.extend(
        child()
            .schema()
            .fields
            .into_iter()
            .filter(|f| f.key != keys::NODE_ID.name()),
    );
    AttributeSchema {
        action: label,
        fields,
    }
}

fn stop_on_failure(ctx: &ActionContext, settings: &StrategyConfig) -> Result<bool, ActionError> {
    Ok(ctx
        .attributes()
        .get(keys::CANCEL_ALL_IF_FAILED)?
        .unwrap_or(settings.cancel_all_if_failed))
}

/// Alert once with the outcome and turn failures into the run's error.
async fn report(
    ctx: &ActionContext,
    failed: &[String],
    skipped: &[String],
) -> Result<(), ActionError> {
    let name = ctx.action().name();
    let cluster = ctx.cluster().name();
    if failed.is_empty() {
        ctx.alert(AlertLevel::Medium, format!("{name} completed on cluster {cluster}"))
            .await;
        return Ok(());
    }
    let reason = format!(
        "failures on nodes {}; not attempted: {}",
        join_nodes(failed),
        join_nodes(skipped)
    );
    ctx.alert(
        AlertLevel::High,
        format!("{name} failed due to {reason} on cluster {cluster}"),
    )
    .await;
    Err(ActionError::Failed(reason))
}

// ---------------------------------------------------------------------------
// RollingAction
// ---------------------------------------------------------------------------

/// One node at a time, in order.
pub struct RollingAction {
    child: ChildFactory,
    settings: StrategyConfig,
}

impl RollingAction {
    pub fn new(child: ChildFactory) -> Self {
        Self {
            child,
            settings: StrategyConfig::default(),
        }
    }
}

#[async_trait]
impl ActionLogic for RollingAction {
    fn kind_name(&self) -> &'static str {
        "rolling"
    }

    fn label(&self) -> String {
        format!("Rolling-{}", (self.child)().label())
    }

    fn display_name(&self, attributes: &AttributeStore) -> String {
        display_with_nodes(self.label(), attributes)
    }

    fn initialize(&mut self, config: &WardConfig) -> crate::Result<()> {
        self.settings = config.strategy.clone();
        Ok(())
    }

    fn schema(&self) -> AttributeSchema {
        strategy_schema(self.label(), &self.child)
    }

    async fn run(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let nodes = select_nodes(ctx, false)?;
        let fail_fast = stop_on_failure(ctx, &self.settings)?;
        let _guard = ctx.cluster().lock_for_strategy().await;

        let mut failed = Vec::new();
        let mut skipped = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            if ctx.is_cancelled() {
                ctx.action().append_err("Action cancelled");
                return Err(ActionError::Cancelled);
            }
            let status = match build_child(ctx, &self.child, node)
                .and_then(|c| ctx.dispatch_child(c).map_err(ActionError::from))
            {
                Ok(child) => ctx.await_child(&child).await,
                Err(e) => {
                    warn!(node = %node, error = %e, "could not start child");
                    ActionStatus::Failed
                }
            };
            match status {
                ActionStatus::Succeeded => {
                    ctx.action().append_out(&format!("completed on node {node}"));
                }
                ActionStatus::Cancelled if ctx.is_cancelled() => {
                    ctx.action().append_err("Action cancelled");
                    return Err(ActionError::Cancelled);
                }
                status => {
                    ctx.action().append_err(&format!("node {node} ended {status}"));
                    failed.push(node.clone());
                    if fail_fast {
                        skipped.extend(nodes[i + 1..].iter().cloned());
                        info!(node = %node, skipped = skipped.len(), "stopping rolling action after failure");
                        break;
                    }
                }
            }
        }
        report(ctx, &failed, &skipped).await
    }
}

// ---------------------------------------------------------------------------
// ParallelAction
// ---------------------------------------------------------------------------

/// Every node at once.
pub struct ParallelAction {
    child: ChildFactory,
    settings: StrategyConfig,
}

impl ParallelAction {
    pub fn new(child: ChildFactory) -> Self {
        Self {
            child,
            settings: StrategyConfig::default(),
        }
    }
}

#[async_trait]
impl ActionLogic for ParallelAction {
    fn kind_name(&self) -> &'static str {
        "parallel"
    }

    fn label(&self) -> String {
        format!("Parallel-{}", (self.child)().label())
    }

    fn display_name(&self, attributes: &AttributeStore) -> String {
        display_with_nodes(self.label(), attributes)
    }

    fn initialize(&mut self, config: &WardConfig) -> crate::Result<()> {
        self.settings = config.strategy.clone();
        Ok(())
    }

    fn schema(&self) -> AttributeSchema {
        strategy_schema(self.label(), &self.child)
    }

    async fn run(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let nodes = select_nodes(ctx, false)?;
        let fail_fast = stop_on_failure(ctx, &self.settings)?;
        let _guard = ctx.cluster().lock_for_strategy().await;
        if ctx.is_cancelled() {
            ctx.action().append_err("Action cancelled");
            return Err(ActionError::Cancelled);
        }

        let mut failed = Vec::new();
        let mut children: Vec<(String, Arc<Action>)> = Vec::with_capacity(nodes.len());
        for node in &nodes {
            match build_child(ctx, &self.child, node)
                .and_then(|c| ctx.dispatch_child(c).map_err(ActionError::from))
            {
                Ok(child) => children.push((node.clone(), child)),
                Err(e) => {
                    warn!(node = %node, error = %e, "could not start child");
                    failed.push(node.clone());
                }
            }
        }
        let cancel_all = |children: &[(String, Arc<Action>)]| {
            for (_, child) in children {
                child.cancel(true);
            }
        };
        let mut siblings_cancelled = fail_fast && !failed.is_empty();
        if siblings_cancelled {
            cancel_all(&children);
        }

        let mut pending: FuturesUnordered<_> = children
            .iter()
            .map(|(node, child)| async move { (node.clone(), child.wait().await) })
            .collect();
        let mut forwarded = false;
        let mut stopped = Vec::new();
        loop {
            let next = if forwarded {
                pending.next().await
            } else {
                tokio::select! {
                    next = pending.next() => next,
                    _ = ctx.cancel_requested() => {
                        forwarded = true;
                        cancel_all(&children);
                        continue;
                    }
                }
            };
            let Some((node, status)) = next else { break };
            match status {
                ActionStatus::Succeeded => {
                    ctx.action().append_out(&format!("completed on node {node}"));
                }
                ActionStatus::Cancelled if siblings_cancelled || ctx.is_cancelled() => {
                    stopped.push(node);
                }
                status => {
                    ctx.action().append_err(&format!("node {node} ended {status}"));
                    failed.push(node);
                    if fail_fast && !siblings_cancelled {
                        siblings_cancelled = true;
                        cancel_all(&children);
                    }
                }
            }
        }
        drop(pending);

        if ctx.is_cancelled() {
            ctx.action().append_err("Action cancelled");
            return Err(ActionError::Cancelled);
        }
        stopped.sort();
        report(ctx, &failed, &stopped).await
    }
}
