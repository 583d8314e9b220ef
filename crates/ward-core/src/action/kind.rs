use async_trait::async_trait;

use crate::action::node_task::NodeTask;
use crate::action::recovery::{RecoverNodeAction, ReplaceNodeAction};
use crate::action::{ActionContext, ActionError, ActionLogic, AttributeSchema};
use crate::attribute::AttributeStore;
use crate::config::WardConfig;
use crate::scheduler::ConcurrentAction;
use crate::strategy::{ParallelAction, RollingAction};

/// The closed set of action variants.
pub enum ActionKind {
    Node(NodeTask),
    Rolling(RollingAction),
    Parallel(ParallelAction),
    Concurrent(ConcurrentAction),
    Replace(ReplaceNodeAction),
    Recover(RecoverNodeAction),
}

impl ActionKind {
    fn logic(&self) -> &dyn ActionLogic {
        match self {
            ActionKind::Node(a) => a,
            ActionKind::Rolling(a) => a,
            ActionKind::Parallel(a) => a,
            ActionKind::Concurrent(a) => a,
            ActionKind::Replace(a) => a,
            ActionKind::Recover(a) => a,
        }
    }

    fn logic_mut(&mut self) -> &mut dyn ActionLogic {
        match self {
            ActionKind::Node(a) => a,
            ActionKind::Rolling(a) => a,
            ActionKind::Parallel(a) => a,
            ActionKind::Concurrent(a) => a,
            ActionKind::Replace(a) => a,
            ActionKind::Recover(a) => a,
        }
    }
}

#[async_trait]
impl ActionLogic for ActionKind {
    fn kind_name(&self) -> &'static str {
        self.logic().kind_name()
    }

    fn label(&self) -> String {
        self.logic().label()
    }

    fn display_name(&self, attributes: &AttributeStore) -> String {
        self.logic().display_name(attributes)
    }

    fn initialize(&mut self, config: &WardConfig) -> crate::Result<()> {
        self.logic_mut().initialize(config)
    }

    fn schema(&self) -> AttributeSchema {
        self.logic().schema()
    }

    async fn run(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        self.logic().run(ctx).await
    }
}

impl std::fmt::Debug for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ActionKind::{}({})", self.kind_name(), self.label())
    }
}
