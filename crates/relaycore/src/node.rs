use crate::{CallError, Condition, EventEmitter, ExecutionId, ReferenceStore};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stable index of a node inside its flow, assigned when the flow is compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The unit of work attached to a node.
///
/// Implementations read their inputs from the store, perform the external
/// call and write the response back under their own resource.
#[async_trait]
pub trait Call: Send + Sync {
    async fn call(&self, ctx: CallContext, store: Arc<ReferenceStore>) -> Result<(), CallError>;
}

/// Context passed to every call
#[derive(Clone)]
pub struct CallContext {
    pub execution_id: ExecutionId,

    /// Name of the flow being executed
    pub flow: String,

    /// Name of the node the call belongs to
    pub node: String,

    /// Cancelled when the execution is aborted by its owner
    pub cancellation: CancellationToken,

    pub events: EventEmitter,
}

/// Adapts an async closure into a [`Call`]
pub struct FnCall<F> {
    function: F,
}

#[async_trait]
impl<F, Fut> Call for FnCall<F>
where
    F: Fn(CallContext, Arc<ReferenceStore>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CallError>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, store: Arc<ReferenceStore>) -> Result<(), CallError> {
        (self.function)(ctx, store).await
    }
}

pub fn call_fn<F, Fut>(function: F) -> Arc<dyn Call>
where
    F: Fn(CallContext, Arc<ReferenceStore>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CallError>> + Send + 'static,
{
    Arc::new(FnCall { function })
}

/// A compiled step of a flow. Holds no per-execution state.
#[derive(Clone)]
pub struct Node {
    id: NodeId,
    name: String,
    dependencies: Vec<NodeId>,
    condition: Option<Arc<dyn Condition>>,
    call: Arc<dyn Call>,
    rollback: Option<Arc<dyn Call>>,
}

impl Node {
    pub fn new(id: NodeId, name: impl Into<String>, call: Arc<dyn Call>) -> Self {
        Self {
            id,
            name: name.into(),
            dependencies: Vec::new(),
            condition: None,
            call,
            rollback: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<NodeId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_condition(mut self, condition: Arc<dyn Condition>) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_rollback(mut self, rollback: Arc<dyn Call>) -> Self {
        self.rollback = Some(rollback);
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[NodeId] {
        &self.dependencies
    }

    pub fn condition(&self) -> Option<&Arc<dyn Condition>> {
        self.condition.as_ref()
    }

    pub fn call(&self) -> &Arc<dyn Call> {
        &self.call
    }

    pub fn rollback(&self) -> Option<&Arc<dyn Call>> {
        self.rollback.as_ref()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("conditional", &self.condition.is_some())
            .field("rollback", &self.rollback.is_some())
            .finish()
    }
}
