use crate::flow::Flow;
use crate::runtime::RuntimeConfig;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use relaycore::{
    CallContext, CallError, EventBus, ExecutionEvent, ExecutionId, FlowError, Node, NodeId,
    Outcome, Readiness, ReferenceStore, Tracker,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

type Running = FuturesUnordered<BoxFuture<'static, (NodeId, Result<Result<Outcome, CallError>, JoinError>)>>;

/// Schedules the nodes of one flow. Cheap to clone; every call to
/// [`Manager::run`] is an independent execution with its own tracker.
#[derive(Clone)]
pub struct Manager {
    flow: Arc<Flow>,
    events: Arc<EventBus>,
    max_parallel: usize,
    node_timeout: Option<Duration>,
}

impl Manager {
    pub fn new(flow: Arc<Flow>, events: Arc<EventBus>) -> Self {
        Self::with_config(flow, events, &RuntimeConfig::default())
    }

    pub fn with_config(flow: Arc<Flow>, events: Arc<EventBus>, config: &RuntimeConfig) -> Self {
        Self {
            flow,
            events,
            max_parallel: config.max_parallel_nodes.max(1),
            node_timeout: config.node_timeout,
        }
    }

    pub fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    /// Prepares an execution over the given store without starting it.
    /// The instance runs under a child of `cancellation`.
    pub fn instance(&self, store: Arc<ReferenceStore>, cancellation: CancellationToken) -> Instance {
        Instance {
            execution_id: ExecutionId::new_v4(),
            tracker: Arc::new(Tracker::new(self.flow.name(), self.flow.len())),
            flow: self.flow.clone(),
            store,
            events: self.events.clone(),
            cancellation: cancellation.child_token(),
            max_parallel: self.max_parallel,
            node_timeout: self.node_timeout,
        }
    }

    /// Executes the flow until every node settled or the first node failed
    pub async fn run(
        &self,
        store: Arc<ReferenceStore>,
        cancellation: CancellationToken,
    ) -> Result<ExecutionResult, FlowError> {
        self.instance(store, cancellation).run().await
    }
}

/// A single execution of a flow
#[derive(Clone)]
pub struct Instance {
    execution_id: ExecutionId,
    flow: Arc<Flow>,
    tracker: Arc<Tracker>,
    store: Arc<ReferenceStore>,
    events: Arc<EventBus>,
    cancellation: CancellationToken,
    max_parallel: usize,
    node_timeout: Option<Duration>,
}

impl Instance {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn store(&self) -> &Arc<ReferenceStore> {
        &self.store
    }

    /// Token observed by every node call of this execution
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Runs a single node under its exclusive lock.
    ///
    /// A node that was already traversed is not called again; its current
    /// outcome is returned instead. A node whose dependencies have not all
    /// settled is left untouched and reported as pending.
    pub async fn trigger(&self, id: NodeId) -> Result<Outcome, CallError> {
        let node = self.flow.node(id);
        let _guard = self.tracker.lock(id).await;

        let outcome = self.tracker.outcome(id);
        if outcome != Outcome::Pending {
            return Ok(outcome);
        }

        match self.tracker.readiness(node.dependencies()) {
            Readiness::Ready => {}
            Readiness::Skip => {
                self.skip(node);
                return Ok(self.tracker.outcome(id));
            }
            Readiness::Waiting | Readiness::Blocked => return Ok(Outcome::Pending),
        }

        if let Some(condition) = node.condition() {
            if !condition.evaluate(&self.store) {
                tracing::debug!("Condition of node {} not met", node.name());
                self.skip(node);
                return Ok(self.tracker.outcome(id));
            }
        }

        self.events.emit(ExecutionEvent::NodeStarted {
            execution_id: self.execution_id,
            node: node.name().to_string(),
            timestamp: Utc::now(),
        });

        let start = Instant::now();
        let ctx = self.context(node, self.cancellation.child_token());
        let call = limit(self.node_timeout, node.call().call(ctx, self.store.clone()));

        let result = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(CallError::Cancelled),
            result = call => result,
        };

        let duration_ms = millis(start.elapsed());
        match result {
            Ok(()) => {
                self.tracker.mark(id);
                tracing::info!("Node {} completed in {}ms", node.name(), duration_ms);
                self.events.emit(ExecutionEvent::NodeCompleted {
                    execution_id: self.execution_id,
                    node: node.name().to_string(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
                Ok(Outcome::Done)
            }
            Err(error) => {
                self.tracker.fail(id);
                self.emit_failed(node, &error);
                Err(error)
            }
        }
    }

    /// Drives the execution to completion. Dropping the returned future
    /// cancels the execution and aborts its running node tasks.
    pub async fn run(self) -> Result<ExecutionResult, FlowError> {
        let _cancel_on_drop = self.cancellation.clone().drop_guard();
        let start = Instant::now();
        let flow = self.flow.clone();

        tracing::info!("Starting flow {} ({})", flow.name(), self.execution_id);
        self.events.emit(ExecutionEvent::FlowStarted {
            execution_id: self.execution_id,
            flow: flow.name().to_string(),
            timestamp: Utc::now(),
        });

        let mut started = vec![false; flow.len()];
        let mut completed: Vec<NodeId> = Vec::new();
        let mut running: Running = FuturesUnordered::new();
        let mut failure: Option<FlowError> = None;

        loop {
            if failure.is_none() && self.cancellation.is_cancelled() {
                failure = Some(FlowError::Cancelled(flow.name().to_string()));
            }

            if failure.is_none() {
                self.schedule(&mut started, &mut running);
            }

            let Some((id, joined)) = running.next().await else {
                break;
            };

            let node = flow.node(id);
            match joined {
                Ok(Ok(Outcome::Done)) => completed.push(id),
                Ok(Ok(_)) => {}
                Ok(Err(CallError::Cancelled)) if self.cancellation.is_cancelled() => {
                    tracing::warn!("Node {} cancelled", node.name());
                    failure.get_or_insert_with(|| FlowError::Cancelled(flow.name().to_string()));
                }
                Ok(Err(error)) => {
                    tracing::error!("Node {} failed: {}", node.name(), error);
                    failure.get_or_insert(FlowError::NodeFailed {
                        node: node.name().to_string(),
                        source: error,
                    });
                }
                Err(join_error) => {
                    let error = CallError::ExecutionFailed(format!("Task join error: {}", join_error));
                    tracing::error!("Node {} failed: {}", node.name(), error);
                    self.tracker.fail(id);
                    self.emit_failed(node, &error);
                    failure.get_or_insert(FlowError::NodeFailed {
                        node: node.name().to_string(),
                        source: error,
                    });
                }
            }
        }

        let failure = failure.or_else(|| self.verify());
        let duration_ms = millis(start.elapsed());

        self.events.emit(ExecutionEvent::FlowCompleted {
            execution_id: self.execution_id,
            flow: flow.name().to_string(),
            success: failure.is_none(),
            duration_ms,
            timestamp: Utc::now(),
        });

        if let Some(error) = failure {
            tracing::error!("Flow {} failed after {}ms: {}", flow.name(), duration_ms, error);
            self.rollback(&completed).await;
            return Err(error);
        }

        tracing::info!("Flow {} completed in {}ms", flow.name(), duration_ms);

        let states = self.tracker.snapshot();
        let outcomes: HashMap<String, Outcome> = flow
            .nodes()
            .iter()
            .map(|node| (node.name().to_string(), states[node.id().index()].outcome))
            .collect();

        Ok(ExecutionResult {
            execution_id: self.execution_id,
            flow: flow.name().to_string(),
            completed_nodes: completed.len(),
            skipped_nodes: states.iter().filter(|state| state.outcome == Outcome::Skipped).count(),
            total_nodes: flow.len(),
            duration_ms,
            outcomes,
        })
    }

    /// Skips nodes downstream of a skip and spawns every ready node, up to
    /// the parallel limit.
    fn schedule(&self, started: &mut [bool], running: &mut Running) {
        loop {
            let mut progressed = false;

            for &id in self.flow.order() {
                if started[id.index()] {
                    continue;
                }

                let node = self.flow.node(id);
                match self.tracker.readiness(node.dependencies()) {
                    Readiness::Waiting | Readiness::Blocked => {}
                    Readiness::Skip => {
                        started[id.index()] = true;
                        self.skip(node);
                        progressed = true;
                    }
                    Readiness::Ready => {
                        if running.len() >= self.max_parallel {
                            continue;
                        }

                        started[id.index()] = true;
                        tracing::debug!("Scheduling node {} of flow {}", node.name(), self.flow.name());

                        let instance = self.clone();
                        // aborted if the execution is dropped before the call finished
                        let task = AbortOnDropHandle::new(tokio::spawn(async move { instance.trigger(id).await }));
                        running.push(async move { (id, task.await) }.boxed());
                    }
                }
            }

            if !progressed {
                break;
            }
        }
    }

    /// Every node of a drained execution must have been traversed exactly once
    fn verify(&self) -> Option<FlowError> {
        self.flow
            .nodes()
            .iter()
            .find(|node| !self.tracker.reached(node.id(), 1))
            .map(|node| {
                FlowError::Execution(format!(
                    "node {} of flow {} was traversed {} times",
                    node.name(),
                    self.flow.name(),
                    self.tracker.state(node.id()).calls
                ))
            })
    }

    /// Runs the compensating calls of completed nodes, most recent first.
    /// Failures are logged and never replace the primary error.
    async fn rollback(&self, completed: &[NodeId]) {
        for &id in completed.iter().rev() {
            let node = self.flow.node(id);
            let Some(rollback) = node.rollback() else {
                continue;
            };

            tracing::info!("Rolling back node {}", node.name());
            let ctx = self.context(node, CancellationToken::new());
            if let Err(error) = rollback.call(ctx, self.store.clone()).await {
                tracing::warn!("Rollback of node {} failed: {}", node.name(), error);
            }
        }
    }

    fn skip(&self, node: &Node) {
        if !self.tracker.skip_pending(node.id()) {
            return;
        }

        tracing::debug!("Skipping node {}", node.name());
        self.events.emit(ExecutionEvent::NodeSkipped {
            execution_id: self.execution_id,
            node: node.name().to_string(),
            timestamp: Utc::now(),
        });
    }

    fn emit_failed(&self, node: &Node, error: &CallError) {
        self.events.emit(ExecutionEvent::NodeFailed {
            execution_id: self.execution_id,
            node: node.name().to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn context(&self, node: &Node, cancellation: CancellationToken) -> CallContext {
        CallContext {
            execution_id: self.execution_id,
            flow: self.flow.name().to_string(),
            node: node.name().to_string(),
            cancellation,
            events: self.events.create_emitter(self.execution_id, node.name()),
        }
    }
}

async fn limit<F>(duration: Option<Duration>, call: F) -> Result<(), CallError>
where
    F: Future<Output = Result<(), CallError>>,
{
    match duration {
        Some(duration) => timeout(duration, call).await.unwrap_or(Err(CallError::Timeout {
            millis: millis(duration),
        })),
        None => call.await,
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Summary of a successful execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub flow: String,
    pub outcomes: HashMap<String, Outcome>,
    pub completed_nodes: usize,
    pub skipped_nodes: usize,
    pub total_nodes: usize,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn outcome(&self, node: &str) -> Option<Outcome> {
        self.outcomes.get(node).copied()
    }
}
