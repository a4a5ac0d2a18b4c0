use crate::{Compiler, Endpoint, ExecutionResult, Flow, Manager, Registry};
use relaycore::{EventBus, ExecutionEvent, FlowError, Manifest, ManifestError, ReferenceStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

/// Main runtime: owns the registry, the event bus and the compiled flows
pub struct FlowRuntime {
    registry: Arc<Registry>,
    event_bus: Arc<EventBus>,
    config: RuntimeConfig,
    flows: RwLock<HashMap<String, Arc<Flow>>>,
}

impl FlowRuntime {
    /// Create a new runtime with default settings and an empty registry
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(Registry::new()), config)
    }

    /// Create a new runtime with a pre-populated registry
    pub fn with_registry(registry: Arc<Registry>, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        Self {
            registry,
            event_bus,
            config,
            flows: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Subscribe to execution events of every flow run by this runtime
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Register a flow, replacing any flow with the same name
    pub async fn register_flow(&self, flow: Flow) -> Arc<Flow> {
        let flow = Arc::new(flow);
        let mut flows = self.flows.write().await;
        if flows.insert(flow.name().to_string(), flow.clone()).is_some() {
            tracing::warn!("Replacing flow {}", flow.name());
        }
        flow
    }

    pub async fn flow(&self, name: &str) -> Option<Arc<Flow>> {
        self.flows.read().await.get(name).cloned()
    }

    pub async fn flow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flows.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Compiles the manifest, registers its flows and returns its endpoints
    /// ready to be bound to listeners.
    pub async fn load_manifest(&self, manifest: &Manifest) -> Result<Vec<Arc<Endpoint>>, FlowError> {
        let compiled = Compiler::new(&self.registry, &self.config, self.event_bus.clone()).compile(manifest)?;

        let mut flows = self.flows.write().await;
        for (name, flow) in compiled.flows {
            tracing::info!("Loaded flow {} ({} nodes)", name, flow.len());
            flows.insert(name, flow);
        }

        Ok(compiled.endpoints)
    }

    pub async fn manager(&self, name: &str) -> Result<Manager, FlowError> {
        let flow = self
            .flow(name)
            .await
            .ok_or_else(|| ManifestError::NotFound(name.to_string()))?;

        Ok(Manager::with_config(flow, self.event_bus.clone(), &self.config))
    }

    /// Execute a registered flow over the given store
    pub async fn execute(&self, name: &str, store: Arc<ReferenceStore>) -> Result<ExecutionResult, FlowError> {
        self.execute_with(name, store, CancellationToken::new()).await
    }

    pub async fn execute_with(
        &self,
        name: &str,
        store: Arc<ReferenceStore>,
        cancellation: CancellationToken,
    ) -> Result<ExecutionResult, FlowError> {
        self.manager(name).await?.run(store, cancellation).await
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Upper bound on node calls running at once within one execution
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    pub node_timeout: Option<Duration>,
    /// Pending chunks held by a response pipe
    pub stream_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 64,
            event_buffer_size: 1000,
            node_timeout: None,
            stream_buffer: 16,
        }
    }
}
