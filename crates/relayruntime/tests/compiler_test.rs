use async_trait::async_trait;
use relaycore::{
    BodyReader, BodyWriter, CallError, CallSpec, Caller, Codec, CodecError, EndpointSpec, EventBus,
    ExecutionEvent, Expression, FlowError, NodeEvent, FlowSpec, Manifest, ManifestError, NodeSpec, Reference, ReferenceStore,
    Request, ServiceSpec, Template,
};
use relayruntime::{
    CallerConstructor, CodecConstructor, Compiler, Registry, RuntimeConfig,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct TreeCodec {
    resource: String,
    message: Option<Template>,
}

#[async_trait]
impl Codec for TreeCodec {
    fn name(&self) -> &str {
        "tree"
    }

    async fn marshal(&self, store: Arc<ReferenceStore>) -> Result<BodyReader, CodecError> {
        let Some(message) = &self.message else {
            return Ok(BodyReader::empty());
        };
        let json = message.resolve(&store).unwrap_or(serde_json::Value::Null);
        let bytes = serde_json::to_vec(&json).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(BodyReader::from_bytes(bytes))
    }

    async fn unmarshal(&self, body: BodyReader, store: &ReferenceStore) -> Result<(), CodecError> {
        let bytes = body.read_to_end().await?;
        if bytes.is_empty() {
            return Ok(());
        }
        match serde_json::from_slice(&bytes).map_err(|e| CodecError::Decode(e.to_string()))? {
            serde_json::Value::Object(map) => store.store_values(&self.resource, "", &map),
            other => store.store_reference(&self.resource, Reference::from_json("", &other)),
        }
        Ok(())
    }
}

struct TreeCodecConstructor;

impl CodecConstructor for TreeCodecConstructor {
    fn name(&self) -> &str {
        "tree"
    }

    fn build(&self, resource: &str, message: Option<Template>) -> Result<Arc<dyn Codec>, ManifestError> {
        Ok(Arc::new(TreeCodec {
            resource: resource.to_string(),
            message,
        }))
    }
}

struct LoopbackCaller;

#[async_trait]
impl Caller for LoopbackCaller {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn call(&self, request: Request, response: BodyWriter, _store: Arc<ReferenceStore>) -> Result<(), CallError> {
        let body = request.body.read_to_end().await?;
        if request.endpoint == "/fail" {
            response.fail("refused").await;
            return Err(CallError::Remote {
                status: 503,
                message: "refused".to_string(),
            });
        }
        response.write(body).await?;
        response.finish().await?;
        Ok(())
    }
}

struct LoopbackConstructor;

impl CallerConstructor for LoopbackConstructor {
    fn name(&self) -> &str {
        "loopback"
    }

    fn dial(&self, _service: &ServiceSpec) -> Result<Arc<dyn Caller>, ManifestError> {
        Ok(Arc::new(LoopbackCaller))
    }
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_codec(Arc::new(TreeCodecConstructor));
    registry.register_caller(Arc::new(LoopbackConstructor));
    registry
}

fn service() -> ServiceSpec {
    ServiceSpec {
        name: "backend".to_string(),
        host: "local".to_string(),
        caller: "loopback".to_string(),
        codec: "tree".to_string(),
        options: HashMap::new(),
    }
}

fn manifest(flow: FlowSpec) -> Manifest {
    Manifest {
        services: vec![service()],
        flows: vec![flow],
        endpoints: Vec::new(),
    }
}

fn compile(manifest: &Manifest) -> Result<relayruntime::CompiledManifest, ManifestError> {
    let registry = registry();
    let config = RuntimeConfig::default();
    Compiler::new(&registry, &config, Arc::new(EventBus::default())).compile(manifest)
}

#[test]
fn test_references_add_implicit_dependencies() {
    let flow = FlowSpec::new("orders")
        .with_node(NodeSpec::new(
            "user",
            CallSpec::new("backend").with_request(json!({ "id": "{{ input:user_id }}" })),
        ))
        .with_node(NodeSpec::new(
            "orders",
            CallSpec::new("backend").with_request(json!({ "owner": "{{ user:id }}" })),
        ))
        .with_node(
            NodeSpec::new("notify", CallSpec::new("backend"))
                .with_condition(Expression::Exists("{{ orders:owner }}".to_string())),
        );

    let compiled = compile(&manifest(flow)).unwrap();
    let flow = compiled.flow("orders").unwrap();

    let user = flow.find("user").unwrap();
    let orders = flow.find("orders").unwrap();
    let notify = flow.find("notify").unwrap();
    assert!(flow.node(user).dependencies().is_empty());
    assert_eq!(flow.node(orders).dependencies(), &[user]);
    assert_eq!(flow.node(notify).dependencies(), &[orders]);
}

#[test]
fn test_reference_cycle_rejected() {
    let flow = FlowSpec::new("cycle")
        .with_node(NodeSpec::new(
            "a",
            CallSpec::new("backend").with_request(json!({ "x": "{{ b:x }}" })),
        ))
        .with_node(NodeSpec::new(
            "b",
            CallSpec::new("backend").with_request(json!({ "x": "{{ a:x }}" })),
        ));

    assert!(matches!(
        compile(&manifest(flow)),
        Err(ManifestError::CyclicDependency(_))
    ));
}

#[test]
fn test_unknown_names_rejected() {
    let flow = FlowSpec::new("f").with_node(NodeSpec::new("a", CallSpec::new("nowhere")));
    assert_eq!(
        compile(&manifest(flow)).err(),
        Some(ManifestError::UnknownService("nowhere".to_string()))
    );

    let flow = FlowSpec::new("f").with_node(NodeSpec::new(
        "a",
        CallSpec::new("backend").with_request(json!({ "x": "{{ ghost:x }}" })),
    ));
    assert_eq!(
        compile(&manifest(flow)).err(),
        Some(ManifestError::UnknownResource {
            node: "a".to_string(),
            resource: "ghost".to_string()
        })
    );

    let flow = FlowSpec::new("f").with_node(NodeSpec::new("a", CallSpec::new("backend")));
    let mut broken = manifest(flow);
    broken.services[0].codec = "xml".to_string();
    assert_eq!(compile(&broken).err(), Some(ManifestError::UnknownCodec("xml".to_string())));

    broken.services[0].codec = "tree".to_string();
    broken.services[0].caller = "grpc".to_string();
    assert_eq!(compile(&broken).err(), Some(ManifestError::UnknownCaller("grpc".to_string())));
}

#[test]
fn test_duplicates_rejected() {
    let mut duplicate = manifest(FlowSpec::new("f"));
    duplicate.flows.push(FlowSpec::new("f"));
    assert_eq!(compile(&duplicate).err(), Some(ManifestError::DuplicateFlow("f".to_string())));

    let mut duplicate = manifest(FlowSpec::new("f"));
    duplicate.services.push(service());
    assert_eq!(
        compile(&duplicate).err(),
        Some(ManifestError::DuplicateService("backend".to_string()))
    );
}

#[test]
fn test_endpoint_for_unknown_flow_rejected() {
    let mut manifest = manifest(FlowSpec::new("f"));
    manifest.endpoints.push(EndpointSpec {
        flow: "missing".to_string(),
        listener: "http".to_string(),
        codec: "tree".to_string(),
        options: HashMap::new(),
    });

    assert_eq!(compile(&manifest).err(), Some(ManifestError::NotFound("missing".to_string())));
}

fn pipeline() -> Manifest {
    let flow = FlowSpec::new("pipeline")
        .with_node(NodeSpec::new(
            "first",
            CallSpec::new("backend").with_request(json!({ "name": "{{ input:name }}", "step": 1 })),
        ))
        .with_node(NodeSpec::new(
            "second",
            CallSpec::new("backend").with_request(json!({ "name": "{{ first:name }}", "step": 2 })),
        ))
        .with_output(json!({ "name": "{{ second:name }}", "step": "{{ second:step }}" }));

    let mut manifest = manifest(flow);
    manifest.endpoints.push(EndpointSpec {
        flow: "pipeline".to_string(),
        listener: "test".to_string(),
        codec: "tree".to_string(),
        options: HashMap::new(),
    });
    manifest
}

#[tokio::test]
async fn test_endpoint_serves_flow() {
    let compiled = compile(&pipeline()).unwrap();
    let endpoint = &compiled.endpoints[0];
    assert_eq!(endpoint.flow(), "pipeline");
    assert_eq!(endpoint.listener(), "test");

    let store = Arc::new(ReferenceStore::new());
    let body = endpoint
        .serve(store.clone(), BodyReader::from_bytes(r#"{"name":"ada"}"#), CancellationToken::new())
        .await
        .unwrap();

    let response: serde_json::Value = serde_json::from_slice(&body.read_to_end().await.unwrap()).unwrap();
    assert_eq!(response, json!({ "name": "ada", "step": 2 }));
    assert_eq!(store.load_tree("first", ""), Some(json!({ "name": "ada", "step": 1 })));
}

#[tokio::test]
async fn test_remote_failure_fails_node() {
    let mut manifest = pipeline();
    manifest.flows[0].nodes[1].call.endpoint = "/fail".to_string();
    let compiled = compile(&manifest).unwrap();

    let err = compiled.endpoints[0]
        .serve(
            Arc::new(ReferenceStore::new()),
            BodyReader::from_bytes(r#"{"name":"ada"}"#),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        FlowError::NodeFailed { node, source } => {
            assert_eq!(node, "second");
            assert_eq!(
                source,
                CallError::Remote {
                    status: 503,
                    message: "refused".to_string()
                }
            );
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_rollback_compiled_from_manifest() {
    let mut manifest = pipeline();
    manifest.flows[0].nodes[0].rollback = Some(
        CallSpec::new("backend")
            .with_endpoint("/undo")
            .with_request(json!({ "undo": "{{ first:name }}" })),
    );
    manifest.flows[0].nodes[1].call.endpoint = "/fail".to_string();
    let compiled = compile(&manifest).unwrap();

    let store = Arc::new(ReferenceStore::new());
    let result = compiled.endpoints[0]
        .serve(store.clone(), BodyReader::from_bytes(r#"{"name":"ada"}"#), CancellationToken::new())
        .await;

    assert!(result.is_err());
    // the rollback response is decoded into the node's resource
    assert_eq!(store.load_tree("first", "undo"), Some(json!("ada")));
}

#[tokio::test]
async fn test_service_calls_report_progress() {
    let mut manifest = pipeline();
    manifest.flows[0].nodes[1].call.endpoint = "/fail".to_string();

    let registry = registry();
    let config = RuntimeConfig::default();
    let events = Arc::new(EventBus::default());
    let mut receiver = events.subscribe();
    let compiled = Compiler::new(&registry, &config, events).compile(&manifest).unwrap();

    let result = compiled.endpoints[0]
        .serve(
            Arc::new(ReferenceStore::new()),
            BodyReader::from_bytes(r#"{"name":"ada"}"#),
            CancellationToken::new(),
        )
        .await;
    assert!(result.is_err());

    let mut reported = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        if let ExecutionEvent::NodeEvent { node, event, .. } = event {
            let kind = match event {
                NodeEvent::Dispatched { service, .. } => format!("dispatched {}", service),
                NodeEvent::Responded { service } => format!("responded {}", service),
                NodeEvent::Warning { .. } => "warning".to_string(),
            };
            reported.push(format!("{}: {}", node, kind));
        }
    }

    assert_eq!(
        reported,
        vec![
            "first: dispatched backend",
            "first: responded backend",
            "second: dispatched backend",
            "second: warning",
        ]
    );
}
