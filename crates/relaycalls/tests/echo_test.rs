use relaycalls::{register_all, EchoCallerConstructor};
use relaycore::{
    pipe, BodyReader, CallError, CallSpec, Caller, EndpointSpec, Expression, FlowError, FlowSpec,
    Manifest, NodeSpec, Outcome, ReferenceStore, Request, ServiceSpec, INPUT_RESOURCE,
};
use relayruntime::{CallerConstructor, FlowRuntime, Registry, RuntimeConfig};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

fn service(name: &str, delay_ms: Option<&str>) -> ServiceSpec {
    let mut options = HashMap::new();
    if let Some(delay) = delay_ms {
        options.insert("delay_ms".to_string(), delay.to_string());
    }

    ServiceSpec {
        name: name.to_string(),
        host: "local".to_string(),
        caller: "echo".to_string(),
        codec: "json".to_string(),
        options,
    }
}

fn runtime() -> FlowRuntime {
    let mut registry = Registry::new();
    register_all(&mut registry);
    FlowRuntime::with_registry(Arc::new(registry), RuntimeConfig::default())
}

fn request(body: &str, cancellation: CancellationToken) -> Request {
    Request {
        method: "POST".to_string(),
        endpoint: "/".to_string(),
        headers: HashMap::new(),
        body: BodyReader::from_bytes(body.to_string()),
        cancellation,
    }
}

#[tokio::test]
async fn test_echo_returns_request_body() {
    let caller = EchoCallerConstructor.dial(&service("mirror", None)).unwrap();
    let (writer, reader) = pipe(4);

    caller
        .call(request("ping", CancellationToken::new()), writer, Arc::new(ReferenceStore::new()))
        .await
        .unwrap();

    assert_eq!(reader.read_to_end().await.unwrap(), b"ping");
}

#[tokio::test]
async fn test_echo_delay_is_cancellable() {
    let caller = EchoCallerConstructor.dial(&service("mirror", Some("5000"))).unwrap();
    let (writer, reader) = pipe(4);
    let token = CancellationToken::new();
    token.cancel();

    let err = caller
        .call(request("ping", token), writer, Arc::new(ReferenceStore::new()))
        .await
        .unwrap_err();

    assert_eq!(err, CallError::Cancelled);
    assert!(reader.read_to_end().await.is_err());
}

#[test]
fn test_invalid_delay_rejected() {
    assert!(EchoCallerConstructor.dial(&service("mirror", Some("soon"))).is_err());
}

fn checkout() -> Manifest {
    let flow = FlowSpec::new("checkout")
        .with_node(NodeSpec::new(
            "cart",
            CallSpec::new("fast").with_request(json!({
                "id": "{{ input:cart }}",
                "total": "{{ input:total }}",
                "express": "{{ input:express }}"
            })),
        ))
        .with_node(NodeSpec::new(
            "stock",
            CallSpec::new("slow").with_request(json!({ "cart": "{{ cart:id }}", "available": true })),
        ))
        .with_node(NodeSpec::new(
            "payment",
            CallSpec::new("slow").with_request(json!({ "cart": "{{ cart:id }}", "charged": "{{ cart:total }}" })),
        ))
        .with_node(
            NodeSpec::new(
                "express",
                CallSpec::new("fast").with_request(json!({ "cart": "{{ cart:id }}" })),
            )
            .with_condition(Expression::Equals(json!("{{ cart:express }}"), json!(true))),
        )
        .with_node(
            NodeSpec::new(
                "confirm",
                CallSpec::new("fast").with_request(json!({
                    "cart": "{{ payment:cart }}",
                    "charged": "{{ payment:charged }}",
                    "available": "{{ stock:available }}"
                })),
            ),
        )
        .with_output(json!({
            "cart": "{{ confirm:cart }}",
            "charged": "{{ confirm:charged }}",
            "available": "{{ confirm:available }}",
            "express": "{{ express:cart }}"
        }));

    Manifest {
        services: vec![service("fast", None), service("slow", Some("100"))],
        flows: vec![flow],
        endpoints: vec![EndpointSpec {
            flow: "checkout".to_string(),
            listener: "test".to_string(),
            codec: "json".to_string(),
            options: HashMap::new(),
        }],
    }
}

#[tokio::test]
async fn test_manifest_flow_end_to_end() {
    init_tracing();
    let runtime = runtime();
    let endpoints = runtime.load_manifest(&checkout()).await.unwrap();

    let started = Instant::now();
    let body = endpoints[0]
        .serve(
            Arc::new(ReferenceStore::new()),
            BodyReader::from_bytes(r#"{"cart":"c-1","total":12.5,"express":false}"#),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();

    let response: serde_json::Value = serde_json::from_slice(&body.read_to_end().await.unwrap()).unwrap();
    assert_eq!(response, json!({ "cart": "c-1", "charged": 12.5, "available": true }));

    // stock and payment run side by side
    assert!(elapsed < Duration::from_millis(190), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_condition_enables_branch() {
    init_tracing();
    let runtime = runtime();
    runtime.load_manifest(&checkout()).await.unwrap();

    let store = Arc::new(ReferenceStore::new());
    let input = json!({ "cart": "c-2", "total": 3, "express": true });
    store.store_values(INPUT_RESOURCE, "", input.as_object().unwrap());

    let result = runtime.execute("checkout", store.clone()).await.unwrap();

    assert_eq!(result.outcome("express"), Some(Outcome::Done));
    assert_eq!(result.skipped_nodes, 0);
    assert_eq!(store.load_tree("express", "cart"), Some(json!("c-2")));
}

#[tokio::test]
async fn test_invalid_input_fails_before_running() {
    let runtime = runtime();
    let endpoints = runtime.load_manifest(&checkout()).await.unwrap();

    let err = endpoints[0]
        .serve(
            Arc::new(ReferenceStore::new()),
            BodyReader::from_bytes("not json"),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::Codec(_)));
}
