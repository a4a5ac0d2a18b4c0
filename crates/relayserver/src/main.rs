use actix_cors::Cors;
use actix_web::{get, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult};
use actix_ws::Message;
use relaycore::Manifest;
use relayruntime::{bind_listeners, FlowRuntime, Listener, Registry, RuntimeConfig};
use relayserver::{HttpListener, ListenerOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
struct AppState {
    runtime: Arc<FlowRuntime>,
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "relay"
    }))
}

/// List loaded flows
#[get("/api/flows")]
async fn list_flows(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let mut flows = Vec::new();
    for name in data.runtime.flow_names().await {
        if let Some(flow) = data.runtime.flow(&name).await {
            flows.push(serde_json::json!({
                "name": flow.name(),
                "nodes": flow.nodes().iter().map(|node| node.name()).collect::<Vec<_>>(),
            }));
        }
    }

    Ok(HttpResponse::Ok().json(flows))
}

/// List available codecs and callers
#[get("/api/components")]
async fn list_components(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let registry = data.runtime.registry();

    let codecs: Vec<_> = registry
        .list_codecs()
        .iter()
        .map(|name| {
            serde_json::json!({
                "name": name,
                "description": registry.codec_metadata(name).map(|m| m.description).unwrap_or_default(),
            })
        })
        .collect();

    let callers: Vec<_> = registry
        .list_callers()
        .iter()
        .map(|name| {
            serde_json::json!({
                "name": name,
                "description": registry.caller_metadata(name).map(|m| m.description).unwrap_or_default(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(serde_json::json!({ "codecs": codecs, "callers": callers })))
}

/// WebSocket endpoint for real-time execution events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");

    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(_) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🚀 Starting Relay Server");

    let mut registry = Registry::new();
    relaycalls::register_all(&mut registry);

    let runtime = Arc::new(FlowRuntime::with_registry(Arc::new(registry), RuntimeConfig::default()));

    info!("✅ Runtime initialized with standard components");

    let mut listener_options = HashMap::new();
    for (key, var) in [("read_timeout", "RELAY_READ_TIMEOUT"), ("write_timeout", "RELAY_WRITE_TIMEOUT")] {
        if let Ok(value) = std::env::var(var) {
            listener_options.insert(key.to_string(), value);
        }
    }
    let options = ListenerOptions::parse(&listener_options)?;

    let mut http = HttpListener::with_options(options);
    match std::env::var("RELAY_MANIFEST") {
        Ok(path) => {
            let manifest = Manifest::load(&path)?;
            let endpoints = runtime.load_manifest(&manifest).await?;
            let mut listeners: [&mut dyn Listener; 1] = [&mut http];
            bind_listeners(&endpoints, &mut listeners)?;
            info!("📄 Loaded manifest {} ({} endpoints)", path, endpoints.len());
        }
        Err(_) => tracing::warn!("RELAY_MANIFEST not set, serving no flows"),
    }

    let app_state = web::Data::new(AppState { runtime });
    let http = Arc::new(http);

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("🌐 Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let http = http.clone();
        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(list_flows)
            .service(list_components)
            .service(websocket_events)
            .configure(move |cfg| http.configure(cfg))
    })
    .client_request_timeout(options.read_timeout)
    .client_disconnect_timeout(options.write_timeout)
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
