use crate::options::{EndpointOptions, ListenerOptions};
use actix_web::http::Method;
use actix_web::{web, HttpRequest, HttpResponse};
use relaycore::{BodyReader, FlowError, ManifestError, ReferenceStore, StreamError, PARAMS_RESOURCE};
use relayruntime::{Endpoint, Listener};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Clone)]
struct Route {
    options: EndpointOptions,
    endpoint: Arc<Endpoint>,
}

/// Serves endpoints as HTTP routes.
///
/// Every endpoint needs an `endpoint` option holding the route path; path
/// segments written `{name}` are stored in the `params` resource. The
/// `method` option defaults to `POST`.
#[derive(Clone, Default)]
pub struct HttpListener {
    routes: Vec<Route>,
    options: ListenerOptions,
}

impl HttpListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ListenerOptions) -> Self {
        Self {
            routes: Vec::new(),
            options,
        }
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }

    pub fn routes(&self) -> impl Iterator<Item = (&Method, &str)> {
        self.routes
            .iter()
            .map(|route| (&route.options.method, route.options.endpoint.as_str()))
    }

    /// Registers one actix route per bound endpoint
    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        for route in &self.routes {
            let shared = Arc::new(route.clone());
            cfg.route(
                &route.options.endpoint,
                web::method(route.options.method.clone()).to(move |req: HttpRequest, body: web::Bytes| {
                    let route = shared.clone();
                    async move { serve(route, req, body).await }
                }),
            );
        }
    }
}

impl Listener for HttpListener {
    fn name(&self) -> &str {
        "http"
    }

    fn handle(&mut self, endpoints: Vec<Arc<Endpoint>>) -> Result<(), ManifestError> {
        for endpoint in endpoints {
            let options = EndpointOptions::parse(endpoint.flow(), endpoint.options())?;
            info!("Routing {} {} to flow {}", options.method, options.endpoint, endpoint.flow());
            self.routes.push(Route { options, endpoint });
        }

        Ok(())
    }
}

async fn serve(route: Arc<Route>, req: HttpRequest, body: web::Bytes) -> HttpResponse {
    let endpoint = &route.endpoint;
    let store = Arc::new(ReferenceStore::new());
    for (key, value) in req.match_info().iter() {
        store.store_value(PARAMS_RESOURCE, key, value);
    }

    // cancels the flow when actix drops the handler
    let cancellation = CancellationToken::new();
    let _cancel_on_drop = cancellation.clone().drop_guard();

    let served = endpoint.serve(store, BodyReader::from_bytes(body.to_vec()), cancellation.clone());
    let result = match timeout(route.options.read_timeout, served).await {
        Ok(result) => result,
        Err(_) => {
            error!("Flow {} did not finish within {:?}", endpoint.flow(), route.options.read_timeout);
            return HttpResponse::GatewayTimeout().json(ErrorResponse {
                error: format!("Flow {} timed out", endpoint.flow()),
            });
        }
    };

    match result {
        Ok(reader) => {
            let write_timeout = route.options.write_timeout;
            let stream = futures::stream::unfold(reader, move |mut reader| async move {
                match timeout(write_timeout, reader.chunk()).await {
                    Ok(Ok(Some(chunk))) => Some((Ok::<_, StreamError>(web::Bytes::from(chunk)), reader)),
                    Ok(Ok(None)) => None,
                    Ok(Err(e)) => Some((Err(e), reader)),
                    Err(_) => Some((
                        Err(StreamError::Producer(format!("no data within {:?}", write_timeout))),
                        reader,
                    )),
                }
            });

            HttpResponse::Ok()
                .content_type(endpoint.content_type())
                .streaming(stream)
        }
        Err(e) => {
            error!("Flow {} failed: {}", endpoint.flow(), e);
            let body = ErrorResponse { error: e.to_string() };
            match e {
                FlowError::Codec(_) => HttpResponse::BadRequest().json(body),
                _ => HttpResponse::InternalServerError().json(body),
            }
        }
    }
}
