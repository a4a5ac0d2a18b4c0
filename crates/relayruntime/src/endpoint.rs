use crate::manager::Manager;
use relaycore::{BodyReader, Codec, FlowError, ManifestError, ReferenceStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A flow exposed through a listener
pub struct Endpoint {
    manager: Manager,
    listener: String,
    request: Arc<dyn Codec>,
    response: Arc<dyn Codec>,
    options: HashMap<String, String>,
}

impl Endpoint {
    pub fn new(
        manager: Manager,
        listener: impl Into<String>,
        request: Arc<dyn Codec>,
        response: Arc<dyn Codec>,
        options: HashMap<String, String>,
    ) -> Self {
        Self {
            manager,
            listener: listener.into(),
            request,
            response,
            options,
        }
    }

    pub fn flow(&self) -> &str {
        self.manager.flow().name()
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn listener(&self) -> &str {
        &self.listener
    }

    pub fn options(&self) -> &HashMap<String, String> {
        &self.options
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn content_type(&self) -> &str {
        self.response.content_type()
    }

    /// Decodes the request body as flow input, executes the flow and
    /// encodes its output. The store may be prefilled by the listener, for
    /// example with path parameters.
    pub async fn serve(
        &self,
        store: Arc<ReferenceStore>,
        body: BodyReader,
        cancellation: CancellationToken,
    ) -> Result<BodyReader, FlowError> {
        self.request.unmarshal(body, &store).await?;
        self.manager.run(store.clone(), cancellation).await?;
        Ok(self.response.marshal(store).await?)
    }
}

/// Protocol front-end serving a set of endpoints
pub trait Listener: Send {
    fn name(&self) -> &str;

    /// Takes ownership of the endpoints bound to this listener. Options are
    /// validated here.
    fn handle(&mut self, endpoints: Vec<Arc<Endpoint>>) -> Result<(), ManifestError>;
}

/// Hands every endpoint to the listener it names
pub fn bind_listeners(
    endpoints: &[Arc<Endpoint>],
    listeners: &mut [&mut dyn Listener],
) -> Result<(), ManifestError> {
    let mut grouped: HashMap<&str, Vec<Arc<Endpoint>>> = HashMap::new();
    for endpoint in endpoints {
        if !listeners.iter().any(|listener| listener.name() == endpoint.listener()) {
            return Err(ManifestError::UnknownListener(endpoint.listener().to_string()));
        }
        grouped.entry(endpoint.listener()).or_default().push(endpoint.clone());
    }

    for listener in listeners.iter_mut() {
        let bound = grouped.remove(listener.name()).unwrap_or_default();
        tracing::info!("Binding {} endpoints to listener {}", bound.len(), listener.name());
        listener.handle(bound)?;
    }

    Ok(())
}
