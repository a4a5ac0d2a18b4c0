use relaycore::{Caller, Codec, ManifestError, ServiceSpec, Template};
use std::collections::HashMap;
use std::sync::Arc;

/// Builds codecs for individual messages of a flow
pub trait CodecConstructor: Send + Sync {
    /// Codec name as referenced by services and endpoints
    fn name(&self) -> &str;

    /// Creates a codec bound to one message.
    ///
    /// Decoding writes into `resource`. Encoding resolves `message` against
    /// the store; without a message the codec encodes an empty body.
    fn build(&self, resource: &str, message: Option<Template>) -> Result<Arc<dyn Codec>, ManifestError>;

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata::default()
    }
}

/// Opens callers for the services of a manifest
pub trait CallerConstructor: Send + Sync {
    fn name(&self) -> &str;

    fn dial(&self, service: &ServiceSpec) -> Result<Arc<dyn Caller>, ManifestError>;

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComponentMetadata {
    pub description: String,
    /// Options understood by the component, as `(name, description)`
    pub options: Vec<(String, String)>,
}

/// Codec and caller constructors available to the compiler
pub struct Registry {
    codecs: HashMap<String, Arc<dyn CodecConstructor>>,
    callers: HashMap<String, Arc<dyn CallerConstructor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
            callers: HashMap::new(),
        }
    }

    pub fn register_codec(&mut self, constructor: Arc<dyn CodecConstructor>) {
        let name = constructor.name().to_string();
        tracing::info!("Registering codec: {}", name);
        self.codecs.insert(name, constructor);
    }

    pub fn register_caller(&mut self, constructor: Arc<dyn CallerConstructor>) {
        let name = constructor.name().to_string();
        tracing::info!("Registering caller: {}", name);
        self.callers.insert(name, constructor);
    }

    pub fn codec(&self, name: &str) -> Result<&Arc<dyn CodecConstructor>, ManifestError> {
        self.codecs
            .get(name)
            .ok_or_else(|| ManifestError::UnknownCodec(name.to_string()))
    }

    pub fn caller(&self, name: &str) -> Result<&Arc<dyn CallerConstructor>, ManifestError> {
        self.callers
            .get(name)
            .ok_or_else(|| ManifestError::UnknownCaller(name.to_string()))
    }

    pub fn list_codecs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.codecs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_callers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.callers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn codec_metadata(&self, name: &str) -> Option<ComponentMetadata> {
        self.codecs.get(name).map(|c| c.metadata())
    }

    pub fn caller_metadata(&self, name: &str) -> Option<ComponentMetadata> {
        self.callers.get(name).map(|c| c.metadata())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
