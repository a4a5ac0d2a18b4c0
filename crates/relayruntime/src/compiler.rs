use crate::endpoint::Endpoint;
use crate::flow::{Flow, FlowBuilder, NodeDefinition};
use crate::manager::Manager;
use crate::registry::Registry;
use crate::runtime::RuntimeConfig;
use crate::service::ServiceCall;
use relaycore::{
    CallSpec, EndpointSpec, EventBus, FlowSpec, Manifest, ManifestError, NodeSpec, Predicate,
    PropertyRef, Template, INPUT_RESOURCE, PARAMS_RESOURCE,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Flows and endpoints produced from a manifest
pub struct CompiledManifest {
    pub flows: HashMap<String, Arc<Flow>>,
    pub endpoints: Vec<Arc<Endpoint>>,
}

impl CompiledManifest {
    pub fn flow(&self, name: &str) -> Option<&Arc<Flow>> {
        self.flows.get(name)
    }
}

/// Turns manifest definitions into executable flows. Every service, codec,
/// caller and reference is resolved here so that nothing is looked up by
/// name during execution.
pub struct Compiler<'a> {
    registry: &'a Registry,
    config: &'a RuntimeConfig,
    events: Arc<EventBus>,
}

impl<'a> Compiler<'a> {
    pub fn new(registry: &'a Registry, config: &'a RuntimeConfig, events: Arc<EventBus>) -> Self {
        Self {
            registry,
            config,
            events,
        }
    }

    pub fn compile(&self, manifest: &Manifest) -> Result<CompiledManifest, ManifestError> {
        manifest.check_duplicates()?;

        let mut flows = HashMap::with_capacity(manifest.flows.len());
        for spec in &manifest.flows {
            let flow = Arc::new(self.compile_flow(manifest, spec)?);
            flows.insert(spec.name.clone(), flow);
        }

        let endpoints = manifest
            .endpoints
            .iter()
            .map(|spec| self.compile_endpoint(&flows, spec).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            "Compiled manifest with {} flows and {} endpoints",
            flows.len(),
            endpoints.len()
        );

        Ok(CompiledManifest { flows, endpoints })
    }

    pub fn compile_flow(&self, manifest: &Manifest, spec: &FlowSpec) -> Result<Flow, ManifestError> {
        let names: HashSet<&str> = spec.nodes.iter().map(|node| node.name.as_str()).collect();
        let mut builder = FlowBuilder::new(&spec.name);

        for node in &spec.nodes {
            builder.add_node(self.compile_node(manifest, node, &names)?);
        }

        if let Some(output) = &spec.output {
            let template = Template::parse(output)?;
            for reference in template.references() {
                check_resource(&spec.name, reference, &names)?;
            }
            builder = builder.output(template);
        }

        builder.build()
    }

    fn compile_node(
        &self,
        manifest: &Manifest,
        spec: &NodeSpec,
        names: &HashSet<&str>,
    ) -> Result<NodeDefinition, ManifestError> {
        let mut references: Vec<PropertyRef> = Vec::new();

        let request = parse_template(spec.call.request.as_ref())?;
        if let Some(template) = &request {
            references.extend(template.references().into_iter().cloned());
        }

        let rollback_request = match &spec.rollback {
            Some(rollback) => parse_template(rollback.request.as_ref())?,
            None => None,
        };
        if let Some(template) = &rollback_request {
            references.extend(template.references().into_iter().cloned());
        }

        let condition = match &spec.condition {
            Some(expression) => {
                let predicate = Predicate::compile(expression)?;
                references.extend(predicate.references().into_iter().cloned());
                Some(predicate)
            }
            None => None,
        };

        // Referencing another node's resource implies depending on it
        let mut implicit = BTreeSet::new();
        for reference in &references {
            check_resource(&spec.name, reference, names)?;
            if names.contains(reference.resource.as_str()) && reference.resource != spec.name {
                implicit.insert(reference.resource.clone());
            }
        }

        let call = self.compile_call(manifest, &spec.name, &spec.call, request)?;
        let mut definition = NodeDefinition::new(&spec.name, Arc::new(call));

        for dependency in spec.depends_on.iter().chain(implicit.iter()) {
            definition = definition.with_dependency(dependency);
        }

        if let Some(predicate) = condition {
            definition = definition.with_condition(Arc::new(predicate));
        }

        if let Some(rollback) = &spec.rollback {
            let call = self.compile_call(manifest, &spec.name, rollback, rollback_request)?;
            definition = definition.with_rollback(Arc::new(call));
        }

        Ok(definition)
    }

    fn compile_call(
        &self,
        manifest: &Manifest,
        node: &str,
        spec: &CallSpec,
        request: Option<Template>,
    ) -> Result<ServiceCall, ManifestError> {
        let service = manifest
            .find_service(&spec.service)
            .ok_or_else(|| ManifestError::UnknownService(spec.service.clone()))?;

        let caller = self.registry.caller(&service.caller)?.dial(service)?;
        let codec = self.registry.codec(&service.codec)?;

        Ok(ServiceCall::new(
            &service.name,
            caller,
            codec.build(node, request)?,
            codec.build(node, None)?,
        )
        .with_method(&spec.method)
        .with_endpoint(&spec.endpoint)
        .with_buffer(self.config.stream_buffer))
    }

    fn compile_endpoint(
        &self,
        flows: &HashMap<String, Arc<Flow>>,
        spec: &EndpointSpec,
    ) -> Result<Endpoint, ManifestError> {
        let flow = flows
            .get(&spec.flow)
            .ok_or_else(|| ManifestError::NotFound(spec.flow.clone()))?;

        let codec = self.registry.codec(&spec.codec)?;
        let request = codec.build(INPUT_RESOURCE, None)?;
        let response = codec.build(INPUT_RESOURCE, flow.output().cloned())?;

        let manager = Manager::with_config(flow.clone(), self.events.clone(), self.config);
        Ok(Endpoint::new(
            manager,
            &spec.listener,
            request,
            response,
            spec.options.clone(),
        ))
    }
}

fn parse_template(json: Option<&serde_json::Value>) -> Result<Option<Template>, ManifestError> {
    json.map(Template::parse).transpose()
}

fn check_resource(
    node: &str,
    reference: &PropertyRef,
    names: &HashSet<&str>,
) -> Result<(), ManifestError> {
    let resource = reference.resource.as_str();
    if resource == INPUT_RESOURCE || resource == PARAMS_RESOURCE || names.contains(resource) {
        return Ok(());
    }

    Err(ManifestError::UnknownResource {
        node: node.to_string(),
        resource: resource.to_string(),
    })
}
