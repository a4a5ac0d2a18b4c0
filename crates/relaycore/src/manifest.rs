use crate::{Expression, FlowError, ManifestError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Complete gateway definition: services, flows and the endpoints exposing them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub flows: Vec<FlowSpec>,
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
}

impl Manifest {
    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let path = path.as_ref();
        tracing::debug!("Loading manifest from {}", path.display());
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Appends every definition of `other`
    pub fn merge(&mut self, other: Manifest) {
        self.services.extend(other.services);
        self.flows.extend(other.flows);
        self.endpoints.extend(other.endpoints);
    }

    pub fn find_flow(&self, name: &str) -> Option<&FlowSpec> {
        self.flows.iter().find(|flow| flow.name == name)
    }

    pub fn find_service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|service| service.name == name)
    }

    pub fn check_duplicates(&self) -> Result<(), ManifestError> {
        let mut services = HashSet::new();
        for service in &self.services {
            if !services.insert(service.name.as_str()) {
                return Err(ManifestError::DuplicateService(service.name.clone()));
            }
        }

        let mut flows = HashSet::new();
        for flow in &self.flows {
            if !flows.insert(flow.name.as_str()) {
                return Err(ManifestError::DuplicateFlow(flow.name.clone()));
            }

            let mut nodes = HashSet::new();
            for node in &flow.nodes {
                if !nodes.insert(node.name.as_str()) {
                    return Err(ManifestError::DuplicateNode {
                        flow: flow.name.clone(),
                        node: node.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Reads a duration option written like `5s`, `250ms` or `1m30s`
pub fn duration_option(options: &HashMap<String, String>, key: &str) -> Result<Option<Duration>, ManifestError> {
    options
        .get(key)
        .map(|value| {
            humantime::parse_duration(value.trim()).map_err(|e| {
                ManifestError::Invalid(format!("Option {} has an invalid duration {}: {}", key, value, e))
            })
        })
        .transpose()
}

/// A remote service reachable through a named caller and codec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub host: String,
    pub caller: String,
    pub codec: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    /// Response template, resolved once every node has settled
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

impl FlowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            output: None,
        }
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub condition: Option<Expression>,
    pub call: CallSpec,
    #[serde(default)]
    pub rollback: Option<CallSpec>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, call: CallSpec) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            condition: None,
            call,
            rollback: None,
        }
    }

    pub fn with_dependency(mut self, node: impl Into<String>) -> Self {
        self.depends_on.push(node.into());
        self
    }

    pub fn with_condition(mut self, condition: Expression) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_rollback(mut self, rollback: CallSpec) -> Self {
        self.rollback = Some(rollback);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSpec {
    pub service: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub endpoint: String,
    /// Request template
    #[serde(default)]
    pub request: Option<serde_json::Value>,
}

impl CallSpec {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: default_method(),
            endpoint: String::new(),
            request: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_request(mut self, request: serde_json::Value) -> Self {
        self.request = Some(request);
        self
    }
}

/// Binds a flow to a protocol listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub flow: String,
    pub listener: String,
    pub codec: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

fn default_method() -> String {
    "POST".to_string()
}
