use crate::{ManifestError, Value};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Resource holding the decoded inbound request
pub const INPUT_RESOURCE: &str = "input";

/// Resource holding path parameters extracted by a listener
pub const PARAMS_RESOURCE: &str = "params";

/// Joins a dotted path prefix with a key
pub fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        return key.to_string();
    }

    if key.is_empty() {
        return prefix.to_string();
    }

    format!("{}.{}", prefix, key)
}

/// The active shape of a reference. Exactly one is ever set.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Scalar value, `Value::Null` is an explicit nil
    Value(Value),
    /// Enum ordinal
    Enum(i32),
    /// Ordered array elements
    Repeated(Vec<Reference>),
    /// Nested message, keyed by field name
    Message(BTreeMap<String, Reference>),
}

/// A stored value addressed by a path inside a resource
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub path: String,
    pub payload: Payload,
}

impl Reference {
    pub fn value(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            payload: Payload::Value(value.into()),
        }
    }

    pub fn null(path: impl Into<String>) -> Self {
        Self::value(path, Value::Null)
    }

    pub fn enumeration(path: impl Into<String>, ordinal: i32) -> Self {
        Self {
            path: path.into(),
            payload: Payload::Enum(ordinal),
        }
    }

    pub fn repeated(path: impl Into<String>, items: Vec<Reference>) -> Self {
        Self {
            path: path.into(),
            payload: Payload::Repeated(items),
        }
    }

    pub fn message(path: impl Into<String>, fields: BTreeMap<String, Reference>) -> Self {
        Self {
            path: path.into(),
            payload: Payload::Message(fields),
        }
    }

    /// Builds a reference from a JSON tree. Objects become nested messages
    /// and arrays become repeated elements addressed by their index.
    pub fn from_json(path: impl Into<String>, json: &serde_json::Value) -> Self {
        let path = path.into();
        match json {
            serde_json::Value::Object(object) => {
                let fields = object
                    .iter()
                    .map(|(key, value)| (key.clone(), Reference::from_json(key.clone(), value)))
                    .collect();
                Reference::message(path, fields)
            }
            serde_json::Value::Array(items) => {
                let items = items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| Reference::from_json(index.to_string(), item))
                    .collect();
                Reference::repeated(path, items)
            }
            scalar => Reference::value(path, Value::from_json(scalar).unwrap_or(Value::Null)),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match &self.payload {
            Payload::Value(value) => value.to_json(),
            Payload::Enum(ordinal) => serde_json::Value::from(*ordinal),
            Payload::Repeated(items) => {
                serde_json::Value::Array(items.iter().map(Reference::to_json).collect())
            }
            Payload::Message(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(key, field)| (key.clone(), field.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn enum_ordinal(&self) -> Option<i32> {
        match &self.payload {
            Payload::Enum(ordinal) => Some(*ordinal),
            _ => None,
        }
    }

    pub fn repeated_items(&self) -> Option<&[Reference]> {
        match &self.payload {
            Payload::Repeated(items) => Some(items),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Reference> {
        match &self.payload {
            Payload::Message(fields) => fields.get(name),
            _ => None,
        }
    }

    /// True for a written reference holding an explicit nil
    pub fn is_null(&self) -> bool {
        matches!(self.payload, Payload::Value(Value::Null))
    }
}

/// Address of a value inside the store, written `resource:path`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyRef {
    pub resource: String,
    pub path: String,
}

impl PropertyRef {
    pub fn new(resource: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            path: path.into(),
        }
    }
}

impl FromStr for PropertyRef {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (resource, path) = s
            .split_once(':')
            .ok_or_else(|| ManifestError::InvalidReference(s.to_string()))?;

        let resource = resource.trim();
        let path = path.trim();
        if resource.is_empty() || resource.contains(char::is_whitespace) || path.contains(char::is_whitespace) {
            return Err(ManifestError::InvalidReference(s.to_string()));
        }

        Ok(PropertyRef::new(resource, path))
    }
}

impl fmt::Display for PropertyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.path)
    }
}

/// Thread-safe store of references, one per flow execution.
///
/// Messages are kept flat: the message path holds an empty marker and each
/// field is stored under `path.field`. Writing a path replaces whatever shape
/// was stored at or below it.
#[derive(Debug, Default)]
pub struct ReferenceStore {
    resources: RwLock<HashMap<String, HashMap<String, Reference>>>,
}

impl ReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(resources: usize) -> Self {
        Self {
            resources: RwLock::new(HashMap::with_capacity(resources)),
        }
    }

    /// Sets a scalar value, overwriting whatever was stored at the path
    pub fn store_value(&self, resource: &str, path: &str, value: impl Into<Value>) {
        self.store_reference(resource, Reference::value(path, value));
    }

    pub fn store_reference(&self, resource: &str, reference: Reference) {
        let mut resources = self.resources.write();
        let references = resources.entry(resource.to_string()).or_default();
        replace(references, reference);
    }

    /// Stores a tree of values rooted at `prefix`. Keys already stored
    /// under the prefix and absent from `values` are kept.
    pub fn store_values(
        &self,
        resource: &str,
        prefix: &str,
        values: &serde_json::Map<String, serde_json::Value>,
    ) {
        let mut resources = self.resources.write();
        let references = resources.entry(resource.to_string()).or_default();

        open(references, prefix);
        for (key, value) in values {
            replace(references, Reference::from_json(join_path(prefix, key), value));
        }
    }

    /// Returns `None` when the path was never written
    pub fn load(&self, resource: &str, path: &str) -> Option<Reference> {
        let resources = self.resources.read();
        let references = resources.get(resource)?;
        let reference = references.get(path)?;

        if is_marker(reference) {
            return Some(Reference::message(path, assemble(references, path)));
        }

        Some(reference.clone())
    }

    pub fn contains(&self, resource: &str, path: &str) -> bool {
        let resources = self.resources.read();
        resources
            .get(resource)
            .map(|references| {
                references.contains_key(path) || (path.is_empty() && !references.is_empty())
            })
            .unwrap_or(false)
    }

    /// Rebuilds a JSON tree from the reference at `prefix`. An empty prefix
    /// addresses the whole resource.
    pub fn load_tree(&self, resource: &str, prefix: &str) -> Option<serde_json::Value> {
        let resources = self.resources.read();
        let references = resources.get(resource)?;

        match references.get(prefix) {
            Some(reference) if !is_marker(reference) => Some(reference.to_json()),
            Some(_) => Some(Reference::message(prefix, assemble(references, prefix)).to_json()),
            None if prefix.is_empty() && !references.is_empty() => {
                Some(Reference::message(prefix, assemble(references, prefix)).to_json())
            }
            None => None,
        }
    }

    /// Snapshot of every reference stored in a resource, ordered by path.
    /// Messages appear as empty markers followed by their fields.
    pub fn resource(&self, resource: &str) -> BTreeMap<String, Reference> {
        let resources = self.resources.read();
        resources
            .get(resource)
            .map(|references| {
                references
                    .iter()
                    .map(|(path, reference)| (path.clone(), reference.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total number of stored references across all resources
    pub fn len(&self) -> usize {
        self.resources.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_marker(reference: &Reference) -> bool {
    matches!(&reference.payload, Payload::Message(fields) if fields.is_empty())
}

fn replace(references: &mut HashMap<String, Reference>, reference: Reference) {
    let path = reference.path.clone();
    clear(references, &path);
    if !path.is_empty() {
        let parent = path.rsplit_once('.').map_or("", |(parent, _)| parent);
        open(references, parent);
    }
    insert_flat(references, reference);
}

/// Drops the reference at `path` and everything stored below it
fn clear(references: &mut HashMap<String, Reference>, path: &str) {
    if path.is_empty() {
        references.clear();
        return;
    }

    let nested = format!("{}.", path);
    references.retain(|key, _| key != path && !key.starts_with(&nested));
}

/// Turns `path` and every parent of it into a message marker
fn open(references: &mut HashMap<String, Reference>, path: &str) {
    if references.get("").is_some_and(|root| !is_marker(root)) {
        references.remove("");
    }

    if path.is_empty() {
        return;
    }

    let parents = path
        .match_indices('.')
        .map(|(index, _)| &path[..index])
        .chain(std::iter::once(path));

    for parent in parents {
        if !references.get(parent).is_some_and(is_marker) {
            clear(references, parent);
            references.insert(parent.to_string(), Reference::message(parent, BTreeMap::new()));
        }
    }
}

fn insert_flat(references: &mut HashMap<String, Reference>, reference: Reference) {
    let Reference { path, payload } = reference;
    match payload {
        Payload::Message(fields) => {
            for (key, field) in fields {
                insert_flat(
                    references,
                    Reference {
                        path: join_path(&path, &key),
                        payload: field.payload,
                    },
                );
            }
            references.insert(path.clone(), Reference::message(path, BTreeMap::new()));
        }
        payload => {
            references.insert(path.clone(), Reference { path, payload });
        }
    }
}

/// Collects the direct fields stored below `path`, nesting markers
fn assemble(references: &HashMap<String, Reference>, path: &str) -> BTreeMap<String, Reference> {
    let mut fields = BTreeMap::new();
    for (key, reference) in references {
        let relative = if path.is_empty() {
            key.as_str()
        } else {
            match key.strip_prefix(path).and_then(|rest| rest.strip_prefix('.')) {
                Some(rest) => rest,
                None => continue,
            }
        };

        if relative.is_empty() || relative.contains('.') {
            continue;
        }

        let field = if is_marker(reference) {
            Reference::message(relative, assemble(references, key))
        } else {
            Reference {
                path: relative.to_string(),
                payload: reference.payload.clone(),
            }
        };
        fields.insert(relative.to_string(), field);
    }
    fields
}
