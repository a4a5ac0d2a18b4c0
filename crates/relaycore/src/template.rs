//! Message templates
//!
//! A template is a JSON tree in which strings written as
//! `{{ resource:path }}` are references into the store. Templates are parsed
//! once when a flow is compiled and resolved per execution.

use crate::{ManifestError, PropertyRef, ReferenceStore, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    Reference(PropertyRef),
    Literal(Value),
    Object(Vec<(String, Template)>),
    Array(Vec<Template>),
}

impl Template {
    pub fn parse(json: &serde_json::Value) -> Result<Template, ManifestError> {
        match json {
            serde_json::Value::String(s) => match reference_expression(s) {
                Some(inner) => Ok(Template::Reference(inner.parse()?)),
                None => Ok(Template::Literal(Value::String(s.clone()))),
            },
            serde_json::Value::Object(object) => {
                let fields = object
                    .iter()
                    .map(|(key, value)| Ok((key.clone(), Template::parse(value)?)))
                    .collect::<Result<Vec<_>, ManifestError>>()?;
                Ok(Template::Object(fields))
            }
            serde_json::Value::Array(items) => {
                let items = items
                    .iter()
                    .map(Template::parse)
                    .collect::<Result<Vec<_>, ManifestError>>()?;
                Ok(Template::Array(items))
            }
            scalar => Ok(Template::Literal(
                Value::from_json(scalar).unwrap_or(Value::Null),
            )),
        }
    }

    /// Resolves the template against the store. Object fields whose
    /// reference was never written are omitted, explicit nulls are kept.
    pub fn resolve(&self, store: &ReferenceStore) -> Option<serde_json::Value> {
        match self {
            Template::Reference(reference) => store.load_tree(&reference.resource, &reference.path),
            Template::Literal(value) => Some(value.to_json()),
            Template::Object(fields) => {
                let object = fields
                    .iter()
                    .filter_map(|(key, field)| Some((key.clone(), field.resolve(store)?)))
                    .collect();
                Some(serde_json::Value::Object(object))
            }
            Template::Array(items) => Some(serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| item.resolve(store).unwrap_or(serde_json::Value::Null))
                    .collect(),
            )),
        }
    }

    /// Every reference used anywhere in the template
    pub fn references(&self) -> Vec<&PropertyRef> {
        let mut references = Vec::new();
        self.collect_references(&mut references);
        references
    }

    fn collect_references<'a>(&'a self, references: &mut Vec<&'a PropertyRef>) {
        match self {
            Template::Reference(reference) => references.push(reference),
            Template::Literal(_) => {}
            Template::Object(fields) => {
                for (_, field) in fields {
                    field.collect_references(references);
                }
            }
            Template::Array(items) => {
                for item in items {
                    item.collect_references(references);
                }
            }
        }
    }
}

/// Returns the inner expression of a `{{ ... }}` string
pub(crate) fn reference_expression(s: &str) -> Option<&str> {
    s.trim()
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map(str::trim)
}
