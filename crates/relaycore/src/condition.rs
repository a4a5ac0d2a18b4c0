//! Node conditions
//!
//! A condition gates a node: when it evaluates to false the node is skipped
//! and the skip propagates to everything depending on it.

use crate::template::reference_expression;
use crate::{ManifestError, Payload, PropertyRef, ReferenceStore, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Predicate over the reference store
pub trait Condition: Send + Sync {
    fn evaluate(&self, store: &ReferenceStore) -> bool;
}

impl<F> Condition for F
where
    F: Fn(&ReferenceStore) -> bool + Send + Sync,
{
    fn evaluate(&self, store: &ReferenceStore) -> bool {
        self(store)
    }
}

/// Declarative condition as written in a manifest.
///
/// Operands are JSON scalars or `{{ resource:path }}` references, e.g.
/// `{"equals": ["{{ input:kind }}", "user"]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    Equals(serde_json::Value, serde_json::Value),
    NotEquals(serde_json::Value, serde_json::Value),
    GreaterThan(serde_json::Value, serde_json::Value),
    LessThan(serde_json::Value, serde_json::Value),
    GreaterOrEqual(serde_json::Value, serde_json::Value),
    LessOrEqual(serde_json::Value, serde_json::Value),
    Exists(String),
    All(Vec<Expression>),
    Any(Vec<Expression>),
    Not(Box<Expression>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Reference(PropertyRef),
    Literal(Value),
}

impl Operand {
    fn parse(json: &serde_json::Value) -> Result<Operand, ManifestError> {
        if let serde_json::Value::String(s) = json {
            if let Some(inner) = reference_expression(s) {
                return Ok(Operand::Reference(inner.parse()?));
            }
        }

        Value::from_json(json).map(Operand::Literal).ok_or_else(|| {
            ManifestError::Invalid(format!("condition operand must be a scalar or a reference: {}", json))
        })
    }

    /// Absent references resolve to `None`, which never compares equal
    fn resolve(&self, store: &ReferenceStore) -> Option<Value> {
        match self {
            Operand::Literal(value) => Some(value.clone()),
            Operand::Reference(reference) => {
                let loaded = store.load(&reference.resource, &reference.path)?;
                match loaded.payload {
                    Payload::Value(value) => Some(value),
                    Payload::Enum(ordinal) => Some(Value::Integer(ordinal as i64)),
                    Payload::Repeated(_) | Payload::Message(_) => None,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Rule {
    Compare {
        operator: Operator,
        left: Operand,
        right: Operand,
    },
    Exists(PropertyRef),
    All(Vec<Rule>),
    Any(Vec<Rule>),
    Not(Box<Rule>),
}

impl Rule {
    fn compile(expression: &Expression) -> Result<Rule, ManifestError> {
        let compare = |operator: Operator,
                       left: &serde_json::Value,
                       right: &serde_json::Value|
         -> Result<Rule, ManifestError> {
            Ok(Rule::Compare {
                operator,
                left: Operand::parse(left)?,
                right: Operand::parse(right)?,
            })
        };

        match expression {
            Expression::Equals(l, r) => compare(Operator::Equals, l, r),
            Expression::NotEquals(l, r) => compare(Operator::NotEquals, l, r),
            Expression::GreaterThan(l, r) => compare(Operator::GreaterThan, l, r),
            Expression::LessThan(l, r) => compare(Operator::LessThan, l, r),
            Expression::GreaterOrEqual(l, r) => compare(Operator::GreaterOrEqual, l, r),
            Expression::LessOrEqual(l, r) => compare(Operator::LessOrEqual, l, r),
            Expression::Exists(reference) => {
                let inner = reference_expression(reference).unwrap_or(reference.as_str());
                Ok(Rule::Exists(inner.parse()?))
            }
            Expression::All(rules) => Ok(Rule::All(
                rules.iter().map(Rule::compile).collect::<Result<_, _>>()?,
            )),
            Expression::Any(rules) => Ok(Rule::Any(
                rules.iter().map(Rule::compile).collect::<Result<_, _>>()?,
            )),
            Expression::Not(rule) => Ok(Rule::Not(Box::new(Rule::compile(rule)?))),
        }
    }

    fn evaluate(&self, store: &ReferenceStore) -> bool {
        match self {
            Rule::Compare { operator, left, right } => {
                let ordering = match (left.resolve(store), right.resolve(store)) {
                    (Some(left), Some(right)) => left.compare(&right),
                    _ => None,
                };

                match operator {
                    Operator::Equals => ordering == Some(Ordering::Equal),
                    Operator::NotEquals => ordering != Some(Ordering::Equal),
                    Operator::GreaterThan => ordering == Some(Ordering::Greater),
                    Operator::LessThan => ordering == Some(Ordering::Less),
                    Operator::GreaterOrEqual => {
                        matches!(ordering, Some(Ordering::Greater | Ordering::Equal))
                    }
                    Operator::LessOrEqual => {
                        matches!(ordering, Some(Ordering::Less | Ordering::Equal))
                    }
                }
            }
            Rule::Exists(reference) => store.contains(&reference.resource, &reference.path),
            Rule::All(rules) => rules.iter().all(|rule| rule.evaluate(store)),
            Rule::Any(rules) => rules.iter().any(|rule| rule.evaluate(store)),
            Rule::Not(rule) => !rule.evaluate(store),
        }
    }

    fn collect_references<'a>(&'a self, references: &mut Vec<&'a PropertyRef>) {
        match self {
            Rule::Compare { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Reference(reference) = operand {
                        references.push(reference);
                    }
                }
            }
            Rule::Exists(reference) => references.push(reference),
            Rule::All(rules) | Rule::Any(rules) => {
                for rule in rules {
                    rule.collect_references(references);
                }
            }
            Rule::Not(rule) => rule.collect_references(references),
        }
    }
}

/// Compiled form of an [`Expression`]
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    rule: Rule,
}

impl Predicate {
    pub fn compile(expression: &Expression) -> Result<Self, ManifestError> {
        Ok(Self {
            rule: Rule::compile(expression)?,
        })
    }

    pub fn references(&self) -> Vec<&PropertyRef> {
        let mut references = Vec::new();
        self.rule.collect_references(&mut references);
        references
    }
}

impl Condition for Predicate {
    fn evaluate(&self, store: &ReferenceStore) -> bool {
        self.rule.evaluate(store)
    }
}
