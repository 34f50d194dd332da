// Guard conditions - data-driven gates on transitions

//! # Guard Conditions
//!
//! A transition carries an ordered list of conditions. All of them must hold
//! for the transition to fire; the first one that fails supplies the reason
//! surfaced to the caller.
//!
//! Conditions are a small tagged union rather than free-form maps:
//!
//! ```json
//! { "type": "field", "field": "progress", "operator": "gte", "value": 1.0,
//!   "description": "进度不足，无法完成" }
//! ```
//!
//! Kinds the engine does not understand deserialize to [`ConditionKind::Unknown`]
//! and are skipped with a warning, so stored definitions written by newer
//! authoring tools keep loading.
//!
//! Evaluation lives in `engine::conditions`; this module is data only.

use serde::{Deserialize, Serialize};

/// One guard condition on a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// What is checked
    #[serde(flatten)]
    pub kind: ConditionKind,

    /// Human-readable failure message, surfaced as the `ConditionFailed` reason
    #[serde(default)]
    pub description: String,
}

/// The kinds of condition the engine knows about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionKind {
    /// Compare one field of the evaluation context against a literal
    Field {
        field: String,
        operator: Operator,
        #[serde(default)]
        value: serde_json::Value,
    },

    /// Opaque script; no expression language is implemented, so these pass
    Script {
        #[serde(default)]
        script: String,
    },

    /// Any other `type` value
    #[serde(other)]
    Unknown,
}

/// Comparison operators for field conditions
///
/// `Eq`/`Ne` compare string-normalized values. The ordering operators require
/// both sides to be JSON numbers and fail closed otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    #[serde(other)]
    Unknown,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Unknown => "unknown",
        }
    }

    /// Whether this operator needs numeric operands
    pub fn is_numeric(&self) -> bool {
        matches!(self, Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte)
    }
}

impl Condition {
    /// Build a field comparison condition
    pub fn field<F: Into<String>, D: Into<String>>(
        field: F,
        operator: Operator,
        value: serde_json::Value,
        description: D,
    ) -> Self {
        Self {
            kind: ConditionKind::Field {
                field: field.into(),
                operator,
                value,
            },
            description: description.into(),
        }
    }

    /// The field this condition reads, if any
    pub fn field_name(&self) -> Option<&str> {
        match &self.kind {
            ConditionKind::Field { field, .. } => Some(field),
            _ => None,
        }
    }

    /// Failure message, falling back to a generated one when no description was authored
    pub fn failure_message(&self) -> String {
        if !self.description.is_empty() {
            return self.description.clone();
        }
        match &self.kind {
            ConditionKind::Field {
                field,
                operator,
                value,
            } => format!("condition not met: {} {} {}", field, operator.as_str(), value),
            ConditionKind::Script { .. } => "script condition not met".to_string(),
            ConditionKind::Unknown => "unknown condition not met".to_string(),
        }
    }
}
