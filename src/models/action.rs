// Post-commit actions - side effects attached to transitions

//! # Actions
//!
//! Actions run after a transition has been committed. They are best-effort:
//! a failing action is logged and never reverses the transition.
//!
//! Stored documents use the `type` tag. The legacy field names `field`/`value`
//! are accepted for every kind, so older definitions that wrote
//! `{"type": "notify", "field": "sales", "value": "order submitted"}` still load.

use serde::{Deserialize, Serialize};

/// One side effect on a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(flatten)]
    pub kind: ActionKind,

    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Write a value into the instance's variables map
    UpdateField {
        field: String,
        #[serde(default)]
        value: serde_json::Value,
    },

    /// Publish a notification on the engine's notification bus
    #[serde(alias = "send_notification")]
    Notify {
        #[serde(alias = "field", default)]
        channel: String,
        #[serde(alias = "value", default)]
        message: serde_json::Value,
    },

    /// POST a JSON payload to an external URL
    Webhook {
        #[serde(alias = "field")]
        url: String,
        #[serde(alias = "value", default)]
        payload: serde_json::Value,
    },

    /// Any other `type` value; executed as a logged no-op
    #[serde(other)]
    Unknown,
}

impl Action {
    pub fn update_field<F: Into<String>>(field: F, value: serde_json::Value) -> Self {
        Self {
            kind: ActionKind::UpdateField {
                field: field.into(),
                value,
            },
            description: String::new(),
        }
    }

    pub fn notify<C: Into<String>>(channel: C, message: serde_json::Value) -> Self {
        Self {
            kind: ActionKind::Notify {
                channel: channel.into(),
                message,
            },
            description: String::new(),
        }
    }

    pub fn webhook<U: Into<String>>(url: U, payload: serde_json::Value) -> Self {
        Self {
            kind: ActionKind::Webhook {
                url: url.into(),
                payload,
            },
            description: String::new(),
        }
    }

    /// Short name used in log lines
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ActionKind::UpdateField { .. } => "update_field",
            ActionKind::Notify { .. } => "notify",
            ActionKind::Webhook { .. } => "webhook",
            ActionKind::Unknown => "unknown",
        }
    }
}
