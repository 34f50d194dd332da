// State and event identifiers - the vocabulary of every workflow
//
// ## State Machine Overview
//
// A workflow is a finite state machine whose states and events are declared
// by a definition. Nothing in the engine hardcodes a state name except the
// order fast path, which compiles its own table.
//
// ```
//     [draft] --submit_order--> [ordered] --start_cutting--> [production]
//                                   |                            |
//                                   +--cancel--> [cancelled] <---+--complete--> [completed]
// ```
//
// - StateId and EventId are plain string wrappers
// - Equality is exact, case-sensitive string equality
// - The engine treats both as opaque names

use serde::{Deserialize, Serialize};

/// Identifier of a declared workflow state
///
/// Examples: "draft", "ordered", "production", "completed", "cancelled"
///
/// Serialized transparently as a plain string so stored documents stay flat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(pub String);

impl StateId {
    /// Get the state identifier as a string slice
    ///
    /// ```rust
    /// # use flowgate::StateId;
    /// let state = StateId::from("draft");
    /// assert_eq!(state.as_str(), "draft");
    /// ```
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn new<S: Into<String>>(name: S) -> Self {
        StateId(name.into())
    }
}

impl From<&str> for StateId {
    fn from(s: &str) -> Self {
        StateId(s.to_string())
    }
}

impl From<String> for StateId {
    fn from(s: String) -> Self {
        StateId(s)
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a triggering event
///
/// Events are not declared on their own; the set of events of a definition is
/// the set of distinct event names across its transitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn new<S: Into<String>>(name: S) -> Self {
        EventId(name.into())
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        EventId(s.to_string())
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        EventId(s)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a state inside its definition
///
/// `Start` is assigned at instance creation only; `End` states are sinks for
/// both transitions and rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    Start,
    #[default]
    Normal,
    End,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Start => "start",
            StateType::Normal => "normal",
            StateType::End => "end",
        }
    }
}
