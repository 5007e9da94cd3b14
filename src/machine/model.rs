//! State Machine Data Model
//!
//! A machine is a set of named, typed states joined by typed transitions.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: rolling-deploy
//! initial_state: prepare
//! states:
//!   - name: prepare
//!     type: NOOP
//!   - name: deploy_hosts
//!     type: REPEAT
//!     config:
//!       repeat_element_expression: "${hosts}"
//!       repeat_element_type: HOST
//!       execution_strategy: SERIAL
//!   - name: deploy_one
//!     type: ECHO
//!     config:
//!       message: "deploying ${host.name}"
//! transitions:
//!   - from: prepare
//!     to: deploy_hosts
//!     type: SUCCESS
//!   - from: deploy_hosts
//!     to: deploy_one
//!     type: REPEAT
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DefinitionError;
use crate::persistence::{generate_id, Entity};

use super::validator::validate_machine;

/// Type tag of the engine-owned repeat state.
pub const REPEAT_STATE_TYPE: &str = "REPEAT";

/// Type tag of the engine-owned fork state.
pub const FORK_STATE_TYPE: &str = "FORK";

/// Category of an edge between two states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionType {
    /// Followed when the source state succeeds
    Success,
    /// Followed when the source state fails or errors
    Failure,
    /// Links a repeat state to the sub-graph it runs per element
    Repeat,
}

impl fmt::Display for TransitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Repeat => write!(f, "REPEAT"),
        }
    }
}

/// A named unit of work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct State {
    pub name: String,

    /// Step variant tag, resolved against the step registry
    #[serde(rename = "type")]
    pub state_type: String,

    /// Step-specific settings
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

impl State {
    pub fn new(name: impl Into<String>, state_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state_type: state_type.into(),
            config: Value::Null,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub transition_type: TransitionType,
}

/// A validated-before-use graph of states.
///
/// Lookups are O(1) once [`validate`](Self::validate) has built the
/// indexes; before that they fall back to a linear scan.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StateMachine {
    #[serde(default = "generate_id")]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub states: Vec<State>,

    #[serde(default)]
    pub transitions: Vec<Transition>,

    #[serde(rename = "initial_state", default)]
    pub initial_state_name: Option<String>,

    #[serde(skip)]
    state_index: HashMap<String, usize>,

    #[serde(skip)]
    transition_index: HashMap<(String, TransitionType), String>,

    #[serde(skip)]
    validated: bool,
}

impl StateMachine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            states: Vec::new(),
            transitions: Vec::new(),
            initial_state_name: None,
            state_index: HashMap::new(),
            transition_index: HashMap::new(),
            validated: false,
        }
    }

    /// Adds a state, rejecting a name already in use.
    pub fn add_state(&mut self, state: State) -> Result<(), DefinitionError> {
        if self.states.iter().any(|s| s.name == state.name) {
            return Err(DefinitionError::DuplicateStateName(state.name));
        }
        self.states.push(state);
        self.validated = false;
        Ok(())
    }

    /// Adds an edge; a state can have one outgoing edge per type.
    pub fn add_transition(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        transition_type: TransitionType,
    ) -> Result<(), DefinitionError> {
        let from = from.into();
        if self
            .transitions
            .iter()
            .any(|t| t.from == from && t.transition_type == transition_type)
        {
            return Err(DefinitionError::DuplicateTransition {
                state: from,
                transition_type,
            });
        }
        self.transitions.push(Transition {
            from,
            to: to.into(),
            transition_type,
        });
        self.validated = false;
        Ok(())
    }

    pub fn set_initial_state(&mut self, name: impl Into<String>) {
        self.initial_state_name = Some(name.into());
        self.validated = false;
    }

    /// Checks the machine and builds lookup indexes.
    pub fn validate(&mut self) -> Result<bool, DefinitionError> {
        validate_machine(self)?;

        self.state_index = self
            .states
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        self.transition_index = self
            .transitions
            .iter()
            .map(|t| ((t.from.clone(), t.transition_type), t.to.clone()))
            .collect();
        self.validated = true;
        Ok(true)
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub fn get_state(&self, name: &str) -> Option<&State> {
        if self.validated {
            self.state_index.get(name).and_then(|&i| self.states.get(i))
        } else {
            self.states.iter().find(|s| s.name == name)
        }
    }

    /// Target of the `transition_type` edge leaving `from`, if any.
    pub fn next_state(&self, from: &str, transition_type: TransitionType) -> Option<&State> {
        let target = if self.validated {
            self.transition_index
                .get(&(from.to_string(), transition_type))
                .map(String::as_str)
        } else {
            self.transitions
                .iter()
                .find(|t| t.from == from && t.transition_type == transition_type)
                .map(|t| t.to.as_str())
        };
        target.and_then(|name| self.get_state(name))
    }

    pub fn initial_state(&self) -> Option<&State> {
        self.initial_state_name
            .as_deref()
            .and_then(|name| self.get_state(name))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl Entity for StateMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "name" => Some(self.name.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_machine() -> StateMachine {
        let mut machine = StateMachine::new("linear");
        machine.add_state(State::new("A", "NOOP")).unwrap();
        machine.add_state(State::new("B", "NOOP")).unwrap();
        machine.add_state(State::new("C", "NOOP")).unwrap();
        machine.add_transition("A", "B", TransitionType::Success).unwrap();
        machine.add_transition("B", "C", TransitionType::Success).unwrap();
        machine.set_initial_state("A");
        machine
    }

    #[test]
    fn test_add_state_rejects_duplicate() {
        let mut machine = StateMachine::new("m");
        machine.add_state(State::new("A", "NOOP")).unwrap();

        let err = machine.add_state(State::new("A", "FAIL")).unwrap_err();
        assert_eq!(err, DefinitionError::DuplicateStateName("A".to_string()));
        assert_eq!(machine.len(), 1);
    }

    #[test]
    fn test_validate_valid_machine() {
        let mut machine = linear_machine();
        assert!(!machine.is_validated());
        assert_eq!(machine.validate(), Ok(true));
        assert!(machine.is_validated());
    }

    #[test]
    fn test_validate_detects_bypassed_duplicate() {
        let mut machine = linear_machine();
        machine.validate().unwrap();

        // Direct construction bypasses add_state
        machine.states.push(State::new("B", "FAIL"));
        let err = machine.validate().unwrap_err();
        assert_eq!(err, DefinitionError::DuplicateStateNames(vec!["B".to_string()]));
    }

    #[test]
    fn test_add_transition_rejects_second_edge_of_type() {
        let mut machine = linear_machine();
        let err = machine
            .add_transition("A", "C", TransitionType::Success)
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateTransition { .. }));

        machine.add_transition("A", "C", TransitionType::Failure).unwrap();
    }

    #[test]
    fn test_lookups_after_validate() {
        let mut machine = linear_machine();
        machine.validate().unwrap();

        assert_eq!(machine.initial_state().map(|s| s.name.as_str()), Some("A"));
        assert_eq!(
            machine
                .next_state("A", TransitionType::Success)
                .map(|s| s.name.as_str()),
            Some("B")
        );
        assert!(machine.next_state("C", TransitionType::Success).is_none());
        assert!(machine.next_state("A", TransitionType::Failure).is_none());
        assert!(machine.get_state("Z").is_none());
    }

    #[test]
    fn test_lookups_before_validate() {
        let machine = linear_machine();
        assert_eq!(
            machine
                .next_state("B", TransitionType::Success)
                .map(|s| s.name.as_str()),
            Some("C")
        );
    }

    #[test]
    fn test_mutation_invalidates() {
        let mut machine = linear_machine();
        machine.validate().unwrap();
        machine.add_state(State::new("D", "NOOP")).unwrap();
        assert!(!machine.is_validated());
    }

    #[test]
    fn test_transition_type_display() {
        assert_eq!(TransitionType::Repeat.to_string(), "REPEAT");
        let parsed: TransitionType = serde_json::from_str("\"FAILURE\"").unwrap();
        assert_eq!(parsed, TransitionType::Failure);
    }
}
