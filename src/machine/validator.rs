//! State Machine Validation
//!
//! Checks performed before a machine may run:
//! - At least one state, no duplicate names
//! - Initial state set and present
//! - Transitions reference known states, one edge per type per state
//! - Repeat and fork states are wired correctly
//!
//! Unreachable states are reported as warnings only.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use log::{debug, info, warn};
use serde_json::Value;

use crate::error::DefinitionError;

use super::model::{StateMachine, TransitionType, FORK_STATE_TYPE, REPEAT_STATE_TYPE};

/// Config key naming the expression a repeat state iterates over.
pub const REPEAT_EXPRESSION_KEY: &str = "repeat_element_expression";

/// Config key listing the branches of a fork state.
pub const FORK_STATES_KEY: &str = "fork_states";

fn collect_errors(machine: &StateMachine) -> Vec<DefinitionError> {
    let mut errors = Vec::new();

    if machine.states.is_empty() {
        errors.push(DefinitionError::EmptyMachine);
        return errors;
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let duplicates: BTreeSet<String> = machine
        .states
        .iter()
        .filter(|s| !seen.insert(s.name.as_str()))
        .map(|s| s.name.clone())
        .collect();
    if !duplicates.is_empty() {
        errors.push(DefinitionError::DuplicateStateNames(
            duplicates.into_iter().collect(),
        ));
    }

    match machine.initial_state_name.as_deref() {
        None => errors.push(DefinitionError::MissingInitialState),
        Some(name) if !seen.contains(name) => {
            errors.push(DefinitionError::UnknownInitialState(name.to_string()))
        }
        Some(_) => {}
    }

    let mut edges: HashSet<(&str, TransitionType)> = HashSet::new();
    for t in &machine.transitions {
        if !seen.contains(t.from.as_str()) || !seen.contains(t.to.as_str()) {
            errors.push(DefinitionError::UnknownTransitionState {
                from: t.from.clone(),
                to: t.to.clone(),
            });
        }
        if !edges.insert((t.from.as_str(), t.transition_type)) {
            errors.push(DefinitionError::DuplicateTransition {
                state: t.from.clone(),
                transition_type: t.transition_type,
            });
        }
    }

    for state in &machine.states {
        match state.state_type.as_str() {
            REPEAT_STATE_TYPE => {
                if !edges.contains(&(state.name.as_str(), TransitionType::Repeat)) {
                    errors.push(DefinitionError::MissingRepeatTransition(state.name.clone()));
                }
                if !state
                    .config
                    .get(REPEAT_EXPRESSION_KEY)
                    .map_or(false, Value::is_string)
                {
                    errors.push(DefinitionError::InvalidStateConfig {
                        state: state.name.clone(),
                        reason: format!("missing '{}'", REPEAT_EXPRESSION_KEY),
                    });
                }
            }
            FORK_STATE_TYPE => {
                let branches = fork_branches(&state.config);
                if branches.is_empty() {
                    errors.push(DefinitionError::InvalidStateConfig {
                        state: state.name.clone(),
                        reason: format!("'{}' must list at least one state", FORK_STATES_KEY),
                    });
                }
                for branch in branches {
                    if !seen.contains(branch) {
                        errors.push(DefinitionError::InvalidStateConfig {
                            state: state.name.clone(),
                            reason: format!("fork branch '{}' does not exist", branch),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    errors
}

/// Branch names listed in a fork state's config.
pub fn fork_branches(config: &Value) -> Vec<&str> {
    config
        .get(FORK_STATES_KEY)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

/// Validates a machine, returning the first problem found.
pub fn validate_machine(machine: &StateMachine) -> Result<(), DefinitionError> {
    info!(
        "Validating state machine '{}' with {} states",
        machine.name,
        machine.states.len()
    );

    if let Some(error) = collect_errors(machine).into_iter().next() {
        return Err(error);
    }

    for name in unreachable_states(machine) {
        warn!(
            "State '{}' is not reachable from initial state in '{}'",
            name, machine.name
        );
    }

    debug!(
        "State machine '{}' validated: {} transitions",
        machine.name,
        machine.transitions.len()
    );
    Ok(())
}

/// States that no path from the initial state reaches.
pub fn unreachable_states(machine: &StateMachine) -> Vec<String> {
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for t in &machine.transitions {
        successors.entry(t.from.as_str()).or_default().push(t.to.as_str());
    }
    for state in &machine.states {
        if state.state_type == FORK_STATE_TYPE {
            successors
                .entry(state.name.as_str())
                .or_default()
                .extend(fork_branches(&state.config));
        }
    }

    let mut reached: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = machine.initial_state_name.as_deref().into_iter().collect();
    while let Some(current) = queue.pop_front() {
        if !reached.insert(current) {
            continue;
        }
        if let Some(next) = successors.get(current) {
            queue.extend(next.iter().copied());
        }
    }

    machine
        .states
        .iter()
        .filter(|s| !reached.contains(s.name.as_str()))
        .map(|s| s.name.clone())
        .collect()
}

/// Lists every problem as a message.
///
/// Useful for editor and CLI feedback.
pub fn quick_validate(machine: &StateMachine) -> Vec<String> {
    collect_errors(machine)
        .iter()
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::model::State;
    use serde_json::json;

    fn base_machine() -> StateMachine {
        let mut machine = StateMachine::new("m");
        machine.add_state(State::new("start", "NOOP")).unwrap();
        machine.add_state(State::new("end", "NOOP")).unwrap();
        machine
            .add_transition("start", "end", TransitionType::Success)
            .unwrap();
        machine.set_initial_state("start");
        machine
    }

    #[test]
    fn test_valid_machine() {
        assert!(validate_machine(&base_machine()).is_ok());
        assert!(quick_validate(&base_machine()).is_empty());
    }

    #[test]
    fn test_empty_machine() {
        let machine = StateMachine::new("empty");
        assert_eq!(validate_machine(&machine), Err(DefinitionError::EmptyMachine));
    }

    #[test]
    fn test_duplicate_names_listed_once() {
        let mut machine = base_machine();
        machine.states.push(State::new("end", "NOOP"));
        machine.states.push(State::new("end", "NOOP"));

        assert_eq!(
            validate_machine(&machine),
            Err(DefinitionError::DuplicateStateNames(vec!["end".to_string()]))
        );
    }

    #[test]
    fn test_initial_state_checks() {
        let mut machine = base_machine();
        machine.initial_state_name = None;
        assert_eq!(
            validate_machine(&machine),
            Err(DefinitionError::MissingInitialState)
        );

        machine.set_initial_state("ghost");
        assert_eq!(
            validate_machine(&machine),
            Err(DefinitionError::UnknownInitialState("ghost".to_string()))
        );
    }

    #[test]
    fn test_unknown_transition_target() {
        let mut machine = base_machine();
        machine
            .add_transition("end", "nowhere", TransitionType::Success)
            .unwrap();
        assert!(matches!(
            validate_machine(&machine),
            Err(DefinitionError::UnknownTransitionState { .. })
        ));
    }

    #[test]
    fn test_duplicate_edge_via_direct_push() {
        let mut machine = base_machine();
        machine.transitions.push(machine.transitions[0].clone());
        assert!(matches!(
            validate_machine(&machine),
            Err(DefinitionError::DuplicateTransition { .. })
        ));
    }

    #[test]
    fn test_repeat_requires_edge_and_expression() {
        let mut machine = base_machine();
        machine.add_state(State::new("loop", "REPEAT")).unwrap();
        machine
            .add_transition("end", "loop", TransitionType::Success)
            .unwrap();

        let errors = quick_validate(&machine);
        assert_eq!(errors.len(), 2, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("no REPEAT transition")));
        assert!(errors.iter().any(|e| e.contains(REPEAT_EXPRESSION_KEY)));
    }

    #[test]
    fn test_fork_branches_must_exist() {
        let mut machine = base_machine();
        machine
            .add_state(State::new("split", "FORK").with_config(json!({"fork_states": ["end", "x"]})))
            .unwrap();

        let errors = quick_validate(&machine);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("fork branch 'x'"));
    }

    #[test]
    fn test_unreachable_states() {
        let mut machine = base_machine();
        machine.add_state(State::new("island", "NOOP")).unwrap();
        assert_eq!(unreachable_states(&machine), vec!["island".to_string()]);
        // Unreachable is only a warning
        assert!(validate_machine(&machine).is_ok());
    }
}
