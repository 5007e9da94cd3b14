//! State Machine Parser
//!
//! Loads machine definitions from YAML and validates them so the result
//! is ready to register with an executor.

use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::{EngineError, Result};

use super::model::StateMachine;

/// Loads and validates a state machine from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use staterunner::machine::load_state_machine;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let machine = load_state_machine("deploy.yaml")?;
///     println!("Loaded {} states", machine.states.len());
///     Ok(())
/// }
/// ```
pub fn load_state_machine(path: impl AsRef<Path>) -> Result<StateMachine> {
    let path = path.as_ref();
    info!("Loading state machine from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        EngineError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read state machine file '{}': {}", path.display(), e),
        ))
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());
    parse_state_machine(&yaml_content)
}

/// Parses and validates a state machine from YAML text.
pub fn parse_state_machine(yaml: &str) -> Result<StateMachine> {
    let mut machine: StateMachine = serde_yaml::from_str(yaml)?;

    info!(
        "Parsed state machine '{}': {} states, {} transitions",
        machine.name,
        machine.states.len(),
        machine.transitions.len()
    );

    machine.validate()?;
    Ok(machine)
}

/// Writes a state machine to a YAML file.
pub fn save_state_machine(machine: &StateMachine, path: impl AsRef<Path>) -> Result<()> {
    let yaml = serde_yaml::to_string(machine)?;
    fs::write(path.as_ref(), yaml)?;
    info!("State machine saved to: {}", path.as_ref().display());
    Ok(())
}
