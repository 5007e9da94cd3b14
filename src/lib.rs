//! StateRunner - State Machine Execution Engine
//!
//! Runs workflows and pipelines described as state machines: named states
//! joined by SUCCESS, FAILURE and REPEAT transitions. States run
//! synchronously or suspend until an external notification arrives;
//! REPEAT and FORK states fan out child chains and fan their results back
//! in. Operators can pause, resume, retry and abort single instances or
//! whole runs.
//!
//! # Architecture
//!
//! - [`machine`]: definitions, validation and YAML loading
//! - [`execution`]: the executor, steps, events and runtime records
//! - [`outcome`]: named results shared between states
//! - [`expression`]: `${...}` evaluation against the execution context
//! - [`persistence`]: repository contract and in-memory storage
//! - [`monitoring`]: per-run execution timeline
//! - [`config`]: engine settings
//!
//! # Example
//!
//! ```rust,no_run
//! use staterunner::execution::{ExecutionArgs, StateMachineExecutor};
//! use staterunner::parse_state_machine;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let machine = parse_state_machine(
//!         r#"
//! name: deploy
//! initial_state: build
//! states:
//!   - { name: build, type: NOOP }
//!   - { name: release, type: ECHO, config: { message: "releasing ${version}" } }
//! transitions:
//!   - { from: build, to: release, type: SUCCESS }
//! "#,
//!     )?;
//!
//!     let executor = StateMachineExecutor::new();
//!     let machine = executor.register_machine(machine)?;
//!     let run = executor.execute(
//!         &machine.id,
//!         ExecutionArgs::new().with_param("version", "1.4.2".into()),
//!     )?;
//!     executor.run_until_idle();
//!
//!     println!("{:?}", executor.workflow_run(&run.id)?.map(|r| r.status));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod expression;
pub mod machine;
pub mod monitoring;
pub mod outcome;
pub mod persistence;

pub use config::EngineConfig;
pub use error::{DefinitionError, EngineError, IllegalTransition, InvalidArgument, Result};
pub use execution::{
    ErrorStrategy, ExecutionArgs, ExecutionEvent, ExecutionEventType, ExecutionStatus,
    StateMachineExecutor,
};
pub use machine::{load_state_machine, parse_state_machine, State, StateMachine, TransitionType};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "StateRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "StateRunner");
    }

    #[test]
    fn test_parse_and_run_from_root_exports() {
        let machine = parse_state_machine(
            r#"
name: smoke
initial_state: first
states:
  - { name: first, type: NOOP }
  - { name: second, type: NOOP }
transitions:
  - { from: first, to: second, type: SUCCESS }
"#,
        )
        .unwrap();

        let executor = StateMachineExecutor::new();
        let machine = executor.register_machine(machine).unwrap();
        let run = executor.execute(&machine.id, ExecutionArgs::new()).unwrap();
        executor.run_until_idle();

        let run = executor.workflow_run(&run.id).unwrap().unwrap();
        assert_eq!(run.status, ExecutionStatus::Success);
        assert_eq!(executor.instances(&run.id).unwrap().len(), 2);
    }
}
