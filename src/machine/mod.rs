//! State Machine Definition Module
//!
//! Data structures and loading for the graphs the engine executes.
//!
//! # Structure
//!
//! - [`model`]: States, transitions and the machine itself
//! - [`parser`]: YAML loading and saving
//! - [`validator`]: Structural checks run before execution

pub mod model;
pub mod parser;
pub mod validator;

pub use model::{
    State, StateMachine, Transition, TransitionType, FORK_STATE_TYPE, REPEAT_STATE_TYPE,
};
pub use parser::{load_state_machine, parse_state_machine, save_state_machine};
pub use validator::{quick_validate, validate_machine};
