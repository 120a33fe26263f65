//! Training scenarios and the step validator.
//!
//! A scenario is an ordered checklist of physical interactions. The validator
//! compares each reported interaction with the current step and only moves
//! forward when the caller advances it after a valid match.

mod matcher;
mod scenario;
mod validator;

pub use matcher::{MatchMode, MatchPolicy};
pub use scenario::{ScenarioError, Step, TrainingScenario};
pub use validator::{InteractionEvent, SessionState, StepValidator, ValidationOutcome};
