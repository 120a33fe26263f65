use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use super::matcher::MatchPolicy;
use super::scenario::{Step, TrainingScenario};

/// A discrete real-world interaction reported by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionEvent {
    pub object_name: String,
    pub action_type: String,
    /// Device-reported timestamp, as sent (usually epoch milliseconds).
    pub timestamp: Option<f64>,
}

impl InteractionEvent {
    pub fn new(object_name: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            object_name: object_name.into(),
            action_type: action_type.into(),
            timestamp: None,
        }
    }
}

/// Mutable progress through the active scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    /// 1-based; terminal once it exceeds the scenario length.
    pub current_step: u32,
    pub completed_steps: Vec<u32>,
    pub consecutive_errors: u32,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            current_step: 1,
            completed_steps: Vec::new(),
            consecutive_errors: 0,
        }
    }
}

/// Result of checking one event against the current step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid {
        step: u32,
        expected_action: String,
        description: String,
        object_matched: String,
    },
    Invalid {
        reason: String,
        expected_objects: Vec<String>,
        current_description: String,
        received_object: String,
    },
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid { .. })
    }
}

/// Ordered step state machine. Moves forward only through `advance`, which the
/// caller invokes after a valid outcome.
#[derive(Debug, Clone)]
pub struct StepValidator {
    scenario: Arc<TrainingScenario>,
    policy: MatchPolicy,
    state: SessionState,
}

impl StepValidator {
    pub fn new(scenario: Arc<TrainingScenario>, policy: MatchPolicy) -> Self {
        Self {
            scenario,
            policy,
            state: SessionState::default(),
        }
    }

    pub fn scenario(&self) -> &TrainingScenario {
        &self.scenario
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn current_step(&self) -> u32 {
        self.state.current_step
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.state.consecutive_errors
    }

    /// The step currently expected, or `None` once the scenario is complete.
    pub fn current(&self) -> Option<&Step> {
        self.scenario.step(self.state.current_step)
    }

    pub fn is_complete(&self) -> bool {
        self.state.current_step as usize > self.scenario.len()
    }

    /// Check `event` against the current step. A mismatch bumps
    /// `consecutive_errors`; state never moves here.
    pub fn validate(&mut self, event: &InteractionEvent) -> ValidationOutcome {
        let Some(step) = self.scenario.step(self.state.current_step) else {
            self.state.consecutive_errors += 1;
            return ValidationOutcome::Invalid {
                reason: "Training scenario already complete".to_string(),
                expected_objects: Vec::new(),
                current_description: String::new(),
                received_object: event.object_name.clone(),
            };
        };

        match self
            .policy
            .find_match(&step.expected_objects, &event.object_name)
        {
            Some(matched) => {
                debug!(
                    step = step.step_number,
                    object = %event.object_name,
                    matched,
                    "Interaction matched current step"
                );
                ValidationOutcome::Valid {
                    step: step.step_number,
                    expected_action: step.action_label.clone(),
                    description: step.description.clone(),
                    object_matched: matched.to_string(),
                }
            }
            None => {
                let outcome = ValidationOutcome::Invalid {
                    reason: format!("Wrong object for step {}", step.step_number),
                    expected_objects: step.expected_objects.clone(),
                    current_description: step.description.clone(),
                    received_object: event.object_name.clone(),
                };
                self.state.consecutive_errors += 1;
                debug!(
                    step = self.state.current_step,
                    object = %event.object_name,
                    consecutive_errors = self.state.consecutive_errors,
                    "Interaction did not match current step"
                );
                outcome
            }
        }
    }

    /// Complete the current step. Returns `true` when the scenario is complete;
    /// calling it again at the terminal state changes nothing.
    pub fn advance(&mut self) -> bool {
        if self.is_complete() {
            return true;
        }
        self.state.completed_steps.push(self.state.current_step);
        self.state.consecutive_errors = 0;
        self.state.current_step += 1;
        self.is_complete()
    }

    /// Start the scenario over.
    pub fn restart(&mut self) {
        self.state = SessionState::default();
    }
}
