use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading or checking a training scenario definition.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Failed to read scenario file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse scenario: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Scenario '{0}' has no steps")]
    Empty(String),

    #[error("Scenario step numbers must run 1..N in order: expected {expected}, found {found}")]
    StepOutOfOrder { expected: u32, found: u32 },

    #[error("Scenario step {0} lists no expected objects")]
    NoObjects(u32),
}

/// One entry of the ordered checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "step")]
    pub step_number: u32,
    #[serde(rename = "objects")]
    pub expected_objects: Vec<String>,
    #[serde(rename = "action")]
    pub action_label: String,
    pub description: String,
    /// Spoken line used when this step is completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_utterance: Option<String>,
}

impl Step {
    fn new(
        step_number: u32,
        objects: &[&str],
        action: &str,
        description: &str,
        success: &str,
    ) -> Self {
        Self {
            step_number,
            expected_objects: objects.iter().map(|o| o.to_string()).collect(),
            action_label: action.to_string(),
            description: description.to_string(),
            success_utterance: Some(success.to_string()),
        }
    }
}

/// An ordered sequence of steps, traversed strictly in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingScenario {
    pub name: String,
    pub steps: Vec<Step>,
}

impl TrainingScenario {
    /// Built-in fire emergency drill.
    pub fn fire_emergency() -> Self {
        Self {
            name: "fire_emergency".to_string(),
            steps: vec![
                Step::new(
                    1,
                    &["fire extinguisher"],
                    "grab",
                    "Find and grab the fire extinguisher",
                    "Excellent! You found the fire extinguisher. Now pull the pin and aim at the base of the fire.",
                ),
                Step::new(
                    2,
                    &["fire extinguisher"],
                    "pull_pin",
                    "Pull the pin from the fire extinguisher",
                    "Perfect! Pin removed. Now aim the extinguisher at the base of the fire and squeeze the handle.",
                ),
                Step::new(
                    3,
                    &["fire extinguisher"],
                    "aim",
                    "Aim the extinguisher at the base of the fire",
                    "Good aim! Now squeeze the handle and sweep side to side to extinguish the flames.",
                ),
                Step::new(
                    4,
                    &["fire", "flame"],
                    "extinguish",
                    "Spray the fire to extinguish it",
                    "Outstanding! The fire is extinguished. Now pull the fire alarm to alert others in the building.",
                ),
                Step::new(
                    5,
                    &["fire alarm"],
                    "pull",
                    "Pull the fire alarm to alert others",
                    "Perfect! You've pulled the fire alarm. Everyone will now be alerted to evacuate safely.",
                ),
            ],
        }
    }

    /// Parse a YAML definition and check its structure.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ScenarioError> {
        let scenario: TrainingScenario = serde_yaml::from_str(contents)?;
        scenario.check()?;
        Ok(scenario)
    }

    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ScenarioError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Steps must be numbered 1..N and each must expect at least one object.
    pub fn check(&self) -> Result<(), ScenarioError> {
        if self.steps.is_empty() {
            return Err(ScenarioError::Empty(self.name.clone()));
        }
        for (index, step) in self.steps.iter().enumerate() {
            let expected = index as u32 + 1;
            if step.step_number != expected {
                return Err(ScenarioError::StepOutOfOrder {
                    expected,
                    found: step.step_number,
                });
            }
            if step.expected_objects.iter().all(|o| o.trim().is_empty()) {
                return Err(ScenarioError::NoObjects(step.step_number));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Look up a 1-based step.
    pub fn step(&self, step_number: u32) -> Option<&Step> {
        let index = (step_number as usize).checked_sub(1)?;
        self.steps.get(index)
    }
}

impl Default for TrainingScenario {
    fn default() -> Self {
        Self::fire_emergency()
    }
}
