//! Turns interaction events into messages for the voice conversation.
//!
//! Every event yields one silent `add-message` so the assistant keeps an
//! accurate picture of the training session. When the event asks for speech a
//! `say` instruction follows, chosen from scripted lines keyed by event kind,
//! result, step and the consecutive error count.

use std::fmt;
use time::OffsetDateTime;
use tracing::debug;

use crate::core::provider::ProviderOutbound;
use crate::core::training::{StepValidator, ValidationOutcome};

/// What happened, from the conversation's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEventKind {
    CorrectInteraction,
    IncorrectInteraction,
    /// Device-named event forwarded without validation (`ar_event`).
    Device(String),
}

impl BridgeEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            BridgeEventKind::CorrectInteraction => "correct_interaction",
            BridgeEventKind::IncorrectInteraction => "incorrect_interaction",
            BridgeEventKind::Device(name) => name,
        }
    }
}

impl fmt::Display for BridgeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Training context appended to the silent message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepContext {
    pub step: Option<u32>,
    pub expected_action: Option<String>,
    pub expected_objects: Option<Vec<String>>,
    pub consecutive_errors: Option<u32>,
    pub current_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEvent {
    pub kind: BridgeEventKind,
    pub object_name: String,
    pub result: String,
    pub context: StepContext,
    /// Scripted line for a completed step, when the scenario provides one.
    pub success_utterance: Option<String>,
    /// Description of the step that follows a completed one. `None` after the
    /// last step.
    pub next_instruction: Option<String>,
}

impl BridgeEvent {
    /// Build from a validation outcome. Call before `advance` so the context
    /// names the step the event was checked against.
    pub fn from_outcome(
        object_name: &str,
        outcome: &ValidationOutcome,
        validator: &StepValidator,
    ) -> Self {
        match outcome {
            ValidationOutcome::Valid {
                step,
                expected_action,
                description,
                ..
            } => BridgeEvent {
                kind: BridgeEventKind::CorrectInteraction,
                object_name: object_name.to_string(),
                result: "success".to_string(),
                context: StepContext {
                    step: Some(*step),
                    expected_action: Some(expected_action.clone()),
                    current_description: Some(description.clone()),
                    ..StepContext::default()
                },
                success_utterance: validator
                    .scenario()
                    .step(*step)
                    .and_then(|s| s.success_utterance.clone()),
                next_instruction: validator
                    .scenario()
                    .step(*step + 1)
                    .map(|s| s.description.clone()),
            },
            ValidationOutcome::Invalid {
                expected_objects,
                current_description,
                ..
            } => BridgeEvent {
                kind: BridgeEventKind::IncorrectInteraction,
                object_name: object_name.to_string(),
                result: "error".to_string(),
                context: StepContext {
                    step: Some(validator.current_step()),
                    expected_objects: Some(expected_objects.clone()),
                    consecutive_errors: Some(validator.consecutive_errors()),
                    current_description: Some(current_description.clone()),
                    ..StepContext::default()
                },
                success_utterance: None,
                next_instruction: None,
            },
        }
    }

    /// A device-reported event forwarded as-is.
    pub fn device(event_type: &str, object_name: &str, result: &str) -> Self {
        BridgeEvent {
            kind: BridgeEventKind::Device(event_type.to_string()),
            object_name: object_name.to_string(),
            result: result.to_string(),
            context: StepContext::default(),
            success_utterance: None,
            next_instruction: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventBridge;

impl EventBridge {
    pub fn new() -> Self {
        Self
    }

    /// Messages for the provider: always the silent context update, plus a
    /// `say` when `should_speak` is set and a line applies.
    pub fn on_validated_event(&self, event: &BridgeEvent, should_speak: bool) -> Vec<ProviderOutbound> {
        self.on_validated_event_at(event, should_speak, OffsetDateTime::now_utc())
    }

    pub fn on_validated_event_at(
        &self,
        event: &BridgeEvent,
        should_speak: bool,
        at: OffsetDateTime,
    ) -> Vec<ProviderOutbound> {
        let mut messages = vec![ProviderOutbound::system(self.context_line(event, at))];
        if should_speak
            && let Some(line) = self.utterance(event)
        {
            debug!(kind = %event.kind, line = %line, "Selected spoken feedback");
            messages.push(ProviderOutbound::say(line));
        }
        messages
    }

    /// `AR_EVENT: <kind> object='<name>' result=<result> at <HH:MM>` plus context.
    pub fn context_line(&self, event: &BridgeEvent, at: OffsetDateTime) -> String {
        let mut line = format!(
            "AR_EVENT: {} object='{}' result={} at {:02}:{:02}",
            event.kind,
            event.object_name,
            event.result,
            at.hour(),
            at.minute()
        );
        let ctx = &event.context;
        if let Some(step) = ctx.step {
            line.push_str(&format!(" step={step}"));
        }
        if let Some(action) = &ctx.expected_action {
            line.push_str(&format!(" expected_action='{action}'"));
        }
        if let Some(objects) = &ctx.expected_objects {
            line.push_str(&format!(" expected_objects=[{}]", objects.join(", ")));
        }
        if let Some(errors) = ctx.consecutive_errors {
            line.push_str(&format!(" consecutive_errors={errors}"));
        }
        if let Some(description) = &ctx.current_description {
            line.push_str(&format!(" current_instruction='{description}'"));
        }
        line
    }

    /// Scripted or templated line for `event`, if any.
    pub fn utterance(&self, event: &BridgeEvent) -> Option<String> {
        let object = event.object_name.as_str();
        match &event.kind {
            BridgeEventKind::IncorrectInteraction => Some(Self::correction(event)),
            BridgeEventKind::CorrectInteraction => Some(match (&event.success_utterance, &event.next_instruction) {
                (Some(scripted), _) => scripted.clone(),
                (None, Some(next)) => format!("Great job with the {object}! Next: {next}."),
                (None, None) => {
                    format!("Great job with the {object}! That completes the training.")
                }
            }),
            BridgeEventKind::Device(_) if event.result != "success" => Some(format!(
                "I noticed you had trouble with the {object}. Let me help guide you."
            )),
            BridgeEventKind::Device(event_type) => Some(Self::device_line(event_type, object)),
        }
    }

    fn correction(event: &BridgeEvent) -> String {
        let ctx = &event.context;
        let Some(objects) = ctx.expected_objects.as_ref().filter(|o| !o.is_empty()) else {
            return "That's not the correct object for this step. Look around for the right item to continue."
                .to_string();
        };
        let objects = objects.join(", ");
        match ctx.consecutive_errors.unwrap_or(0) {
            0 | 1 => format!("That's not quite right. You need to find the {objects} for this step."),
            2 => format!(
                "Remember, for this step you should be looking for the {objects}. Take your time and look around."
            ),
            _ => {
                let step = ctx
                    .step
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "?".to_string());
                let task = ctx
                    .current_description
                    .as_deref()
                    .filter(|d| !d.is_empty())
                    .map(lowercase_first)
                    .unwrap_or_else(|| "continue with the training".to_string());
                format!("Let me help you. You're currently on step {step}. You need to {task}.")
            }
        }
    }

    fn device_line(event_type: &str, object: &str) -> String {
        let lowered = object.to_lowercase();
        match event_type {
            "object_interaction" | "object_pinched" => {
                if lowered.contains("fire extinguisher") {
                    "Great job grabbing the fire extinguisher! Now pull the pin and aim at the base of the fire.".to_string()
                } else if lowered.contains("fire alarm") {
                    "Good work activating the fire alarm! Now let's focus on the fire extinguisher.".to_string()
                } else if lowered.contains("flame") {
                    "I see you're near the fire. Remember to stay at a safe distance and use the extinguisher.".to_string()
                } else {
                    format!("Nice work interacting with the {object}. Keep following the safety procedures.")
                }
            }
            "pull_extinguisher" => "Perfect! You've got the fire extinguisher. Now pull the pin and aim at the base of the fire.".to_string(),
            "pull_pin" => "Excellent! Pin removed. Now aim the nozzle at the base of the fire and squeeze the handle.".to_string(),
            "aim_extinguisher" => "Good positioning! Now squeeze the handle to discharge the extinguisher.".to_string(),
            "extinguish_fire" => "Outstanding! You've successfully extinguished the fire. Great job following proper fire safety procedures.".to_string(),
            "task_complete" => "Congratulations! You've completed the fire safety training successfully.".to_string(),
            other => format!("I see you completed the {other} step. Keep up the good work!"),
        }
    }
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
