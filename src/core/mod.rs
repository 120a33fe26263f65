pub mod audio;
pub mod bridge;
pub mod provider;
pub mod training;

// Re-export commonly used types for convenience
pub use audio::{AudioFrame, FrameError, FrameQueue, JitterBuffer, JitterConfig, ScheduledPlayback};
pub use bridge::{BridgeEvent, BridgeEventKind, EventBridge, StepContext};
pub use provider::{
    CallClient, CallClientConfig, ProviderChannel, ProviderCommand, ProviderError, ProviderEvent,
    ProviderFrame, ProviderOutbound, ProviderResult, SharedConnector, UpstreamConnector,
    UpstreamTarget, WebSocketConnector,
};
pub use training::{
    InteractionEvent, MatchMode, MatchPolicy, SessionState, Step, StepValidator,
    TrainingScenario, ValidationOutcome,
};
