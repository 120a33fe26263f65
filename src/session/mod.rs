//! Device sessions: wire messages, the session registry and the relay
//! session state machine.

pub mod messages;
pub mod policy;
pub mod registry;
pub mod relay;

pub use messages::{
    DecodedFrame, DeviceDecodeError, DeviceInbound, DeviceOutbound, NavigationCommand, Position,
};
pub use policy::{AudioDelivery, RelayPolicy, UpstreamMode};
pub use registry::{
    BroadcastReport, DEVICE_QUEUE_SIZE, DeviceRoute, RegistryError, SessionHandle, SessionKind,
    SessionRegistry, SessionSummary,
};
pub use relay::{DeviceFrame, RelaySession, SessionDeps, SessionPhase};
