//! Session coordination for remotely operated telescopes.
//!
//! A [`SessionCoordinator`] leases one telescope, binds the lease token to a
//! realtime media session, forwards control intents while the lease is held,
//! meters cost, and always hands the telescope back on the way out.

pub mod context;
pub mod coordinator;
pub mod cost;
pub mod dispatch;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod realtime;

pub use context::{permitted_modes, Holder, SessionContext, SessionMode};
pub use coordinator::{
    Collaborators, CoordinatorConfig, CoordinatorHandle, CoordinatorState, NoticeLevel,
    SessionCoordinator, SessionEvent,
};
pub use cost::CostMeter;
pub use dispatch::{
    BusControlChannel, CommandDispatcher, CommandKind, ControlChannel, ControlCommand,
    ControlIntent, DispatchFailure, Direction, RecordingControlChannel, RegistryControlChannel,
    ZoomBounds, ZoomTracker,
};
pub use error::{DispatchError, SessionError, TransportError};
pub use lease::{Lease, LeaseClient};
pub use realtime::{
    ConnectionState, LoopbackTransport, MediaSurface, MediaTrack, NullSurface, RealtimeEvent,
    RealtimeSession, RealtimeTransport, TrackKind, TransportEvent, TransportHandle, TransportLink,
};
