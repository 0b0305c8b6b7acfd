use control_bus::{BusError, FrameError};
use scope_registry::RegistryError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("telescope {telescope_id} is not available: {reason}")]
    LeaseDenied { telescope_id: String, reason: String },
    #[error("telescope backend unreachable for {telescope_id}: {reason}")]
    Unreachable { telescope_id: String, reason: String },
    #[error("realtime session lost: {0}")]
    SessionFatal(String),
    #[error("failed to release telescope {telescope_id}: {reason}")]
    ReleaseFailed { telescope_id: String, reason: String },
    #[error("no telescope selected")]
    NoTelescopeSelected,
}

impl SessionError {
    /// Label used for the `result` dimension of the lease metrics.
    pub(crate) fn metric_label(&self) -> &'static str {
        match self {
            SessionError::LeaseDenied { .. } => "denied",
            SessionError::Unreachable { .. } => "unreachable",
            SessionError::SessionFatal(_) => "fatal",
            SessionError::ReleaseFailed { .. } => "failed",
            SessionError::NoTelescopeSelected => "unselected",
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("control channel error: {0}")]
    Channel(String),
    #[error("invalid control value for {kind}: {value}")]
    InvalidValue { kind: &'static str, value: f64 },
    #[error("dispatcher stopped")]
    Stopped,
}

impl From<BusError> for DispatchError {
    fn from(err: BusError) -> Self {
        DispatchError::Channel(err.to_string())
    }
}

impl From<FrameError> for DispatchError {
    fn from(err: FrameError) -> Self {
        DispatchError::Channel(err.to_string())
    }
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        DispatchError::Channel(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("transport signaling failed: {0}")]
    Signaling(String),
    #[error("transport connect timed out")]
    Timeout,
}
