use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire form of one control command: `{"type": "dx", "value": 0.1}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid control frame: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("control frame value is not finite")]
    NotFinite,
}

impl ControlFrame {
    pub fn new(kind: impl Into<String>, value: f64) -> Self {
        Self {
            kind: kind.into(),
            value,
        }
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if !self.value.is_finite() {
            return Err(FrameError::NotFinite);
        }
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        let frame: ControlFrame = serde_json::from_slice(payload)?;
        if !frame.value.is_finite() {
            return Err(FrameError::NotFinite);
        }
        Ok(frame)
    }
}
