use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::{Bus, ControlFrame};

/// Receives decoded frames on the telescope side of the bus.
pub trait ControlSink: Send + Sync {
    fn apply(&self, frame: ControlFrame);
}

impl<F> ControlSink for F
where
    F: Fn(ControlFrame) + Send + Sync,
{
    fn apply(&self, frame: ControlFrame) {
        (self)(frame)
    }
}

/// Subscribes to `topic` and hands every well-formed frame to `sink` until the
/// bus drops the topic. Malformed payloads are logged and skipped.
pub fn spawn_control_listener<B, S>(
    bus: Arc<B>,
    topic: &str,
    sink: S,
) -> tokio::task::JoinHandle<()>
where
    B: Bus + ?Sized + 'static,
    S: ControlSink + 'static,
{
    let mut rx = bus.subscribe(topic);
    let topic = topic.to_string();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => match ControlFrame::decode(&msg.payload) {
                    Ok(frame) => {
                        debug!(
                            target = "control.bus",
                            topic = %topic,
                            kind = %frame.kind,
                            value = frame.value,
                            "control frame received"
                        );
                        sink.apply(frame);
                    }
                    Err(err) => {
                        warn!(target = "control.bus", topic = %topic, error = %err, "dropping malformed control frame");
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = "control.bus", topic = %topic, skipped, "control listener lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
