use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use control_bus::{control_topic, Bus, ControlFrame};
use parking_lot::Mutex;
use scope_registry::{ControlMessage, ResourceRegistry};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Dx,
    Dy,
    Zoom,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Dx => "dx",
            CommandKind::Dy => "dy",
            CommandKind::Zoom => "zoom",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound message: a relative pan step or an absolute zoom level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlCommand {
    pub kind: CommandKind,
    pub value: f64,
}

impl ControlCommand {
    pub fn frame(&self) -> ControlFrame {
        ControlFrame::new(self.kind.as_str(), self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn command(self, step: f64) -> ControlCommand {
        let (kind, value) = match self {
            Direction::Right => (CommandKind::Dx, step),
            Direction::Left => (CommandKind::Dx, -step),
            Direction::Up => (CommandKind::Dy, step),
            Direction::Down => (CommandKind::Dy, -step),
        };
        ControlCommand { kind, value }
    }
}

/// A user request, before it is turned into a wire command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlIntent {
    Move(Direction),
    /// Relative change composed onto the tracked zoom level.
    Zoom { delta: f64 },
    /// Absolute zoom level, as set by a slider.
    ZoomTo(f64),
}

impl ControlIntent {
    pub fn resolve(self, move_step: f64, zoom: &mut ZoomTracker) -> ControlCommand {
        match self {
            ControlIntent::Move(direction) => direction.command(move_step),
            ControlIntent::Zoom { delta } => ControlCommand {
                kind: CommandKind::Zoom,
                value: zoom.apply_delta(delta),
            },
            ControlIntent::ZoomTo(level) => ControlCommand {
                kind: CommandKind::Zoom,
                value: zoom.set(level),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for ZoomBounds {
    fn default() -> Self {
        Self { min: 1.0, max: 10.0 }
    }
}

impl ZoomBounds {
    pub fn new(min: f64, max: f64) -> Result<Self, DispatchError> {
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(DispatchError::InvalidValue {
                kind: "zoom bounds",
                value: max - min,
            });
        }
        Ok(Self { min, max })
    }

    pub fn clamp(&self, level: f64) -> f64 {
        level.clamp(self.min, self.max)
    }
}

/// Locally tracked zoom level, always inside its bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomTracker {
    bounds: ZoomBounds,
    level: f64,
}

impl ZoomTracker {
    pub fn new(bounds: ZoomBounds, initial: f64) -> Self {
        let level = if initial.is_finite() {
            bounds.clamp(initial)
        } else {
            bounds.min
        };
        Self { bounds, level }
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn bounds(&self) -> ZoomBounds {
        self.bounds
    }

    pub fn apply_delta(&mut self, delta: f64) -> f64 {
        if delta.is_finite() {
            self.level = self.bounds.clamp(self.level + delta);
        }
        self.level
    }

    pub fn set(&mut self, level: f64) -> f64 {
        if level.is_finite() {
            self.level = self.bounds.clamp(level);
        }
        self.level
    }
}

/// Carrier for control commands. No acknowledgement contract.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn send(&self, telescope_id: &str, command: &ControlCommand) -> Result<(), DispatchError>;
}

/// Publishes `{"type", "value"}` frames on the telescope's bus topic.
pub struct BusControlChannel {
    bus: Arc<dyn Bus>,
}

impl BusControlChannel {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ControlChannel for BusControlChannel {
    async fn send(&self, telescope_id: &str, command: &ControlCommand) -> Result<(), DispatchError> {
        let payload = command.frame().encode()?;
        self.bus.publish(control_topic(telescope_id), payload)?;
        Ok(())
    }
}

/// Forwards commands through the backend's control endpoint.
pub struct RegistryControlChannel {
    registry: Arc<dyn ResourceRegistry>,
}

impl RegistryControlChannel {
    pub fn new(registry: Arc<dyn ResourceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ControlChannel for RegistryControlChannel {
    async fn send(&self, telescope_id: &str, command: &ControlCommand) -> Result<(), DispatchError> {
        let message = ControlMessage {
            kind: command.kind.as_str().to_string(),
            value: command.value,
        };
        self.registry.control(telescope_id, &message).await?;
        Ok(())
    }
}

/// Keeps every command it is handed; can be told to fail.
#[derive(Default)]
pub struct RecordingControlChannel {
    sent: Mutex<Vec<(String, ControlCommand)>>,
    failing: AtomicBool,
    sent_notify: Notify,
}

impl RecordingControlChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(String, ControlCommand)> {
        self.sent.lock().clone()
    }

    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Resolves once at least `count` commands have been recorded.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.sent_notify.notified();
            if self.sent.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ControlChannel for RecordingControlChannel {
    async fn send(&self, telescope_id: &str, command: &ControlCommand) -> Result<(), DispatchError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::Channel("recording channel set to fail".into()));
        }
        self.sent.lock().push((telescope_id.to_string(), *command));
        self.sent_notify.notify_waiters();
        Ok(())
    }
}

/// A command the channel could not deliver.
#[derive(Debug)]
pub struct DispatchFailure {
    pub command: ControlCommand,
    pub error: DispatchError,
}

/// Sends commands for one telescope. Callers never wait on the channel; a
/// single worker keeps them in submission order.
pub struct CommandDispatcher {
    queue: Option<mpsc::UnboundedSender<ControlCommand>>,
    worker: Option<JoinHandle<()>>,
}

impl CommandDispatcher {
    pub fn spawn(
        telescope_id: String,
        channel: Arc<dyn ControlChannel>,
        failures: mpsc::UnboundedSender<DispatchFailure>,
    ) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<ControlCommand>();
        let worker = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let kind = command.kind.as_str();
                match channel.send(&telescope_id, &command).await {
                    Ok(()) => {
                        metrics::CONTROL_DISPATCH
                            .with_label_values(&[kind, "ok"])
                            .inc();
                        debug!(target = "scope.dispatch", telescope_id = %telescope_id, kind, value = command.value, "command sent");
                    }
                    Err(error) => {
                        metrics::CONTROL_DISPATCH
                            .with_label_values(&[kind, "failed"])
                            .inc();
                        warn!(target = "scope.dispatch", telescope_id = %telescope_id, kind, error = %error, "command not delivered");
                        let _ = failures.send(DispatchFailure { command, error });
                    }
                }
            }
        });
        Self {
            queue: Some(queue),
            worker: Some(worker),
        }
    }

    pub fn dispatch(&self, command: ControlCommand) -> Result<(), DispatchError> {
        if !command.value.is_finite() {
            return Err(DispatchError::InvalidValue {
                kind: command.kind.as_str(),
                value: command.value,
            });
        }
        let queue = self.queue.as_ref().ok_or(DispatchError::Stopped)?;
        queue.send(command).map_err(|_| DispatchError::Stopped)
    }

    /// Stops sending. Commands still queued are discarded.
    pub fn stop(&mut self) {
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
