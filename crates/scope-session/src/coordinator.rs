use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use scope_registry::ResourceRegistry;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::{SessionContext, SessionMode};
use crate::cost::{CostMeter, DEFAULT_SAMPLE_INTERVAL};
use crate::dispatch::{
    CommandDispatcher, ControlChannel, ControlIntent, DispatchFailure, ZoomBounds, ZoomTracker,
};
use crate::error::SessionError;
use crate::lease::{Lease, LeaseClient};
use crate::metrics;
use crate::realtime::{
    ConnectionState, MediaSurface, MediaTrack, RealtimeEvent, RealtimeSession, RealtimeTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Init,
    Acquiring,
    Active,
    SessionLost,
    AcquireFailed,
    TearingDown,
    Closed,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CoordinatorState::Init => "INIT",
            CoordinatorState::Acquiring => "ACQUIRING",
            CoordinatorState::Active => "ACTIVE",
            CoordinatorState::SessionLost => "SESSION_LOST",
            CoordinatorState::AcquireFailed => "ACQUIRE_FAILED",
            CoordinatorState::TearingDown => "TEARING_DOWN",
            CoordinatorState::Closed => "CLOSED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Error,
    Warning,
    Success,
}

/// Everything the presentation layer is told about a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    State(CoordinatorState),
    Connection(ConnectionState),
    Notice { level: NoticeLevel, message: String },
    TrackAttached(MediaTrack),
    Cost(f64),
    /// The screen should be left; the session is over or never started.
    NavigateAway,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub telescope_id: String,
    pub mode: SessionMode,
    pub rate_per_minute: f64,
    pub cost_interval: Duration,
    pub zoom_bounds: ZoomBounds,
    pub initial_zoom: f64,
    pub move_step: f64,
    pub close_grace: Duration,
}

impl CoordinatorConfig {
    pub fn new(telescope_id: impl Into<String>, mode: SessionMode, rate_per_minute: f64) -> Self {
        Self {
            telescope_id: telescope_id.into(),
            mode,
            rate_per_minute,
            cost_interval: DEFAULT_SAMPLE_INTERVAL,
            zoom_bounds: ZoomBounds::default(),
            initial_zoom: 1.0,
            move_step: 0.1,
            close_grace: Duration::from_secs(5),
        }
    }
}

/// External collaborators a coordinator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn ResourceRegistry>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub control: Arc<dyn ControlChannel>,
    pub surface: Arc<dyn MediaSurface>,
}

enum Command {
    Intent(ControlIntent),
    Exit,
}

pub struct SessionCoordinator;

impl SessionCoordinator {
    /// Spawns a coordinator that starts acquiring immediately.
    pub fn start(
        config: CoordinatorConfig,
        context: SessionContext,
        collaborators: Collaborators,
    ) -> CoordinatorHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Init);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let actor = Coordinator {
            zoom: ZoomTracker::new(config.zoom_bounds, config.initial_zoom),
            leases: LeaseClient::new(collaborators.registry.clone()),
            config,
            context: context.clone(),
            collaborators,
            state: state_tx,
            events: events_tx,
            commands: commands_rx,
        };
        let task = tokio::spawn(actor.run());
        CoordinatorHandle {
            commands: commands_tx,
            state: state_rx,
            events: Some(events_rx),
            context,
            task: Some(task),
        }
    }
}

/// Owner-side handle. Dropping it tears the session down.
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<CoordinatorState>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    context: SessionContext,
    task: Option<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Queues an intent. It is sent only if the coordinator is ACTIVE when it
    /// gets to it; returns false once the coordinator has finished.
    pub fn dispatch(&self, intent: ControlIntent) -> bool {
        self.commands.send(Command::Intent(intent)).is_ok()
    }

    /// Requests teardown. Further calls have no effect.
    pub fn exit(&self) {
        let _ = self.commands.send(Command::Exit);
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state.clone()
    }

    /// Hands out the event stream; only the first call gets it.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    pub fn current_cost(&self) -> f64 {
        self.context.current_cost()
    }

    /// Waits until the coordinator reaches CLOSED.
    pub async fn wait_closed(&mut self) -> CoordinatorState {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == CoordinatorState::Closed).await;
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!(target = "scope.coordinator", error = %err, "coordinator task failed");
            }
        }
        self.state()
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.exit();
    }
}

enum ActiveExit {
    Requested,
    Lost { reason: String, ever_connected: bool },
}

struct Coordinator {
    config: CoordinatorConfig,
    context: SessionContext,
    collaborators: Collaborators,
    leases: LeaseClient,
    zoom: ZoomTracker,
    state: watch::Sender<CoordinatorState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Coordinator {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit(SessionEvent::Notice {
            level,
            message: message.into(),
        });
    }

    fn transition(&self, next: CoordinatorState) {
        let previous = self.state.send_replace(next);
        info!(
            target = "scope.coordinator",
            telescope_id = %self.config.telescope_id,
            %previous,
            %next,
            "coordinator state"
        );
        self.emit(SessionEvent::State(next));
    }

    async fn run(mut self) {
        if self.config.telescope_id.trim().is_empty() {
            warn!(target = "scope.coordinator", error = %SessionError::NoTelescopeSelected, "not starting");
            self.notice(NoticeLevel::Error, "No telescope selected");
            self.transition(CoordinatorState::AcquireFailed);
            self.finish();
            return;
        }

        self.transition(CoordinatorState::Acquiring);
        let (outcome, exit_requested) = self.acquire().await;
        let lease = match outcome {
            Ok(lease) => lease,
            Err(err) => {
                error!(target = "scope.coordinator", error = %err, "failed to lock telescope");
                self.notice(NoticeLevel::Error, "Failed to connect to telescope");
                self.transition(CoordinatorState::AcquireFailed);
                self.finish();
                return;
            }
        };

        if exit_requested {
            info!(target = "scope.coordinator", telescope_id = %lease.telescope_id, "exit arrived while acquiring; releasing");
            self.teardown(&lease, None, None, None).await;
            self.finish();
            return;
        }

        self.run_active(lease).await;
        self.finish();
    }

    /// Awaits the lock while still taking commands. An exit (or a dropped
    /// handle) is remembered and honoured once the outcome is known.
    async fn acquire(&mut self) -> (Result<Lease, SessionError>, bool) {
        let leases = self.leases.clone();
        let telescope_id = self.config.telescope_id.clone();
        let holder_id = self.context.holder().id.clone();
        let acquire = leases.acquire(&telescope_id, &holder_id);
        tokio::pin!(acquire);

        let mut exit_requested = false;
        loop {
            tokio::select! {
                outcome = &mut acquire => return (outcome, exit_requested),
                command = self.commands.recv(), if !exit_requested => match command {
                    Some(Command::Intent(intent)) => {
                        debug!(target = "scope.coordinator", ?intent, "intent ignored while acquiring");
                    }
                    Some(Command::Exit) | None => exit_requested = true,
                },
            }
        }
    }

    async fn run_active(&mut self, lease: Lease) {
        let (realtime_tx, mut realtime_rx) = mpsc::unbounded_channel();
        let mut realtime = RealtimeSession::open(
            self.collaborators.transport.clone(),
            lease.session_token.clone(),
            self.collaborators.surface.clone(),
            realtime_tx,
            self.config.close_grace,
        );
        let mut meter = CostMeter::start(
            self.config.rate_per_minute,
            self.config.cost_interval,
            lease.started,
            self.context.clone(),
        );
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel::<DispatchFailure>();
        let mut dispatcher = self.config.mode.permits_control().then(|| {
            CommandDispatcher::spawn(
                lease.telescope_id.clone(),
                self.collaborators.control.clone(),
                failures_tx.clone(),
            )
        });
        let mut cost_updates = self.context.cost_updates();
        self.transition(CoordinatorState::Active);

        let mut connection = realtime.state();
        let mut ever_connected = false;
        let exit = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Intent(intent)) => self.handle_intent(intent, dispatcher.as_ref()),
                    Some(Command::Exit) | None => break ActiveExit::Requested,
                },
                event = realtime_rx.recv() => match event {
                    Some(RealtimeEvent::State(next)) => {
                        self.connection_changed(connection, next);
                        ever_connected |= next == ConnectionState::Connected;
                        connection = next;
                    }
                    Some(RealtimeEvent::TrackAttached(track)) => {
                        self.emit(SessionEvent::TrackAttached(track));
                    }
                    Some(RealtimeEvent::Lost { reason }) => break ActiveExit::Lost { reason, ever_connected },
                    None => break ActiveExit::Lost {
                        reason: "realtime session ended".into(),
                        ever_connected,
                    },
                },
                Some(failure) = failures_rx.recv() => {
                    self.notice(
                        NoticeLevel::Warning,
                        format!("Failed to send {} command", failure.command.kind),
                    );
                }
                Ok(()) = cost_updates.changed() => {
                    let amount = *cost_updates.borrow_and_update();
                    self.emit(SessionEvent::Cost(amount));
                }
            }
        };
        drop(failures_tx);

        if let ActiveExit::Lost {
            reason,
            ever_connected,
        } = exit
        {
            metrics::SESSION_LOST.inc();
            let err = SessionError::SessionFatal(reason);
            error!(target = "scope.coordinator", telescope_id = %lease.telescope_id, error = %err, "session lost");
            let message = if ever_connected {
                "Video connection lost"
            } else {
                "Failed to connect to video stream"
            };
            self.notice(NoticeLevel::Error, message);
            self.transition(CoordinatorState::SessionLost);
        }

        self.teardown(&lease, dispatcher.as_mut(), Some(&mut meter), Some(&mut realtime))
            .await;
    }

    fn handle_intent(&mut self, intent: ControlIntent, dispatcher: Option<&CommandDispatcher>) {
        let Some(dispatcher) = dispatcher else {
            debug!(target = "scope.coordinator", ?intent, "view mode ignores control intents");
            return;
        };
        let command = intent.resolve(self.config.move_step, &mut self.zoom);
        if let Err(err) = dispatcher.dispatch(command) {
            warn!(target = "scope.coordinator", error = %err, "command rejected");
        }
    }

    fn connection_changed(&self, previous: ConnectionState, next: ConnectionState) {
        self.emit(SessionEvent::Connection(next));
        match (previous, next) {
            (_, ConnectionState::Reconnecting) => {
                self.notice(NoticeLevel::Warning, "Attempting to reconnect...");
            }
            (ConnectionState::Reconnecting, ConnectionState::Connected) => {
                self.notice(NoticeLevel::Success, "Video connection restored");
            }
            _ => {}
        }
    }

    /// Stop the meter, close the realtime session, release the lease. Every
    /// step runs whatever happened before it.
    async fn teardown(
        &mut self,
        lease: &Lease,
        dispatcher: Option<&mut CommandDispatcher>,
        meter: Option<&mut CostMeter>,
        realtime: Option<&mut RealtimeSession>,
    ) {
        self.transition(CoordinatorState::TearingDown);
        metrics::TEARDOWN.inc();

        if let Some(dispatcher) = dispatcher {
            dispatcher.stop();
        }
        if let Some(meter) = meter {
            let amount = meter.stop();
            self.emit(SessionEvent::Cost(amount));
        }
        if let Some(realtime) = realtime {
            realtime.close().await;
        }
        match self
            .leases
            .release(&lease.telescope_id, &lease.holder_id)
            .await
        {
            Ok(()) => debug!(target = "scope.coordinator", telescope_id = %lease.telescope_id, "telescope released"),
            Err(err) => {
                warn!(target = "scope.coordinator", error = %err, "release failed; backend will reconcile");
                self.notice(NoticeLevel::Warning, "Failed to release telescope");
            }
        }
    }

    fn finish(&mut self) {
        self.commands.close();
        self.emit(SessionEvent::NavigateAway);
        self.transition(CoordinatorState::Closed);
    }
}
