use std::future::Future;
use std::io::BufRead;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use control_bus::{control_topic, spawn_control_listener, Bus, ControlFrame, LocalBus};
use scope_registry::ResourceRegistry;
use scope_session::{
    permitted_modes, BusControlChannel, Collaborators, ConnectionState, ControlChannel,
    ControlIntent, CoordinatorConfig, CoordinatorHandle, CoordinatorState, Direction, Holder,
    LoopbackTransport, MediaSurface, MediaTrack, NoticeLevel, RealtimeTransport,
    RegistryControlChannel, SessionContext, SessionCoordinator, SessionEvent, SessionMode,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport_webrtc::{WhepConfig, WhepTransport};

use crate::config::{AppConfig, ControlKind, TransportKind};

/// One line of console input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Input {
    Intent(ControlIntent),
    Cost,
    Exit,
}

/// Parses a console line. Blank lines yield `None`.
pub fn parse_input(line: &str, zoom_step: f64) -> Result<Option<Input>, String> {
    let mut words = line.split_whitespace();
    let Some(first) = words.next() else {
        return Ok(None);
    };
    let input = match first.to_ascii_lowercase().as_str() {
        "up" | "w" => Input::Intent(ControlIntent::Move(Direction::Up)),
        "down" | "s" => Input::Intent(ControlIntent::Move(Direction::Down)),
        "left" | "a" => Input::Intent(ControlIntent::Move(Direction::Left)),
        "right" | "d" => Input::Intent(ControlIntent::Move(Direction::Right)),
        "+" => Input::Intent(ControlIntent::Zoom { delta: zoom_step }),
        "-" => Input::Intent(ControlIntent::Zoom { delta: -zoom_step }),
        "zoom" | "z" => Input::Intent(parse_zoom(words.next(), zoom_step)?),
        "cost" => Input::Cost,
        "exit" | "quit" | "q" => Input::Exit,
        other => return Err(format!("unknown input {other:?}")),
    };
    Ok(Some(input))
}

fn parse_zoom(argument: Option<&str>, zoom_step: f64) -> Result<ControlIntent, String> {
    let argument = argument.ok_or_else(|| "zoom needs a level or a signed delta".to_string())?;
    match argument {
        "in" => return Ok(ControlIntent::Zoom { delta: zoom_step }),
        "out" => return Ok(ControlIntent::Zoom { delta: -zoom_step }),
        _ => {}
    }
    let value: f64 = argument
        .parse()
        .map_err(|_| format!("invalid zoom value {argument:?}"))?;
    if !value.is_finite() {
        return Err(format!("invalid zoom value {argument:?}"));
    }
    if argument.starts_with('+') || argument.starts_with('-') {
        Ok(ControlIntent::Zoom { delta: value })
    } else {
        Ok(ControlIntent::ZoomTo(value))
    }
}

/// Console line for a presentation event.
pub fn render(event: &SessionEvent) -> String {
    match event {
        SessionEvent::State(state) => format!("state: {state}"),
        SessionEvent::Connection(state) => format!("video: {}", connection_label(*state)),
        SessionEvent::Notice { level, message } => {
            let level = match level {
                NoticeLevel::Error => "error",
                NoticeLevel::Warning => "warning",
                NoticeLevel::Success => "ok",
            };
            format!("[{level}] {message}")
        }
        SessionEvent::TrackAttached(track) => format!("track attached: {}", track.id),
        SessionEvent::Cost(amount) => format!("cost: {amount:.2}"),
        SessionEvent::NavigateAway => "session over".to_string(),
    }
}

fn connection_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Idle => "idle",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "connected",
        ConnectionState::Reconnecting => "reconnecting",
        ConnectionState::Disconnected => "disconnected",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub acquire_failed: bool,
    pub final_cost: f64,
}

/// Pumps console input into the coordinator and its events out to `emit`
/// until the coordinator closes. End of input and `shutdown` both request
/// teardown.
pub async fn drive<F, E>(
    handle: &mut CoordinatorHandle,
    mut lines: mpsc::UnboundedReceiver<String>,
    shutdown: F,
    zoom_step: f64,
    mut emit: E,
) -> SessionSummary
where
    F: Future<Output = ()>,
    E: FnMut(String),
{
    let mut acquire_failed = false;
    let Some(mut events) = handle.events() else {
        handle.exit();
        handle.wait_closed().await;
        return SessionSummary {
            acquire_failed,
            final_cost: handle.current_cost(),
        };
    };
    tokio::pin!(shutdown);
    let mut reading = true;
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if event == SessionEvent::State(CoordinatorState::AcquireFailed) {
                    acquire_failed = true;
                }
                emit(render(&event));
            }
            line = lines.recv(), if reading => match line {
                Some(line) => match parse_input(&line, zoom_step) {
                    Ok(Some(Input::Intent(intent))) => {
                        debug!(?intent, "console intent");
                        handle.dispatch(intent);
                    }
                    Ok(Some(Input::Cost)) => {
                        emit(format!("cost so far: {:.2}", handle.current_cost()));
                    }
                    Ok(Some(Input::Exit)) => {
                        reading = false;
                        handle.exit();
                    }
                    Ok(None) => {}
                    Err(message) => emit(message),
                },
                None => {
                    reading = false;
                    handle.exit();
                }
            },
            _ = &mut shutdown, if !interrupted => {
                interrupted = true;
                reading = false;
                emit("interrupted, handing the telescope back".to_string());
                handle.exit();
            }
        }
    }

    handle.wait_closed().await;
    SessionSummary {
        acquire_failed,
        final_cost: handle.current_cost(),
    }
}

/// Telescope end of the loopback control bus: applies frames to a simulated
/// mount and logs where it points.
#[derive(Debug, Default)]
pub struct SimulatedTelescope {
    pose: Mutex<Pose>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

impl SimulatedTelescope {
    pub fn pose(&self) -> Pose {
        *self.pose.lock()
    }

    pub fn apply_frame(&self, frame: ControlFrame) {
        let mut pose = self.pose.lock();
        match frame.kind.as_str() {
            "dx" => pose.x += frame.value,
            "dy" => pose.y += frame.value,
            "zoom" => pose.zoom = frame.value,
            other => {
                warn!(target: "stargaze.telescope", kind = other, "ignoring unknown command");
                return;
            }
        }
        info!(
            target: "stargaze.telescope",
            x = pose.x,
            y = pose.y,
            zoom = pose.zoom,
            "telescope moved"
        );
    }
}

struct ConsoleSurface;

impl MediaSurface for ConsoleSurface {
    fn attach(&self, track: &MediaTrack) {
        info!(track_id = %track.id, kind = ?track.kind, "rendering track");
    }
}

/// A started coordinator plus whatever the chosen wiring keeps alive.
pub struct Session {
    pub handle: CoordinatorHandle,
    pub telescope: Option<Arc<SimulatedTelescope>>,
    listener: Option<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// Checks the telescope can be used in `mode`, wires the collaborators named
/// in `cfg` and starts the coordinator.
pub async fn start(
    cfg: &AppConfig,
    registry: Arc<dyn ResourceRegistry>,
    telescope_id: &str,
    mode: SessionMode,
) -> anyhow::Result<Session> {
    let telescope_id = telescope_id.trim();
    let rate_per_minute = if telescope_id.is_empty() {
        0.0
    } else {
        let listing = registry.list().await.context("failed to list telescopes")?;
        let telescope = listing
            .find(telescope_id)
            .ok_or_else(|| anyhow!("unknown telescope {telescope_id}"))?;
        if !permitted_modes(telescope.status).contains(&mode) {
            bail!(
                "telescope {telescope_id} is {}; {} mode is not available",
                telescope.status,
                mode.label()
            );
        }
        telescope.price_per_minute
    };

    let transport: Arc<dyn RealtimeTransport> = match cfg.transport {
        TransportKind::Webrtc => {
            let mut whep = WhepConfig::new(&cfg.media_url)?;
            whep.ice_servers = cfg.ice_servers.clone();
            whep.request_timeout = cfg.request_timeout();
            Arc::new(WhepTransport::new(whep)?)
        }
        TransportKind::Loopback => LoopbackTransport::with_video(),
    };

    let mut telescope = None;
    let mut listener = None;
    let control: Arc<dyn ControlChannel> = match cfg.control {
        ControlKind::Http => Arc::new(RegistryControlChannel::new(registry.clone())),
        ControlKind::Loopback => {
            let bus = Arc::new(LocalBus::new());
            let simulated = Arc::new(SimulatedTelescope::default());
            let sink = simulated.clone();
            listener = Some(spawn_control_listener(
                bus.clone(),
                control_topic(telescope_id),
                move |frame: ControlFrame| sink.apply_frame(frame),
            ));
            telescope = Some(simulated);
            let bus: Arc<dyn Bus> = bus;
            Arc::new(BusControlChannel::new(bus))
        }
    };

    let mut config = CoordinatorConfig::new(telescope_id, mode, rate_per_minute);
    config.cost_interval = cfg.cost_interval();
    config.zoom_bounds = cfg.zoom_bounds()?;
    config.initial_zoom = cfg.initial_zoom;
    config.move_step = cfg.move_step;
    config.close_grace = cfg.close_grace();

    let context = SessionContext::new(Holder::new(&cfg.holder_id, &cfg.holder_name));
    info!(
        telescope_id,
        mode = mode.label(),
        rate_per_minute,
        holder = %cfg.holder_id,
        "starting session"
    );
    let handle = SessionCoordinator::start(
        config,
        context,
        Collaborators {
            registry,
            transport,
            control,
            surface: Arc::new(ConsoleSurface),
        },
    );
    Ok(Session {
        handle,
        telescope,
        listener,
    })
}

/// Runs an interactive session on stdin/stdout until exit, end of input or
/// Ctrl-C.
pub async fn run(
    cfg: &AppConfig,
    registry: Arc<dyn ResourceRegistry>,
    telescope_id: &str,
    mode: SessionMode,
) -> anyhow::Result<()> {
    let mut session = start(cfg, registry, telescope_id, mode).await?;
    if mode.permits_control() {
        println!("steer with up/down/left/right (or w/a/s/d), zoom +0.5, zoom 3; cost; exit");
    } else {
        println!("viewing only; type cost or exit");
    }

    let summary = drive(&mut session.handle, stdin_lines(), ctrl_c(), cfg.zoom_step, |line| {
        println!("{line}")
    })
    .await;
    println!("total cost: {:.2}", summary.final_cost);
    if let Some(telescope) = &session.telescope {
        let pose = telescope.pose();
        println!(
            "simulated telescope at x={:.2} y={:.2} zoom={:.2}",
            pose.x, pose.y, pose.zoom
        );
    }
    if summary.acquire_failed {
        bail!("could not start a session on telescope {}", telescope_id.trim());
    }
    Ok(())
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Reads stdin on a dedicated thread. The channel closes at end of input.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, ControlKind, TransportKind};
    use scope_registry::{InMemoryRegistry, TelescopeStatus};
    use std::time::Duration;

    fn offline_config() -> AppConfig {
        AppConfig {
            backend: BackendKind::Memory,
            transport: TransportKind::Loopback,
            control: ControlKind::Loopback,
            ..AppConfig::default()
        }
    }

    #[test]
    fn simulated_telescope_accumulates_moves_and_ignores_unknown_frames() {
        let telescope = SimulatedTelescope::default();
        let frame = |kind: &str, value: f64| ControlFrame {
            kind: kind.to_string(),
            value,
        };
        telescope.apply_frame(frame("dx", 0.5));
        telescope.apply_frame(frame("dx", -0.2));
        telescope.apply_frame(frame("dy", 0.1));
        telescope.apply_frame(frame("zoom", 2.0));
        telescope.apply_frame(frame("focus", 9.0));
        let pose = telescope.pose();
        assert!((pose.x - 0.3).abs() < 1e-9);
        assert!((pose.y - 0.1).abs() < 1e-9);
        assert_eq!(pose.zoom, 2.0);
    }

    #[test]
    fn parses_moves_in_both_spellings() {
        for (line, direction) in [
            ("up", Direction::Up),
            ("W", Direction::Up),
            ("down", Direction::Down),
            ("a", Direction::Left),
            ("  right  ", Direction::Right),
        ] {
            assert_eq!(
                parse_input(line, 0.1),
                Ok(Some(Input::Intent(ControlIntent::Move(direction)))),
                "{line}"
            );
        }
    }

    #[test]
    fn signed_zoom_is_relative_and_bare_zoom_is_absolute() {
        assert_eq!(
            parse_input("zoom +0.5", 0.1),
            Ok(Some(Input::Intent(ControlIntent::Zoom { delta: 0.5 })))
        );
        assert_eq!(
            parse_input("zoom -2", 0.1),
            Ok(Some(Input::Intent(ControlIntent::Zoom { delta: -2.0 })))
        );
        assert_eq!(
            parse_input("zoom 3", 0.1),
            Ok(Some(Input::Intent(ControlIntent::ZoomTo(3.0))))
        );
        assert_eq!(
            parse_input("+", 0.25),
            Ok(Some(Input::Intent(ControlIntent::Zoom { delta: 0.25 })))
        );
        assert!(parse_input("zoom", 0.1).is_err());
        assert!(parse_input("zoom NaN", 0.1).is_err());
        assert!(parse_input("zoom far", 0.1).is_err());
    }

    #[test]
    fn recognises_session_words_and_rejects_the_rest() {
        assert_eq!(parse_input("", 0.1), Ok(None));
        assert_eq!(parse_input("cost", 0.1), Ok(Some(Input::Cost)));
        assert_eq!(parse_input("exit", 0.1), Ok(Some(Input::Exit)));
        assert_eq!(parse_input("q", 0.1), Ok(Some(Input::Exit)));
        assert!(parse_input("jump", 0.1).is_err());
    }

    #[test]
    fn renders_events_for_the_console() {
        assert_eq!(
            render(&SessionEvent::State(CoordinatorState::SessionLost)),
            "state: SESSION_LOST"
        );
        assert_eq!(
            render(&SessionEvent::Connection(ConnectionState::Reconnecting)),
            "video: reconnecting"
        );
        assert_eq!(
            render(&SessionEvent::Notice {
                level: NoticeLevel::Error,
                message: "Failed to connect to telescope".into(),
            }),
            "[error] Failed to connect to telescope"
        );
        assert_eq!(render(&SessionEvent::Cost(1.5)), "cost: 1.50");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn steers_the_simulated_telescope_and_hands_it_back() {
        let registry = InMemoryRegistry::demo();
        let mut session = start(&offline_config(), registry.clone(), "T1", SessionMode::Control)
            .await
            .expect("session starts");
        let telescope = session.telescope.clone().expect("loopback control");

        let (tx, rx) = mpsc::unbounded_channel();
        let output = Arc::new(Mutex::new(Vec::new()));
        let driver = {
            let output = output.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let summary = drive(
                    &mut session.handle,
                    rx,
                    std::future::pending(),
                    0.1,
                    move |line| {
                        if line == "state: ACTIVE" {
                            let _ = tx.send("up".to_string());
                            let _ = tx.send("zoom 3".to_string());
                        }
                        output.lock().push(line);
                    },
                )
                .await;
                drop(session);
                summary
            })
        };

        let expected = Pose {
            x: 0.0,
            y: 0.1,
            zoom: 3.0,
        };
        while telescope.pose() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send("exit".to_string()).expect("driver reading");

        let summary = driver.await.expect("driver finished");
        assert!(!summary.acquire_failed);
        assert_eq!(registry.status_of("T1"), Some(TelescopeStatus::Free));
        assert_eq!(registry.calls_with_status("T1", TelescopeStatus::Free), 1);
        let output = output.lock().clone();
        assert!(output.contains(&"state: ACTIVE".to_string()));
        assert_eq!(output.last().map(String::as_str), Some("state: CLOSED"));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn end_of_input_releases_the_lease() {
        let registry = InMemoryRegistry::demo();
        let mut session = start(&offline_config(), registry.clone(), "T4", SessionMode::View)
            .await
            .expect("session starts");
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        drop(tx);

        let summary = drive(
            &mut session.handle,
            rx,
            std::future::pending(),
            0.1,
            |_| {},
        )
        .await;
        assert!(!summary.acquire_failed);
        assert_eq!(registry.status_of("T4"), Some(TelescopeStatus::Free));
        assert_eq!(registry.calls_with_status("T4", TelescopeStatus::Free), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn missing_telescope_id_reports_acquire_failure() {
        let registry = InMemoryRegistry::demo();
        let mut session = start(&offline_config(), registry.clone(), "  ", SessionMode::Control)
            .await
            .expect("session starts");
        let (_tx, rx) = mpsc::unbounded_channel::<String>();
        let mut output = Vec::new();

        let summary = drive(
            &mut session.handle,
            rx,
            std::future::pending(),
            0.1,
            |line| output.push(line),
        )
        .await;
        assert!(summary.acquire_failed);
        assert!(output.contains(&"[error] No telescope selected".to_string()));
        assert!(registry.status_calls().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn refuses_modes_the_status_does_not_permit() {
        let registry = InMemoryRegistry::demo();
        let damaged = start(&offline_config(), registry.clone(), "T3", SessionMode::View).await;
        assert!(damaged.is_err());
        let locked = start(&offline_config(), registry.clone(), "T2", SessionMode::Control).await;
        assert!(locked.is_err());
        let unknown = start(&offline_config(), registry.clone(), "T9", SessionMode::View).await;
        assert!(unknown.is_err());
        assert!(registry.status_calls().is_empty());
    }
}
