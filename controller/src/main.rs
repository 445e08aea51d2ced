//! Drives a two motor car over a serial radio link with two fingers
#![warn(meta_variable_misuse)]

mod dispatch;
mod script;

use crate::dispatch::CommandSender;
use crate::script::Step;
use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use common::command::FrameFormat;
use common::config::ControllerConfig;
use common::error::LogErrorExt;
use common::telemetry::TelemetryDecoder;
use common::touch::TouchTracker;
use common::types::PeerAddress;
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use link::{channel_listener, ConnectionEvent, ConnectionRegistry, ConnectionState, TcpTransport};
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fs, thread};
use tracing::{debug, error, info, warn, Level};

static STOP: AtomicBool = AtomicBool::new(false);

/// Touch controller for the car
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Settings file, defaults are used without one
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Car to connect to, overrides the config file
    #[arg(short, long, value_name = "ADDR")]
    peer: Option<String>,

    /// Frame format, overrides the config file
    #[arg(short, long)]
    format: Option<Format>,

    /// Touch script to replay, read from stdin without one
    #[arg(short, long, value_name = "FILE")]
    script: Option<PathBuf>,

    /// More logging (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(ValueEnum, Debug, Copy, Clone)]
enum Format {
    Binary,
    Text,
}

impl From<Format> for FrameFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Binary => FrameFormat::Binary,
            Format::Text => FrameFormat::Text,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    info!("Starting controller");

    let mut config = match &args.config {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::default(),
    };
    if let Some(peer) = args.peer {
        config.peer = Some(PeerAddress::new(peer));
    }
    if let Some(format) = args.format {
        config.format = format.into();
    }
    let peer = config.peer.clone().context("No peer address configured")?;

    let steps = load_script(args.script.as_ref())?;
    debug!("Loaded {} script steps", steps.len());

    ctrlc::set_handler(|| STOP.store(true, Ordering::Relaxed)).context("Set ctrl-c")?;

    let registry = Arc::new(ConnectionRegistry::new(TcpTransport));
    let (tx, events) = channel::unbounded();
    let connecting = registry
        .spawn_initialize(peer.clone(), Some(channel_listener(tx)))
        .context("Spawn connect thread")?;

    let mut telemetry = TelemetryDecoder::new();
    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => match handle_event(event, &mut telemetry) {
                Some(ConnectionState::Connected) => break,
                Some(ConnectionState::Failed) => {
                    let connection = connecting.join().log_error("Connect thread panicked");
                    let reason = connection.and_then(|it| it.error_message());
                    bail!("Could not connect to {peer}: {}", reason.unwrap_or_default());
                }
                _ => {}
            },
            Err(RecvTimeoutError::Timeout) if STOP.load(Ordering::Relaxed) => {
                // The connect thread can't be interrupted, it is left behind
                info!("Stopped while connecting");
                return Ok(());
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => bail!("Connection listener dropped"),
        }
    }

    let connection = match connecting.join() {
        Ok(connection) => connection,
        Err(_) => bail!("Connect thread panicked"),
    };

    let mut tracker = TouchTracker::new(config.surface.width, config.surface.height);
    tracker.add_observer(|snapshot| {
        if let Some((left, right)) = snapshot.levels() {
            debug!("Levels: left {:.0}%, right {:.0}%", left * 100.0, right * 100.0);
        }
    });
    let mut sender = CommandSender::new(config.encoder());
    sender.attach(connection.clone());
    sender.observe(&mut tracker);

    info!("Replaying {} steps", steps.len());
    for step in steps {
        if STOP.load(Ordering::Relaxed) {
            info!("Stopped");
            break;
        }

        match step {
            Step::Touch(event) => {
                if !tracker.handle(event) {
                    debug!("Ignored extra finger");
                }
            }
            Step::Resize(width, height) => tracker.resize(width, height),
            Step::Wait(duration) => pump_for(&events, &mut telemetry, duration),
        }
        pump(&events, &mut telemetry);

        if !connection.is_connected() {
            warn!("Car is gone, stopping replay");
            break;
        }
    }

    connection.disconnect();
    pump(&events, &mut telemetry);

    if let Some(reason) = connection.error_message() {
        error!("Link ended with an error: {reason}");
    }
    info!("Controller stopped");

    Ok(())
}

fn load_script(path: Option<&PathBuf>) -> anyhow::Result<Vec<Step>> {
    let text = match path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Read script {}", path.display()))?,
        None => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("Read script from stdin")?;
            text
        }
    };

    script::parse(&text).context("Parse script")
}

/// Logs one connection event, returning the new state for state changes
fn handle_event(
    event: ConnectionEvent,
    telemetry: &mut TelemetryDecoder,
) -> Option<ConnectionState> {
    match event {
        ConnectionEvent::StateChanged(change) => {
            match &change.error {
                Some(reason) => warn!(
                    "Car {} is {:?} (was {:?}): {reason}",
                    change.peer, change.state, change.last_state
                ),
                None => info!(
                    "Car {} is {:?} (was {:?})",
                    change.peer, change.state, change.last_state
                ),
            }
            Some(change.state)
        }
        ConnectionEvent::DataReceived(byte) => {
            if let Some(distance) = telemetry.push(byte) {
                info!("Space ahead: {distance}");
            }
            None
        }
    }
}

fn pump(events: &Receiver<ConnectionEvent>, telemetry: &mut TelemetryDecoder) {
    for event in events.try_iter() {
        handle_event(event, telemetry);
    }
}

/// Like `thread::sleep` but keeps the event log flowing
fn pump_for(
    events: &Receiver<ConnectionEvent>,
    telemetry: &mut TelemetryDecoder,
    duration: Duration,
) {
    let deadline = Instant::now() + duration;

    loop {
        let now = Instant::now();
        if now >= deadline || STOP.load(Ordering::Relaxed) {
            break;
        }

        match events.recv_timeout((deadline - now).min(Duration::from_millis(100))) {
            Ok(event) => {
                handle_event(event, telemetry);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(deadline.saturating_duration_since(Instant::now()));
                break;
            }
        }
    }
}
