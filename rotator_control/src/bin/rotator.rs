use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use pass_planner::{ElementStore, PropagationModel, SharedVisibilityCache, VisibilityCache};
use rotator_control::config::{default_config_path, Config};
use rotator_control::model::calibration::{CalibrationSession, WizardEvent, WizardState};
use rotator_control::model::tracking_manager::{
    SatelliteTarget, StatusEvent, TickOutcome, TrackingSession,
};
use rotator_control::rotator_handler::{
    serial_link, AbortHandle, RotatorDriver, RotatorLink, SerialLink, SimulatedRotator,
};
use rotator_control::{RotatorError, RotatorResult};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

const SWEEP_POLL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "rotator", about = "Point a GS-232B rotator at satellites")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track one satellite until interrupted
    Track {
        /// Two/three-line element file
        tle: PathBuf,
        /// Satellite name as it appears in the element file
        satellite: String,
        /// Drive the simulated rotator instead of the serial port
        #[arg(long)]
        simulate: bool,
        #[arg(long, default_value_t = PropagationModel::Keplerian)]
        model: PropagationModel,
    },
    /// Run the calibration wizard; events are read from stdin
    Calibrate {
        #[arg(long)]
        simulate: bool,
        /// Record commands without sending them
        #[arg(long)]
        dry_run: bool,
    },
    /// List upcoming passes
    Passes {
        tle: PathBuf,
        /// Only this satellite
        satellite: Option<String>,
        /// Look-ahead, overriding the configured prefetch
        #[arg(long)]
        hours: Option<i64>,
        #[arg(long, default_value_t = PropagationModel::Keplerian)]
        model: PropagationModel,
    },
    /// List serial ports
    Ports,
    /// Print the configuration, optionally writing it back to disk
    Config {
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> RotatorResult<()> {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let mut config = Config::load_from_or_default(&config_path)?;
    config.validate()?;

    match cli.command {
        Commands::Track {
            tle,
            satellite,
            simulate,
            model,
        } => {
            if simulate {
                let link = SimulatedRotator::realtime(&config.simulation);
                track(RotatorDriver::new(link, config.serial.timeout()), &config, &tle, &satellite, model).await
            } else {
                let link = SerialLink::open(&config.serial)?;
                track(RotatorDriver::new(link, config.serial.timeout()), &config, &tle, &satellite, model).await
            }
        }
        Commands::Calibrate { simulate, dry_run } => {
            let park = if simulate {
                let link = SimulatedRotator::realtime(&config.simulation);
                calibrate(RotatorDriver::new(link, config.serial.timeout()), &config, dry_run).await?
            } else {
                let link = SerialLink::open(&config.serial)?;
                calibrate(RotatorDriver::new(link, config.serial.timeout()), &config, dry_run).await?
            };
            if let Some(park) = park {
                config.calibration.park_azimuth_deg = park;
                config.save_to(&config_path)?;
                log::info!("park azimuth {park}° saved to {}", config_path.display());
            }
            Ok(())
        }
        Commands::Passes {
            tle,
            satellite,
            hours,
            model,
        } => passes(&config, &tle, satellite.as_deref(), hours, model).await,
        Commands::Ports => {
            let ports = serial_link::available_ports()?;
            if ports.is_empty() {
                println!("no serial ports found");
            }
            for port in ports {
                println!("{port}");
            }
            Ok(())
        }
        Commands::Config { write } => {
            let text = serde_json::to_string_pretty(&config)
                .map_err(|e| RotatorError::ConfigError(e.to_string()))?;
            println!("{text}");
            if write {
                config.save_to(&config_path)?;
                println!("written to {}", config_path.display());
            }
            Ok(())
        }
    }
}

/// Raises the driver's abort flag on Ctrl-C.
fn abort_on_interrupt(abort: AbortHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupted, aborting");
            abort.abort();
        }
    });
}

/// Stops motion after an interrupted session.
fn halt<L: RotatorLink>(driver: &mut RotatorDriver<L>) {
    driver.abort_handle().reset();
    match tokio::task::block_in_place(|| driver.stop()) {
        Ok(echo) => log::info!("rotator stopped at {echo}"),
        Err(e) => log::warn!("could not stop rotator: {e}"),
    }
}

fn load_store(path: &Path) -> RotatorResult<Arc<ElementStore>> {
    let store = ElementStore::from_file(path)?;
    if store.is_empty() {
        return Err(RotatorError::ConfigError(format!(
            "no element sets in {}",
            path.display()
        )));
    }
    Ok(Arc::new(store))
}

async fn track<L: RotatorLink>(
    mut driver: RotatorDriver<L>,
    config: &Config,
    tle: &Path,
    satellite: &str,
    model: PropagationModel,
) -> RotatorResult<()> {
    let store = load_store(tle)?;
    let elements = store
        .get(satellite)
        .cloned()
        .ok_or_else(|| RotatorError::ConfigError(format!("'{satellite}' not in {}", tle.display())))?;
    let name = elements.name.clone();
    let station = config.ground_station()?;
    let settings = config.visibility_settings(model);

    let cache = SharedVisibilityCache::new();
    let mut rebuild = Some(cache.spawn_rebuild(store.clone(), station, Utc::now(), settings));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                StatusEvent::Pointing(target) => log::debug!(
                    "target az {:.1} el {:.1} range {:.0} km",
                    target.azimuth_deg,
                    target.elevation_deg,
                    target.range_m / 1000.0
                ),
                StatusEvent::Commanded { command, echo } => log::debug!("{command} -> {echo}"),
                StatusEvent::ProtocolTimeout(msg) => log::warn!("protocol timeout: {msg}"),
                StatusEvent::RotatorUnresponsive(msg) => log::error!("{msg}"),
                StatusEvent::KeplerNonConvergence(msg) | StatusEvent::PropagationFailed(msg) => {
                    log::warn!("{msg}")
                }
            }
        }
    });

    let abort = driver.abort_handle();
    abort_on_interrupt(abort.clone());
    log::info!("tracking {name} via {}", driver.link().describe());

    let source = SatelliteTarget::new(elements, station, model);
    let mut session = TrackingSession::new(&mut driver, source, config.tracking_config()).with_events(events_tx);
    let mut interval = tokio::time::interval(Duration::from_millis(config.tracking.tick_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut was_visible = None;

    while !abort.is_aborted() {
        interval.tick().await;
        let now = Utc::now();

        if rebuild.as_ref().is_some_and(|h| h.is_finished()) {
            if let Some(handle) = rebuild.take() {
                match handle.await {
                    Ok(Ok(built)) => log::info!(
                        "visibility cache ready until {} ({} passes)",
                        built.end(),
                        built.all_windows().len()
                    ),
                    Ok(Err(e)) => log::warn!("visibility cache rebuild failed: {e}"),
                    Err(e) => log::warn!("visibility cache task failed: {e}"),
                }
            }
        }
        if rebuild.is_none() && cache_expiring(cache.snapshot().as_deref(), now, settings.prefetch / 2) {
            rebuild = Some(cache.spawn_rebuild(store.clone(), station, now, settings));
        }

        let report = tokio::task::block_in_place(|| session.tick(now));
        let visible = !matches!(report.outcome, TickOutcome::BelowHorizon);
        if was_visible != Some(visible) {
            if visible {
                log::info!("{name} above the horizon");
            } else {
                announce_next_pass(cache.snapshot().as_deref(), &name, now);
            }
            was_visible = Some(visible);
        }
        if report.outcome == TickOutcome::Aborted {
            break;
        }
    }

    drop(session);
    halt(&mut driver);
    Ok(())
}

fn cache_expiring(cache: Option<&VisibilityCache>, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
    cache.is_some_and(|c| c.end() - now < margin)
}

fn announce_next_pass(cache: Option<&VisibilityCache>, satellite: &str, now: DateTime<Utc>) {
    let Some(cache) = cache else {
        log::info!("{satellite} below the horizon");
        return;
    };
    match cache.next_pass(satellite, now) {
        Ok(Some(pass)) => log::info!(
            "{satellite} below the horizon, next pass {} to {} (max {:.1}°)",
            pass.start,
            pass.end,
            pass.max_elevation_deg
        ),
        Ok(None) => log::info!("{satellite} below the horizon, no pass before {}", cache.end()),
        Err(e) => log::warn!("{e}"),
    }
}

const CALIBRATION_HELP: &str = "events: start, move, next, back, stop, finish, continue, \
restart, cancel, sweep [x1..x4], pause, resume; also: park <deg>, status, help";

/// Runs the wizard on stdin. Returns the park azimuth when it exits through
/// `Continue`.
async fn calibrate<L: RotatorLink>(
    mut driver: RotatorDriver<L>,
    config: &Config,
    dry_run: bool,
) -> RotatorResult<Option<i64>> {
    let abort = driver.abort_handle();
    abort_on_interrupt(abort.clone());

    let (lines_tx, mut lines) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if lines_tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut session = CalibrationSession::new(&mut driver, dry_run);
    session.set_park_azimuth(config.calibration.park_azimuth_deg)?;
    println!("{CALIBRATION_HELP}");
    println!("{}", session.status_line());

    let mut poll = tokio::time::interval(SWEEP_POLL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut failure = None;
    while !session.state().is_terminal() && !abort.is_aborted() {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                match calibration_input(&mut session, line.trim()) {
                    Ok(()) => println!("{}", session.status_line()),
                    Err(RotatorError::OperationAborted(msg)) => {
                        log::warn!("{msg}");
                        break;
                    }
                    Err(e) => println!("{e}"),
                }
            }
            _ = poll.tick() => {
                if session.sweep().is_some_and(|s| s.is_running()) {
                    match tokio::task::block_in_place(|| session.poll_sweep(Utc::now())) {
                        Ok(Some(progress)) => {
                            println!("sweep {:.0}°", progress.travelled_deg.min(360.0));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::error!("sweep failed: {e}");
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }
        }
    }

    let unfinished_sweep = session.sweep().is_some_and(|s| !s.complete);
    if abort.is_aborted() || failure.is_some() || unfinished_sweep {
        match tokio::task::block_in_place(|| session.halt()) {
            Ok(()) => log::info!("rotator stopped"),
            Err(e) => log::warn!("could not stop rotator: {e}"),
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    let state = session.state();
    Ok((state == WizardState::ExitOk).then_some(session.park_azimuth()))
}

fn calibration_input<L: RotatorLink>(
    session: &mut CalibrationSession<'_, L>,
    line: &str,
) -> RotatorResult<()> {
    let mut words = line.split_whitespace();
    match words.next() {
        None => Ok(()),
        Some("help") => {
            println!("{CALIBRATION_HELP}");
            Ok(())
        }
        Some("status") => Ok(()),
        Some("park") => {
            let azimuth = words
                .next()
                .and_then(|w| w.parse::<i64>().ok())
                .ok_or_else(|| RotatorError::ConfigError("usage: park <degrees>".to_string()))?;
            session.set_park_azimuth(azimuth)
        }
        Some(_) => {
            let event: WizardEvent = line.parse().map_err(RotatorError::ConfigError)?;
            tokio::task::block_in_place(|| session.handle_at(event, Utc::now())).map(|_| ())
        }
    }
}

async fn passes(
    config: &Config,
    tle: &Path,
    satellite: Option<&str>,
    hours: Option<i64>,
    model: PropagationModel,
) -> RotatorResult<()> {
    let store = load_store(tle)?;
    let station = config.ground_station()?;
    let mut settings = config.visibility_settings(model);
    if let Some(hours) = hours {
        settings.prefetch = chrono::Duration::hours(hours);
    }

    let cache = SharedVisibilityCache::new();
    let built = cache.rebuild(store.clone(), station, Utc::now(), settings).await?;

    let wanted = match satellite {
        Some(name) => Some(
            store
                .get(name)
                .map(|set| set.name.clone())
                .ok_or_else(|| RotatorError::ConfigError(format!("'{name}' not in {}", tle.display())))?,
        ),
        None => None,
    };

    for (name, reason) in built.not_computed() {
        log::warn!("{name}: not computed ({reason})");
    }
    let windows = built
        .all_windows()
        .into_iter()
        .filter(|w| wanted.as_deref().map_or(true, |name| w.satellite == name));
    let mut count = 0;
    for w in windows {
        count += 1;
        println!(
            "{:<24} {}  {}  max {:5.1}° at {}  ({} min)",
            w.satellite,
            w.start.format("%Y-%m-%d %H:%M:%S"),
            w.end.format("%H:%M:%S"),
            w.max_elevation_deg,
            w.culmination.format("%H:%M:%S"),
            w.duration().num_minutes()
        );
    }
    if count == 0 {
        println!("no passes before {}", built.end());
    }
    Ok(())
}
