//! Closed-loop satellite tracking.
//!
//! [`TrackingSession::tick`] is called at whatever cadence the host chooses.
//! Each tick computes where the satellite is, decides whether the rotator
//! needs to move and, if so, commands it and records the confirmed position.

use crate::model::{RotatorError, RotatorResult};
use crate::rotator_handler::protocol::MAX_AZIMUTH_DEG;
use crate::rotator_handler::{Command, Echo, RotatorDriver, RotatorLink};
use chrono::{DateTime, Duration, Utc};
use pass_planner::{
    calculate_pointing, GroundStation, OrbitalElementSet, PassPlannerError, PassPlannerResult,
    PointingTarget, PropagationModel,
};
use tokio::sync::mpsc::UnboundedSender;

/// Motion policy of the tracking loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingConfig {
    /// Azimuth changes smaller than this are not commanded (degrees)
    pub az_deadband_deg: f64,
    /// Elevation changes smaller than this are not commanded (degrees)
    pub el_deadband_deg: f64,
    /// Shortest time between two move commands
    pub min_interval: Duration,
    /// Above this elevation the azimuth is held
    pub zenith_freeze_deg: f64,
    /// Extra attempts after a move times out
    pub retries: u32,
    /// Use the 360°..450° overlap to keep azimuth continuous across north
    pub unwrap_azimuth: bool,
    /// Fastest azimuth change commanded per second of elapsed time
    pub az_slew_deg_per_s: f64,
    pub el_slew_deg_per_s: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            az_deadband_deg: 0.4,
            el_deadband_deg: 0.3,
            min_interval: Duration::seconds(1),
            zenith_freeze_deg: 87.0,
            retries: 1,
            unwrap_azimuth: true,
            az_slew_deg_per_s: 8.0,
            el_slew_deg_per_s: 6.0,
        }
    }
}

/// What the loop last asked for and what the rotator last confirmed.
///
/// Only a confirmed move updates this, so an aborted or timed-out exchange
/// leaves it as it was.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RotatorCommandState {
    /// Azimuth and elevation of the last confirmed move command
    pub last_commanded: Option<(f64, f64)>,
    pub last_command_time: Option<DateTime<Utc>>,
    pub last_confirmed: Option<Echo>,
}

/// Anything that can say where to point at a given instant.
pub trait PointingSource {
    fn label(&self) -> &str;
    fn pointing_at(&self, now: DateTime<Utc>) -> PassPlannerResult<PointingTarget>;
}

/// A satellite seen from a ground station.
#[derive(Debug, Clone)]
pub struct SatelliteTarget {
    elements: OrbitalElementSet,
    station: GroundStation,
    model: PropagationModel,
}

impl SatelliteTarget {
    pub fn new(elements: OrbitalElementSet, station: GroundStation, model: PropagationModel) -> Self {
        Self {
            elements,
            station,
            model,
        }
    }
}

impl PointingSource for SatelliteTarget {
    fn label(&self) -> &str {
        &self.elements.name
    }

    fn pointing_at(&self, now: DateTime<Utc>) -> PassPlannerResult<PointingTarget> {
        calculate_pointing(&self.elements, &self.station, now, self.model)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Target below the horizon; the rotator is left where it is
    BelowHorizon,
    /// Change inside both deadbands
    SkippedDeadband,
    /// Change outside the deadband but the previous move is too recent
    SkippedRateLimit,
    Commanded {
        azimuth_deg: f64,
        elevation_deg: f64,
        echo: Echo,
        attempts: u32,
    },
    /// Every attempt timed out; holds a `RotatorError::RotatorUnresponsive`
    Unresponsive(RotatorError),
    PropagationFailed(PassPlannerError),
    Aborted,
    /// Any other link failure (serial I/O, unparseable echo)
    LinkFailed(RotatorError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub time: DateTime<Utc>,
    pub target: Option<PointingTarget>,
    pub outcome: TickOutcome,
}

/// Status updates pushed to whoever is displaying the session.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Pointing(PointingTarget),
    Commanded { command: String, echo: Echo },
    ProtocolTimeout(String),
    RotatorUnresponsive(String),
    KeplerNonConvergence(String),
    PropagationFailed(String),
}

/// A tracking session. Holds the driver exclusively for its lifetime.
pub struct TrackingSession<'a, L: RotatorLink, S: PointingSource = SatelliteTarget> {
    driver: &'a mut RotatorDriver<L>,
    source: S,
    config: TrackingConfig,
    state: RotatorCommandState,
    events: Option<UnboundedSender<StatusEvent>>,
}

impl<'a, L: RotatorLink, S: PointingSource> TrackingSession<'a, L, S> {
    pub fn new(driver: &'a mut RotatorDriver<L>, source: S, config: TrackingConfig) -> Self {
        Self {
            driver,
            source,
            config,
            state: RotatorCommandState::default(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: UnboundedSender<StatusEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> RotatorCommandState {
        self.state
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn driver(&self) -> &RotatorDriver<L> {
        self.driver
    }

    pub fn driver_mut(&mut self) -> &mut RotatorDriver<L> {
        self.driver
    }

    fn emit(&self, event: StatusEvent) {
        if let Some(events) = &self.events {
            // A closed receiver only means nobody is watching
            let _ = events.send(event);
        }
    }

    /// Runs one control step for the instant `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let report = |target, outcome| TickReport {
            time: now,
            target,
            outcome,
        };

        let target = match self.source.pointing_at(now) {
            Ok(target) => target,
            Err(e) => {
                log::warn!("{}: propagation failed at {}: {}", self.source.label(), now, e);
                let event = match e {
                    PassPlannerError::KeplerNonConvergence { .. } => {
                        StatusEvent::KeplerNonConvergence(e.to_string())
                    }
                    _ => StatusEvent::PropagationFailed(e.to_string()),
                };
                self.emit(event);
                return report(None, TickOutcome::PropagationFailed(e));
            }
        };
        self.emit(StatusEvent::Pointing(target));

        if !target.is_above_horizon() {
            log::debug!(
                "{} below horizon ({:.1}°), holding",
                self.source.label(),
                target.elevation_deg
            );
            return report(Some(target), TickOutcome::BelowHorizon);
        }

        let (az, el) = self.command_for(now, &target);
        if let Some((last_az, last_el)) = self.state.last_commanded {
            if (az - last_az).abs() < self.config.az_deadband_deg
                && (el - last_el).abs() < self.config.el_deadband_deg
            {
                return report(Some(target), TickOutcome::SkippedDeadband);
            }
        }
        if let Some(last) = self.state.last_command_time {
            if now - last < self.config.min_interval {
                return report(Some(target), TickOutcome::SkippedRateLimit);
            }
        }

        let outcome = self.command(now, az, el);
        report(Some(target), outcome)
    }

    /// Azimuth/elevation to command for a target, after unwrap and zenith
    /// freeze, stepped toward it no faster than the configured slew rates.
    fn command_for(&self, now: DateTime<Utc>, target: &PointingTarget) -> (f64, f64) {
        let last_az = self.state.last_commanded.map(|(az, _)| az);
        let el = target.elevation_deg;

        let az = match last_az {
            Some(last) if el >= self.config.zenith_freeze_deg => last,
            Some(last) if self.config.unwrap_azimuth => unwrap_azimuth(last, target.azimuth_deg),
            _ => target.azimuth_deg,
        };

        let (Some((last_az, last_el)), Some(last_time)) =
            (self.state.last_commanded, self.state.last_command_time)
        else {
            return (az, el);
        };
        let dt = ((now - last_time).num_milliseconds() as f64 / 1000.0).max(1e-3);
        (
            slew_toward(last_az, az, self.config.az_slew_deg_per_s, dt),
            slew_toward(last_el, el, self.config.el_slew_deg_per_s, dt),
        )
    }

    fn command(&mut self, now: DateTime<Utc>, az: f64, el: f64) -> TickOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.driver.move_to(az, el) {
                Ok(echo) => {
                    self.state = RotatorCommandState {
                        last_commanded: Some((az, el)),
                        last_command_time: Some(now),
                        last_confirmed: Some(echo),
                    };
                    log::info!("{}: moved to {az:.1}/{el:.1}, echo {echo}", self.source.label());
                    self.emit(StatusEvent::Commanded {
                        command: Command::MoveTo {
                            azimuth_deg: az,
                            elevation_deg: el,
                        }
                        .encode(),
                        echo,
                    });
                    return TickOutcome::Commanded {
                        azimuth_deg: az,
                        elevation_deg: el,
                        echo,
                        attempts,
                    };
                }
                Err(RotatorError::ProtocolTimeout(msg)) => {
                    log::warn!("move attempt {attempts} timed out: {msg}");
                    self.emit(StatusEvent::ProtocolTimeout(msg.clone()));
                    if attempts > self.config.retries {
                        let err = RotatorError::RotatorUnresponsive(format!(
                            "no echo after {attempts} attempts: {msg}"
                        ));
                        log::error!("{err}");
                        self.emit(StatusEvent::RotatorUnresponsive(err.to_string()));
                        return TickOutcome::Unresponsive(err);
                    }
                }
                Err(RotatorError::OperationAborted(msg)) => {
                    log::info!("tracking move aborted: {msg}");
                    return TickOutcome::Aborted;
                }
                Err(e) => {
                    log::warn!("tracking move failed: {e}");
                    return TickOutcome::LinkFailed(e);
                }
            }
        }
    }

    /// Stops the rotator, e.g. when the session ends.
    pub fn stop(&mut self) -> RotatorResult<Echo> {
        self.driver.stop()
    }
}

/// Moves from `current` toward `target` by at most `rate_deg_s * dt_s`.
pub fn slew_toward(current: f64, target: f64, rate_deg_s: f64, dt_s: f64) -> f64 {
    let max_step = rate_deg_s * dt_s;
    current + (target - current).clamp(-max_step, max_step)
}

/// Picks the representation of `azimuth_deg` (0..360) within the rotator's
/// 0..450 travel that is closest to `previous`.
pub fn unwrap_azimuth(previous: f64, azimuth_deg: f64) -> f64 {
    [azimuth_deg, azimuth_deg + 360.0]
        .into_iter()
        .filter(|candidate| *candidate <= MAX_AZIMUTH_DEG as f64)
        .min_by(|a, b| (a - previous).abs().total_cmp(&(b - previous).abs()))
        .unwrap_or(azimuth_deg)
}
