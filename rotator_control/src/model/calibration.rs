//! Guided calibration: point at true north, then due south, optionally sweep
//! a full turn, then stage a park azimuth.

use crate::model::{RotatorError, RotatorResult};
use crate::rotator_handler::{Command, Echo, RotatorDriver, RotatorLink, SpeedTier};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Park azimuths are offered in steps of this many degrees.
pub const PARK_STEP_DEG: i64 = 15;
const FULL_TURN_DEG: f64 = 360.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardState {
    Splash,
    TrueNorth,
    DueSouth,
    StagePark,
    Complete,
    ExitOk,
    ExitCancel,
}

impl WizardState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WizardState::ExitOk | WizardState::ExitCancel)
    }

    /// Next state for `event`, or `None` if the event is not accepted here.
    pub fn transition(self, event: WizardEvent) -> Option<WizardState> {
        use WizardEvent as E;
        use WizardState as S;
        let next = match (self, event) {
            (S::Splash, E::Start) => S::TrueNorth,
            (S::Splash, E::Cancel) => S::ExitCancel,
            (S::TrueNorth, E::Move) => S::TrueNorth,
            (S::TrueNorth, E::Next) => S::DueSouth,
            (S::DueSouth, E::Move) => S::DueSouth,
            (S::DueSouth, E::Sweep(_) | E::PauseSweep | E::ResumeSweep) => S::DueSouth,
            (S::DueSouth, E::Next) => S::StagePark,
            (S::StagePark, E::Move) => S::StagePark,
            (S::StagePark, E::Back) => S::DueSouth,
            (S::StagePark, E::Finish) => S::Complete,
            (S::TrueNorth | S::DueSouth | S::StagePark, E::StopRestart) => S::Splash,
            (S::Complete, E::Continue) => S::ExitOk,
            (S::Complete, E::RestartWizard) => S::Splash,
            (S::Complete, E::Cancel) => S::ExitCancel,
            _ => return None,
        };
        Some(next)
    }
}

impl fmt::Display for WizardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WizardState::Splash => "Splash",
            WizardState::TrueNorth => "TrueNorth",
            WizardState::DueSouth => "DueSouth",
            WizardState::StagePark => "StagePark",
            WizardState::Complete => "Complete",
            WizardState::ExitOk => "ExitOk",
            WizardState::ExitCancel => "ExitCancel",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardEvent {
    Start,
    Cancel,
    Move,
    Next,
    StopRestart,
    Back,
    Finish,
    Continue,
    RestartWizard,
    /// Full clockwise turn at the given speed
    Sweep(SpeedTier),
    /// Halts the azimuth of a running sweep and keeps its progress
    PauseSweep,
    ResumeSweep,
}

impl fmt::Display for WizardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WizardEvent::Sweep(tier) => write!(f, "Sweep(X{})", tier.index()),
            other => write!(f, "{other:?}"),
        }
    }
}

impl FromStr for WizardEvent {
    type Err = String;

    /// Parses the words typed at the calibration prompt.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let word = words.next().unwrap_or_default().to_ascii_lowercase();
        let event = match word.as_str() {
            "start" => WizardEvent::Start,
            "cancel" => WizardEvent::Cancel,
            "move" => WizardEvent::Move,
            "next" => WizardEvent::Next,
            "stop" | "stoprestart" => WizardEvent::StopRestart,
            "back" => WizardEvent::Back,
            "finish" => WizardEvent::Finish,
            "continue" => WizardEvent::Continue,
            "restart" | "restartwizard" => WizardEvent::RestartWizard,
            "pause" => WizardEvent::PauseSweep,
            "resume" => WizardEvent::ResumeSweep,
            "sweep" => {
                let tier = match words.next() {
                    Some(tier) => tier.parse().map_err(|e: RotatorError| e.to_string())?,
                    None => SpeedTier::default(),
                };
                WizardEvent::Sweep(tier)
            }
            other => return Err(format!("unknown calibration event '{other}'")),
        };
        Ok(event)
    }
}

/// Progress of a full clockwise turn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepProgress {
    pub tier: SpeedTier,
    /// Clockwise travel covered so far (degrees)
    pub travelled_deg: f64,
    pub complete: bool,
    pub paused: bool,
    previous_az: f64,
    last_poll: DateTime<Utc>,
}

impl SweepProgress {
    fn new(tier: SpeedTier, start_az: f64, now: DateTime<Utc>) -> Self {
        Self {
            tier,
            travelled_deg: 0.0,
            complete: false,
            paused: false,
            previous_az: start_az.rem_euclid(FULL_TURN_DEG),
            last_poll: now,
        }
    }

    /// Whether the rotator is turning under `R`.
    pub fn is_running(&self) -> bool {
        !self.complete && !self.paused
    }

    fn advance_simulated(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.last_poll).num_milliseconds().max(0) as f64 / 1000.0;
        let step = self.tier.deg_per_s() * elapsed;
        self.travelled_deg += step;
        self.previous_az = (self.previous_az + step).rem_euclid(FULL_TURN_DEG);
        self.last_poll = now;
    }

    /// Adds the clockwise distance from the previous azimuth to `azimuth_deg`.
    fn record(&mut self, azimuth_deg: f64) {
        let current = azimuth_deg.rem_euclid(FULL_TURN_DEG);
        self.travelled_deg += (current - self.previous_az).rem_euclid(FULL_TURN_DEG);
        self.previous_az = current;
    }
}

/// The calibration wizard bound to a rotator.
///
/// In simulate mode nothing is written to the rotator; commands are only
/// recorded so the operator can see what would have been sent.
pub struct CalibrationSession<'a, L: RotatorLink> {
    driver: &'a mut RotatorDriver<L>,
    state: WizardState,
    park_azimuth: i64,
    simulate: bool,
    last_command: Option<String>,
    last_echo: Option<Echo>,
    sweep: Option<SweepProgress>,
}

impl<'a, L: RotatorLink> CalibrationSession<'a, L> {
    pub fn new(driver: &'a mut RotatorDriver<L>, simulate: bool) -> Self {
        Self {
            driver,
            state: WizardState::Splash,
            park_azimuth: 0,
            simulate,
            last_command: None,
            last_echo: None,
            sweep: None,
        }
    }

    pub fn state(&self) -> WizardState {
        self.state
    }

    pub fn park_azimuth(&self) -> i64 {
        self.park_azimuth
    }

    pub fn is_simulated(&self) -> bool {
        self.simulate
    }

    pub fn last_echo(&self) -> Option<Echo> {
        self.last_echo
    }

    pub fn last_command(&self) -> Option<&str> {
        self.last_command.as_deref()
    }

    pub fn sweep(&self) -> Option<&SweepProgress> {
        self.sweep.as_ref()
    }

    /// One-line status for display: last command and confirmed position.
    pub fn status_line(&self) -> String {
        let command = self.last_command.as_deref().unwrap_or("-");
        let echo = match self.last_echo {
            Some(echo) => echo.to_string(),
            None => "no echo".to_string(),
        };
        format!("[{}] last: {command} | {echo}", self.state)
    }

    /// Stages the park azimuth sent by `Move` in `StagePark`.
    ///
    /// # Errors
    /// `InvalidParkAzimuth` unless the value is a multiple of 15 in 0..=345.
    pub fn set_park_azimuth(&mut self, azimuth_deg: i64) -> RotatorResult<()> {
        if !(0..FULL_TURN_DEG as i64).contains(&azimuth_deg) || azimuth_deg % PARK_STEP_DEG != 0 {
            return Err(RotatorError::InvalidParkAzimuth(azimuth_deg));
        }
        self.park_azimuth = azimuth_deg;
        Ok(())
    }

    pub fn handle(&mut self, event: WizardEvent) -> RotatorResult<WizardState> {
        self.handle_at(event, Utc::now())
    }

    /// Applies `event` at `now`.
    ///
    /// # Errors
    /// `InvalidTransition` if the event is not accepted in the current state.
    /// Link errors from the command an event issues are returned as they are
    /// and leave the state unchanged.
    pub fn handle_at(&mut self, event: WizardEvent, now: DateTime<Utc>) -> RotatorResult<WizardState> {
        let next = self
            .state
            .transition(event)
            .ok_or_else(|| RotatorError::InvalidTransition {
                state: self.state.to_string(),
                event: event.to_string(),
            })?;

        match (self.state, event) {
            (_, WizardEvent::Move) => {
                self.stop_sweep()?;
                let azimuth = match self.state {
                    WizardState::TrueNorth => 0.0,
                    WizardState::DueSouth => 180.0,
                    _ => self.park_azimuth as f64,
                };
                self.command(Command::MoveTo {
                    azimuth_deg: azimuth,
                    elevation_deg: 0.0,
                })?;
            }
            (_, WizardEvent::StopRestart) => {
                self.command(Command::Stop)?;
                self.sweep = None;
            }
            (WizardState::DueSouth, WizardEvent::Next) => self.stop_sweep()?,
            (_, WizardEvent::Sweep(tier)) => self.start_sweep(tier, now)?,
            (_, WizardEvent::PauseSweep) => self.pause_sweep(now)?,
            (_, WizardEvent::ResumeSweep) => self.resume_sweep(now)?,
            (_, WizardEvent::Finish) => {
                log::info!("calibration finished, park azimuth {}°", self.park_azimuth);
            }
            _ => {}
        }

        if next != self.state {
            log::debug!("calibration {} --{event}--> {next}", self.state);
        }
        self.state = next;
        Ok(next)
    }

    /// Sends one command (or records it in simulate mode) and keeps its echo.
    fn command(&mut self, command: Command) -> RotatorResult<()> {
        if self.simulate {
            log::info!("(sim) {command}");
            self.last_command = Some(format!("(sim) {command}"));
            if let Command::MoveTo {
                azimuth_deg,
                elevation_deg,
            } = command
            {
                self.last_echo = Some(Echo {
                    azimuth_deg: azimuth_deg.round() as u32,
                    elevation_deg: elevation_deg.round() as u32,
                });
            }
            return Ok(());
        }
        let echo = self.driver.execute(command)?;
        self.last_command = Some(command.to_string());
        self.last_echo = Some(echo);
        Ok(())
    }

    /// Starts a full clockwise turn at elevation 0: `W<az> 000` at the
    /// current azimuth, then `X<n>` and `R`.
    fn start_sweep(&mut self, tier: SpeedTier, now: DateTime<Utc>) -> RotatorResult<()> {
        if self.sweep.is_some_and(|s| !s.complete) {
            log::debug!("sweep already in progress");
            return Ok(());
        }
        let start_az = if self.simulate {
            0.0
        } else {
            match self.driver.query_position() {
                Ok(echo) => {
                    self.last_echo = Some(echo);
                    echo.azimuth_deg as f64
                }
                Err(RotatorError::ProtocolTimeout(msg)) => {
                    log::warn!("no position before sweep, assuming last known azimuth: {msg}");
                    self.last_echo.map_or(0.0, |echo| echo.azimuth_deg as f64)
                }
                Err(e) => return Err(e),
            }
        };
        let start_az = start_az.rem_euclid(FULL_TURN_DEG).trunc();

        self.command(Command::MoveTo {
            azimuth_deg: start_az,
            elevation_deg: 0.0,
        })?;
        self.command(Command::Speed(tier))?;
        self.command(Command::RotateClockwise)?;
        log::info!("sweeping 360° clockwise at X{} ({} °/s)", tier.index(), tier.deg_per_s());
        self.sweep = Some(SweepProgress::new(tier, start_az, now));
        Ok(())
    }

    /// Stops a running sweep in place with `A`. The sweep is only forgotten
    /// once the stop went through.
    fn stop_sweep(&mut self) -> RotatorResult<()> {
        if let Some(sweep) = self.sweep {
            if sweep.is_running() {
                self.command(Command::StopAzimuth)?;
                log::info!("sweep stopped after {:.0}°", sweep.travelled_deg);
            }
        }
        self.sweep = None;
        Ok(())
    }

    fn pause_sweep(&mut self, now: DateTime<Utc>) -> RotatorResult<()> {
        let Some(mut sweep) = self.sweep.filter(SweepProgress::is_running) else {
            log::debug!("no running sweep to pause");
            return Ok(());
        };
        self.command(Command::StopAzimuth)?;
        if self.simulate {
            sweep.advance_simulated(now);
        }
        sweep.paused = true;
        log::info!("sweep paused after {:.0}°", sweep.travelled_deg);
        self.sweep = Some(sweep);
        Ok(())
    }

    /// Re-sends the sweep speed and `R` after a pause.
    fn resume_sweep(&mut self, now: DateTime<Utc>) -> RotatorResult<()> {
        let Some(mut sweep) = self.sweep.filter(|s| s.paused && !s.complete) else {
            log::debug!("no paused sweep to resume");
            return Ok(());
        };
        self.command(Command::Speed(sweep.tier))?;
        self.command(Command::RotateClockwise)?;
        sweep.paused = false;
        sweep.last_poll = now;
        log::info!("sweep resumed at {:.0}°", sweep.travelled_deg);
        self.sweep = Some(sweep);
        Ok(())
    }

    /// Brings the rotator to rest after the wizard was interrupted or failed,
    /// including a sweep left turning under `R`.
    ///
    /// A raised abort handle is cleared first so the stop can be sent.
    pub fn halt(&mut self) -> RotatorResult<()> {
        self.driver.abort_handle().reset();
        self.command(Command::Stop)?;
        if let Some(sweep) = self.sweep.take() {
            log::info!("sweep halted after {:.0}°", sweep.travelled_deg);
        }
        Ok(())
    }

    /// Updates a running sweep and stops the rotator once a full turn is
    /// covered. Returns the progress, or `None` when no sweep was started.
    /// A paused sweep is returned unchanged.
    ///
    /// A position query that times out is logged and the sweep continues on
    /// the next poll.
    pub fn poll_sweep(&mut self, now: DateTime<Utc>) -> RotatorResult<Option<SweepProgress>> {
        let Some(mut sweep) = self.sweep else {
            return Ok(None);
        };
        if !sweep.is_running() {
            return Ok(Some(sweep));
        }

        if self.simulate {
            sweep.advance_simulated(now);
        } else {
            match self.driver.query_position() {
                Ok(echo) => {
                    self.last_echo = Some(echo);
                    sweep.record(echo.azimuth_deg as f64);
                }
                Err(RotatorError::ProtocolTimeout(msg)) => {
                    log::warn!("sweep poll got no echo: {msg}");
                }
                Err(e) => return Err(e),
            }
        }
        sweep.last_poll = now;

        if sweep.travelled_deg >= FULL_TURN_DEG {
            self.command(Command::StopAzimuth)?;
            sweep.complete = true;
            log::info!("sweep complete ({:.0}° covered)", sweep.travelled_deg);
        }
        self.sweep = Some(sweep);
        Ok(Some(sweep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::rotator_handler::{SimulatedRotator, DEFAULT_REPLY_TIMEOUT};
    use chrono::{Duration, TimeZone};

    fn driver() -> RotatorDriver<SimulatedRotator> {
        RotatorDriver::new(
            SimulatedRotator::manual(&SimulationConfig::default()),
            DEFAULT_REPLY_TIMEOUT,
        )
    }

    fn run(session: &mut CalibrationSession<'_, SimulatedRotator>, events: &[WizardEvent]) -> WizardState {
        for event in events {
            session.handle(*event).unwrap();
        }
        session.state()
    }

    fn commands(driver: &RotatorDriver<SimulatedRotator>) -> Vec<String> {
        driver
            .link()
            .sent()
            .iter()
            .filter(|l| l.as_str() != "C2")
            .cloned()
            .collect()
    }

    #[test]
    fn test_happy_path_exits_ok() {
        use WizardEvent::*;
        let mut driver = driver();
        let mut session = CalibrationSession::new(&mut driver, false);
        assert_eq!(session.state(), WizardState::Splash);
        assert_eq!(run(&mut session, &[Start, Next, Next, Finish, Continue]), WizardState::ExitOk);
        assert!(session.state().is_terminal());
    }

    #[test]
    fn test_stop_restart_halts_and_returns_to_splash() {
        use WizardEvent::*;
        let mut driver = driver();
        let mut session = CalibrationSession::new(&mut driver, false);
        assert_eq!(run(&mut session, &[Start, StopRestart]), WizardState::Splash);
        drop(session);
        assert_eq!(commands(&driver), ["S"]);
    }

    #[test]
    fn test_cancel_where_allowed() {
        use WizardEvent::*;
        let mut driver = driver();
        let mut session = CalibrationSession::new(&mut driver, false);
        assert_eq!(run(&mut session, &[Cancel]), WizardState::ExitCancel);
        drop(session);

        let mut session = CalibrationSession::new(&mut driver, false);
        assert_eq!(
            run(&mut session, &[Start, Next, Next, Finish, Cancel]),
            WizardState::ExitCancel
        );
    }

    #[test]
    fn test_rejected_event_keeps_state() {
        use WizardEvent::*;
        let mut driver = driver();
        let mut session = CalibrationSession::new(&mut driver, false);
        run(&mut session, &[Start]);

        let err = session.handle(Finish).unwrap_err();
        assert_eq!(
            err,
            RotatorError::InvalidTransition {
                state: "TrueNorth".to_string(),
                event: "Finish".to_string(),
            }
        );
        assert_eq!(session.state(), WizardState::TrueNorth);
        assert!(session.handle(Cancel).is_err());
        assert!(session.handle(Sweep(SpeedTier::X2)).is_err());
    }

    #[test]
    fn test_move_sends_reference_positions() {
        use WizardEvent::*;
        let mut driver = driver();
        let mut session = CalibrationSession::new(&mut driver, false);
        session.set_park_azimuth(135).unwrap();
        run(&mut session, &[Start, Move, Next, Move, Next, Move, Back, Next, Finish]);
        assert_eq!(session.state(), WizardState::Complete);
        assert_eq!(session.last_command(), Some("W135 000"));
        drop(session);
        assert_eq!(commands(&driver), ["W000 000", "W180 000", "W135 000"]);
    }

    #[test]
    fn test_park_azimuth_validation() {
        let mut driver = driver();
        let mut session = CalibrationSession::new(&mut driver, false);
        for ok in [0, 15, 180, 345] {
            assert!(session.set_park_azimuth(ok).is_ok());
        }
        for bad in [-15, 7, 360, 400] {
            assert_eq!(
                session.set_park_azimuth(bad),
                Err(RotatorError::InvalidParkAzimuth(bad))
            );
        }
        assert_eq!(session.park_azimuth(), 345);
    }

    #[test]
    fn test_simulate_mode_sends_nothing() {
        use WizardEvent::*;
        let mut driver = driver();
        let mut session = CalibrationSession::new(&mut driver, true);
        run(&mut session, &[Start, Move, StopRestart]);
        assert_eq!(session.last_command(), Some("(sim) S"));
        assert_eq!(session.last_echo(), Some(Echo { azimuth_deg: 0, elevation_deg: 0 }));
        drop(session);
        assert!(driver.link().sent().is_empty());
    }

    #[test]
    fn test_unresponsive_move_surfaces_timeout() {
        use WizardEvent::*;
        let mut driver = driver();
        driver.link_mut().set_unresponsive(true);
        let mut session = CalibrationSession::new(&mut driver, false);
        run(&mut session, &[Start]);
        assert!(matches!(session.handle(Move), Err(RotatorError::ProtocolTimeout(_))));
        assert_eq!(session.state(), WizardState::TrueNorth);
    }

    #[test]
    fn test_simulated_sweep_completes_after_full_turn() {
        use WizardEvent::*;
        let mut driver = driver();
        let mut session = CalibrationSession::new(&mut driver, true);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        run(&mut session, &[Start, Next]);
        session.handle_at(Sweep(SpeedTier::X4), t0).unwrap();

        // 24 °/s needs 15 s for a full turn
        let progress = session.poll_sweep(t0 + Duration::seconds(10)).unwrap().unwrap();
        assert!((progress.travelled_deg - 240.0).abs() < 1e-9);
        assert!(!progress.complete);
        let progress = session.poll_sweep(t0 + Duration::seconds(16)).unwrap().unwrap();
        assert!(progress.complete);
        assert_eq!(session.last_command(), Some("(sim) A"));
        drop(session);
        assert!(driver.link().sent().is_empty());
    }

    #[test]
    fn test_rotator_sweep_integrates_echoes() {
        use WizardEvent::*;
        let mut driver = driver();
        let mut session = CalibrationSession::new(&mut driver, false);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        run(&mut session, &[Start, Next]);
        session.handle_at(Sweep(SpeedTier::X3), t0).unwrap();

        // Poll every 5 s of simulated time at 12 °/s; 30 s covers a turn
        let mut polls = 0;
        loop {
            session.driver.link_mut().advance(std::time::Duration::from_secs(5));
            polls += 1;
            let progress = session
                .poll_sweep(t0 + Duration::seconds(5 * polls))
                .unwrap()
                .unwrap();
            if progress.complete {
                break;
            }
            assert!(polls < 20, "sweep never completed");
        }
        assert_eq!(polls, 6);
        drop(session);
        let sent = commands(&driver);
        assert_eq!(sent[..3], ["W000 000", "X3", "R"]);
        assert_eq!(sent.last().map(String::as_str), Some("A"));
    }

    #[test]
    fn test_next_stops_running_sweep() {
        use WizardEvent::*;
        let mut driver = driver();
        let mut session = CalibrationSession::new(&mut driver, false);
        run(&mut session, &[Start, Next, Sweep(SpeedTier::X1), Next]);
        assert_eq!(session.state(), WizardState::StagePark);
        assert!(session.sweep().is_none());
        drop(session);
        assert_eq!(commands(&driver), ["W000 000", "X1", "R", "A"]);
    }

    #[test]
    fn test_sweep_lowers_elevation_before_turning() {
        use WizardEvent::*;
        let mut driver = driver();
        driver.send(Command::MoveTo { azimuth_deg: 40.0, elevation_deg: 30.0 }).unwrap();
        let settle = driver.link().settle_time_remaining();
        driver.link_mut().advance(settle);

        let mut session = CalibrationSession::new(&mut driver, false);
        run(&mut session, &[Start, Next, Sweep(SpeedTier::X2)]);
        assert_eq!(session.sweep().map(|s| s.is_running()), Some(true));
        session.driver.link_mut().advance(std::time::Duration::from_secs(60));
        let (_, el) = session.driver.link().position();
        assert_eq!(el, 0.0);
        drop(session);
        assert_eq!(commands(&driver)[1..4], ["W040 000", "X2", "R"]);
    }

    #[test]
    fn test_pause_holds_progress_and_resume_continues() {
        use WizardEvent::*;
        let mut driver = driver();
        let mut session = CalibrationSession::new(&mut driver, false);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        run(&mut session, &[Start, Next]);
        session.handle_at(Sweep(SpeedTier::X2), t0).unwrap();

        // 6 °/s for 10 s
        session.driver.link_mut().advance(std::time::Duration::from_secs(10));
        let progress = session.poll_sweep(t0 + Duration::seconds(10)).unwrap().unwrap();
        assert!((progress.travelled_deg - 60.0).abs() < 1.0);

        session.handle_at(PauseSweep, t0 + Duration::seconds(10)).unwrap();
        assert_eq!(session.state(), WizardState::DueSouth);
        assert_eq!(session.last_command(), Some("A"));
        let paused = *session.sweep().unwrap();
        assert!(paused.paused && !paused.is_running());

        // Nothing moves or accumulates while paused
        session.driver.link_mut().advance(std::time::Duration::from_secs(30));
        let progress = session.poll_sweep(t0 + Duration::seconds(40)).unwrap().unwrap();
        assert_eq!(progress.travelled_deg, paused.travelled_deg);
        assert!((session.driver.link().position().0 - 60.0).abs() < 1.0);

        session.handle_at(ResumeSweep, t0 + Duration::seconds(40)).unwrap();
        assert_eq!(session.last_command(), Some("R"));
        session.driver.link_mut().advance(std::time::Duration::from_secs(10));
        let progress = session.poll_sweep(t0 + Duration::seconds(50)).unwrap().unwrap();
        assert!((progress.travelled_deg - 120.0).abs() < 1.0);
        assert!(progress.is_running());

        drop(session);
        let sent = commands(&driver);
        assert_eq!(sent[..3], ["W000 000", "X2", "R"]);
        assert_eq!(sent[3..], ["A", "X2", "R"]);
    }

    #[test]
    fn test_simulated_pause_excludes_paused_time() {
        use WizardEvent::*;
        let mut driver = driver();
        let mut session = CalibrationSession::new(&mut driver, true);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        run(&mut session, &[Start, Next]);
        session.handle_at(Sweep(SpeedTier::X1), t0).unwrap();
        session.handle_at(PauseSweep, t0 + Duration::seconds(5)).unwrap();
        session.handle_at(ResumeSweep, t0 + Duration::seconds(100)).unwrap();

        // 2 °/s for 5 s before the pause and 5 s after it
        let progress = session.poll_sweep(t0 + Duration::seconds(105)).unwrap().unwrap();
        assert!((progress.travelled_deg - 20.0).abs() < 1e-9);
        drop(session);
        assert!(driver.link().sent().is_empty());
    }

    #[test]
    fn test_pause_and_resume_without_sweep_are_ignored() {
        use WizardEvent::*;
        let mut driver = driver();
        let mut session = CalibrationSession::new(&mut driver, false);
        run(&mut session, &[Start, Next, PauseSweep, ResumeSweep]);
        assert_eq!(session.state(), WizardState::DueSouth);
        assert!(session.sweep().is_none());
        assert!(session.handle(Back).is_err());
        drop(session);
        assert!(commands(&driver).is_empty());
    }

    #[test]
    fn test_failed_stop_keeps_running_sweep() {
        use WizardEvent::*;
        let mut driver = driver();
        let mut session = CalibrationSession::new(&mut driver, false);
        run(&mut session, &[Start, Next, Sweep(SpeedTier::X1)]);

        session.driver.link_mut().set_unresponsive(true);
        assert!(matches!(session.handle(Move), Err(RotatorError::ProtocolTimeout(_))));
        assert!(matches!(session.handle(StopRestart), Err(RotatorError::ProtocolTimeout(_))));
        assert_eq!(session.state(), WizardState::DueSouth);
        assert_eq!(session.sweep().map(|s| s.is_running()), Some(true));

        session.driver.link_mut().set_unresponsive(false);
        session.handle(Move).unwrap();
        assert!(session.sweep().is_none());
        let azimuth = session.driver.link().position().0;
        session.driver.link_mut().advance(std::time::Duration::from_secs(1));
        // Slewing towards 180 now, not turning under R
        assert!(session.driver.link().position().0 > azimuth);
        drop(session);
        let sent = commands(&driver);
        assert!(sent.ends_with(&["A".to_string(), "W180 000".to_string()]));
    }

    #[test]
    fn test_halt_after_abort_stops_sweep() {
        use WizardEvent::*;
        let mut driver = driver();
        let abort = driver.abort_handle();
        let mut session = CalibrationSession::new(&mut driver, false);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        run(&mut session, &[Start, Next]);
        session.handle_at(Sweep(SpeedTier::X4), t0).unwrap();
        session.driver.link_mut().advance(std::time::Duration::from_secs(2));

        abort.abort();
        assert!(matches!(
            session.poll_sweep(t0 + Duration::seconds(2)),
            Err(RotatorError::OperationAborted(_))
        ));

        session.halt().unwrap();
        assert!(!abort.is_aborted());
        assert!(session.sweep().is_none());
        assert_eq!(session.last_command(), Some("S"));
        let stopped_at = session.driver.link().position().0;
        session.driver.link_mut().advance(std::time::Duration::from_secs(10));
        assert_eq!(session.driver.link().position().0, stopped_at);
    }

    #[test]
    fn test_event_parsing() {
        assert_eq!("Start".parse::<WizardEvent>(), Ok(WizardEvent::Start));
        assert_eq!("stop".parse::<WizardEvent>(), Ok(WizardEvent::StopRestart));
        assert_eq!(
            "sweep x3".parse::<WizardEvent>(),
            Ok(WizardEvent::Sweep(SpeedTier::X3))
        );
        assert_eq!(
            "sweep".parse::<WizardEvent>(),
            Ok(WizardEvent::Sweep(SpeedTier::X2))
        );
        assert_eq!("pause".parse::<WizardEvent>(), Ok(WizardEvent::PauseSweep));
        assert_eq!("Resume".parse::<WizardEvent>(), Ok(WizardEvent::ResumeSweep));
        assert!("jump".parse::<WizardEvent>().is_err());
        assert!("sweep x9".parse::<WizardEvent>().is_err());
    }
}
