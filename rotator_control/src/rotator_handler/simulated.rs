//! Simulated GS-232B controller.
//!
//! Accepts the same command lines as the hardware and moves a virtual
//! azimuth/elevation pair at configured slew rates. Time is either the wall
//! clock or a manual virtual clock advanced by the caller.

use super::protocol::{Command, Echo, SpeedTier, MAX_AZIMUTH_DEG, MAX_ELEVATION_DEG};
use super::{AbortHandle, RotatorLink};
use crate::config::SimulationConfig;
use crate::model::{RotatorError, RotatorResult};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Most recent command lines kept by [`SimulatedRotator::sent`].
pub const SENT_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
enum Clock {
    Manual(Duration),
    Realtime(Instant),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Motion {
    Idle,
    Slewing { target: f64, rate: f64 },
    Continuous { rate: f64 },
}

#[derive(Debug, Clone, Copy)]
struct Axis {
    origin: f64,
    since: Duration,
    motion: Motion,
}

impl Axis {
    fn at_rest(position: f64) -> Self {
        Self {
            origin: position,
            since: Duration::ZERO,
            motion: Motion::Idle,
        }
    }

    fn position(&self, now: Duration) -> f64 {
        let dt = now.saturating_sub(self.since).as_secs_f64();
        match self.motion {
            Motion::Idle => self.origin,
            Motion::Slewing { target, rate } => {
                let remaining = target - self.origin;
                let travelled = (rate * dt).min(remaining.abs());
                self.origin + travelled.copysign(remaining)
            }
            Motion::Continuous { rate } => (self.origin + rate * dt).rem_euclid(360.0),
        }
    }

    /// When a slew reaches its target; `None` while rotating continuously.
    fn arrival(&self) -> Option<Duration> {
        match self.motion {
            Motion::Idle => Some(self.since),
            Motion::Slewing { target, rate } => {
                Some(self.since + Duration::from_secs_f64((target - self.origin).abs() / rate))
            }
            Motion::Continuous { .. } => None,
        }
    }

    fn set_motion(&mut self, now: Duration, motion: Motion) {
        self.origin = self.position(now);
        self.since = now;
        self.motion = motion;
    }
}

#[derive(Debug)]
pub struct SimulatedRotator {
    clock: Clock,
    azimuth: Axis,
    elevation: Axis,
    az_rate: f64,
    el_rate: f64,
    settle: Duration,
    speed: SpeedTier,
    replies: VecDeque<String>,
    sent: Vec<String>,
    unresponsive: bool,
}

impl SimulatedRotator {
    fn with_clock(config: &SimulationConfig, clock: Clock) -> Self {
        Self {
            clock,
            azimuth: Axis::at_rest(0.0),
            elevation: Axis::at_rest(0.0),
            az_rate: config.az_rate_deg_s,
            el_rate: config.el_rate_deg_s,
            settle: Duration::from_millis(config.settle_ms),
            speed: SpeedTier::default(),
            replies: VecDeque::new(),
            sent: Vec::new(),
            unresponsive: false,
        }
    }

    /// A simulator that follows the wall clock.
    pub fn realtime(config: &SimulationConfig) -> Self {
        Self::with_clock(config, Clock::Realtime(Instant::now()))
    }

    /// A simulator whose time only moves through [`SimulatedRotator::advance`].
    pub fn manual(config: &SimulationConfig) -> Self {
        Self::with_clock(config, Clock::Manual(Duration::ZERO))
    }

    fn now(&self) -> Duration {
        match self.clock {
            Clock::Manual(elapsed) => elapsed,
            Clock::Realtime(start) => start.elapsed(),
        }
    }

    /// Advances the manual clock. Has no effect on a wall-clock simulator.
    pub fn advance(&mut self, by: Duration) {
        if let Clock::Manual(elapsed) = &mut self.clock {
            *elapsed += by;
        }
    }

    /// A silent controller accepts writes but never replies.
    pub fn set_unresponsive(&mut self, unresponsive: bool) {
        self.unresponsive = unresponsive;
    }

    /// Command lines written so far, without terminators, oldest first. Only
    /// the last [`SENT_LOG_CAPACITY`] are kept.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }

    /// Current virtual azimuth and elevation.
    pub fn position(&self) -> (f64, f64) {
        let now = self.now();
        (self.azimuth.position(now), self.elevation.position(now))
    }

    fn settled_at(&self) -> Option<Duration> {
        let az = self.azimuth.arrival()?;
        let el = self.elevation.arrival()?;
        Some(az.max(el) + self.settle)
    }

    /// Whether both axes have reached their targets and the settle delay has
    /// passed.
    pub fn is_settled(&self) -> bool {
        self.settled_at().is_some_and(|at| self.now() >= at)
    }

    /// Time until the current move has settled; zero when settled or when
    /// rotating continuously.
    pub fn settle_time_remaining(&self) -> Duration {
        self.settled_at()
            .map(|at| at.saturating_sub(self.now()))
            .unwrap_or(Duration::ZERO)
    }

    fn apply(&mut self, command: Command) {
        let now = self.now();
        match command {
            Command::MoveTo {
                azimuth_deg,
                elevation_deg,
            } => {
                let az = azimuth_deg.clamp(0.0, MAX_AZIMUTH_DEG as f64);
                let el = elevation_deg.clamp(0.0, MAX_ELEVATION_DEG as f64);
                self.azimuth.set_motion(
                    now,
                    Motion::Slewing {
                        target: az,
                        rate: self.az_rate,
                    },
                );
                self.elevation.set_motion(
                    now,
                    Motion::Slewing {
                        target: el,
                        rate: self.el_rate,
                    },
                );
            }
            Command::Speed(tier) => self.speed = tier,
            Command::RotateClockwise => self.azimuth.set_motion(
                now,
                Motion::Continuous {
                    rate: self.speed.deg_per_s(),
                },
            ),
            Command::Stop => {
                self.azimuth.set_motion(now, Motion::Idle);
                self.elevation.set_motion(now, Motion::Idle);
            }
            Command::StopAzimuth => self.azimuth.set_motion(now, Motion::Idle),
            Command::QueryPosition => {
                let (az, el) = self.position();
                let echo = Echo {
                    azimuth_deg: az.round() as u32,
                    elevation_deg: el.round() as u32,
                };
                self.replies.push_back(echo.to_reply());
            }
        }
    }
}

impl RotatorLink for SimulatedRotator {
    fn write_line(&mut self, line: &str) -> RotatorResult<()> {
        let line = line.trim();
        if self.sent.len() >= SENT_LOG_CAPACITY {
            self.sent.remove(0);
        }
        self.sent.push(line.to_string());
        if self.unresponsive {
            return Ok(());
        }
        match Command::parse(line) {
            Some(command) => self.apply(command),
            None => log::debug!("simulated rotator ignoring '{line}'"),
        }
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration, abort: &AbortHandle) -> RotatorResult<String> {
        let deadline = self.now() + timeout;
        loop {
            if abort.is_aborted() {
                self.discard_buffers()?;
                return Err(RotatorError::OperationAborted(
                    "wait for simulated reply aborted".to_string(),
                ));
            }
            if let Some(reply) = self.replies.pop_front() {
                return Ok(reply);
            }
            match self.clock {
                Clock::Manual(_) => {
                    // Nothing else can happen on a manual clock; the wait
                    // simply consumes the whole timeout.
                    self.advance(timeout);
                    break;
                }
                Clock::Realtime(_) => {
                    if self.now() >= deadline {
                        break;
                    }
                    std::thread::sleep(WAIT_SLICE);
                }
            }
        }
        Err(RotatorError::ProtocolTimeout(format!(
            "simulated rotator silent for {} ms",
            timeout.as_millis()
        )))
    }

    fn discard_buffers(&mut self) -> RotatorResult<()> {
        self.replies.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        "simulated rotator".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotator_handler::{RotatorDriver, DEFAULT_REPLY_TIMEOUT};

    fn config() -> SimulationConfig {
        SimulationConfig {
            az_rate_deg_s: 6.0,
            el_rate_deg_s: 3.0,
            settle_ms: 500,
        }
    }

    #[test]
    fn test_move_then_settle_reports_target() {
        let mut driver = RotatorDriver::new(SimulatedRotator::manual(&config()), DEFAULT_REPLY_TIMEOUT);
        driver.send(Command::MoveTo { azimuth_deg: 90.0, elevation_deg: 45.0 }).unwrap();

        // 90° at 6°/s and 45° at 3°/s both take 15 s, then 0.5 s to settle
        assert_eq!(driver.link().settle_time_remaining(), Duration::from_millis(15_500));
        driver.link_mut().advance(Duration::from_millis(15_500));

        let echo = driver.query_position().unwrap();
        assert_eq!(echo, Echo { azimuth_deg: 90, elevation_deg: 45 });
        assert!(driver.link().is_settled());
    }

    #[test]
    fn test_axes_slew_at_configured_rates() {
        let mut sim = SimulatedRotator::manual(&config());
        sim.write_line("W090 045").unwrap();
        sim.advance(Duration::from_secs(5));
        let (az, el) = sim.position();
        assert!((az - 30.0).abs() < 1e-9);
        assert!((el - 15.0).abs() < 1e-9);
        assert!(!sim.is_settled());

        // Retargeting mid-slew starts from where the axes are
        sim.write_line("W000 000").unwrap();
        sim.advance(Duration::from_secs(1));
        let (az, el) = sim.position();
        assert!((az - 24.0).abs() < 1e-9);
        assert!((el - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_continuous_rotation_wraps_and_stops() {
        let mut sim = SimulatedRotator::manual(&config());
        sim.write_line("W350 000").unwrap();
        sim.advance(Duration::from_secs(120));
        sim.write_line("X4").unwrap();
        sim.write_line("R").unwrap();
        assert_eq!(sim.settle_time_remaining(), Duration::ZERO);
        assert!(!sim.is_settled());

        sim.advance(Duration::from_secs(1));
        assert!((sim.position().0 - 14.0).abs() < 1e-9);

        sim.write_line("A").unwrap();
        sim.advance(Duration::from_secs(10));
        assert!((sim.position().0 - 14.0).abs() < 1e-9);
    }

    #[test]
    fn test_stop_freezes_both_axes() {
        let mut sim = SimulatedRotator::manual(&config());
        sim.write_line("W180 090").unwrap();
        sim.advance(Duration::from_secs(2));
        sim.write_line("S").unwrap();
        sim.advance(Duration::from_secs(60));
        let (az, el) = sim.position();
        assert!((az - 12.0).abs() < 1e-9);
        assert!((el - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_unresponsive_manual_clock_consumes_timeout() {
        let mut sim = SimulatedRotator::manual(&config());
        sim.set_unresponsive(true);
        sim.write_line("C2").unwrap();
        let result = sim.read_line(Duration::from_millis(1500), &AbortHandle::new());
        assert!(matches!(result, Err(RotatorError::ProtocolTimeout(_))));
        assert_eq!(sim.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_sent_log_keeps_only_recent_lines() {
        let mut sim = SimulatedRotator::manual(&config());
        for az in 0..SENT_LOG_CAPACITY + 10 {
            sim.write_line(&format!("W{:03} 000", az % 360)).unwrap();
        }
        assert_eq!(sim.sent().len(), SENT_LOG_CAPACITY);
        assert_eq!(sim.sent()[0], format!("W{:03} 000", 10));
        assert_eq!(
            sim.sent().last().map(String::as_str),
            Some(format!("W{:03} 000", (SENT_LOG_CAPACITY + 9) % 360).as_str())
        );
    }

    #[test]
    fn test_realtime_wait_is_interrupted_by_abort() {
        let mut sim = SimulatedRotator::realtime(&config());
        sim.set_unresponsive(true);
        let abort = AbortHandle::new();
        let remote = abort.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.abort();
        });

        let started = Instant::now();
        let result = sim.read_line(Duration::from_secs(10), &abort);
        waker.join().unwrap();
        assert!(matches!(result, Err(RotatorError::OperationAborted(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
