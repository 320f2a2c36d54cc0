use crate::model::{RotatorError, RotatorResult};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

pub mod protocol;
pub mod serial_link;
pub mod simulated;

pub use protocol::{Command, Echo, SpeedTier};
pub use serial_link::SerialLink;
pub use simulated::SimulatedRotator;

/// Default bound on the wait for a reply line.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(1500);

/// Shared flag that interrupts an in-flight serial wait.
///
/// Clones share the flag, so a handle taken before the driver is lent to a
/// session can still abort it from another task.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// A line-oriented connection to a rotator controller.
pub trait RotatorLink: Send {
    /// Writes one command line; the terminator is added by the link.
    fn write_line(&mut self, line: &str) -> RotatorResult<()>;

    /// Waits up to `timeout` for one non-empty reply line.
    ///
    /// Returns `ProtocolTimeout` when nothing arrives in time and
    /// `OperationAborted` (after discarding buffered input) when `abort` is
    /// raised during the wait.
    fn read_line(&mut self, timeout: Duration, abort: &AbortHandle) -> RotatorResult<String>;

    /// Drops anything buffered in either direction.
    fn discard_buffers(&mut self) -> RotatorResult<()>;

    fn describe(&self) -> String;
}

/// Sends GS-232B commands and confirms each one with a `C2` position echo.
pub struct RotatorDriver<L: RotatorLink> {
    link: L,
    timeout: Duration,
    abort: AbortHandle,
    last_echo: Option<String>,
}

impl<L: RotatorLink> RotatorDriver<L> {
    pub fn new(link: L, timeout: Duration) -> Self {
        Self {
            link,
            timeout,
            abort: AbortHandle::new(),
            last_echo: None,
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Raw text of the last position reply.
    pub fn last_echo(&self) -> Option<&str> {
        self.last_echo.as_deref()
    }

    fn check_abort(&mut self, command: &Command) -> RotatorResult<()> {
        if self.abort.is_aborted() {
            self.link.discard_buffers()?;
            return Err(RotatorError::OperationAborted(format!(
                "{command} not sent to {}",
                self.link.describe()
            )));
        }
        Ok(())
    }

    /// Sends a command without waiting for a reply.
    pub fn send(&mut self, command: Command) -> RotatorResult<()> {
        self.check_abort(&command)?;
        log::debug!("-> {command}");
        self.link.write_line(&command.encode())
    }

    /// Queries the position with `C2`.
    ///
    /// Input still buffered from an earlier query that timed out is dropped
    /// first, so the reply read is always the answer to this `C2`.
    ///
    /// # Errors
    /// `ProtocolTimeout` if no reply arrives within the driver timeout,
    /// `ProtocolError` if the reply is not a position, `OperationAborted` if the
    /// abort handle is raised.
    pub fn query_position(&mut self) -> RotatorResult<Echo> {
        self.check_abort(&Command::QueryPosition)?;
        self.link.discard_buffers()?;
        self.send(Command::QueryPosition)?;
        let reply = match self.link.read_line(self.timeout, &self.abort) {
            Ok(reply) => reply,
            Err(RotatorError::ProtocolTimeout(_)) => {
                return Err(RotatorError::ProtocolTimeout(format!(
                    "no reply to C2 from {} within {} ms",
                    self.link.describe(),
                    self.timeout.as_millis()
                )))
            }
            Err(e) => return Err(e),
        };
        log::debug!("<- {reply}");
        let echo = Echo::parse(&reply)?;
        self.last_echo = Some(reply);
        Ok(echo)
    }

    /// Sends a command and confirms it with a position echo.
    pub fn execute(&mut self, command: Command) -> RotatorResult<Echo> {
        if command != Command::QueryPosition {
            self.send(command)?;
        }
        self.query_position()
    }

    pub fn move_to(&mut self, azimuth_deg: f64, elevation_deg: f64) -> RotatorResult<Echo> {
        self.execute(Command::MoveTo {
            azimuth_deg,
            elevation_deg,
        })
    }

    pub fn set_speed(&mut self, tier: SpeedTier) -> RotatorResult<Echo> {
        self.execute(Command::Speed(tier))
    }

    pub fn rotate_clockwise(&mut self) -> RotatorResult<Echo> {
        self.execute(Command::RotateClockwise)
    }

    pub fn stop(&mut self) -> RotatorResult<Echo> {
        self.execute(Command::Stop)
    }

    pub fn stop_azimuth(&mut self) -> RotatorResult<Echo> {
        self.execute(Command::StopAzimuth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use std::collections::VecDeque;

    fn driver() -> RotatorDriver<SimulatedRotator> {
        let sim = SimulatedRotator::manual(&SimulationConfig::default());
        RotatorDriver::new(sim, DEFAULT_REPLY_TIMEOUT)
    }

    #[test]
    fn test_move_is_confirmed_by_position_echo() {
        let mut driver = driver();
        let echo = driver.move_to(90.0, 45.0).unwrap();
        // The query follows the move immediately, before any slew
        assert_eq!(echo, Echo { azimuth_deg: 0, elevation_deg: 0 });
        assert_eq!(driver.link().sent(), ["W090 045", "C2"]);
        assert_eq!(driver.last_echo(), Some("+0000+0000"));
    }

    #[test]
    fn test_settled_move_echoes_target() {
        let mut driver = driver();
        driver.move_to(90.0, 45.0).unwrap();
        let settle = driver.link().settle_time_remaining();
        driver.link_mut().advance(settle);

        let echo = driver.query_position().unwrap();
        assert_eq!(echo, Echo { azimuth_deg: 90, elevation_deg: 45 });
        assert!(driver.link().is_settled());
    }

    #[test]
    fn test_silent_rotator_times_out() {
        let mut driver = driver();
        driver.link_mut().set_unresponsive(true);
        assert!(matches!(
            driver.move_to(10.0, 10.0),
            Err(RotatorError::ProtocolTimeout(_))
        ));
    }

    /// Answers every `C2` with an azimuth 10° further on; the reply to the
    /// first query only shows up after that query has timed out.
    #[derive(Default)]
    struct LateReplyLink {
        azimuth: u32,
        inbox: VecDeque<String>,
        held: Option<String>,
        first_is_late: bool,
    }

    impl RotatorLink for LateReplyLink {
        fn write_line(&mut self, line: &str) -> RotatorResult<()> {
            if line.trim() == "C2" {
                self.azimuth += 10;
                let reply = Echo { azimuth_deg: self.azimuth, elevation_deg: 0 }.to_reply();
                if self.first_is_late {
                    self.first_is_late = false;
                    self.held = Some(reply);
                } else {
                    self.inbox.push_back(reply);
                }
            }
            Ok(())
        }

        fn read_line(&mut self, _timeout: Duration, _abort: &AbortHandle) -> RotatorResult<String> {
            if let Some(reply) = self.inbox.pop_front() {
                return Ok(reply);
            }
            if let Some(reply) = self.held.take() {
                self.inbox.push_back(reply);
            }
            Err(RotatorError::ProtocolTimeout("late reply".to_string()))
        }

        fn discard_buffers(&mut self) -> RotatorResult<()> {
            self.inbox.clear();
            Ok(())
        }

        fn describe(&self) -> String {
            "late reply link".to_string()
        }
    }

    #[test]
    fn test_late_reply_is_not_taken_as_next_echo() {
        let link = LateReplyLink {
            first_is_late: true,
            ..LateReplyLink::default()
        };
        let mut driver = RotatorDriver::new(link, DEFAULT_REPLY_TIMEOUT);

        assert!(matches!(
            driver.query_position(),
            Err(RotatorError::ProtocolTimeout(_))
        ));
        // The first reply (AZ 10) is now buffered; the second query must see AZ 20
        assert_eq!(driver.link().inbox.len(), 1);
        let echo = driver.query_position().unwrap();
        assert_eq!(echo, Echo { azimuth_deg: 20, elevation_deg: 0 });
        assert_eq!(driver.query_position().unwrap().azimuth_deg, 30);
    }

    #[test]
    fn test_abort_discards_and_stops_commands() {
        let mut driver = driver();
        let handle = driver.abort_handle();
        handle.abort();
        assert!(matches!(
            driver.move_to(10.0, 10.0),
            Err(RotatorError::OperationAborted(_))
        ));
        assert!(driver.link().sent().is_empty());

        handle.reset();
        assert!(driver.query_position().is_ok());
    }
}
