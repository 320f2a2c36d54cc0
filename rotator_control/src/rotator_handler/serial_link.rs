//! Serial connection to a GS-232B controller.

use super::protocol::LINE_TERMINATOR;
use super::{AbortHandle, RotatorLink};
use crate::config::SerialConfig;
use crate::model::{RotatorError, RotatorResult};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

/// Longest single blocking read, so an abort is noticed promptly.
const READ_SLICE: Duration = Duration::from_millis(50);
const REOPEN_DELAY: Duration = Duration::from_millis(200);

pub struct SerialLink {
    candidates: Vec<String>,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
    last_open_port: Option<String>,
    pending: Vec<u8>,
}

impl SerialLink {
    /// Opens the first candidate port that accepts a connection at 8N1.
    ///
    /// # Errors
    /// Returns `RotatorError::SerialError` if no candidate opens.
    pub fn open(config: &SerialConfig) -> RotatorResult<Self> {
        let mut link = Self {
            candidates: config.candidates.clone(),
            baud_rate: config.baud_rate,
            port: None,
            last_open_port: None,
            pending: Vec::new(),
        };
        link.open_any()?;
        Ok(link)
    }

    pub fn port_name(&self) -> Option<&str> {
        self.last_open_port.as_deref()
    }

    fn open_any(&mut self) -> RotatorResult<()> {
        let mut ports_to_try: Vec<String> = self.last_open_port.iter().cloned().collect();
        ports_to_try.extend(
            self.candidates
                .iter()
                .filter(|p| Some(*p) != self.last_open_port.as_ref())
                .cloned(),
        );

        for name in &ports_to_try {
            let opened = serialport::new(name.as_str(), self.baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(READ_SLICE)
                .open();
            match opened {
                Ok(port) => {
                    if let Err(e) = port.clear(ClearBuffer::All) {
                        log::debug!("could not clear {name}: {e}");
                    }
                    log::info!("opened {name} @ {} 8N1", self.baud_rate);
                    self.port = Some(port);
                    self.last_open_port = Some(name.clone());
                    self.pending.clear();
                    return Ok(());
                }
                Err(e) => log::warn!("open {name} failed: {e}"),
            }
        }

        Err(RotatorError::SerialError(format!(
            "none of the candidate ports opened: {}",
            ports_to_try.join(", ")
        )))
    }

    fn close(&mut self) {
        if let Some(name) = &self.last_open_port {
            if self.port.take().is_some() {
                log::info!("closed {name}");
            }
        }
        self.pending.clear();
    }

    fn ensure_open(&mut self) -> RotatorResult<&mut Box<dyn SerialPort>> {
        if self.port.is_none() {
            self.open_any()?;
        }
        self.port
            .as_mut()
            .ok_or_else(|| RotatorError::SerialError("port not open".to_string()))
    }

    fn write_payload(&mut self, payload: &[u8]) -> std::io::Result<()> {
        match self.ensure_open() {
            Ok(port) => {
                port.write_all(payload)?;
                port.flush()
            }
            Err(e) => Err(std::io::Error::new(ErrorKind::NotConnected, e.to_string())),
        }
    }

    /// Takes the first complete non-empty line out of the pending bytes.
    fn take_line(&mut self) -> Option<String> {
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
        None
    }
}

impl RotatorLink for SerialLink {
    fn write_line(&mut self, line: &str) -> RotatorResult<()> {
        let payload = format!("{}{}", line.trim_end(), LINE_TERMINATOR);
        if let Err(e) = self.write_payload(payload.as_bytes()) {
            log::warn!("write of '{line}' failed ({e}), reopening");
            self.close();
            std::thread::sleep(REOPEN_DELAY);
            self.write_payload(payload.as_bytes())
                .map_err(|e| RotatorError::SerialError(format!("write of '{line}' failed: {e}")))?;
        }
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration, abort: &AbortHandle) -> RotatorResult<String> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 64];

        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            if abort.is_aborted() {
                self.discard_buffers()?;
                return Err(RotatorError::OperationAborted(
                    "serial read aborted".to_string(),
                ));
            }
            if Instant::now() >= deadline {
                return Err(RotatorError::ProtocolTimeout(format!(
                    "no reply within {} ms",
                    timeout.as_millis()
                )));
            }

            let port = self.ensure_open()?;
            match port.read(&mut buf) {
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    self.close();
                    return Err(RotatorError::SerialError(format!("read failed: {e}")));
                }
            }
        }
    }

    fn discard_buffers(&mut self) -> RotatorResult<()> {
        self.pending.clear();
        if let Some(port) = &self.port {
            port.clear(ClearBuffer::All)
                .map_err(|e| RotatorError::SerialError(format!("clear failed: {e}")))?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.last_open_port {
            Some(name) => format!("{name} @ {}", self.baud_rate),
            None => "closed serial port".to_string(),
        }
    }
}

/// Names of the serial ports present on this machine.
pub fn available_ports() -> RotatorResult<Vec<String>> {
    let ports = serialport::available_ports()
        .map_err(|e| RotatorError::SerialError(format!("failed to enumerate ports: {e}")))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_link() -> SerialLink {
        SerialLink {
            candidates: vec!["/nonexistent/ttyUSB0".to_string(), "/nonexistent/ttyUSB1".to_string()],
            baud_rate: 9600,
            port: None,
            last_open_port: None,
            pending: Vec::new(),
        }
    }

    #[test]
    fn test_take_line_splits_on_either_terminator() {
        let mut link = closed_link();
        link.pending.extend_from_slice(b"\r\n+0180+0090\r\n+0181");
        assert_eq!(link.take_line().as_deref(), Some("+0180+0090"));
        assert_eq!(link.take_line(), None);
        assert_eq!(link.pending, b"+0181");
    }

    #[test]
    fn test_missing_ports_are_a_serial_error() {
        let config = SerialConfig {
            candidates: vec!["/nonexistent/rotator-a".to_string(), "/nonexistent/rotator-b".to_string()],
            ..SerialConfig::default()
        };
        match SerialLink::open(&config) {
            Err(RotatorError::SerialError(msg)) => {
                assert!(msg.contains("rotator-a") && msg.contains("rotator-b"));
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("nonexistent port opened"),
        }
    }

    #[test]
    fn test_abort_is_checked_before_reading() {
        let mut link = closed_link();
        link.pending.extend_from_slice(b"+01");
        let abort = AbortHandle::new();
        abort.abort();
        assert!(matches!(
            link.read_line(Duration::from_secs(1), &abort),
            Err(RotatorError::OperationAborted(_))
        ));
        assert!(link.pending.is_empty());
    }

    #[test]
    fn test_reopen_prefers_last_open_port() {
        let mut link = closed_link();
        link.last_open_port = Some("/nonexistent/ttyUSB1".to_string());
        let err = link.open_any().unwrap_err().to_string();
        let first = err.find("ttyUSB1").unwrap();
        let second = err.find("ttyUSB0").unwrap();
        assert!(first < second);
    }
}
