/* Serial port access for the printer drivers: open/close, speed changes
with an Arduino-style DTR reset pulse, timed reads and line extraction. */

use crate::{Error, Result};
use serial2::SerialPort;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

const READ_CHUNK_SIZE: usize = 1024;
const DTR_PULSE: Duration = Duration::from_millis(100);

// serial2 rejects a zero read timeout, so "no waiting" is approximated
// with the smallest one it accepts.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// A serial connection to the printer with an internal receive buffer
/// for line-oriented protocols.
#[derive(Debug)]
pub struct Serial {
    path: PathBuf,
    port: Option<SerialPort>,
    buffer: Vec<u8>,
}

impl Serial {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            port: None,
            buffer: Vec::new(),
        }
    }

    /// Opens the device in raw mode. The speed is configured separately
    /// via [`set_speed`](Self::set_speed).
    pub fn open(&mut self) -> Result<()> {
        debug!(path = %self.path.display(), "open");
        let port = SerialPort::open(&self.path, |mut settings: serial2::Settings| {
            settings.set_raw();
            Ok(settings)
        })?;
        self.port = Some(port);
        Ok(())
    }

    pub fn close(&mut self) {
        self.port = None;
        self.buffer.clear();
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Raw descriptor of the open port, for joining a poll set.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.port.as_ref().map(|p| p.as_raw_fd())
    }

    fn port(&self) -> Result<&SerialPort> {
        self.port.as_ref().ok_or(Error::Disconnected)
    }

    fn port_mut(&mut self) -> Result<&mut SerialPort> {
        self.port.as_mut().ok_or(Error::Disconnected)
    }

    /// Reconfigures the baud rate of the open port and pulses DTR to
    /// reset Arduino-class boards. Arbitrary speeds (115200, 250000, ...)
    /// are supported.
    pub fn set_speed(&mut self, baudrate: u32) -> Result<()> {
        debug!(baudrate, "set_speed");
        let port = self.port_mut()?;

        let mut settings = port.get_configuration()?;
        settings.set_baud_rate(baudrate)?;
        port.set_configuration(&settings)?;

        port.set_dtr(true)?;
        thread::sleep(DTR_PULSE);
        port.set_dtr(false)?;

        Ok(())
    }

    /// Reads everything currently available into the internal buffer,
    /// polling once up to `timeout` when nothing is immediately there.
    /// Returns the number of bytes appended.
    pub fn read_available(&mut self, timeout: Duration) -> Result<usize> {
        let port = self.port.as_mut().ok_or(Error::Disconnected)?;
        port.set_read_timeout(timeout.max(MIN_READ_TIMEOUT))?;

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut total = 0;
        loop {
            match port.read(&mut chunk) {
                Ok(0) => return Err(Error::Disconnected),
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if is_timeout(&e) {
                        break;
                    }
                    return Err(map_device_error(e));
                }
            }
        }

        if total > 0 {
            trace!(bytes = total, "read from device");
        }
        Ok(total)
    }

    /// Reads one byte directly from the port, bypassing the internal
    /// buffer, waiting at most `timeout`.
    pub fn read_byte(&mut self, timeout: Duration) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf, timeout)?;
        Ok(buf[0])
    }

    /// Fills `buf` with bytes read directly from the port, waiting at
    /// most `timeout` per read.
    pub fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let port = self.port_mut()?;
        port.set_read_timeout(timeout.max(MIN_READ_TIMEOUT))?;

        let mut filled = 0;
        while filled < buf.len() {
            match port.read(&mut buf[filled..]) {
                Ok(0) => return Err(Error::Disconnected),
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if is_timeout(&e) {
                        return Err(Error::Timeout);
                    }
                    return Err(map_device_error(e));
                }
            }
        }
        Ok(())
    }

    /// Drains and returns the number of bytes lingering in the OS
    /// receive queue. Used by the packet driver to spot noise between
    /// transactions.
    pub fn drain_input(&mut self) -> usize {
        let Ok(port) = self.port_mut() else { return 0 };
        if port.set_read_timeout(MIN_READ_TIMEOUT).is_err() {
            return 0;
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut total = 0;
        while let Ok(n) = port.read(&mut chunk) {
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port()?;
        port.write_all(data).map_err(map_device_error)?;
        Ok(())
    }

    /// Discards both the OS receive queue and the internal line buffer.
    pub fn flush_read(&mut self) -> Result<()> {
        self.buffer.clear();
        self.port()?.discard_input_buffer()?;
        Ok(())
    }

    /// Pops the next `\n`-terminated line from the internal buffer,
    /// stripping the terminator and a trailing `\r`.
    pub fn extract_line(&mut self) -> Option<String> {
        take_line(&mut self.buffer)
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

/// ENXIO and EBADF mean the device node went away under us; both are
/// reported as a disconnect so the driver can shut the connection down.
fn map_device_error(e: std::io::Error) -> Error {
    match e.raw_os_error() {
        Some(libc::ENXIO) | Some(libc::EBADF) | Some(libc::EIO) => {
            warn!("device error: {}", e);
            Error::Disconnected
        }
        _ => Error::Io(e),
    }
}

fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    let pos = buffer.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=pos).collect();
    line.pop(); // the newline itself
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_line_splits_on_newline() {
        let mut buf = b"ok T:19.1 /0.0\r\nResend: 5\npartial".to_vec();

        assert_eq!(take_line(&mut buf).as_deref(), Some("ok T:19.1 /0.0"));
        assert_eq!(take_line(&mut buf).as_deref(), Some("Resend: 5"));
        assert_eq!(take_line(&mut buf), None);
        assert_eq!(buf, b"partial");
    }

    #[test]
    fn take_line_handles_empty_lines() {
        let mut buf = b"\nstart\n".to_vec();
        assert_eq!(take_line(&mut buf).as_deref(), Some(""));
        assert_eq!(take_line(&mut buf).as_deref(), Some("start"));
        assert_eq!(take_line(&mut buf), None);
    }

    #[test]
    fn closed_port_reports_disconnected() {
        let mut serial = Serial::new("/dev/null");
        assert!(!serial.is_open());
        assert!(matches!(
            serial.read_available(Duration::ZERO),
            Err(Error::Disconnected)
        ));
        assert!(matches!(serial.write(b"M105\n"), Err(Error::Disconnected)));
    }
}
