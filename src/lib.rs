//! Local print server for serial-attached 3D printers.
//!
//! The `print3d` crate implements a single-printer daemon that accepts
//! G-code and control commands from local clients over a unix stream
//! socket, translates them into the wire protocol of the attached
//! printer firmware, and drives the printer through a print job while
//! caching live status (temperatures, progress, state).
//!
//! Two firmware families are supported:
//! * Marlin-style firmwares speaking a line-oriented ASCII protocol
//!   (`ok` confirmations, `T:`/`B:` temperature reports, `Resend:`);
//! * Makerbot-style firmwares speaking a binary packet protocol with
//!   per-packet CRC, retries and printer-side buffer accounting.
//!
//! The daemon runs a single-threaded cooperative event loop: one unix
//! listener, any number of client connections and the serial port all
//! join the same poll set, and the active driver is ticked in between.
//!
//! # Example
//! ```no_run
//! # fn example() -> print3d::Result<()> {
//! use print3d::{driver, server::Server};
//!
//! let driver = driver::create_driver("ultimaker2", "/dev/ttyACM0", 250_000)
//!     .expect("unknown firmware name");
//! let mut server = Server::bind("ttyACM0", driver)?;
//! let rv = server.run()?;
//! # let _ = rv;
//! # Ok(())
//! # }
//! ```
use thiserror::Error;

pub mod driver;
pub mod gcode;
pub mod ipc;
pub mod serial;
pub mod server;

/// Errors for the print server and its printer drivers
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed IPC frame: {0}")]
    MalformedFrame(String),
    #[error("{0}")]
    InvalidParams(String),
    #[error("device closed or disconnected")]
    Disconnected,
    #[error("read timed out")]
    Timeout,
    #[error("expected packet start byte, got 0x{0:02x}")]
    UnexpectedByte(u8),
    #[error("response CRC mismatch")]
    CrcMismatch,
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
