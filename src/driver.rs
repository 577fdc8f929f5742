/* Printer driver framework: the common lifecycle/state machine shared by
the protocol back-ends, and the firmware-name registry that maps printer
models to a concrete driver. */

use crate::gcode::{GCodeBuffer, Meta, SetResult};
use crate::serial::Serial;
use crate::{Error, Result};
use std::os::fd::RawFd;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info};

pub mod makerbot;
pub mod marlin;
pub mod translate;

pub use makerbot::MakerbotDriver;
pub use marlin::MarlinDriver;

/// Requested delay until the next [`Driver::update`] call; `None` means
/// "only call me again when I/O happens".
pub type Tick = Option<Duration>;

/// Lifecycle states of a printer connection, ordered by progression.
/// The display names travel over IPC into client scripts and must stay
/// stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DriverState {
    #[display("unknown")]
    Unknown,
    #[display("disconnected")]
    Disconnected,
    #[display("connecting")]
    Connecting,
    #[display("idle")]
    Idle,
    #[display("buffering")]
    Buffering,
    #[display("printing")]
    Printing,
    #[display("stopping")]
    Stopping,
}

impl FromStr for DriverState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "disconnected" => Ok(Self::Disconnected),
            "connecting" => Ok(Self::Connecting),
            "idle" => Ok(Self::Idle),
            "buffering" => Ok(Self::Buffering),
            "printing" => Ok(Self::Printing),
            "stopping" => Ok(Self::Stopping),
            _ => Err(Error::InvalidParams(format!("unknown state: {}", s))),
        }
    }
}

/// The capability set every protocol back-end provides. Common behavior
/// lives in [`DriverCore`]; the back-ends implement the wire protocol.
pub trait Driver: Send {
    /// Opens the serial connection and starts probing the printer.
    fn open(&mut self) -> Result<()>;

    fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// Raw serial descriptor for the server's poll set, when open.
    fn serial_fd(&self) -> Option<RawFd>;

    /// Performs periodic protocol work and returns the delay after which
    /// the driver wants to run again.
    fn update(&mut self) -> Tick;

    fn set_gcode(&mut self, gcode: &str, meta: Option<&Meta>) -> SetResult;

    fn append_gcode(&mut self, gcode: &str, meta: Option<&Meta>) -> SetResult;

    fn clear_gcode(&mut self);

    /// Starts printing the buffered G-code. Returns false when the
    /// printer is not online.
    fn start_print(&mut self) -> bool;

    /// Resets the print and plays `end_code` in the `Stopping` state.
    fn stop_print(&mut self, end_code: &str) -> bool;

    /// Asks the printer to heat the hot end to `temperature`.
    fn heatup(&mut self, temperature: i16);

    /// Shared state: cached temperatures, progress and lifecycle.
    fn core(&self) -> &DriverCore;
}

/// State and behavior shared by all drivers: the serial port, the G-code
/// buffer, cached temperatures and the lifecycle state machine.
#[derive(Debug)]
pub struct DriverCore {
    pub(crate) serial: Serial,
    pub(crate) gcode: GCodeBuffer,
    pub(crate) state: DriverState,
    pub(crate) heating: bool,
    pub(crate) temperature: u16,
    pub(crate) target_temperature: u16,
    pub(crate) bed_temperature: u16,
    pub(crate) target_bed_temperature: u16,
    baudrate: u32,
    exit_request: Option<i32>,
}

impl DriverCore {
    pub(crate) fn new(serial_port_path: &str, baudrate: u32) -> Self {
        Self {
            serial: Serial::new(serial_port_path),
            gcode: GCodeBuffer::new(),
            state: DriverState::Disconnected,
            heating: false,
            temperature: 0,
            target_temperature: 0,
            bed_temperature: 0,
            target_bed_temperature: 0,
            baudrate,
            exit_request: None,
        }
    }

    pub(crate) fn open_connection(&mut self) -> Result<()> {
        info!(baudrate = self.baudrate, "opening printer connection");
        self.serial.open()?;
        self.set_baudrate(self.baudrate);
        Ok(())
    }

    pub(crate) fn close_connection(&mut self) {
        self.set_state(DriverState::Disconnected);
        self.serial.close();
    }

    pub fn is_connected(&self) -> bool {
        self.serial.is_open()
    }

    /// Online means a printer has been confirmed on the other end.
    pub fn is_online(&self) -> bool {
        !matches!(
            self.state,
            DriverState::Unknown | DriverState::Disconnected | DriverState::Connecting
        )
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: DriverState) {
        debug!(from = %self.state, to = %state, "state change");
        self.state = state;
    }

    pub fn is_heating(&self) -> bool {
        self.heating
    }

    pub fn temperature(&self) -> u16 {
        self.temperature
    }

    pub fn target_temperature(&self) -> u16 {
        self.target_temperature
    }

    pub fn bed_temperature(&self) -> u16 {
        self.bed_temperature
    }

    pub fn target_bed_temperature(&self) -> u16 {
        self.target_bed_temperature
    }

    pub fn current_line(&self) -> i32 {
        self.gcode.current_line()
    }

    pub fn buffered_lines(&self) -> i32 {
        self.gcode.buffered_lines()
    }

    pub fn total_lines(&self) -> i32 {
        self.gcode.total_lines()
    }

    pub fn buffer_size(&self) -> usize {
        self.gcode.buffer_size()
    }

    pub fn max_buffer_size(&self) -> usize {
        self.gcode.max_buffer_size()
    }

    /// A fatal device failure asks the server to shut down with this
    /// exit code.
    pub fn exit_request(&self) -> Option<i32> {
        self.exit_request
    }

    pub(crate) fn set_gcode(&mut self, gcode: &str, meta: Option<&Meta>) -> SetResult {
        let result = self.gcode.set(gcode, meta);
        if result.is_ok() {
            self.extract_gcode_info(gcode);
            if self.state == DriverState::Idle {
                self.set_state(DriverState::Buffering);
            }
        }
        result
    }

    pub(crate) fn append_gcode(&mut self, gcode: &str, meta: Option<&Meta>) -> SetResult {
        let result = self.gcode.append(gcode, meta);
        if result.is_ok() {
            self.extract_gcode_info(gcode);
            if self.state == DriverState::Idle {
                self.set_state(DriverState::Buffering);
            }
        }
        result
    }

    pub(crate) fn clear_gcode(&mut self) {
        self.gcode.clear();
        if matches!(
            self.state,
            DriverState::Buffering | DriverState::Printing | DriverState::Stopping
        ) {
            self.set_state(DriverState::Idle);
        }
    }

    /// Common part of starting a print: reset unless already printing or
    /// stopping, then enter the requested state.
    pub(crate) fn start_print(&mut self, state: DriverState) -> bool {
        if !self.is_online() {
            debug!(state = %self.state, "start_print: printer not online");
            return false;
        }

        if !matches!(self.state, DriverState::Printing | DriverState::Stopping) {
            self.reset_print();
        }
        self.set_state(state);
        true
    }

    pub(crate) fn reset_print(&mut self) -> bool {
        if !self.is_online() {
            debug!(state = %self.state, "reset_print: printer not online");
            return false;
        }

        self.set_state(DriverState::Idle);
        self.gcode.set_current_line(0);
        true
    }

    pub(crate) fn set_baudrate(&mut self, baudrate: u32) {
        self.baudrate = baudrate;
        match self.serial.set_speed(baudrate) {
            Ok(()) => self.set_state(DriverState::Connecting),
            Err(e) => error!("could not set port speed: {}", e),
        }
    }

    pub(crate) fn switch_baudrate(&mut self) {
        let next = if self.baudrate == 250_000 { 115_200 } else { 250_000 };
        self.set_baudrate(next);
    }

    pub(crate) fn baudrate(&self) -> u32 {
        self.baudrate
    }

    /// Reads whatever the printer sent into the serial line buffer. A
    /// dead device closes the connection and requests a server exit.
    pub(crate) fn read_data(&mut self) -> usize {
        match self.serial.read_available(Duration::ZERO) {
            Ok(n) => n,
            Err(Error::Disconnected) => {
                error!("remote end closed connection, closing port");
                self.handle_device_error();
                0
            }
            Err(e) => {
                error!("cannot read from device: {}", e);
                0
            }
        }
    }

    pub(crate) fn handle_device_error(&mut self) {
        self.close_connection();
        self.exit_request = Some(1);
    }

    /// Scans outgoing G-code for heatup commands so the target
    /// temperatures are known before the printer starts reporting them.
    /// The last `M109 S`/`M190 S` occurrence wins.
    pub(crate) fn extract_gcode_info(&mut self, gcode: &str) {
        if let Some(pos) = gcode.rfind("M109") {
            self.target_temperature = find_number(gcode, pos + 6);
            debug!(target = self.target_temperature, "gcode sets hotend target");
        }

        if let Some(pos) = gcode.rfind("M190") {
            self.target_bed_temperature = find_number(gcode, pos + 6);
            debug!(target = self.target_bed_temperature, "gcode sets bed target");
        }
    }
}

/// Parses the number starting at `start`, delimited by the next newline
/// or space. Fractions are truncated.
pub(crate) fn find_number(code: &str, start: usize) -> u16 {
    let Some(rest) = code.get(start..) else {
        return 0;
    };
    let end = rest.find(['\n', ' ']).unwrap_or(rest.len());
    rest[..end].parse::<f32>().unwrap_or(0.0) as u16
}

/// Printer models supported by the Marlin (text-line) driver.
pub const MARLIN_FIRMWARE: &[&str] = &[
    "rigidbot",
    "ultimaker",
    "ultimaker2",
    "ultimaker2go",
    "ultimaker_original_plus",
    "renkforce_rf100",
    "printrbot",
    "bukobot",
    "cartesio",
    "cyrus",
    "delta_rostockmax",
    "deltamaker",
    "eventorbot",
    "felix",
    "gigabot",
    "kossel",
    "leapfrog_creatr",
    "lulzbot_aO_101",
    "lulzbot_taz_4",
    "makergear_m2",
    "makergear_prusa",
    "makibox",
    "orca_0_3",
    "ord_bot_hadron",
    "printxel_3d",
    "prusa_i3",
    "prusa_iteration_2",
    "rapman",
    "reprappro_huxley",
    "reprappro_mendel",
    "robo_3d_printer",
    "shapercube",
    "tantillus",
    "minifactory",
    "vision_3d_printer",
    "builder3d",
    "bigbuilder3d",
    "mamba3d",
    "marlin_generic",
    "doodle_dream",
    "colido_2_0_plus",
    "colido_m2020",
    "colido_x3045",
    "colido_compact",
    "colido_diy",
    "craftbot_plus",
];

/// Printer models supported by the Makerbot (binary packet) driver.
pub const MAKERBOT_FIRMWARE: &[&str] = &[
    "_3Dison_plus",
    "makerbot_replicator2",
    "makerbot_replicator2x",
    "makerbot_thingomatic",
    "makerbot_generic",
    "wanhao_duplicator4",
];

/// A driver family and the printer models it supports.
pub struct DriverInfo {
    pub name: &'static str,
    pub supported_firmware: &'static [&'static str],
}

pub fn driver_info() -> [DriverInfo; 2] {
    [
        DriverInfo {
            name: "Marlin",
            supported_firmware: MARLIN_FIRMWARE,
        },
        DriverInfo {
            name: "Makerbot",
            supported_firmware: MAKERBOT_FIRMWARE,
        },
    ]
}

/// Maps a firmware/model name to a concrete driver for the given port.
/// Returns `None` when no driver supports the name.
pub fn create_driver(
    firmware: &str,
    serial_port_path: &str,
    baudrate: u32,
) -> Option<Box<dyn Driver>> {
    if MARLIN_FIRMWARE.contains(&firmware) {
        info!(firmware, driver = "Marlin", "creating driver");
        return Some(Box::new(MarlinDriver::new(serial_port_path, baudrate)));
    }
    if MAKERBOT_FIRMWARE.contains(&firmware) {
        info!(firmware, driver = "Makerbot", "creating driver");
        return Some(Box::new(MakerbotDriver::new(serial_port_path, baudrate)));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_are_stable() {
        let names: Vec<String> = [
            DriverState::Unknown,
            DriverState::Disconnected,
            DriverState::Connecting,
            DriverState::Idle,
            DriverState::Buffering,
            DriverState::Printing,
            DriverState::Stopping,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        assert_eq!(
            names,
            [
                "unknown",
                "disconnected",
                "connecting",
                "idle",
                "buffering",
                "printing",
                "stopping"
            ]
        );

        assert_eq!(
            "printing".parse::<DriverState>().unwrap(),
            DriverState::Printing
        );
        assert!("Printing".parse::<DriverState>().is_err());
    }

    #[test]
    fn online_excludes_connection_states() {
        let mut core = DriverCore::new("/dev/null", 250_000);
        assert_eq!(core.state(), DriverState::Disconnected);
        assert!(!core.is_online());

        core.state = DriverState::Connecting;
        assert!(!core.is_online());
        core.state = DriverState::Idle;
        assert!(core.is_online());
        core.state = DriverState::Printing;
        assert!(core.is_online());
    }

    #[test]
    fn gcode_buffering_state_transitions() {
        let mut core = DriverCore::new("/dev/null", 250_000);
        core.state = DriverState::Idle;

        assert!(core.set_gcode("G1 X10\n", None).is_ok());
        assert_eq!(core.state(), DriverState::Buffering);

        core.clear_gcode();
        assert_eq!(core.state(), DriverState::Idle);
        assert_eq!(core.total_lines(), 0);
    }

    #[test]
    fn start_print_requires_online() {
        let mut core = DriverCore::new("/dev/null", 250_000);
        assert!(!core.start_print(DriverState::Printing));
        assert_eq!(core.state(), DriverState::Disconnected);

        core.state = DriverState::Idle;
        core.gcode.append("G1 X0\n", None);
        core.gcode.set_current_line(1);
        assert!(core.start_print(DriverState::Printing));
        assert_eq!(core.state(), DriverState::Printing);
        // reset_print rewinds the line counter
        assert_eq!(core.current_line(), 0);
    }

    #[test]
    fn extract_gcode_info_takes_last_heat_command() {
        let mut core = DriverCore::new("/dev/null", 250_000);

        core.extract_gcode_info("M109 S220");
        assert_eq!(core.target_temperature(), 220);

        core.extract_gcode_info("M90\nM91\nM109 S60\nM92\nG0 X10.600 Y10.050");
        assert_eq!(core.target_temperature(), 60);

        core.extract_gcode_info("M190 S100");
        assert_eq!(core.target_bed_temperature(), 100);

        core.extract_gcode_info("M190 S10\nM109 S25\nM190 S40\nM109 S45");
        assert_eq!(core.target_temperature(), 45);
        assert_eq!(core.target_bed_temperature(), 40);

        // M104/M140 are not scanned
        let mut fresh = DriverCore::new("/dev/null", 250_000);
        fresh.extract_gcode_info("M104 S15\nM140 S32");
        assert_eq!(fresh.target_temperature(), 0);
        assert_eq!(fresh.target_bed_temperature(), 0);
    }

    #[test]
    fn baudrate_toggles_between_supported_speeds() {
        let mut core = DriverCore::new("/dev/null", 250_000);
        core.switch_baudrate();
        assert_eq!(core.baudrate(), 115_200);
        core.switch_baudrate();
        assert_eq!(core.baudrate(), 250_000);
    }

    #[test]
    fn registry_maps_models_to_drivers() {
        assert!(create_driver("ultimaker2", "/dev/null", 250_000).is_some());
        assert!(create_driver("makerbot_replicator2", "/dev/null", 115_200).is_some());
        assert!(create_driver("unknown_model", "/dev/null", 250_000).is_none());

        let infos = driver_info();
        assert_eq!(infos[0].name, "Marlin");
        assert!(infos[1].supported_firmware.contains(&"wanhao_duplicator4"));
    }
}
