/* Driver for Marlin-style firmwares: a line-oriented ASCII protocol with
`ok` confirmations, `T:`/`B:` temperature reports and `Resend:` requests.
Connection probing doubles as baud rate detection. */

use crate::driver::{Driver, DriverCore, DriverState, Tick, find_number};
use crate::gcode::{Meta, SetResult};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

const UPDATE_INTERVAL: Duration = Duration::from_millis(200);
const MAX_CHECK_TEMPERATURE_ATTEMPTS: u32 = 2;

/// Temperature poll intervals: idle printers are asked often, printing
/// ones less frequently to keep the line free for G-code.
const CHECK_TEMPERATURE_CONNECTING: Duration = Duration::from_millis(2000);
const CHECK_TEMPERATURE_IDLE: Duration = Duration::from_millis(1500);
const CHECK_TEMPERATURE_PRINTING: Duration = Duration::from_millis(5000);

pub struct MarlinDriver {
    core: DriverCore,
    check_temperature_interval: Duration,
    check_connection: bool,
    check_temperature_attempt: u32,
    temperature_timer: Instant,
    update_timer: Instant,
}

impl MarlinDriver {
    pub fn new(serial_port_path: &str, baudrate: u32) -> Self {
        Self {
            core: DriverCore::new(serial_port_path, baudrate),
            check_temperature_interval: CHECK_TEMPERATURE_CONNECTING,
            check_connection: true,
            check_temperature_attempt: 0,
            temperature_timer: Instant::now(),
            update_timer: Instant::now(),
        }
    }

    fn check_temperature(&mut self) {
        self.send_code("M105");
    }

    /// Handles one complete line from the printer.
    fn read_response(&mut self, code: &str) {
        trace!(line = code, "read_response");

        let temp_message = code.starts_with("ok T:");
        let heating_message = code.starts_with("T:");

        if temp_message || heating_message {
            self.parse_temperatures(code);
            if self.check_connection {
                // a temperature response proves the baud rate is right
                self.check_connection = false;
                self.core.set_state(DriverState::Idle);
            }

            self.check_temperature_interval = if matches!(
                self.core.state,
                DriverState::Printing | DriverState::Stopping
            ) {
                CHECK_TEMPERATURE_PRINTING
            } else {
                CHECK_TEMPERATURE_IDLE
            };
        } else if code.starts_with("ok") {
            // confirmation that the last line was received
            if matches!(
                self.core.state,
                DriverState::Printing | DriverState::Stopping
            ) {
                self.core.gcode.erase_line();
                self.print_next_line();
            }
        } else if code.contains("Resend:") {
            let line = self.core.gcode.current_line() - 1;
            self.core.gcode.set_current_line(line);
            debug!(line = self.core.gcode.current_line(), "resend requested");
            self.print_next_line();
        } else if code.contains("start") {
            // greeting after a reset; no action needed
        }
    }

    /// Parses a status line. Examples seen in the wild:
    ///   `ok T:19.1 /0.0 B:0.0 /0.0 @:0 B@:0`
    ///   `T:19.51 B:-1.00 @:0`
    ///   `T:19.5 E:0 W:?`
    fn parse_temperatures(&mut self, code: &str) {
        let pos_t = code.find("T:");

        // the variant _not_ prefixed with 'ok ' means the printer is
        // heating and reporting on its own accord
        self.core.heating = pos_t == Some(0);

        if let Some(pos_t) = pos_t {
            self.core.temperature = find_number(code, pos_t + 2);
            if let Some(pos_tt) = code[pos_t..].find('/') {
                self.core.target_temperature = find_number(code, pos_t + pos_tt + 1);
            }
        }

        if let Some(pos_b) = code.find("B:") {
            self.core.bed_temperature = find_number(code, pos_b + 2);
            if let Some(pos_tbt) = code[pos_b..].find('/') {
                self.core.target_bed_temperature = find_number(code, pos_b + pos_tbt + 1);
            }
        }
    }

    fn print_next_line(&mut self) {
        trace!(
            line = self.core.gcode.current_line(),
            total = self.core.gcode.total_lines(),
            "print_next_line"
        );

        match self.core.gcode.next_line() {
            Some(line) => {
                self.send_code(&line);
                let current = self.core.gcode.current_line();
                self.core.gcode.set_current_line(current + 1);
            }
            None => {
                // print finished
                self.core.reset_print();
            }
        }
    }

    fn send_code(&mut self, code: &str) {
        trace!(code, "send_code");
        if !self.core.is_connected() {
            return;
        }

        self.core.extract_gcode_info(code);
        let mut line = code.to_string();
        line.push('\n');
        if let Err(e) = self.core.serial.write(line.as_bytes()) {
            tracing::error!("could not write to device: {}", e);
            if matches!(e, crate::Error::Disconnected) {
                self.core.handle_device_error();
            }
        }
    }
}

impl Driver for MarlinDriver {
    fn open(&mut self) -> crate::Result<()> {
        self.core.open_connection()
    }

    fn close(&mut self) {
        self.core.close_connection();
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn serial_fd(&self) -> Option<RawFd> {
        self.core.serial.raw_fd()
    }

    fn update(&mut self) -> Tick {
        if !self.is_connected() {
            return None;
        }

        if self.temperature_timer.elapsed() >= self.check_temperature_interval {
            self.temperature_timer = Instant::now();

            // during startup the temperature poll doubles as a
            // connection probe; once established we keep polling at the
            // regular interval
            if self.check_connection {
                if self.check_temperature_attempt < MAX_CHECK_TEMPERATURE_ATTEMPTS {
                    info!(
                        attempt = self.check_temperature_attempt,
                        max = MAX_CHECK_TEMPERATURE_ATTEMPTS,
                        baudrate = self.core.baudrate(),
                        "probing connection"
                    );
                    self.check_temperature();
                    self.check_temperature_attempt += 1;
                } else {
                    self.core.switch_baudrate();
                    self.check_temperature_attempt = 0;
                }
            } else {
                self.check_temperature();
            }
        }

        let busy = matches!(
            self.core.state,
            DriverState::Printing | DriverState::Stopping
        );
        if busy || self.update_timer.elapsed() >= UPDATE_INTERVAL {
            if self.core.read_data() > 0 {
                while let Some(line) = self.core.serial.extract_line() {
                    self.read_response(&line);
                }
            }
            self.update_timer = Instant::now();
        }

        Some(UPDATE_INTERVAL.saturating_sub(self.update_timer.elapsed()))
    }

    fn set_gcode(&mut self, gcode: &str, meta: Option<&Meta>) -> SetResult {
        self.core.set_gcode(gcode, meta)
    }

    fn append_gcode(&mut self, gcode: &str, meta: Option<&Meta>) -> SetResult {
        self.core.append_gcode(gcode, meta)
    }

    fn clear_gcode(&mut self) {
        self.core.clear_gcode();
    }

    fn start_print(&mut self) -> bool {
        if !self.core.start_print(DriverState::Printing) {
            return false;
        }
        self.print_next_line();
        true
    }

    fn stop_print(&mut self, end_code: &str) -> bool {
        debug!(bytes = end_code.len(), "stop_print with end g-code");
        self.core.reset_print();
        self.core.set_gcode(end_code, None);
        if !self.core.start_print(DriverState::Stopping) {
            return false;
        }
        self.print_next_line();
        true
    }

    fn heatup(&mut self, temperature: i16) {
        self.send_code(&format!("M104 S{}", temperature));
    }

    fn core(&self) -> &DriverCore {
        &self.core
    }
}
