/* Driver for Makerbot-style firmwares: the s3g binary packet protocol
with per-packet CRC, bounded retries and printer-side buffer accounting.

Protocol reference: https://github.com/makerbot/s3g/blob/master/doc/s3gProtocol.md */

use crate::driver::translate::{BasicTranslator, Translator};
use crate::driver::{Driver, DriverCore, DriverState, Tick};
use crate::gcode::{Meta, SetResult};
use crate::{Error, Result};
use bytes::Buf;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const PACKET_START_BYTE: u8 = 0xD5;

const PRINTER_BUFFER_SIZE: u32 = 512;
/// Number of G-code lines pulled from the buffer per translation batch.
const GCODE_CVT_LINES: usize = 25;
/// Queue watermarks are kept small to limit the error of progress
/// reporting against what the printer has actually executed.
const QUEUE_MIN_SIZE: usize = 10;
const QUEUE_FILL_SIZE: usize = 30;

const RESPONSE_TIMEOUT: Duration = Duration::from_millis(250);
const RESPONSE_LENGTH_PAUSE: Duration = Duration::from_millis(5);
const MAX_SEND_ATTEMPTS: u32 = 5;

const UPDATE_INTERVAL: Duration = Duration::from_millis(1000 / 30);
const HOUSEKEEPING_TICKS: u32 = 30;

// s3g command opcodes handled by this driver
const CMD_GET_VERSION: u8 = 0;
const CMD_GET_BUFFER_SPACE: u8 = 2;
const CMD_RESET_BUFFER: u8 = 3;
const CMD_ABORT: u8 = 7;
const CMD_TOOL_QUERY: u8 = 10;

// tool query subcommands
const TOOL_QUERY_TEMPERATURE: u8 = 2;
const TOOL_QUERY_PLATFORM_TEMPERATURE: u8 = 30;
const TOOL_QUERY_TARGET_TEMPERATURE: u8 = 32;
const TOOL_QUERY_PLATFORM_TARGET_TEMPERATURE: u8 = 33;

const RSP_SUCCESS: u8 = 0x81;

fn response_message(code: u8) -> &'static str {
    match code {
        0x80 => "Generic packet error, packet discarded",
        0x81 => "Success",
        0x82 => "Action buffer overflow, entire packet discarded",
        0x83 => "CRC mismatch, packet discarded",
        0x84 => "Query packet too big, packet discarded",
        0x85 => "Command not supported/recognized",
        0x87 => "Downstream timeout",
        0x88 => "Tool lock timeout",
        0x89 => "Cancel build",
        0x8A => "Bot is building from SD",
        0x8B => "Bot is shut down due to overheat",
        0x8C => "Packet timeout error, packet discarded",
        _ => "Unknown response code",
    }
}

/// iButton/Maxim CRC-8 (polynomial 0x8C, bitwise) over the payload only.
pub(crate) fn crc_ibutton(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |mut crc, &byte| {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ 0x8C
            } else {
                crc >> 1
            };
        }
        crc
    })
}

/// Frames a payload for the wire: `0xD5 | len | payload | crc`.
pub(crate) fn build_packet(payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 3);
    packet.push(PACKET_START_BYTE);
    packet.push(payload.len() as u8);
    packet.extend_from_slice(payload);
    packet.push(crc_ibutton(payload));
    packet
}

pub struct MakerbotDriver {
    core: DriverCore,
    queue: VecDeque<Vec<u8>>,
    translator: Box<dyn Translator>,
    /// Approximate number of free bytes in the printer's command buffer,
    /// corrected by every get-buffer-space reply.
    buffer_space: u32,
    firmware_version: u16,
    valid_response_received: bool,
    send_stop_codes: bool,
    counter: u32,
}

impl MakerbotDriver {
    pub fn new(serial_port_path: &str, baudrate: u32) -> Self {
        let mut core = DriverCore::new(serial_port_path, baudrate);
        // GPX macro comments steer the translator and must survive
        // buffer cleanup
        core.gcode.set_keep_macro_comments(true);

        Self {
            core,
            queue: VecDeque::new(),
            translator: Box::new(BasicTranslator::new()),
            buffer_space: PRINTER_BUFFER_SIZE,
            firmware_version: 0,
            valid_response_received: false,
            send_stop_codes: true,
            counter: 0,
        }
    }

    /// When disabled, `reset-buffer`/`abort` are not sent on a full
    /// stop, matching firmwares that drop the serial connection on
    /// those opcodes.
    pub fn set_send_stop_codes(&mut self, send: bool) {
        self.send_stop_codes = send;
    }

    /// Pulls G-code from the buffer through the translator until the
    /// transmit queue is comfortably filled or the source runs dry.
    fn fill_queue(&mut self) {
        loop {
            if self.queue.len() >= QUEUE_FILL_SIZE {
                break;
            }

            let (lines, amount) = self.core.gcode.next_lines(GCODE_CVT_LINES);
            let commands = self.convert_gcode(&lines);
            if !lines.is_empty() {
                trace!(lines = amount, commands, "translated gcode batch");
            }

            if amount == 0 {
                break;
            }
            self.core.gcode.erase_lines(amount as usize);
            let current = self.core.gcode.current_line();
            self.core.gcode.set_current_line(current + amount);
        }
    }

    fn convert_gcode(&mut self, gcode: &str) -> usize {
        if gcode.is_empty() {
            return 0;
        }
        let mut payloads = Vec::new();
        let count = self.translator.convert(gcode, &mut payloads);
        self.queue.extend(payloads);
        count
    }

    fn process_queue(&mut self) {
        if self.queue.is_empty() {
            if self.request_buffer_space() >= PRINTER_BUFFER_SIZE {
                self.core.set_state(DriverState::Idle);
                info!("print queue and printer buffer empty, done");
            } else if self.counter == 0 {
                info!("print queue empty, waiting for printer to finish");
            }
            return;
        }

        let old_queue_size = self.queue.len();
        let old_space = self.buffer_space;

        // refill the printer buffer only when a good chunk of it is free
        if self.request_buffer_space() > 480 {
            loop {
                let Some(front_len) = self.queue.front().map(Vec::len) else {
                    break;
                };
                // commands vary in length; stop before overrunning the
                // printer's buffer
                if front_len as u32 > self.buffer_space.saturating_sub(5) {
                    break;
                }
                let command = self.queue.pop_front().unwrap();
                self.send_packet(&command, true);
            }
        }

        let sent = old_queue_size - self.queue.len();
        if sent > 0 {
            debug!(
                sent,
                queued = self.queue.len(),
                space_before = old_space,
                space_after = self.buffer_space,
                "processed queue"
            );
        }
    }

    fn query_firmware_version(&mut self) -> u16 {
        self.send_packet(&[CMD_GET_VERSION], false);
        self.firmware_version
    }

    fn request_buffer_space(&mut self) -> u32 {
        self.send_packet(&[CMD_GET_BUFFER_SPACE], false);
        self.buffer_space // updated by the reply
    }

    fn update_temperatures(&mut self) -> bool {
        let mut ok = true;
        for subcommand in [
            TOOL_QUERY_TEMPERATURE,
            TOOL_QUERY_PLATFORM_TEMPERATURE,
            TOOL_QUERY_TARGET_TEMPERATURE,
            TOOL_QUERY_PLATFORM_TARGET_TEMPERATURE,
        ] {
            ok &= self.send_packet(&[CMD_TOOL_QUERY, 0, subcommand], false);
        }
        ok
    }

    /// Clears all buffers and aborts the currently active print.
    fn full_stop(&mut self) {
        self.queue.clear();
        self.translator.reset();

        if self.core.is_connected() {
            if self.send_stop_codes {
                self.send_packet(&[CMD_RESET_BUFFER], false);
                self.send_packet(&[CMD_ABORT], false);
            } else {
                debug!("not sending reset-buffer/abort to keep the serial port open");
            }
        }
    }

    /// Transmits one framed packet and waits for its acknowledgement,
    /// retrying on timeouts and framing errors. Returns true when the
    /// printer acknowledged the packet.
    fn send_packet(&mut self, payload: &[u8], update_buffer_space: bool) -> bool {
        let lingering = self.core.serial.drain_input();
        if lingering > 0 {
            warn!(bytes = lingering, "unexpected bytes in the serial read buffer");
        }

        let packet = build_packet(payload);
        let cmd = payload[0];
        let toolcmd = (cmd == CMD_TOOL_QUERY)
            .then(|| payload.get(2).copied())
            .flatten();

        if update_buffer_space {
            self.buffer_space = self.buffer_space.saturating_sub(payload.len() as u32);
        }

        let mut attempts_left = MAX_SEND_ATTEMPTS;
        loop {
            trace!(
                cmd,
                len = packet.len(),
                attempt = MAX_SEND_ATTEMPTS - attempts_left,
                "writing packet"
            );
            if let Err(e) = self.core.serial.write(&packet) {
                error!("could not write packet: {}", e);
                if matches!(e, Error::Disconnected) {
                    self.core.handle_device_error();
                    return false;
                }
            }

            match self.parse_response(cmd, toolcmd) {
                Ok(()) => {
                    if !self.valid_response_received {
                        info!("hello makerbot (received first valid response packet)");
                        self.valid_response_received = true;
                    }
                    return true;
                }
                // an invalid _response_ CRC most likely means the
                // request itself was executed; retransmitting would run
                // it twice
                Err(Error::CrcMismatch) => {
                    error!(cmd, "response CRC error");
                    return false;
                }
                Err(Error::Disconnected) => {
                    error!("remote end closed connection, closing port");
                    self.core.handle_device_error();
                    return false;
                }
                Err(e) => {
                    match &e {
                        Error::Timeout => error!(cmd, "response timeout"),
                        Error::UnexpectedByte(b) => {
                            warn!(cmd, "expected 0xd5 start byte, got 0x{:02x}", b)
                        }
                        other => error!(cmd, "response error: {}", other),
                    }
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        error!(cmd, "packet lost after {} attempts", MAX_SEND_ATTEMPTS);
                        return false;
                    }
                    warn!(attempts_left, cmd, "resending packet");
                }
            }
        }
    }

    /// Reads and validates one response packet, then folds its payload
    /// into the cached state.
    fn parse_response(&mut self, cmd: u8, toolcmd: Option<u8>) -> Result<()> {
        let first = self.core.serial.read_byte(RESPONSE_TIMEOUT)?;
        if first != PACKET_START_BYTE {
            return Err(Error::UnexpectedByte(first));
        }

        // give the firmware a moment to put the whole packet on the wire
        thread::sleep(RESPONSE_LENGTH_PAUSE);

        let len = self.core.serial.read_byte(RESPONSE_TIMEOUT)? as usize;
        if len == 0 {
            return Err(Error::Other("zero-length response packet".to_string()));
        }

        let mut payload = vec![0u8; len];
        self.core.serial.read_exact(&mut payload, RESPONSE_TIMEOUT)?;

        let crc = self.core.serial.read_byte(RESPONSE_TIMEOUT)?;
        if crc != crc_ibutton(&payload) {
            warn!(cmd, "CRC check failed");
            return Err(Error::CrcMismatch);
        }

        self.interpret_reply(cmd, toolcmd, &payload);
        Ok(())
    }

    fn interpret_reply(&mut self, cmd: u8, toolcmd: Option<u8>, payload: &[u8]) {
        let code = payload[0];
        if code != RSP_SUCCESS {
            let code_hex = format!("0x{:02x}", code);
            info!(cmd, code = %code_hex, "printer replied: {}", response_message(code));
        }

        let mut body = &payload[1..];
        match cmd {
            CMD_GET_VERSION if body.len() >= 2 => {
                self.firmware_version = body.get_u16_le();
            }
            CMD_GET_BUFFER_SPACE if body.len() >= 4 => {
                self.buffer_space = body.get_u32_le();
            }
            CMD_TOOL_QUERY if body.len() >= 2 => {
                let value = body.get_u16_le();
                match toolcmd {
                    Some(TOOL_QUERY_TEMPERATURE) => self.core.temperature = value,
                    Some(TOOL_QUERY_PLATFORM_TEMPERATURE) => self.core.bed_temperature = value,
                    Some(TOOL_QUERY_TARGET_TEMPERATURE) => self.core.target_temperature = value,
                    Some(TOOL_QUERY_PLATFORM_TARGET_TEMPERATURE) => {
                        self.core.target_bed_temperature = value
                    }
                    other => warn!(?other, "unrecognized or missing tool command"),
                }
                // any tool query answer proves we have communication
                if self.core.state == DriverState::Connecting {
                    self.core.set_state(DriverState::Idle);
                }
            }
            CMD_RESET_BUFFER | CMD_ABORT => {}
            // movement/config commands only acknowledge
            136 | 140 | 144 | 145 | 149 | 150 | 151 | 153 | 154 | 155 => {}
            other => warn!(cmd = other, len = payload.len(), "ignored response"),
        }
    }
}

impl Driver for MakerbotDriver {
    fn open(&mut self) -> Result<()> {
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

        let busy = matches!(
            self.core.state,
            DriverState::Printing | DriverState::Stopping
        );
        if busy && self.queue.len() < QUEUE_MIN_SIZE {
            self.fill_queue();
        }
        if busy {
            self.process_queue();
        }

        self.counter += 1;
        if self.counter >= HOUSEKEEPING_TICKS {
            self.counter = 0;
            if !self.valid_response_received {
                let version = self.query_firmware_version();
                info!("makerbot firmware version {}.{:02}", version / 100, version % 100);
            }
            self.update_temperatures();
            self.request_buffer_space();

            debug!(
                hotend = self.core.temperature,
                hotend_target = self.core.target_temperature,
                bed = self.core.bed_temperature,
                bed_target = self.core.target_bed_temperature,
                queued = self.queue.len(),
                printer_buffer_space = self.buffer_space,
                "makerbot status"
            );
        }

        Some(UPDATE_INTERVAL)
    }

    fn set_gcode(&mut self, gcode: &str, meta: Option<&Meta>) -> SetResult {
        let result = self.core.set_gcode(gcode, meta);
        self.full_stop();
        result
    }

    fn append_gcode(&mut self, gcode: &str, meta: Option<&Meta>) -> SetResult {
        self.core.append_gcode(gcode, meta)
    }

    fn clear_gcode(&mut self) {
        self.core.clear_gcode();
        self.full_stop();
    }

    fn start_print(&mut self) -> bool {
        // the queue drives progress; no immediate line send here
        self.core.start_print(DriverState::Printing)
    }

    fn stop_print(&mut self, end_code: &str) -> bool {
        debug!(bytes = end_code.len(), "stop_print with end g-code");
        self.core.reset_print();
        self.set_gcode(end_code, None);
        self.core.start_print(DriverState::Stopping)
    }

    fn heatup(&mut self, temperature: i16) {
        // route through the translator so the command is queued like any
        // other job content
        let mut payloads = Vec::new();
        self.translator
            .convert(&format!("M104 S{}\n", temperature), &mut payloads);
        self.queue.extend(payloads);
    }

    fn core(&self) -> &DriverCore {
        &self.core
    }
}
