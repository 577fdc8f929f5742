/* Translation of G-code text into binary command payloads for
Makerbot-family printers. The packet driver only depends on the trait;
the bundled translator covers the common command subset. */

use bytes::BufMut;

/// Converts G-code text into s3g command payloads. Implementations may
/// keep positional state between batches; `reset` drops it (used when
/// the G-code buffer is replaced or cleared).
pub trait Translator: Send {
    /// Translates a batch of G-code lines, appending one payload per
    /// resulting printer command to `out`. Returns the number of
    /// payloads produced.
    fn convert(&mut self, gcode: &str, out: &mut Vec<Vec<u8>>) -> usize;

    /// Drops accumulated translation state.
    fn reset(&mut self);
}

// s3g command opcodes emitted by the bundled translator
const CMD_TOOL_ACTION: u8 = 136;
const CMD_SET_POSITION_EXT: u8 = 140;
const CMD_DISPLAY_MESSAGE: u8 = 149;
const CMD_SET_BUILD_PERCENT: u8 = 150;
const CMD_QUEUE_SONG: u8 = 151;
const CMD_START_BUILD: u8 = 153;
const CMD_END_BUILD: u8 = 154;
const CMD_QUEUE_POINT_EXT: u8 = 155;

const TOOL_CMD_SET_TEMPERATURE: u8 = 3;
const TOOL_CMD_SET_PLATFORM_TEMPERATURE: u8 = 31;

const STEPS_PER_MM_XY: f32 = 88.88;
const STEPS_PER_MM_Z: f32 = 400.0;
const STEPS_PER_MM_E: f32 = 96.27;

const DEFAULT_FEEDRATE: f32 = 3200.0; // mm/min

/// Stateful G-code to s3g translator for the common command subset
/// (moves, heatup, build bookkeeping, display/progress commands).
/// Unrecognized lines are skipped.
#[derive(Debug)]
pub struct BasicTranslator {
    position: [i32; 5],
    feedrate: f32,
}

impl Default for BasicTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl BasicTranslator {
    pub fn new() -> Self {
        Self {
            position: [0; 5],
            feedrate: DEFAULT_FEEDRATE,
        }
    }

    fn convert_line(&mut self, line: &str, out: &mut Vec<Vec<u8>>) {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            return;
        }

        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else { return };

        match cmd {
            "G0" | "G1" => out.push(self.queue_point(line)),
            "G92" => {
                self.set_position(line);
                let mut p = Vec::with_capacity(21);
                p.put_u8(CMD_SET_POSITION_EXT);
                for axis in self.position {
                    p.put_i32_le(axis);
                }
                out.push(p);
            }
            "M104" => {
                if let Some(temp) = field(line, 'S') {
                    out.push(tool_action(TOOL_CMD_SET_TEMPERATURE, temp as u16));
                }
            }
            "M140" => {
                if let Some(temp) = field(line, 'S') {
                    out.push(tool_action(TOOL_CMD_SET_PLATFORM_TEMPERATURE, temp as u16));
                }
            }
            "M70" => {
                let message = line.splitn(2, ' ').nth(1).unwrap_or("");
                let mut p = Vec::with_capacity(6 + message.len());
                p.put_u8(CMD_DISPLAY_MESSAGE);
                p.put_u8(0); // options
                p.put_u8(0); // x
                p.put_u8(0); // y
                p.put_u8(0); // timeout
                p.put_slice(message.as_bytes());
                p.put_u8(0);
                out.push(p);
            }
            "M72" => {
                let song = field(line, 'S').unwrap_or(0.0) as u8;
                out.push(vec![CMD_QUEUE_SONG, song]);
            }
            "M73" => {
                let percent = field(line, 'P').unwrap_or(0.0).clamp(0.0, 100.0) as u8;
                out.push(vec![CMD_SET_BUILD_PERCENT, percent, 0]);
            }
            "M136" => {
                let name = line.splitn(2, ' ').nth(1).unwrap_or("print3d");
                let mut p = Vec::with_capacity(6 + name.len());
                p.put_u8(CMD_START_BUILD);
                p.put_u32_le(0);
                p.put_slice(name.as_bytes());
                p.put_u8(0);
                out.push(p);
            }
            "M137" => out.push(vec![CMD_END_BUILD]),
            _ => {}
        }
    }

    fn set_position(&mut self, line: &str) {
        if let Some(x) = field(line, 'X') {
            self.position[0] = (x * STEPS_PER_MM_XY) as i32;
        }
        if let Some(y) = field(line, 'Y') {
            self.position[1] = (y * STEPS_PER_MM_XY) as i32;
        }
        if let Some(z) = field(line, 'Z') {
            self.position[2] = (z * STEPS_PER_MM_Z) as i32;
        }
        if let Some(e) = field(line, 'E') {
            self.position[3] = (e * STEPS_PER_MM_E) as i32;
        }
    }

    fn queue_point(&mut self, line: &str) -> Vec<u8> {
        let old = self.position;
        self.set_position(line);
        if let Some(f) = field(line, 'F') {
            self.feedrate = f.max(1.0);
        }

        let distance_steps = self
            .position
            .iter()
            .zip(old.iter())
            .map(|(new, old)| (new - old).abs())
            .max()
            .unwrap_or(0);
        let distance_mm = distance_steps as f32 / STEPS_PER_MM_XY;

        // microseconds per step of the dominant axis
        let steps_per_second = (self.feedrate / 60.0 * STEPS_PER_MM_XY).max(1.0);
        let dda = (1_000_000.0 / steps_per_second) as u32;

        let mut p = Vec::with_capacity(32);
        p.put_u8(CMD_QUEUE_POINT_EXT);
        for axis in self.position {
            p.put_i32_le(axis);
        }
        p.put_u32_le(dda);
        p.put_u8(0); // all axes absolute
        p.put_f32_le(distance_mm);
        p.put_u16_le((self.feedrate * 64.0 / 60.0) as u16);
        p
    }
}

impl Translator for BasicTranslator {
    fn convert(&mut self, gcode: &str, out: &mut Vec<Vec<u8>>) -> usize {
        let before = out.len();
        for line in gcode.split('\n') {
            self.convert_line(line, out);
        }
        out.len() - before
    }

    fn reset(&mut self) {
        self.position = [0; 5];
        self.feedrate = DEFAULT_FEEDRATE;
    }
}

/// Looks up a `<letter><number>` word in a G-code line.
fn field(line: &str, letter: char) -> Option<f32> {
    let pos = line.find(letter)?;
    let rest = &line[pos + 1..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

fn tool_action(command: u8, value: u16) -> Vec<u8> {
    let mut p = Vec::with_capacity(6);
    p.put_u8(CMD_TOOL_ACTION);
    p.put_u8(0); // tool index
    p.put_u8(command);
    p.put_u8(2); // payload length
    p.put_u16_le(value);
    p
}
