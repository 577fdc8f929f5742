/* IPC message framing shared between the server and its clients, plus the
socket path convention and serial device discovery. */

use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt::Display;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;

/// Unix socket paths are derived from the device id, so one server per
/// printer can coexist with others.
pub const SOCKET_PATH_PREFIX: &str = "/tmp/print3d-";

#[cfg(target_os = "macos")]
pub const DEFAULT_DEVICE_ID: &str = "tty.usbmodem1a21";
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_DEVICE_ID: &str = "ttyACM0";

const HEADER_SIZE: usize = 4;
const ARG_HEADER_SIZE: usize = 4;

/// Transaction flag bits carried by the optional second argument of
/// [`RequestCode::GcodeAppend`]. When the flag word is absent, both bits
/// are implied and each append is a complete transaction by itself.
pub const TRX_FIRST_CHUNK_BIT: u16 = 0x01;
pub const TRX_LAST_CHUNK_BIT: u16 = 0x02;

/// Request commands sent by clients. Codes below 0x200 are requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[repr(u16)]
pub enum RequestCode {
    #[display("test")]
    Test = 0x01,
    #[display("getTemperature")]
    GetTemperature = 0x11,
    #[display("gcodeClear")]
    GcodeClear = 0x12,
    #[display("gcodeAppend")]
    GcodeAppend = 0x13,
    #[display("gcodeAppendFile")]
    GcodeAppendFile = 0x14,
    #[display("gcodeStartPrint")]
    GcodeStartPrint = 0x15,
    #[display("gcodeStopPrint")]
    GcodeStopPrint = 0x16,
    #[display("heatup")]
    Heatup = 0x17,
    #[display("getProgress")]
    GetProgress = 0x18,
    #[display("getState")]
    GetState = 0x19,
}

impl TryFrom<u16> for RequestCode {
    type Error = Error;

    fn try_from(code: u16) -> Result<Self> {
        match code {
            0x01 => Ok(Self::Test),
            0x11 => Ok(Self::GetTemperature),
            0x12 => Ok(Self::GcodeClear),
            0x13 => Ok(Self::GcodeAppend),
            0x14 => Ok(Self::GcodeAppendFile),
            0x15 => Ok(Self::GcodeStartPrint),
            0x16 => Ok(Self::GcodeStopPrint),
            0x17 => Ok(Self::Heatup),
            0x18 => Ok(Self::GetProgress),
            0x19 => Ok(Self::GetState),
            other => Err(Error::InvalidParams(format!(
                "unknown request code 0x{:x}",
                other
            ))),
        }
    }
}

/// Reply commands sent by the server. Codes at or above 0x200 are replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[repr(u16)]
pub enum ReplyCode {
    #[display("ok")]
    Ok = 0x201,
    #[display("error")]
    Error = 0x202,
    #[display("not_implemented")]
    NotImplemented = 0x203,
    #[display("gcode_add_failed")]
    GcodeAddFailed = 0x204,
    #[display("retry_later")]
    RetryLater = 0x205,
    #[display("trx_cancelled")]
    TrxCancelled = 0x206,
}

/// Selector argument of [`RequestCode::GetTemperature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureSelector {
    Hotend,
    HotendTarget,
    Bed,
    BedTarget,
    Heating,
}

impl TryFrom<i16> for TemperatureSelector {
    type Error = Error;

    fn try_from(v: i16) -> Result<Self> {
        match v {
            0 => Ok(Self::Hotend),
            1 => Ok(Self::HotendTarget),
            2 => Ok(Self::Bed),
            3 => Ok(Self::BedTarget),
            4 => Ok(Self::Heating),
            _ => Err(Error::InvalidParams(
                "unknown temperature parameter value".to_string(),
            )),
        }
    }
}

/// Incremental encoder for one IPC message.
///
/// The wire layout is `[u16 code][u16 argCount]` followed by
/// `[u32 argLen][argLen bytes]` per argument, all multi-byte integers in
/// network byte order.
#[derive(Debug)]
pub struct FrameBuilder {
    buf: BytesMut,
}

impl FrameBuilder {
    pub fn new(code: u16) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(code);
        buf.put_u16(0);
        Self { buf }
    }

    pub fn reply(code: ReplyCode) -> Self {
        Self::new(code as u16)
    }

    pub fn request(code: RequestCode) -> Self {
        Self::new(code as u16)
    }

    fn bump_arg_count(&mut self) {
        let n = u16::from_be_bytes([self.buf[2], self.buf[3]]);
        self.buf[2..4].copy_from_slice(&(n + 1).to_be_bytes());
    }

    pub fn arg_blob(mut self, arg: &[u8]) -> Self {
        self.buf.put_u32(arg.len() as u32);
        self.buf.put_slice(arg);
        self.bump_arg_count();
        self
    }

    pub fn arg_str(self, arg: &str) -> Self {
        self.arg_blob(arg.as_bytes())
    }

    pub fn arg_i16(mut self, arg: i16) -> Self {
        self.buf.put_u32(2);
        self.buf.put_i16(arg);
        self.bump_arg_count();
        self
    }

    pub fn arg_i32(mut self, arg: i32) -> Self {
        self.buf.put_u32(4);
        self.buf.put_i32(arg);
        self.bump_arg_count();
        self
    }

    pub fn finish(self) -> BytesMut {
        self.buf
    }
}

/// A decoded IPC message: the command code plus raw argument slices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    code: u16,
    args: Vec<Vec<u8>>,
}

impl Frame {
    /// Parses the first message in `buf`, which must hold at least one
    /// complete message (see [`is_complete`]).
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let len = is_complete(buf);
        if len == 0 {
            return Err(Error::MalformedFrame(
                "incomplete message".to_string(),
            ));
        }

        let mut p = &buf[..len];
        let code = p.get_u16();
        let argc = p.get_u16() as usize;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            let arglen = p.get_u32() as usize;
            args.push(p[..arglen].to_vec());
            p.advance(arglen);
        }

        Ok(Self { code, args })
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    fn arg(&self, idx: usize) -> Result<&[u8]> {
        self.args
            .get(idx)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::MalformedFrame(format!("no argument {}", idx)))
    }

    pub fn blob_arg(&self, idx: usize) -> Result<&[u8]> {
        self.arg(idx)
    }

    pub fn str_arg(&self, idx: usize) -> Result<&str> {
        std::str::from_utf8(self.arg(idx)?)
            .map_err(|e| Error::MalformedFrame(format!("argument {} is not UTF-8: {}", idx, e)))
    }

    pub fn i16_arg(&self, idx: usize) -> Result<i16> {
        let arg = self.arg(idx)?;
        if arg.len() != 2 {
            return Err(Error::MalformedFrame(format!(
                "argument {} has length {}, expected 2",
                idx,
                arg.len()
            )));
        }
        Ok(i16::from_be_bytes([arg[0], arg[1]]))
    }

    pub fn i32_arg(&self, idx: usize) -> Result<i32> {
        let arg = self.arg(idx)?;
        if arg.len() != 4 {
            return Err(Error::MalformedFrame(format!(
                "argument {} has length {}, expected 4",
                idx,
                arg.len()
            )));
        }
        Ok(i32::from_be_bytes([arg[0], arg[1], arg[2], arg[3]]))
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[0x{:x}", self.code)?;
        for arg in &self.args {
            match arg.len() {
                2 => write!(f, ":s{}", i16::from_be_bytes([arg[0], arg[1]]))?,
                4 => write!(
                    f,
                    ":l{}",
                    i32::from_be_bytes([arg[0], arg[1], arg[2], arg[3]])
                )?,
                n if n <= 15 => write!(f, ":\"{}\"", String::from_utf8_lossy(arg))?,
                n => write!(f, ":#{}", n)?,
            }
        }
        write!(f, "]")
    }
}

/// Returns the byte length of the first complete message in `buf`, or 0
/// if the buffer does not (yet) hold a complete message.
pub fn is_complete(buf: &[u8]) -> usize {
    if buf.len() < HEADER_SIZE {
        return 0;
    }

    let mut args_left = u16::from_be_bytes([buf[2], buf[3]]);
    let mut p = HEADER_SIZE;
    while args_left > 0 {
        if buf.len() < p + ARG_HEADER_SIZE {
            return 0;
        }
        let arglen =
            u32::from_be_bytes([buf[p], buf[p + 1], buf[p + 2], buf[p + 3]]) as usize;
        if buf.len() < p + ARG_HEADER_SIZE + arglen {
            return 0;
        }
        p += ARG_HEADER_SIZE + arglen;
        args_left -= 1;
    }

    p
}

/// Truncates the first complete message from the front of `buf`. Returns
/// true when a message was removed.
pub fn remove_first(buf: &mut BytesMut) -> bool {
    let len = is_complete(buf);
    if len == 0 {
        return false;
    }
    buf.advance(len);
    true
}

/// Returns the socket path a server for `device_id` listens on.
pub fn socket_path(device_id: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", SOCKET_PATH_PREFIX, device_id))
}

#[cfg(target_os = "macos")]
const DEVICE_NAME_PREFIXES: &[&str] = &["tty.usbmodem", "tty.usbserial-"];
#[cfg(not(target_os = "macos"))]
const DEVICE_NAME_PREFIXES: &[&str] = &["ttyACM", "ttyUSB"];

/// Enumerates `/dev` character devices that look like printer serial
/// ports. The returned names are sorted and unique, without the `/dev/`
/// prefix.
pub fn find_devices() -> std::io::Result<Vec<String>> {
    let mut result = Vec::new();
    for entry in std::fs::read_dir("/dev")? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !DEVICE_NAME_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        if entry.file_type()?.is_char_device() {
            result.push(name.to_string());
        }
    }
    result.sort();
    result.dedup();
    Ok(result)
}
