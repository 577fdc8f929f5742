/* Command dispatcher: routes complete IPC frames from a client to the
driver and writes the reply. */

use crate::driver::Driver;
use crate::gcode::Meta;
use crate::ipc::{
    Frame, FrameBuilder, ReplyCode, RequestCode, TemperatureSelector, TRX_FIRST_CHUNK_BIT,
    TRX_LAST_CHUNK_BIT,
};
use crate::server::client::Client;
use crate::{Error, Result};
use mio::Token;
use std::path::Path;
use tracing::{debug, error, trace};

/// Marks every *other* client's transaction as cancelled. The owners
/// observe the flag on their next append.
pub(crate) fn cancel_all_transactions(clients: &mut [(Token, Client)], except: Token) {
    debug!(?except, clients = clients.len(), "cancelling all transactions");
    for (token, client) in clients.iter_mut() {
        if *token == except {
            continue;
        }
        client.transaction.cancelled = true;
    }
}

/// Runs one complete frame for the client identified by `token`. Usage
/// errors turn into an `Error` reply; everything else is handled by the
/// individual command handlers.
pub(crate) fn run_command(
    driver: &mut Box<dyn Driver>,
    clients: &mut Vec<(Token, Client)>,
    token: Token,
    frame: &Frame,
) {
    let Some(idx) = clients.iter().position(|(t, _)| *t == token) else {
        return;
    };

    let code = match RequestCode::try_from(frame.code()) {
        Ok(code) => code,
        Err(_) => {
            error!(code = frame.code(), "unknown command code");
            clients[idx].1.send_error("unknown command");
            return;
        }
    };
    trace!(%code, args = frame.arg_count(), "command");

    let result = match code {
        RequestCode::Test => hnd_test(&mut clients[idx].1, frame),
        RequestCode::GetTemperature => hnd_get_temperature(driver, &mut clients[idx].1, frame),
        RequestCode::GcodeClear => hnd_gcode_clear(driver, clients, idx, token),
        RequestCode::GcodeAppend => hnd_gcode_append(driver, &mut clients[idx].1, frame),
        RequestCode::GcodeAppendFile => hnd_gcode_append_file(driver, &mut clients[idx].1, frame),
        RequestCode::GcodeStartPrint => hnd_gcode_start_print(driver, &mut clients[idx].1),
        RequestCode::GcodeStopPrint => hnd_gcode_stop_print(driver, clients, idx, token, frame),
        RequestCode::Heatup => hnd_heatup(driver, &mut clients[idx].1, frame),
        RequestCode::GetProgress => hnd_get_progress(driver, &mut clients[idx].1),
        RequestCode::GetState => hnd_get_state(driver, &mut clients[idx].1),
    };

    if let Err(e) = result {
        error!(%code, "command failed: {}", e);
        clients[idx].1.send_error(&e.to_string());
    }
}

fn hnd_test(client: &mut Client, frame: &Frame) -> Result<()> {
    let answer = if frame.arg_count() > 0 {
        format!(
            "printserver test answer to the question: '{}'",
            frame.str_arg(0)?
        )
    } else {
        "printserver test answer without question".to_string()
    };

    client.send_reply(ReplyCode::Ok, Some(&answer));
    Ok(())
}

fn hnd_get_temperature(
    driver: &mut Box<dyn Driver>,
    client: &mut Client,
    frame: &Frame,
) -> Result<()> {
    if frame.arg_count() == 0 {
        return Err(Error::InvalidParams("missing argument".to_string()));
    }

    let selector = TemperatureSelector::try_from(frame.i16_arg(0)?)?;
    let core = driver.core();
    let temperature = match selector {
        TemperatureSelector::Hotend => core.temperature() as i16,
        TemperatureSelector::HotendTarget => core.target_temperature() as i16,
        TemperatureSelector::Bed => core.bed_temperature() as i16,
        TemperatureSelector::BedTarget => core.target_bed_temperature() as i16,
        TemperatureSelector::Heating => i16::from(core.is_heating()),
    };

    client.send_data(
        &FrameBuilder::reply(ReplyCode::Ok)
            .arg_i16(temperature)
            .finish(),
    );
    Ok(())
}

fn hnd_gcode_clear(
    driver: &mut Box<dyn Driver>,
    clients: &mut [(Token, Client)],
    idx: usize,
    token: Token,
) -> Result<()> {
    cancel_all_transactions(clients, token);
    driver.clear_gcode();
    clients[idx].1.send_ok();
    Ok(())
}

fn hnd_gcode_append(
    driver: &mut Box<dyn Driver>,
    client: &mut Client,
    frame: &Frame,
) -> Result<()> {
    if client.transaction.cancelled {
        // another client forced a reset; the partial buffer is discarded
        // and the owner is told once
        client.transaction.reset();
        client.send_reply(ReplyCode::TrxCancelled, Some("transaction cancelled"));
        return Ok(());
    }

    if frame.arg_count() == 0 {
        return Err(Error::InvalidParams("missing argument".to_string()));
    }

    // each append defaults to a self-contained transaction
    let flags = if frame.arg_count() >= 2 {
        frame.i16_arg(1)? as u16
    } else {
        TRX_FIRST_CHUNK_BIT | TRX_LAST_CHUNK_BIT
    };

    let mut meta = Meta::default();
    if frame.arg_count() >= 3 {
        meta.seq_number = Some(frame.i32_arg(2)?);
    }
    if frame.arg_count() >= 4 {
        meta.seq_total = Some(frame.i32_arg(3)?);
    }
    if frame.arg_count() >= 5 {
        meta.source = Some(frame.str_arg(4)?.to_string());
    }

    let payload = frame.blob_arg(0)?;
    trace!(
        len = payload.len(),
        flags,
        seq_num = ?meta.seq_number,
        seq_ttl = ?meta.seq_total,
        src = ?meta.source,
        "append gcode chunk"
    );

    if let Some(blob) = client.transaction.push_chunk(flags, payload) {
        let gcode = String::from_utf8_lossy(&blob);
        let result = driver.append_gcode(&gcode, Some(&meta));
        if !result.is_ok() {
            client.send_reply(ReplyCode::GcodeAddFailed, Some(&result.to_string()));
            return Ok(());
        }
    }

    client.send_ok();
    Ok(())
}

fn hnd_gcode_append_file(
    driver: &mut Box<dyn Driver>,
    client: &mut Client,
    frame: &Frame,
) -> Result<()> {
    if frame.arg_count() == 0 {
        return Err(Error::InvalidParams("missing argument".to_string()));
    }

    if client.transaction.active {
        client.send_reply(ReplyCode::RetryLater, Some("transaction in progress"));
        return Ok(());
    }

    let filename = frame.str_arg(0)?;
    if !Path::new(filename).is_absolute() {
        return Err(Error::InvalidParams(format!(
            "'{}' is not an absolute path",
            filename
        )));
    }
    debug!(filename, "append gcode from file");

    let gcode = std::fs::read_to_string(filename)?;
    let result = driver.append_gcode(&gcode, None);
    if !result.is_ok() {
        client.send_reply(ReplyCode::GcodeAddFailed, Some(&result.to_string()));
        return Ok(());
    }

    client.send_ok();
    Ok(())
}

fn hnd_gcode_start_print(driver: &mut Box<dyn Driver>, client: &mut Client) -> Result<()> {
    debug!("start print");
    driver.start_print();
    client.send_ok();
    Ok(())
}

fn hnd_gcode_stop_print(
    driver: &mut Box<dyn Driver>,
    clients: &mut [(Token, Client)],
    idx: usize,
    token: Token,
    frame: &Frame,
) -> Result<()> {
    debug!("stop print");

    // no other gcode transfer may continue after the stop code is set
    cancel_all_transactions(clients, token);

    let end_code = if frame.arg_count() > 0 {
        frame.str_arg(0)?.to_string()
    } else {
        String::new()
    };
    driver.stop_print(&end_code);

    clients[idx].1.send_ok();
    Ok(())
}

fn hnd_heatup(driver: &mut Box<dyn Driver>, client: &mut Client, frame: &Frame) -> Result<()> {
    if frame.arg_count() == 0 {
        return Err(Error::InvalidParams("missing argument".to_string()));
    }

    let temperature = frame.i16_arg(0)?;
    debug!(temperature, "heatup");
    driver.heatup(temperature);
    client.send_ok();
    Ok(())
}

fn hnd_get_progress(driver: &mut Box<dyn Driver>, client: &mut Client) -> Result<()> {
    let core = driver.core();
    client.send_data(
        &FrameBuilder::reply(ReplyCode::Ok)
            .arg_i32(core.current_line())
            .arg_i32(core.buffered_lines())
            .arg_i32(core.total_lines())
            .arg_i32(core.buffer_size() as i32)
            .arg_i32(core.max_buffer_size() as i32)
            .finish(),
    );
    Ok(())
}

fn hnd_get_state(driver: &mut Box<dyn Driver>, client: &mut Client) -> Result<()> {
    let state = driver.core().state().to_string();
    client.send_data(
        &FrameBuilder::reply(ReplyCode::Ok)
            .arg_str(&state)
            .finish(),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{self, DriverState};
    use crate::ipc;
    use mio::net::UnixStream;
    use std::io::Read;

    struct Harness {
        driver: Box<dyn Driver>,
        clients: Vec<(Token, Client)>,
        peers: Vec<UnixStream>,
    }

    impl Harness {
        fn new(num_clients: usize) -> Self {
            let mut clients = Vec::new();
            let mut peers = Vec::new();
            for i in 0..num_clients {
                let (server_end, client_end) = UnixStream::pair().unwrap();
                clients.push((Token(2 + i), Client::new(server_end)));
                peers.push(client_end);
            }
            Self {
                driver: driver::create_driver("ultimaker2", "/dev/null", 250_000).unwrap(),
                clients,
                peers,
            }
        }

        fn run(&mut self, client: usize, frame_bytes: &[u8]) {
            let frame = Frame::parse(frame_bytes).unwrap();
            run_command(
                &mut self.driver,
                &mut self.clients,
                Token(2 + client),
                &frame,
            );
        }

        /// Reads the single reply frame the last command produced.
        fn reply(&mut self, client: usize) -> Frame {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                match self.peers[client].read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("peer read failed: {}", e),
                }
                if ipc::is_complete(&buf) > 0 {
                    break;
                }
            }
            assert!(ipc::is_complete(&buf) > 0, "no complete reply");
            let frame = Frame::parse(&buf).unwrap();
            assert_eq!(ipc::is_complete(&buf), buf.len(), "more than one reply");
            frame
        }
    }

    fn append_frame(payload: &[u8], flags: Option<u16>) -> Vec<u8> {
        let mut builder = FrameBuilder::request(RequestCode::GcodeAppend).arg_blob(payload);
        if let Some(flags) = flags {
            builder = builder.arg_i16(flags as i16);
        }
        builder.finish().to_vec()
    }

    #[test]
    fn single_chunk_append_and_progress() {
        let mut h = Harness::new(1);

        h.run(0, &append_frame(b"G1 X10\nG1 Y10\n", None));
        assert_eq!(h.reply(0).code(), ReplyCode::Ok as u16);

        let progress = FrameBuilder::request(RequestCode::GetProgress).finish();
        h.run(0, &progress);
        let reply = h.reply(0);
        assert_eq!(reply.code(), ReplyCode::Ok as u16);
        assert_eq!(reply.i32_arg(0).unwrap(), 0); // current
        assert_eq!(reply.i32_arg(1).unwrap(), 2); // buffered
        assert_eq!(reply.i32_arg(2).unwrap(), 2); // total
        assert_eq!(reply.i32_arg(3).unwrap(), 14); // bytes
        assert_eq!(
            reply.i32_arg(4).unwrap(),
            crate::gcode::MAX_BUFFER_SIZE as i32
        );
    }

    #[test]
    fn sequenced_appends_enforce_discipline() {
        let mut h = Harness::new(1);
        let seq_frame = |payload: &[u8], num: i32| {
            FrameBuilder::request(RequestCode::GcodeAppend)
                .arg_blob(payload)
                .arg_i16((TRX_FIRST_CHUNK_BIT | TRX_LAST_CHUNK_BIT) as i16)
                .arg_i32(num)
                .arg_i32(3)
                .finish()
                .to_vec()
        };

        for (i, payload) in [b"A\n", b"B\n", b"C\n"].iter().enumerate() {
            h.run(0, &seq_frame(*payload, i as i32));
            assert_eq!(h.reply(0).code(), ReplyCode::Ok as u16);
        }
        assert_eq!(h.driver.core().total_lines(), 3);

        // a fourth chunk overruns the announced total
        h.run(0, &seq_frame(b"D\n", 3));
        let reply = h.reply(0);
        assert_eq!(reply.code(), ReplyCode::GcodeAddFailed as u16);
        assert_eq!(reply.str_arg(0).unwrap(), "seq_num_mismatch");
    }

    #[test]
    fn cross_client_cancellation() {
        let mut h = Harness::new(2);

        // client A starts a chunked transaction
        h.run(0, &append_frame(b"abc", Some(TRX_FIRST_CHUNK_BIT)));
        assert_eq!(h.reply(0).code(), ReplyCode::Ok as u16);

        // client B stops the print, cancelling everyone else
        let stop = FrameBuilder::request(RequestCode::GcodeStopPrint)
            .arg_str("")
            .finish();
        h.run(1, &stop);
        assert_eq!(h.reply(1).code(), ReplyCode::Ok as u16);

        // client A's next chunk bounces and its partial data is gone
        h.run(0, &append_frame(b"def", Some(TRX_LAST_CHUNK_BIT)));
        assert_eq!(h.reply(0).code(), ReplyCode::TrxCancelled as u16);
        assert!(h.clients[0].1.transaction.buffer.is_empty());
        assert!(!h.clients[0].1.transaction.cancelled);

        // and the one after that goes through again
        h.run(0, &append_frame(b"G1 X0\n", None));
        assert_eq!(h.reply(0).code(), ReplyCode::Ok as u16);
    }

    #[test]
    fn append_file_conflicts_with_active_transaction() {
        let mut h = Harness::new(1);

        h.run(0, &append_frame(b"abc", Some(TRX_FIRST_CHUNK_BIT)));
        h.reply(0);

        let file = FrameBuilder::request(RequestCode::GcodeAppendFile)
            .arg_str("/tmp/whatever.gcode")
            .finish();
        h.run(0, &file);
        assert_eq!(h.reply(0).code(), ReplyCode::RetryLater as u16);
    }

    #[test]
    fn append_file_reads_gcode() {
        let mut h = Harness::new(1);

        let mut path = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write as _;
        write!(path, "G1 X1\nG1 X2 ; comment\n").unwrap();

        let file = FrameBuilder::request(RequestCode::GcodeAppendFile)
            .arg_str(path.path().to_str().unwrap())
            .finish();
        h.run(0, &file);
        assert_eq!(h.reply(0).code(), ReplyCode::Ok as u16);
        assert_eq!(h.driver.core().total_lines(), 2);

        let relative = FrameBuilder::request(RequestCode::GcodeAppendFile)
            .arg_str("not/absolute.gcode")
            .finish();
        h.run(0, &relative);
        assert_eq!(h.reply(0).code(), ReplyCode::Error as u16);
    }

    #[test]
    fn get_state_and_temperature_replies() {
        let mut h = Harness::new(1);

        let state = FrameBuilder::request(RequestCode::GetState).finish();
        h.run(0, &state);
        let reply = h.reply(0);
        assert_eq!(reply.code(), ReplyCode::Ok as u16);
        assert_eq!(reply.str_arg(0).unwrap(), "disconnected");

        let temp = FrameBuilder::request(RequestCode::GetTemperature)
            .arg_i16(0)
            .finish();
        h.run(0, &temp);
        let reply = h.reply(0);
        assert_eq!(reply.code(), ReplyCode::Ok as u16);
        assert_eq!(reply.i16_arg(0).unwrap(), 0);

        // unknown selector is a usage error
        let bad = FrameBuilder::request(RequestCode::GetTemperature)
            .arg_i16(9)
            .finish();
        h.run(0, &bad);
        assert_eq!(h.reply(0).code(), ReplyCode::Error as u16);

        // missing argument as well
        let missing = FrameBuilder::request(RequestCode::GetTemperature).finish();
        h.run(0, &missing);
        assert_eq!(h.reply(0).code(), ReplyCode::Error as u16);
    }

    #[test]
    fn test_command_echoes_question() {
        let mut h = Harness::new(1);

        let ask = FrameBuilder::request(RequestCode::Test)
            .arg_str("anyone there?")
            .finish();
        h.run(0, &ask);
        let reply = h.reply(0);
        assert_eq!(reply.code(), ReplyCode::Ok as u16);
        assert!(reply.str_arg(0).unwrap().contains("anyone there?"));
    }

    #[test]
    fn clear_resets_buffer_and_cancels_others() {
        let mut h = Harness::new(2);

        h.run(0, &append_frame(b"G1 X0\n", None));
        h.reply(0);
        h.run(1, &append_frame(b"abc", Some(TRX_FIRST_CHUNK_BIT)));
        h.reply(1);

        let clear = FrameBuilder::request(RequestCode::GcodeClear).finish();
        h.run(0, &clear);
        assert_eq!(h.reply(0).code(), ReplyCode::Ok as u16);
        assert_eq!(h.driver.core().total_lines(), 0);
        assert!(h.clients[1].1.transaction.cancelled);
        // the issuing client keeps its own transaction
        assert!(!h.clients[0].1.transaction.cancelled);
    }

    #[test]
    fn unknown_state_never_reached_by_buffering() {
        let mut h = Harness::new(1);
        // not online: appends buffer but do not change state
        h.run(0, &append_frame(b"G1 X0\n", None));
        h.reply(0);
        assert_eq!(h.driver.core().state(), DriverState::Disconnected);

        let start = FrameBuilder::request(RequestCode::GcodeStartPrint).finish();
        h.run(0, &start);
        assert_eq!(h.reply(0).code(), ReplyCode::Ok as u16);
        // still offline: no state skip to printing
        assert_eq!(h.driver.core().state(), DriverState::Disconnected);
    }
}
