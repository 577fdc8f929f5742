//! Drives a running server over its unix socket the way a client
//! library would: connect, issue commands, check the framed replies.

use print3d::driver;
use print3d::ipc::{self, Frame, FrameBuilder, ReplyCode, RequestCode};
use print3d::server::Server;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

fn connect_with_retry(id: &str) -> UnixStream {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match UnixStream::connect(ipc::socket_path(id)) {
            Ok(stream) => return stream,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Err(e) => panic!("could not connect to server socket: {}", e),
        }
    }
}

fn read_replies(stream: &mut UnixStream, count: usize) -> Vec<Frame> {
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();

    let mut frames = Vec::new();
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    let deadline = Instant::now() + Duration::from_secs(2);
    while frames.len() < count {
        while ipc::is_complete(&buf) == 0 {
            match stream.read(&mut chunk) {
                Ok(0) => panic!("server closed the connection"),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(ref e)
                    if e.kind() == ErrorKind::WouldBlock
                        || e.kind() == ErrorKind::TimedOut => {}
                Err(e) => panic!("read failed: {}", e),
            }
            assert!(Instant::now() < deadline, "no reply from server");
        }
        let len = ipc::is_complete(&buf);
        frames.push(Frame::parse(&buf).unwrap());
        buf.drain(..len);
    }
    frames
}

fn read_reply(stream: &mut UnixStream) -> Frame {
    read_replies(stream, 1).pop().unwrap()
}

fn transact(stream: &mut UnixStream, request: &[u8]) -> Frame {
    stream.write_all(request).unwrap();
    read_reply(stream)
}

#[test]
fn command_session() {
    let id = "test-session";
    let _ = std::fs::remove_file(ipc::socket_path(id));

    // /dev/null is not a tty, so the driver stays disconnected and the
    // server serves pure IPC traffic
    let printer_driver = driver::create_driver("prusa_i3", "/dev/null", 250_000).unwrap();
    let mut server = Server::bind(id, printer_driver).unwrap();
    let shutdown = server.shutdown_flag();

    let handle = thread::spawn(move || server.run().unwrap());

    let mut stream = connect_with_retry(id);

    // test echo
    let reply = transact(
        &mut stream,
        &FrameBuilder::request(RequestCode::Test)
            .arg_str("ping")
            .finish(),
    );
    assert_eq!(reply.code(), ReplyCode::Ok as u16);
    assert!(reply.str_arg(0).unwrap().contains("ping"));

    // append a two-line job and check the reported progress
    let reply = transact(
        &mut stream,
        &FrameBuilder::request(RequestCode::GcodeAppend)
            .arg_blob(b"G1 X10\nG1 Y10\n")
            .finish(),
    );
    assert_eq!(reply.code(), ReplyCode::Ok as u16);

    let reply = transact(
        &mut stream,
        &FrameBuilder::request(RequestCode::GetProgress).finish(),
    );
    assert_eq!(reply.code(), ReplyCode::Ok as u16);
    assert_eq!(reply.arg_count(), 5);
    assert_eq!(reply.i32_arg(0).unwrap(), 0);
    assert_eq!(reply.i32_arg(1).unwrap(), 2);
    assert_eq!(reply.i32_arg(2).unwrap(), 2);
    assert_eq!(reply.i32_arg(3).unwrap(), 14);

    // two frames in one write are answered in order
    let mut batch = Vec::new();
    batch.extend_from_slice(&FrameBuilder::request(RequestCode::GetState).finish());
    batch.extend_from_slice(
        &FrameBuilder::request(RequestCode::GetTemperature)
            .arg_i16(0)
            .finish(),
    );
    stream.write_all(&batch).unwrap();
    let replies = read_replies(&mut stream, 2);
    assert_eq!(replies[0].str_arg(0).unwrap(), "disconnected");
    assert_eq!(replies[1].i16_arg(0).unwrap(), 0);

    // ask the server to stop; a fresh connection wakes its poll loop
    shutdown.store(true, Ordering::Relaxed);
    let _waker = connect_with_retry(id);

    assert_eq!(handle.join().unwrap(), 0);
}

#[test]
fn sequence_violations_are_rejected_atomically() {
    let id = "test-sequence";
    let _ = std::fs::remove_file(ipc::socket_path(id));

    let printer_driver = driver::create_driver("ultimaker", "/dev/null", 250_000).unwrap();
    let mut server = Server::bind(id, printer_driver).unwrap();
    let shutdown = server.shutdown_flag();
    let handle = thread::spawn(move || server.run().unwrap());

    let mut stream = connect_with_retry(id);
    let seq_append = |num: i32, payload: &[u8]| {
        FrameBuilder::request(RequestCode::GcodeAppend)
            .arg_blob(payload)
            .arg_i16(0x03) // first and last chunk
            .arg_i32(num)
            .arg_i32(3)
            .finish()
    };

    for (num, payload) in [b"A\n", b"B\n", b"C\n"].iter().enumerate() {
        let reply = transact(&mut stream, &seq_append(num as i32, *payload));
        assert_eq!(reply.code(), ReplyCode::Ok as u16);
    }

    // the announced total is exhausted
    let reply = transact(&mut stream, &seq_append(3, b"D\n"));
    assert_eq!(reply.code(), ReplyCode::GcodeAddFailed as u16);
    assert_eq!(reply.str_arg(0).unwrap(), "seq_num_mismatch");

    // the rejected append left the counters untouched
    let reply = transact(
        &mut stream,
        &FrameBuilder::request(RequestCode::GetProgress).finish(),
    );
    assert_eq!(reply.i32_arg(2).unwrap(), 3);

    shutdown.store(true, Ordering::Relaxed);
    let _waker = connect_with_retry(id);
    assert_eq!(handle.join().unwrap(), 0);
}
