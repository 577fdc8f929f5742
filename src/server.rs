/* The event loop: one unix listener, any number of clients and the
printer's serial descriptor multiplexed through a single mio poll, with
the driver ticked in between at its requested cadence. */

use crate::driver::Driver;
use crate::ipc;
use crate::{Error, Result};
use mio::net::UnixListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

pub(crate) mod client;
mod handler;

use client::Client;

const LISTENER: Token = Token(0);
const SERIAL: Token = Token(1);
const FIRST_CLIENT_TOKEN: usize = 2;

/// The print server: accepts client connections on a per-device unix
/// socket and relays commands to the single printer driver it owns.
pub struct Server {
    poll: Poll,
    listener: UnixListener,
    socket_path: PathBuf,
    driver: Box<dyn Driver>,
    clients: Vec<(Token, Client)>,
    next_token: usize,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Binds the socket for `device_id`, unlinking a stale socket file
    /// from an earlier run. A leftover path that is not a socket is an
    /// error rather than something to delete.
    pub fn bind(device_id: &str, driver: Box<dyn Driver>) -> Result<Self> {
        let socket_path = ipc::socket_path(device_id);

        match std::fs::metadata(&socket_path) {
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Ok(meta) if meta.file_type().is_socket() => {
                debug!(path = %socket_path.display(), "removing stale socket");
                std::fs::remove_file(&socket_path)?;
            }
            Ok(_) => {
                return Err(Error::InvalidParams(format!(
                    "'{}' exists and is not a socket",
                    socket_path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        }

        let poll = Poll::new()?;
        let mut listener = UnixListener::bind(&socket_path)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            socket_path,
            driver,
            clients: Vec::new(),
            next_token: FIRST_CLIENT_TOKEN,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag checked on every loop iteration; set it from a signal
    /// handler for an orderly shutdown.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Runs the event loop until a shutdown is requested. Returns the
    /// process exit code.
    pub fn run(&mut self) -> Result<i32> {
        info!(path = %self.socket_path.display(), "starting print server");

        if let Err(e) = self.driver.open() {
            error!("could not open printer connection: {}", e);
        }
        if let Some(fd) = self.driver.serial_fd() {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), SERIAL, Interest::READABLE)?;
        }

        let mut events = Events::with_capacity(128);
        let mut timeout = Some(Duration::ZERO);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("termination requested, shutting down");
                self.teardown();
                return Ok(0);
            }

            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                // a signal interrupted the wait; re-check the flag
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let mut accept = false;
            let mut pending = Vec::new();
            for event in events.iter() {
                match event.token() {
                    LISTENER => accept = true,
                    // serial data is consumed inside driver.update()
                    SERIAL => {}
                    token => pending.push(token),
                }
            }

            if accept {
                self.accept_clients();
            }
            for token in pending {
                self.service_client(token);
            }
            self.reap_closed_clients();

            timeout = self.driver.update();
            if let Some(rv) = self.driver.core().exit_request() {
                error!(rv, "driver requested exit");
                self.teardown();
                return Ok(rv);
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        error!("could not register client: {}", e);
                        continue;
                    }

                    debug!(?token, "client connected");
                    self.clients.push((token, Client::new(stream)));
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn service_client(&mut self, token: Token) {
        let Some(idx) = self.clients.iter().position(|(t, _)| *t == token) else {
            return;
        };

        let read = self.clients[idx].1.read_available();
        if read > 0 {
            trace!(?token, bytes = read, "read from client");
        } else if self.clients[idx].1.is_closed()
            && !self.clients[idx].1.transaction.buffer.is_empty()
        {
            warn!(?token, "client closed with a transaction in progress");
        }

        // a client that closed with residual bytes still gets its final
        // frames processed before teardown
        loop {
            let Some(idx) = self.clients.iter().position(|(t, _)| *t == token) else {
                return;
            };
            let Some(frame) = self.clients[idx].1.take_frame() else {
                break;
            };
            trace!(%frame, "dispatch");
            handler::run_command(&mut self.driver, &mut self.clients, token, &frame);
        }
    }

    fn reap_closed_clients(&mut self) {
        let mut i = self.clients.len();
        while i != 0 {
            i -= 1;
            if self.clients[i].1.is_closed() {
                let (token, mut client) = self.clients.swap_remove(i);
                debug!(?token, "client disconnected");
                if let Err(e) = self.poll.registry().deregister(client.stream_mut()) {
                    warn!("could not deregister client: {}", e);
                }
            }
        }
    }

    fn teardown(&mut self) {
        self.driver.close();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!("could not remove socket file: {}", e);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver;
    use crate::ipc::{Frame, FrameBuilder, ReplyCode, RequestCode};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream as StdUnixStream;

    fn test_server(device_id: &str) -> Server {
        let driver = driver::create_driver("ultimaker2", "/dev/null", 250_000).unwrap();
        Server::bind(device_id, driver).unwrap()
    }

    #[test]
    fn bind_replaces_stale_socket() {
        let id = "test-stale";
        let path = ipc::socket_path(id);
        let _ = std::fs::remove_file(&path);

        // leave a stale socket file behind, the way a crashed server
        // would (std listeners do not unlink their path on drop)
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let _server = test_server(id);
        assert!(path.exists());
    }

    #[test]
    fn bind_refuses_non_socket_path() {
        let id = "test-nonsock";
        let path = ipc::socket_path(id);
        std::fs::write(&path, b"not a socket").unwrap();

        let driver = driver::create_driver("ultimaker2", "/dev/null", 250_000).unwrap();
        assert!(Server::bind(id, driver).is_err());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn client_roundtrip_over_the_socket() {
        let id = "test-roundtrip";
        let _ = std::fs::remove_file(ipc::socket_path(id));
        let mut server = test_server(id);

        let mut peer = StdUnixStream::connect(ipc::socket_path(id)).unwrap();
        peer.write_all(
            &FrameBuilder::request(RequestCode::GetState).finish(),
        )
        .unwrap();

        // drive the loop by hand: accept, then service the new client
        let mut events = Events::with_capacity(8);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while server.clients.is_empty() && std::time::Instant::now() < deadline {
            server
                .poll
                .poll(&mut events, Some(Duration::from_millis(10)))
                .unwrap();
            server.accept_clients();
        }
        assert_eq!(server.clients.len(), 1);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let token = server.clients[0].0;
        loop {
            server.service_client(token);
            peer.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
            let mut buf = [0u8; 256];
            match peer.read(&mut buf) {
                Ok(n) if n > 0 => {
                    let frame = Frame::parse(&buf[..n]).unwrap();
                    assert_eq!(frame.code(), ReplyCode::Ok as u16);
                    assert_eq!(frame.str_arg(0).unwrap(), "disconnected");
                    break;
                }
                _ => {}
            }
            assert!(std::time::Instant::now() < deadline, "no reply");
        }
    }
}
