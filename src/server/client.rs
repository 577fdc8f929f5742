/* Per-connection state: the socket, the frame read buffer and the
chunked-append transaction. */

use crate::ipc::{self, Frame, FrameBuilder, ReplyCode, TRX_FIRST_CHUNK_BIT, TRX_LAST_CHUNK_BIT};
use bytes::BytesMut;
use mio::net::UnixStream;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::time::Duration;
use tracing::{trace, warn};

const READ_CHUNK_SIZE: usize = 1024;

/// How long a reply write may stall on a full kernel buffer before the
/// client is given up on.
const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// A chunked G-code append in progress. The chunks of one transaction
/// are accumulated here and handed to the driver as a single blob when
/// the last chunk arrives.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub buffer: Vec<u8>,
    pub active: bool,
    pub cancelled: bool,
}

impl Transaction {
    /// Folds one append chunk into the transaction. Returns the complete
    /// blob once the last chunk has been seen.
    pub fn push_chunk(&mut self, flags: u16, payload: &[u8]) -> Option<Vec<u8>> {
        if flags & TRX_FIRST_CHUNK_BIT != 0 {
            self.buffer.clear();
            self.active = true;
        }

        self.buffer.extend_from_slice(payload);

        if flags & TRX_LAST_CHUNK_BIT != 0 {
            self.active = false;
            return Some(std::mem::take(&mut self.buffer));
        }
        None
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One connected IPC client. Owned by the event loop from accept until
/// close; none of its state outlives the connection.
pub(crate) struct Client {
    stream: UnixStream,
    read_buf: BytesMut,
    pub transaction: Transaction,
    closed: bool,
}

impl Client {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            transaction: Transaction::default(),
            closed: false,
        }
    }

    pub fn stream_mut(&mut self) -> &mut UnixStream {
        &mut self.stream
    }

    /// A closed client is destroyed by the event loop once its buffered
    /// frames have been processed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drains everything currently readable into the frame buffer.
    /// Returns the number of bytes read.
    pub fn read_available(&mut self) -> usize {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut total = 0;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("cannot read from client: {}", e);
                    self.closed = true;
                    break;
                }
            }
        }
        total
    }

    /// Pops the next complete frame from the read buffer, if any.
    pub fn take_frame(&mut self) -> Option<Frame> {
        if ipc::is_complete(&self.read_buf) == 0 {
            return None;
        }
        let frame = Frame::parse(&self.read_buf).ok();
        ipc::remove_first(&mut self.read_buf);
        frame
    }

    /// Writes a complete reply frame. The stream is non-blocking, so a
    /// short write must be resumed until every byte is out; a dropped
    /// tail would desynchronize the length-prefixed stream. SIGPIPE is
    /// ignored process-wide, so writes to a vanished client fail locally
    /// and the client is discarded.
    pub fn send_data(&mut self, data: &[u8]) {
        let mut written = 0;
        while written < data.len() {
            match self.stream.write(&data[written..]) {
                Ok(0) => {
                    warn!(sent = written, len = data.len(), "client stopped accepting data");
                    self.closed = true;
                    return;
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    if !self.wait_writable(WRITE_STALL_TIMEOUT) {
                        warn!(
                            sent = written,
                            len = data.len(),
                            "write to client stalled, dropping connection"
                        );
                        self.closed = true;
                        return;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("could not send to client: {}", e);
                    self.closed = true;
                    return;
                }
            }
        }
        trace!(len = data.len(), "sent reply");
    }

    /// Waits for the socket to accept more data, up to `timeout`.
    fn wait_writable(&self, timeout: Duration) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.stream.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        let rv = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        rv > 0 && (pfd.revents & libc::POLLOUT) != 0
    }

    pub fn send_reply(&mut self, code: ReplyCode, message: Option<&str>) {
        let builder = FrameBuilder::reply(code);
        let frame = match message {
            Some(msg) => builder.arg_str(msg),
            None => builder,
        };
        self.send_data(&frame.finish());
    }

    pub fn send_ok(&mut self) {
        self.send_reply(ReplyCode::Ok, None);
    }

    pub fn send_error(&mut self, message: &str) {
        self.send_reply(ReplyCode::Error, Some(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_transaction_completes_immediately() {
        let mut trx = Transaction::default();
        let blob = trx.push_chunk(TRX_FIRST_CHUNK_BIT | TRX_LAST_CHUNK_BIT, b"G1 X0\n");
        assert_eq!(blob.as_deref(), Some(b"G1 X0\n".as_slice()));
        assert!(!trx.active);
        assert!(trx.buffer.is_empty());
    }

    #[test]
    fn chunks_accumulate_until_last() {
        let mut trx = Transaction::default();

        assert_eq!(trx.push_chunk(TRX_FIRST_CHUNK_BIT, b"abc"), None);
        assert!(trx.active);
        assert_eq!(trx.push_chunk(0, b"def"), None);
        let blob = trx.push_chunk(TRX_LAST_CHUNK_BIT, b"ghi");
        assert_eq!(blob.as_deref(), Some(b"abcdefghi".as_slice()));
        assert!(!trx.active);
    }

    #[test]
    fn first_chunk_discards_previous_partial() {
        let mut trx = Transaction::default();
        trx.push_chunk(TRX_FIRST_CHUNK_BIT, b"old");
        let blob = trx.push_chunk(TRX_FIRST_CHUNK_BIT | TRX_LAST_CHUNK_BIT, b"new");
        assert_eq!(blob.as_deref(), Some(b"new".as_slice()));
    }

    #[test]
    fn reset_discards_everything() {
        let mut trx = Transaction::default();
        trx.push_chunk(TRX_FIRST_CHUNK_BIT, b"partial");
        trx.cancelled = true;

        trx.reset();
        assert!(trx.buffer.is_empty());
        assert!(!trx.active);
        assert!(!trx.cancelled);
    }

    #[test]
    fn large_reply_is_written_completely() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut client = Client::new(a);

        // well past the kernel socket buffer, forcing short writes
        let frame = FrameBuilder::new(0x201)
            .arg_blob(&vec![0x42u8; 512 * 1024])
            .finish();
        let expected = frame.len();

        let reader = std::thread::spawn(move || {
            let mut chunk = [0u8; 4096];
            let mut total = 0;
            while total < expected {
                match b.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => panic!("peer read failed: {}", e),
                }
            }
            total
        });

        client.send_data(&frame);
        assert!(!client.is_closed());
        assert_eq!(reader.join().unwrap(), expected);
    }

    #[test]
    fn frames_pop_in_order_from_the_read_buffer() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut client = Client::new(a);

        client
            .read_buf
            .extend_from_slice(&FrameBuilder::new(0x12).finish());
        client
            .read_buf
            .extend_from_slice(&FrameBuilder::new(0x19).finish());
        // plus a partial frame that must stay queued
        client.read_buf.extend_from_slice(&[0x00, 0x15]);

        assert_eq!(client.take_frame().unwrap().code(), 0x12);
        assert_eq!(client.take_frame().unwrap().code(), 0x19);
        assert!(client.take_frame().is_none());
        assert_eq!(&client.read_buf[..], &[0x00, 0x15]);
    }
}
