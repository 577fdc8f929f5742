/* Bucketed FIFO of cleaned G-code text with chunk-append consistency
checks and bounded per-operation cost. */

use std::collections::VecDeque;
use tracing::{debug, trace};

/// Total capacity of the buffer in bytes; appends beyond this fail with
/// [`SetResult::BufferFull`].
pub const MAX_BUFFER_SIZE: usize = 3 * 1024 * 1024;
/// A bucket that has grown to this size no longer accepts chunks.
pub const MAX_BUCKET_SIZE: usize = 50 * 1024;
/// Appended text is split on the first newline past this offset. Without
/// the split, erase operations on multi-megabyte buckets would be
/// quadratic.
pub const BUFFER_SPLIT_SIZE: usize = 8 * 1024;

const GCODE_EXCERPT_LENGTH: usize = 10;

/// Optional consistency metadata for chunked appends. Once any field has
/// been seen it must be passed consistently with every subsequent append
/// until the buffer is cleared: sequence numbers increment by exactly one
/// and stay below the total, the total must not change, and the source
/// must be byte-identical each time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    pub seq_number: Option<i32>,
    pub seq_total: Option<i32>,
    pub source: Option<String>,
}

/// Outcome of [`GCodeBuffer::set`] / [`GCodeBuffer::append`]. The display
/// names travel over IPC all the way into client scripts, so they must
/// stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SetResult {
    #[display("ok")]
    Ok,
    #[display("buffer_full")]
    BufferFull,
    #[display("seq_num_missing")]
    SeqNumMissing,
    #[display("seq_num_mismatch")]
    SeqNumMismatch,
    #[display("seq_ttl_missing")]
    SeqTtlMissing,
    #[display("seq_ttl_mismatch")]
    SeqTtlMismatch,
    #[display("seq_src_missing")]
    SrcMissing,
    #[display("seq_src_mismatch")]
    SrcMismatch,
}

impl SetResult {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Ordered sequence of byte buckets holding cleaned G-code.
///
/// Invariants after every operation: no `\r`, no `;`-comments (except
/// `;@` macro comments when enabled), no empty lines, every bucket ends
/// in `\n`, and `buffer_size` equals the sum of all bucket lengths.
#[derive(Debug)]
pub struct GCodeBuffer {
    buckets: VecDeque<Vec<u8>>,
    current_line: i32,
    buffered_lines: i32,
    total_lines: i32,
    buffer_size: usize,
    sequence_last_seen: Option<i32>,
    sequence_total: Option<i32>,
    source: Option<String>,
    keep_macro_comments: bool,
}

impl Default for GCodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl GCodeBuffer {
    pub fn new() -> Self {
        Self {
            buckets: VecDeque::new(),
            current_line: 0,
            buffered_lines: 0,
            total_lines: 0,
            buffer_size: 0,
            sequence_last_seen: None,
            sequence_total: None,
            source: None,
            keep_macro_comments: false,
        }
    }

    /// When enabled, cleanup will not touch GPX macro comments (`;@...`).
    pub fn set_keep_macro_comments(&mut self, keep: bool) {
        self.keep_macro_comments = keep;
    }

    /// Replaces the buffer contents: `clear()` followed by `append()`.
    pub fn set(&mut self, gcode: &str, meta: Option<&Meta>) -> SetResult {
        self.clear();
        self.append(gcode, meta)
    }

    /// Appends `gcode` to the buffer, subject to the metadata consistency
    /// rules and the capacity limit. A rejected append leaves the buffer
    /// untouched.
    pub fn append(&mut self, gcode: &str, meta: Option<&Meta>) -> SetResult {
        let excerpt: String = gcode.chars().take(GCODE_EXCERPT_LENGTH).collect();
        trace!(
            len = gcode.len(),
            excerpt = %excerpt,
            size = self.buffer_size,
            lines = self.buffered_lines,
            "append"
        );

        if let Some(last_seen) = self.sequence_last_seen {
            let Some(seq) = meta.and_then(|m| m.seq_number) else {
                return SetResult::SeqNumMissing;
            };
            if last_seen + 1 != seq {
                return SetResult::SeqNumMismatch;
            }
        }

        if let Some(total) = self.sequence_total {
            let Some(seq_total) = meta.and_then(|m| m.seq_total) else {
                return SetResult::SeqTtlMissing;
            };
            if total != seq_total {
                return SetResult::SeqTtlMismatch;
            }
            let seq = meta.and_then(|m| m.seq_number).unwrap_or(-1);
            if seq + 1 > seq_total {
                return SetResult::SeqNumMismatch;
            }
        }

        if self.source.is_some() {
            let Some(src) = meta.and_then(|m| m.source.as_ref()) else {
                return SetResult::SrcMissing;
            };
            if self.source.as_ref() != Some(src) {
                return SetResult::SrcMismatch;
            }
        }

        if self.buffer_size + gcode.len() > MAX_BUFFER_SIZE {
            return SetResult::BufferFull;
        }

        if let Some(meta) = meta {
            self.sequence_last_seen = meta.seq_number;
            self.sequence_total = meta.seq_total;
            if self.source.is_none() && meta.source.is_some() {
                self.source = meta.source.clone();
            }
        }

        let mut count = 0;
        let mut start = 0;
        let bytes = gcode.as_bytes();
        while start < gcode.len() {
            let mut len = gcode.len() - start;
            let probe = start + BUFFER_SPLIT_SIZE;
            if probe < gcode.len() {
                if let Some(nl) = bytes[probe..].iter().position(|&b| b == b'\n') {
                    len = probe + nl + 1 - start;
                }
            }
            self.append_chunk(&gcode[start..start + len]);
            count += 1;
            start += len;
        }

        debug!(bytes = gcode.len(), chunks = count, "appended gcode");
        SetResult::Ok
    }

    /// Drops all buckets and counters, and unfreezes the metadata.
    pub fn clear(&mut self) {
        debug!("clear");
        self.buckets.clear();
        self.current_line = 0;
        self.buffered_lines = 0;
        self.total_lines = 0;
        self.buffer_size = 0;
        self.sequence_last_seen = None;
        self.sequence_total = None;
        self.source = None;
    }

    pub fn current_line(&self) -> i32 {
        self.current_line
    }

    pub fn buffered_lines(&self) -> i32 {
        self.buffered_lines
    }

    pub fn total_lines(&self) -> i32 {
        self.total_lines
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn max_buffer_size(&self) -> usize {
        MAX_BUFFER_SIZE
    }

    pub fn set_current_line(&mut self, line: i32) {
        self.current_line = line.min(self.total_lines);
    }

    /// Returns up to `amount` lines from the front bucket together with
    /// the number of lines actually included. Does not span buckets; the
    /// terminating newline of the last returned line is not included.
    pub fn next_lines(&self, amount: usize) -> (String, i32) {
        let Some(bucket) = self.buckets.front() else {
            return (String::new(), 0);
        };

        let mut pos = find_byte(bucket, 0, b'\n');
        let mut counter = i32::from(pos.is_some());

        if amount > 1 && pos.is_some() {
            for _ in 1..amount {
                match find_byte(bucket, pos.unwrap() + 1, b'\n') {
                    Some(p) => {
                        pos = Some(p);
                        counter += 1;
                    }
                    None => {
                        pos = None;
                        break;
                    }
                }
            }
            // account for an unterminated line at the end of the bucket
            if pos.is_none() && bucket.last() != Some(&b'\n') {
                counter += 1;
            }
        }

        let end = pos.unwrap_or(bucket.len());
        (String::from_utf8_lossy(&bucket[..end]).into_owned(), counter)
    }

    /// Convenience single-line variant of [`next_lines`](Self::next_lines).
    pub fn next_line(&self) -> Option<String> {
        let (line, count) = self.next_lines(1);
        (count > 0).then_some(line)
    }

    /// Removes up to `amount` lines from the front bucket, dropping the
    /// bucket when it runs empty. Returns the number of lines removed.
    pub fn erase_lines(&mut self, amount: usize) -> i32 {
        let Some(bucket) = self.buckets.front_mut() else {
            return 0;
        };

        let mut pos = find_byte(bucket, 0, b'\n');
        let mut counter = 1;

        if amount > 1 && pos.is_some() {
            for _ in 1..amount {
                match find_byte(bucket, pos.unwrap() + 1, b'\n') {
                    Some(p) => {
                        pos = Some(p);
                        counter += 1;
                    }
                    None => {
                        pos = None;
                        break;
                    }
                }
            }
            if pos.is_none() && bucket.last() != Some(&b'\n') {
                counter += 1;
            }
        }

        let before = bucket.len();
        match pos {
            Some(p) => drop(bucket.drain(..=p)),
            None => bucket.clear(),
        }
        self.buffer_size -= before - bucket.len();

        if bucket.is_empty() {
            self.buckets.pop_front();
        }
        self.buffered_lines -= counter;

        counter
    }

    pub fn erase_line(&mut self) -> i32 {
        self.erase_lines(1)
    }

    fn append_chunk(&mut self, chunk: &str) {
        if self
            .buckets
            .back()
            .is_none_or(|b| b.len() >= MAX_BUCKET_SIZE)
        {
            self.buckets.push_back(Vec::new());
        }
        let bucket = self.buckets.back_mut().unwrap();

        let pos = bucket.len();
        bucket.extend_from_slice(chunk.as_bytes());
        cleanup_gcode(bucket, pos, self.keep_macro_comments);

        let mut added = bucket[pos..].iter().filter(|&&b| b == b'\n').count() as i32;
        if !bucket.is_empty() && bucket.last() != Some(&b'\n') {
            added += 1;
        }
        self.buffered_lines += added;
        self.total_lines += added;
        if self.current_line > self.total_lines {
            self.current_line = self.total_lines;
        }

        if bucket.is_empty() {
            self.buckets.pop_back();
        }
        self.buffer_size = self.buckets.iter().map(Vec::len).sum();
    }
}

fn find_byte(buf: &[u8], from: usize, needle: u8) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..].iter().position(|&b| b == needle).map(|p| from + p)
}

/// Normalizes the bucket region starting at `pos`: maps `\r` to `\n`,
/// strips `;`-comments (keeping `;@` macro comments when requested),
/// collapses newline runs, drops a leading empty line and terminates the
/// bucket with a newline.
fn cleanup_gcode(buf: &mut Vec<u8>, pos: usize, keep_macro_comments: bool) {
    for b in &mut buf[pos..] {
        if *b == b'\r' {
            *b = b'\n';
        }
    }

    let mut p = pos;
    while let Some(comment) = find_byte(buf, p, b';') {
        if keep_macro_comments && comment + 1 < buf.len() && buf[comment + 1] == b'@' {
            p = comment + 1;
            continue;
        }
        match find_byte(buf, comment, b'\n') {
            Some(end) => drop(buf.drain(comment..end)),
            None => buf.truncate(comment),
        }
        if buf.is_empty() {
            return;
        }
        p = pos;
    }

    // start one byte early so a double newline across the region boundary
    // is caught as well
    let mut p = pos.saturating_sub(1);
    while p + 1 < buf.len() {
        if buf[p] == b'\n' && buf[p + 1] == b'\n' {
            buf.remove(p + 1);
        } else {
            p += 1;
        }
    }

    if buf.first() == Some(&b'\n') {
        buf.remove(0);
    }

    if !buf.is_empty() && buf.last() != Some(&b'\n') {
        buf.push(b'\n');
    }
}
