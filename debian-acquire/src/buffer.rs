// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Double-buffered transfer primitives.

The HTTP worker moves bytes between the server socket, the destination
file, and the request queue through two fixed-size circular buffers. Each
buffer tracks monotonically increasing logical positions; the physical
index is the position modulo the capacity, so a single logical transfer may
span two contiguous segments.

The inbound buffer can carry an MD5 accumulator. It is fed only by the
drain path that writes entity bytes to the destination, never by header or
chunk-framing line pops, which keeps the digest over the logical body
alone.
*/

use {
    md5::{Digest, Md5},
    std::{
        io::{self, Write},
        time::Instant,
    },
    tokio::net::TcpStream,
};

/// Outcome of a non-blocking transfer against the ring.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transfer {
    /// No further progress possible right now: the endpoint would block, or
    /// the ring is full (reads) / drained (writes).
    Again,
    /// The remote end closed the connection.
    Closed,
}

/// Fixed-capacity circular byte buffer.
pub struct CircleBuf {
    buf: Box<[u8]>,
    in_pos: u64,
    out_pos: u64,
    out_queue: Vec<u8>,
    queue_pos: usize,
    max_get: u64,
    digest: Option<Md5>,
    started: Option<Instant>,
}

impl CircleBuf {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0; size].into_boxed_slice(),
            in_pos: 0,
            out_pos: 0,
            out_queue: Vec::new(),
            queue_pos: 0,
            max_get: u64::MAX,
            digest: None,
            started: None,
        }
    }

    /// Return to the pristine state, preserving whether a digest is kept.
    pub fn reset(&mut self) {
        self.in_pos = 0;
        self.out_pos = 0;
        self.out_queue.clear();
        self.queue_pos = 0;
        self.max_get = u64::MAX;
        if self.digest.is_some() {
            self.digest = Some(Md5::new());
        }
        self.started = None;
    }

    fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Bytes buffered and not yet drained.
    fn level(&self) -> u64 {
        self.in_pos - self.out_pos
    }

    /// Contiguous free room at the fill position.
    fn left_read(&self) -> usize {
        let phys = (self.in_pos % self.size()) as usize;
        let spare = (self.size() - self.level()) as usize;
        spare.min(self.buf.len() - phys)
    }

    /// Contiguous drainable bytes at the drain position, honoring the limit.
    fn left_write(&self) -> usize {
        let phys = (self.out_pos % self.size()) as usize;
        let mut avail = self.level();
        if self.max_get != u64::MAX {
            avail = avail.min(self.max_get.saturating_sub(self.out_pos));
        }
        (avail as usize).min(self.buf.len() - phys)
    }

    /// Whether the ring has unused capacity.
    pub fn read_space(&self) -> bool {
        self.level() < self.size()
    }

    /// Whether drainable bytes exist, buffered or still queued.
    pub fn write_space(&self) -> bool {
        self.level() > 0 || self.queue_pos < self.out_queue.len()
    }

    /// Allow draining `n` more bytes before the buffer reads as empty.
    pub fn limit(&mut self, n: u64) {
        self.max_get = self.out_pos + n;
    }

    pub fn unlimit(&mut self) {
        self.max_get = u64::MAX;
    }

    pub fn is_limit(&self) -> bool {
        self.out_pos == self.max_get
    }

    /// When the first byte arrived, for transfer statistics.
    pub fn start_time(&self) -> Option<Instant> {
        self.started
    }

    /// Attach a fresh MD5 accumulator, replacing any previous one.
    pub fn enable_digest(&mut self) {
        self.digest = Some(Md5::new());
    }

    /// Feed bytes that bypassed the ring, e.g. the resumed prefix on disk.
    pub fn feed_digest(&mut self, data: &[u8]) {
        if let Some(digest) = &mut self.digest {
            digest.update(data);
        }
    }

    /// Finalize and take the accumulated digest as lowercase hex.
    pub fn take_digest_hex(&mut self) -> Option<String> {
        self.digest.take().map(|d| hex::encode(d.finalize()))
    }

    /// Queue bytes for draining. As much as fits is copied into the ring
    /// immediately; the rest follows as the ring empties.
    pub fn enqueue(&mut self, data: &str) {
        self.out_queue.extend_from_slice(data.as_bytes());
        self.fill_from_queue();
    }

    fn fill_from_queue(&mut self) {
        while self.queue_pos < self.out_queue.len() {
            let room = self.left_read();
            if room == 0 {
                return;
            }
            let take = room.min(self.out_queue.len() - self.queue_pos);
            let phys = (self.in_pos % self.size()) as usize;
            self.buf[phys..phys + take]
                .copy_from_slice(&self.out_queue[self.queue_pos..self.queue_pos + take]);
            self.queue_pos += take;
            self.in_pos += take as u64;
        }
        self.out_queue.clear();
        self.queue_pos = 0;
    }

    /// Fill the ring from a non-blocking socket until the socket would
    /// block, the ring is full, or the peer closes.
    pub fn read_from(&mut self, socket: &TcpStream) -> io::Result<Transfer> {
        loop {
            if !self.read_space() {
                return Ok(Transfer::Again);
            }
            let phys = (self.in_pos % self.size()) as usize;
            let len = self.left_read();
            match socket.try_read(&mut self.buf[phys..phys + len]) {
                Ok(0) => return Ok(Transfer::Closed),
                Ok(n) => {
                    if self.in_pos == 0 {
                        self.started = Some(Instant::now());
                    }
                    self.in_pos += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Transfer::Again),
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain the ring to a non-blocking socket.
    pub fn write_to_socket(&mut self, socket: &TcpStream) -> io::Result<Transfer> {
        loop {
            self.fill_from_queue();
            let len = self.left_write();
            if len == 0 {
                // Drained, or the limit is reached.
                return Ok(Transfer::Again);
            }
            let phys = (self.out_pos % self.size()) as usize;
            match socket.try_write(&self.buf[phys..phys + len]) {
                Ok(0) => return Ok(Transfer::Closed),
                Ok(n) => {
                    if let Some(digest) = &mut self.digest {
                        digest.update(&self.buf[phys..phys + n]);
                    }
                    self.out_pos += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Transfer::Again),
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain the ring to a blocking writer (the destination file), stopping
    /// at the drain limit. Drained bytes feed the digest.
    pub fn drain_to<W: Write>(&mut self, sink: &mut W) -> io::Result<()> {
        loop {
            self.fill_from_queue();
            let len = self.left_write();
            if len == 0 {
                // Drained, or the limit is reached.
                return Ok(());
            }
            let phys = (self.out_pos % self.size()) as usize;
            let n = sink.write(&self.buf[phys..phys + len])?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            if let Some(digest) = &mut self.digest {
                digest.update(&self.buf[phys..phys + n]);
            }
            self.out_pos += n as u64;
        }
    }

    /// Pop buffered bytes up to and including a line terminator.
    ///
    /// With `single` set, pops one line; used for chunk size lines and
    /// trailers. Otherwise pops up to an *empty* line, i.e. a complete
    /// header block. Returns `None` until a full terminator is buffered.
    /// Popped bytes never feed the digest and ignore the drain limit.
    pub fn write_till_el(&mut self, single: bool) -> Option<String> {
        let size = self.size();
        let mut i = self.out_pos;
        while i < self.in_pos {
            if self.buf[(i % size) as usize] != b'\n' {
                i += 1;
                continue;
            }
            i += 1;
            while i < self.in_pos && self.buf[(i % size) as usize] == b'\r' {
                i += 1;
            }

            if !single {
                if i >= self.in_pos || self.buf[(i % size) as usize] != b'\n' {
                    continue;
                }
                i += 1;
                while i < self.in_pos && self.buf[(i % size) as usize] == b'\r' {
                    i += 1;
                }
            }

            let end = i.min(self.in_pos);
            let mut data = Vec::with_capacity((end - self.out_pos) as usize);
            while self.out_pos < end {
                let phys = (self.out_pos % size) as usize;
                let take = ((end - self.out_pos) as usize).min(self.buf.len() - phys);
                data.extend_from_slice(&self.buf[phys..phys + take]);
                self.out_pos += take as u64;
            }
            return Some(String::from_utf8_lossy(&data).into_owned());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buf: &mut CircleBuf) -> Vec<u8> {
        let mut out = Vec::new();
        buf.drain_to(&mut out).unwrap();
        out
    }

    #[test]
    fn test_enqueue_and_drain() {
        let mut buf = CircleBuf::new(64);
        assert!(!buf.write_space());
        buf.enqueue("hello");
        assert!(buf.write_space());
        assert!(buf.read_space());
        assert_eq!(drain(&mut buf), b"hello");
        assert!(!buf.write_space());
    }

    #[test]
    fn test_wrap_around() {
        // A ring smaller than the queued data exercises both segment copies
        // and the pending-queue spill.
        let mut buf = CircleBuf::new(8);
        buf.enqueue("abcdefghij");
        assert_eq!(drain(&mut buf), b"abcdefghij");
        buf.enqueue("0123456789");
        assert_eq!(drain(&mut buf), b"0123456789");
    }

    #[test]
    fn test_limit_stops_drain() {
        let mut buf = CircleBuf::new(64);
        buf.enqueue("hello world");
        buf.limit(5);
        assert_eq!(drain(&mut buf), b"hello");
        assert!(buf.is_limit());
        buf.unlimit();
        assert!(!buf.is_limit());
        assert_eq!(drain(&mut buf), b" world");
    }

    #[test]
    fn test_digest_covers_drained_bytes_only() {
        let mut buf = CircleBuf::new(64);
        buf.enable_digest();
        buf.enqueue("HTTP/1.1 200 OK\r\n\r\n");
        // Header pops must not touch the digest.
        assert!(buf.write_till_el(false).is_some());
        buf.enqueue("hello");
        let _ = drain(&mut buf);
        assert_eq!(
            buf.take_digest_hex().as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
    }

    #[test]
    fn test_digest_resume_prefix() {
        let mut buf = CircleBuf::new(64);
        buf.enable_digest();
        buf.feed_digest(b"hel");
        buf.enqueue("lo");
        let _ = drain(&mut buf);
        assert_eq!(
            buf.take_digest_hex().as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
    }

    #[test]
    fn test_write_till_el_header_block() {
        let mut buf = CircleBuf::new(256);
        buf.enqueue("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n");
        assert_eq!(buf.write_till_el(false), None);
        buf.enqueue("\r\nbody");
        let block = buf.write_till_el(false).unwrap();
        assert!(block.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(block.ends_with("\r\n\r\n"));
        // The body stays buffered.
        assert_eq!(drain(&mut buf), b"body");
    }

    #[test]
    fn test_write_till_el_single_line() {
        let mut buf = CircleBuf::new(64);
        buf.enqueue("5\r\nhello\r\n");
        assert_eq!(buf.write_till_el(true).unwrap(), "5\r\n");
        assert_eq!(drain(&mut buf), b"hello\r\n");
    }

    #[test]
    fn test_write_till_el_across_wrap() {
        let mut buf = CircleBuf::new(8);
        buf.enqueue("abc");
        assert_eq!(drain(&mut buf), b"abc");
        // The line now straddles the physical end of the ring.
        buf.enqueue("0123\r\n");
        assert_eq!(buf.write_till_el(true).unwrap(), "0123\r\n");
    }

    #[test]
    fn test_reset() {
        let mut buf = CircleBuf::new(16);
        buf.enable_digest();
        buf.enqueue("data");
        buf.limit(2);
        buf.reset();
        assert!(!buf.write_space());
        assert!(!buf.is_limit());
        // The digest restarts rather than disappearing.
        buf.enqueue("hello");
        let _ = drain(&mut buf);
        assert_eq!(
            buf.take_digest_hex().as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
    }
}
