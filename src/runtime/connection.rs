//! Per-connection state: buffers, scatter/gather reply assembly, and the
//! freelist of reusable connection shells.
//!
//! Reply fragments are descriptors naming their backing allocation (the
//! write buffer, an owned reply, a static byte string, or an item held in
//! `ilist`); they are materialized into `IoSlice`s only inside
//! [`Connection::transmit`], so item memory stays pinned until the vectored
//! send drains.

use std::collections::TryReserveError;
use std::io::{self, IoSlice, Write};
use std::sync::Mutex;

use mio::net::TcpStream;
use mio::Interest;
use tracing::debug;

use crate::item::Item;
use crate::stats::Stats;

pub const DATA_BUFFER_SIZE: usize = 2048;
pub const READ_BUFFER_HIGHWAT: usize = 8192;
pub const ITEM_LIST_INITIAL: usize = 200;
pub const ITEM_LIST_HIGHWAT: usize = 400;
pub const IOV_LIST_INITIAL: usize = 400;
pub const IOV_LIST_HIGHWAT: usize = 600;
pub const MSG_LIST_INITIAL: usize = 10;
pub const MSG_LIST_HIGHWAT: usize = 20;

/// Ceiling on the first message of a TCP reply; keeps the opening payload
/// within one MTU-sized datagram.
pub const MAX_PAYLOAD_SIZE: usize = 1400;

/// Fragment count ceiling per message header.
pub const IOV_MAX: usize = 1024;

/// Connection state machine states. The listening socket is owned by the
/// reactor rather than a connection, so accepting lives there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for or parsing command lines.
    Read,
    /// Reading a `set`/`append` body into the pending item.
    NRead,
    /// Discarding a body whose item could not be allocated.
    Swallow,
    /// Sending a one-line reply from `wbuf` or an owned buffer.
    Write,
    /// Sending a multi-fragment `get` reply.
    MWrite,
    /// Tear the connection down.
    Closing,
}

/// Which update command owns the pending item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Set,
    Append,
}

/// Backing allocation of a reply fragment.
#[derive(Debug, Clone, Copy)]
pub enum FragBuf {
    Static(&'static [u8]),
    /// The connection's `wbuf`.
    WBuf,
    /// The `write_and_free` owned reply buffer.
    Owned,
    /// Key bytes of `ilist[idx]`.
    ItemKey(usize),
    /// Suffix-plus-data of `ilist[idx]`.
    ItemBody(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct Frag {
    pub src: FragBuf,
    pub off: usize,
    pub len: usize,
}

/// One message header: a window of `iovlen` fragments starting at `start`.
#[derive(Debug, Clone, Copy)]
pub struct Msg {
    pub start: usize,
    pub iovlen: usize,
}

/// Result of one `transmit` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmit {
    Complete,
    Incomplete,
    SoftError,
    HardError,
}

pub struct Connection {
    pub(crate) stream: TcpStream,
    pub(crate) remote: Option<String>,
    pub(crate) state: State,

    pub(crate) rbuf: Vec<u8>,
    pub(crate) rcurr: usize,
    pub(crate) rbytes: usize,

    pub(crate) wbuf: Vec<u8>,
    pub(crate) wcurr: usize,
    pub(crate) wbytes: usize,

    pub(crate) frags: Vec<Frag>,
    pub(crate) msgs: Vec<Msg>,
    pub(crate) msgcurr: usize,
    /// Bytes in the message currently being built.
    pub(crate) msgbytes: usize,

    pub(crate) ilist: Vec<Item>,
    pub(crate) icurr: usize,

    pub(crate) pending: Option<(Item, UpdateKind)>,
    /// Fill offset into the pending item's payload.
    pub(crate) ritem: usize,
    /// Payload bytes still to read into the pending item.
    pub(crate) rlbytes: usize,
    /// Bytes still to discard in `Swallow`.
    pub(crate) sbytes: usize,

    pub(crate) write_and_go: State,
    pub(crate) write_and_free: Option<Vec<u8>>,
    pub(crate) noreply: bool,

    /// Readiness interest wanted from the reactor after the current drive.
    pub(crate) interest: Interest,
}

impl Connection {
    pub fn new(stream: TcpStream, shell: Option<ConnShell>) -> Connection {
        let remote = stream.peer_addr().ok().map(|a| a.to_string());
        let shell = shell.unwrap_or_default();
        let mut conn = Connection {
            stream,
            remote,
            state: State::Read,
            rbuf: shell.rbuf,
            rcurr: 0,
            rbytes: 0,
            wbuf: shell.wbuf,
            wcurr: 0,
            wbytes: 0,
            frags: shell.frags,
            msgs: shell.msgs,
            msgcurr: 0,
            msgbytes: 0,
            ilist: shell.ilist,
            icurr: 0,
            pending: None,
            ritem: 0,
            rlbytes: 0,
            sbytes: 0,
            write_and_go: State::Read,
            write_and_free: None,
            noreply: false,
            interest: Interest::READABLE,
        };
        conn.frags.clear();
        conn.msgs.clear();
        conn.ilist.clear();
        conn
    }

    /// Items still owned past the released prefix.
    pub fn ileft(&self) -> usize {
        self.ilist.len() - self.icurr
    }

    pub fn iovused(&self) -> usize {
        self.frags.len()
    }

    pub fn set_state(&mut self, state: State) {
        if state != self.state {
            if state == State::Read {
                self.shrink();
            }
            self.state = state;
        }
    }

    /// Shrink buffers that ballooned past their high-water marks. Called
    /// between requests only, since it repositions the read cursor.
    fn shrink(&mut self) {
        if self.rbuf.len() > READ_BUFFER_HIGHWAT && self.rbytes < DATA_BUFFER_SIZE {
            if self.rcurr != 0 {
                self.rbuf
                    .copy_within(self.rcurr..self.rcurr + self.rbytes, 0);
                self.rcurr = 0;
            }
            self.rbuf.truncate(DATA_BUFFER_SIZE);
            self.rbuf.shrink_to(DATA_BUFFER_SIZE);
        }
        if self.ilist.capacity() > ITEM_LIST_HIGHWAT {
            self.ilist.shrink_to(ITEM_LIST_INITIAL);
        }
        if self.msgs.capacity() > MSG_LIST_HIGHWAT {
            self.msgs.shrink_to(MSG_LIST_INITIAL);
        }
        if self.frags.capacity() > IOV_LIST_HIGHWAT {
            self.frags.shrink_to(IOV_LIST_INITIAL);
        }
    }

    /// Double the read buffer. On allocator refusal the caller replies
    /// `SERVER_ERROR` and closes.
    pub fn grow_rbuf(&mut self) -> Result<(), TryReserveError> {
        let len = self.rbuf.len();
        self.rbuf.try_reserve_exact(len)?;
        self.rbuf.resize(len * 2, 0);
        Ok(())
    }

    pub fn reserve_ilist(&mut self) -> Result<(), TryReserveError> {
        self.ilist.try_reserve(1)
    }

    /// Start a new message header; subsequent fragments land in it.
    pub fn add_msghdr(&mut self) -> Result<(), TryReserveError> {
        self.msgs.try_reserve(1)?;
        self.msgs.push(Msg {
            start: self.frags.len(),
            iovlen: 0,
        });
        self.msgbytes = 0;
        Ok(())
    }

    /// Append a reply fragment, splitting across message headers when the
    /// current one is full (`IOV_MAX`) or, for the first message of a reply,
    /// when it would push the payload past [`MAX_PAYLOAD_SIZE`].
    pub fn add_iov(&mut self, src: FragBuf, off: usize, len: usize) -> Result<(), TryReserveError> {
        if self.msgs.is_empty() {
            self.add_msghdr()?;
        }
        let mut off = off;
        let mut len = len;
        loop {
            let limit_to_mtu = self.msgs.len() == 1;

            let full = {
                let m = self.msgs[self.msgs.len() - 1];
                m.iovlen == IOV_MAX || (limit_to_mtu && self.msgbytes >= MAX_PAYLOAD_SIZE)
            };
            if full {
                self.add_msghdr()?;
            }

            self.frags.try_reserve(1)?;

            let leftover = if limit_to_mtu && len + self.msgbytes > MAX_PAYLOAD_SIZE {
                len + self.msgbytes - MAX_PAYLOAD_SIZE
            } else {
                0
            };
            let take = len - leftover;

            self.frags.push(Frag { src, off, len: take });
            self.msgbytes += take;
            let last = self.msgs.len() - 1;
            self.msgs[last].iovlen += 1;

            off += take;
            len = leftover;
            if leftover == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Queue a one-line reply. Honors `noreply` by sending nothing and
    /// returning straight to `Read`.
    pub fn out_string(&mut self, reply: &str) {
        if self.noreply {
            self.noreply = false;
            self.set_state(State::Read);
            return;
        }

        let mut bytes = reply.as_bytes();
        if bytes.len() + 2 > self.wbuf.len() {
            bytes = b"SERVER_ERROR output line too long";
        }
        self.wbuf[..bytes.len()].copy_from_slice(bytes);
        self.wbuf[bytes.len()..bytes.len() + 2].copy_from_slice(b"\r\n");
        self.wbytes = bytes.len() + 2;
        self.wcurr = 0;

        self.set_state(State::Write);
        self.write_and_go = State::Read;
    }

    /// Queue an owned reply buffer, released once its bytes are sent. Used
    /// for replies too large for `wbuf` (stats).
    pub fn out_owned(&mut self, buf: Vec<u8>) {
        if self.noreply {
            self.noreply = false;
            self.set_state(State::Read);
            return;
        }
        self.wbytes = buf.len();
        self.wcurr = 0;
        self.write_and_free = Some(buf);
        self.set_state(State::Write);
        self.write_and_go = State::Read;
    }

    /// Drop a partially built reply: fragments, message headers, and any
    /// items pinned for it.
    pub fn reset_reply(&mut self) {
        self.frags.clear();
        self.msgs.clear();
        self.msgcurr = 0;
        self.msgbytes = 0;
        self.release_items();
    }

    /// Release every item still pinned by reply fragments.
    pub fn release_items(&mut self) {
        self.ilist.clear();
        self.icurr = 0;
    }

    fn resolve_frag(&self, frag: &Frag) -> &[u8] {
        let buf: &[u8] = match frag.src {
            FragBuf::Static(s) => s,
            FragBuf::WBuf => &self.wbuf,
            FragBuf::Owned => self.write_and_free.as_deref().unwrap_or(&[]),
            FragBuf::ItemKey(i) => self.ilist[i].key(),
            FragBuf::ItemBody(i) => self.ilist[i].suffix_and_data(),
        };
        &buf[frag.off..frag.off + frag.len]
    }

    /// Send the next chunk of the current message with a vectored write.
    pub fn transmit(&mut self, stats: &Stats) -> Transmit {
        if self.msgcurr < self.msgs.len() && self.msgs[self.msgcurr].iovlen == 0 {
            self.msgcurr += 1;
        }
        if self.msgcurr >= self.msgs.len() {
            return Transmit::Complete;
        }

        let msg = self.msgs[self.msgcurr];
        let mut slices = Vec::with_capacity(msg.iovlen);
        for frag in &self.frags[msg.start..msg.start + msg.iovlen] {
            slices.push(IoSlice::new(self.resolve_frag(frag)));
        }

        let mut stream = &self.stream;
        let res = stream.write_vectored(&slices);
        drop(slices);

        match res {
            Ok(0) => {
                debug!(remote = ?self.remote, "write returned zero");
                self.set_state(State::Closing);
                Transmit::HardError
            }
            Ok(n) => {
                stats
                    .bytes_written
                    .fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
                self.advance_msg(n);
                Transmit::Incomplete
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.interest = Interest::WRITABLE;
                Transmit::SoftError
            }
            Err(e) => {
                debug!(remote = ?self.remote, error = %e, "failed to write");
                self.set_state(State::Closing);
                Transmit::HardError
            }
        }
    }

    /// Trim `n` sent bytes off the head of the current message, adjusting
    /// the boundary fragment in place.
    fn advance_msg(&mut self, mut n: usize) {
        let msg = &mut self.msgs[self.msgcurr];
        while msg.iovlen > 0 && n >= self.frags[msg.start].len {
            n -= self.frags[msg.start].len;
            msg.start += 1;
            msg.iovlen -= 1;
        }
        if n > 0 {
            debug_assert!(msg.iovlen > 0);
            let frag = &mut self.frags[msg.start];
            debug_assert!(n < frag.len);
            frag.off += n;
            frag.len -= n;
        }
    }

    /// Recover the buffer allocations for pooling, unless the read buffer
    /// grew past the high-water mark.
    pub fn into_shell(mut self) -> Option<ConnShell> {
        if self.rbuf.len() > READ_BUFFER_HIGHWAT {
            return None;
        }
        self.frags.clear();
        self.msgs.clear();
        self.ilist.clear();
        Some(ConnShell {
            rbuf: self.rbuf,
            wbuf: self.wbuf,
            frags: self.frags,
            msgs: self.msgs,
            ilist: self.ilist,
        })
    }
}

/// The reusable allocations of a connection.
pub struct ConnShell {
    rbuf: Vec<u8>,
    wbuf: Vec<u8>,
    frags: Vec<Frag>,
    msgs: Vec<Msg>,
    ilist: Vec<Item>,
}

impl Default for ConnShell {
    fn default() -> Self {
        ConnShell {
            rbuf: vec![0; DATA_BUFFER_SIZE],
            wbuf: vec![0; DATA_BUFFER_SIZE],
            frags: Vec::with_capacity(IOV_LIST_INITIAL),
            msgs: Vec::with_capacity(MSG_LIST_INITIAL),
            ilist: Vec::with_capacity(ITEM_LIST_INITIAL),
        }
    }
}

/// Freelist of connection shells shared by all workers. Amortizes allocator
/// churn under connection turnover; capacity 0 disables pooling.
pub struct ConnPool {
    shells: Mutex<Vec<ConnShell>>,
    cap: usize,
}

impl ConnPool {
    pub fn new(cap: usize) -> ConnPool {
        ConnPool {
            shells: Mutex::new(Vec::new()),
            cap,
        }
    }

    pub fn take(&self) -> Option<ConnShell> {
        self.shells.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    /// Return a shell to the pool; drops it when the pool is full or
    /// disabled.
    pub fn put(&self, shell: ConnShell) {
        let mut shells = self.shells.lock().unwrap_or_else(|e| e.into_inner());
        if shells.len() < self.cap {
            shells.push(shell);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> (Connection, std::net::TcpStream) {
        test_support::conn_pair()
    }

    fn total_iovlen(conn: &Connection) -> usize {
        conn.msgs.iter().map(|m| m.iovlen).sum()
    }

    #[test]
    fn test_add_iov_first_message_respects_mtu() {
        let (mut conn, _client) = test_conn();
        conn.add_msghdr().unwrap();

        static BIG: [u8; 5000] = [b'x'; 5000];
        conn.add_iov(FragBuf::Static(&BIG), 0, BIG.len()).unwrap();

        assert!(conn.msgs.len() >= 2);
        let first = conn.msgs[0];
        let first_bytes: usize = conn.frags[first.start..first.start + first.iovlen]
            .iter()
            .map(|f| f.len)
            .sum();
        assert!(first_bytes <= MAX_PAYLOAD_SIZE);
        assert_eq!(conn.iovused(), total_iovlen(&conn));

        let total: usize = conn.frags.iter().map(|f| f.len).sum();
        assert_eq!(total, BIG.len());
    }

    #[test]
    fn test_add_iov_caps_fragments_per_message() {
        let (mut conn, _client) = test_conn();
        conn.add_msghdr().unwrap();

        for _ in 0..IOV_MAX + 10 {
            conn.add_iov(FragBuf::Static(b"a"), 0, 1).unwrap();
        }

        assert_eq!(conn.iovused(), IOV_MAX + 10);
        assert_eq!(conn.iovused(), total_iovlen(&conn));
        for msg in &conn.msgs {
            assert!(msg.iovlen <= IOV_MAX);
        }
        assert_eq!(conn.msgs[0].iovlen, IOV_MAX);
    }

    #[test]
    fn test_out_string_too_long() {
        let (mut conn, _client) = test_conn();
        let long = "x".repeat(DATA_BUFFER_SIZE);
        conn.out_string(&long);
        assert_eq!(
            &conn.wbuf[..conn.wbytes],
            b"SERVER_ERROR output line too long\r\n"
        );
        assert_eq!(conn.state, State::Write);
    }

    #[test]
    fn test_out_string_noreply_suppresses_reply() {
        let (mut conn, _client) = test_conn();
        conn.state = State::NRead;
        conn.noreply = true;
        conn.out_string("STORED");
        assert!(!conn.noreply);
        assert_eq!(conn.state, State::Read);
        assert_eq!(conn.wbytes, 0);
        assert!(conn.frags.is_empty());
    }

    #[test]
    fn test_shrink_on_read_transition() {
        let (mut conn, _client) = test_conn();
        while conn.rbuf.len() <= READ_BUFFER_HIGHWAT {
            conn.grow_rbuf().unwrap();
        }
        // Leave a little residual data behind the cursor.
        conn.rbuf[100..104].copy_from_slice(b"rest");
        conn.rcurr = 100;
        conn.rbytes = 4;

        conn.state = State::Write;
        conn.set_state(State::Read);

        assert_eq!(conn.rbuf.len(), DATA_BUFFER_SIZE);
        assert_eq!(conn.rcurr, 0);
        assert_eq!(&conn.rbuf[..4], b"rest");
    }

    #[test]
    fn test_advance_msg_partial_fragment() {
        let (mut conn, _client) = test_conn();
        conn.add_msghdr().unwrap();
        conn.add_iov(FragBuf::Static(b"hello"), 0, 5).unwrap();
        conn.add_iov(FragBuf::Static(b"world"), 0, 5).unwrap();

        conn.msgcurr = 0;
        conn.advance_msg(7);
        let msg = conn.msgs[0];
        assert_eq!(msg.iovlen, 1);
        let frag = conn.frags[msg.start];
        assert_eq!(frag.off, 2);
        assert_eq!(frag.len, 3);
    }

    #[test]
    fn test_pool_respects_capacity() {
        let pool = ConnPool::new(1);
        pool.put(ConnShell::default());
        pool.put(ConnShell::default());
        assert!(pool.take().is_some());
        assert!(pool.take().is_none());

        let disabled = ConnPool::new(0);
        disabled.put(ConnShell::default());
        assert!(disabled.take().is_none());
    }
}
