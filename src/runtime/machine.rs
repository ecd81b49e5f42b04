//! The connection state machine.
//!
//! `drive` loops a connection through its states until it must wait for
//! readiness or closes. Every blocking syscall is non-blocking underneath;
//! `WouldBlock` updates the wanted interest and yields back to the reactor.

use std::io::Read;
use std::sync::atomic::Ordering;

use mio::Interest;
use tracing::debug;

use super::connection::{Connection, FragBuf, State, Transmit};
use crate::context::ServerContext;
use crate::protocol;

/// Why `drive` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Blocked; re-arm `conn.interest` and wait.
    Await,
    /// The connection reached `Closing` and must be torn down.
    Closed,
}

pub fn drive(conn: &mut Connection, ctx: &ServerContext) -> DriveOutcome {
    loop {
        match conn.state {
            State::Read => {
                if try_read_command(conn, ctx) {
                    continue;
                }
                if try_read_network(conn, ctx) {
                    continue;
                }
                // No command line and nothing on the wire.
                conn.interest = Interest::READABLE;
                return DriveOutcome::Await;
            }

            State::NRead => {
                if conn.rlbytes == 0 {
                    protocol::complete_nread(conn, ctx);
                    continue;
                }

                if conn.pending.is_none() {
                    conn.set_state(State::Closing);
                    continue;
                }

                // Drain residual bytes already sitting in the read buffer.
                if conn.rbytes > 0 {
                    let tocopy = conn.rbytes.min(conn.rlbytes);
                    let dst = conn.ritem;
                    let src = conn.rcurr;
                    if let Some((item, _)) = conn.pending.as_mut() {
                        item.data_mut()[dst..dst + tocopy]
                            .copy_from_slice(&conn.rbuf[src..src + tocopy]);
                    }
                    conn.ritem += tocopy;
                    conn.rlbytes -= tocopy;
                    conn.rcurr += tocopy;
                    conn.rbytes -= tocopy;
                    continue;
                }

                // Read straight into the item payload.
                let res = if let Some((item, _)) = conn.pending.as_mut() {
                    let dst = conn.ritem;
                    let end = dst + conn.rlbytes;
                    let mut stream = &conn.stream;
                    stream.read(&mut item.data_mut()[dst..end])
                } else {
                    conn.set_state(State::Closing);
                    continue;
                };
                match res {
                    Ok(0) => conn.set_state(State::Closing),
                    Ok(n) => {
                        ctx.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                        conn.ritem += n;
                        conn.rlbytes -= n;
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        conn.interest = Interest::READABLE;
                        return DriveOutcome::Await;
                    }
                    Err(e) => {
                        debug!(remote = ?conn.remote, error = %e, "failed to read body");
                        conn.set_state(State::Closing);
                    }
                }
            }

            State::Swallow => {
                if conn.sbytes == 0 {
                    conn.set_state(State::Read);
                    continue;
                }

                if conn.rbytes > 0 {
                    let tocopy = conn.rbytes.min(conn.sbytes);
                    conn.sbytes -= tocopy;
                    conn.rcurr += tocopy;
                    conn.rbytes -= tocopy;
                    continue;
                }

                let max = conn.rbuf.len().min(conn.sbytes);
                let res = {
                    let mut stream = &conn.stream;
                    stream.read(&mut conn.rbuf[..max])
                };
                match res {
                    Ok(0) => conn.set_state(State::Closing),
                    Ok(n) => {
                        ctx.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                        conn.sbytes -= n;
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        conn.interest = Interest::READABLE;
                        return DriveOutcome::Await;
                    }
                    Err(e) => {
                        debug!(remote = ?conn.remote, error = %e, "failed to swallow");
                        conn.set_state(State::Closing);
                    }
                }
            }

            State::Write | State::MWrite => {
                // A one-line reply is turned into a single fragment here.
                if conn.state == State::Write && conn.iovused() == 0 {
                    let src = if conn.write_and_free.is_some() {
                        FragBuf::Owned
                    } else {
                        FragBuf::WBuf
                    };
                    let (wcurr, wbytes) = (conn.wcurr, conn.wbytes);
                    if conn.add_iov(src, wcurr, wbytes).is_err() {
                        debug!(remote = ?conn.remote, "couldn't build response");
                        conn.set_state(State::Closing);
                        continue;
                    }
                }

                match conn.transmit(&ctx.stats) {
                    Transmit::Complete => {
                        if conn.state == State::MWrite {
                            conn.reset_reply();
                            conn.set_state(State::Read);
                        } else {
                            conn.write_and_free = None;
                            let next = conn.write_and_go;
                            conn.frags.clear();
                            conn.msgs.clear();
                            conn.msgcurr = 0;
                            conn.msgbytes = 0;
                            conn.set_state(next);
                        }
                    }
                    Transmit::Incomplete | Transmit::HardError => {}
                    Transmit::SoftError => return DriveOutcome::Await,
                }
            }

            State::Closing => return DriveOutcome::Closed,
        }
    }
}

/// Process one complete command line out of the read buffer, if present.
fn try_read_command(conn: &mut Connection, ctx: &ServerContext) -> bool {
    if conn.rbytes == 0 {
        return false;
    }
    let window = &conn.rbuf[conn.rcurr..conn.rcurr + conn.rbytes];
    let Some(nl) = window.iter().position(|&b| b == b'\n') else {
        return false;
    };

    let el = conn.rcurr + nl;
    let cont = el + 1;
    let line_end = if nl > 1 && conn.rbuf[el - 1] == b'\r' {
        el - 1
    } else {
        el
    };
    let line_start = conn.rcurr;

    // The handlers never touch the read buffer, so it can be lent out for
    // the duration of the call; tokens borrow straight from it.
    let rbuf = std::mem::take(&mut conn.rbuf);
    protocol::process_command(conn, &rbuf[line_start..line_end], ctx);
    conn.rbuf = rbuf;

    conn.rbytes -= cont - conn.rcurr;
    conn.rcurr = cont;
    true
}

/// Pull whatever the socket has into the read buffer, growing it on demand.
/// Returns true when any progress (or a state change) was made.
fn try_read_network(conn: &mut Connection, ctx: &ServerContext) -> bool {
    let mut gotdata = false;

    // Compact the residual fragment to the head before reading more.
    if conn.rcurr != 0 {
        if conn.rbytes != 0 {
            conn.rbuf
                .copy_within(conn.rcurr..conn.rcurr + conn.rbytes, 0);
        }
        conn.rcurr = 0;
    }

    loop {
        if conn.rbytes >= conn.rbuf.len() {
            if conn.grow_rbuf().is_err() {
                debug!(remote = ?conn.remote, "couldn't grow input buffer");
                conn.rbytes = 0;
                conn.out_string("SERVER_ERROR out of memory reading request");
                conn.write_and_go = State::Closing;
                return true;
            }
        }

        let avail = conn.rbuf.len() - conn.rbytes;
        let res = {
            let start = conn.rbytes;
            let mut stream = &conn.stream;
            stream.read(&mut conn.rbuf[start..])
        };
        match res {
            Ok(0) => {
                conn.set_state(State::Closing);
                return true;
            }
            Ok(n) => {
                ctx.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                gotdata = true;
                conn.rbytes += n;
                if n == avail {
                    continue;
                }
                break;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!(remote = ?conn.remote, error = %e, "failed to read");
                conn.set_state(State::Closing);
                return true;
            }
        }
    }
    gotdata
}
