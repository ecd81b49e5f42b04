//! Command handlers.
//!
//! `process_command` routes one tokenized line to its handler; handlers
//! queue replies on the connection and pick the next state. Update commands
//! hand off to the body read and finish in `complete_nread`.

use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::parser::{parse_i64, parse_u32, parse_u64, CommandLine, MAX_KEY_LEN};
use crate::context::ServerContext;
use crate::item::Item;
use crate::runtime::connection::{Connection, FragBuf, State, UpdateKind};
use crate::store::{OptimizeOutcome, SetOutcome, Store};

pub(crate) fn process_command(conn: &mut Connection, line: &[u8], ctx: &ServerContext) {
    if ctx.settings.verbose_at_least(2) {
        debug!(remote = ?conn.remote, cmd = %String::from_utf8_lossy(line), "request");
    }

    conn.msgcurr = 0;
    conn.msgs.clear();
    conn.frags.clear();
    conn.msgbytes = 0;
    if conn.add_msghdr().is_err() {
        conn.out_string("SERVER_ERROR out of memory preparing response");
        return;
    }

    let start = Instant::now();
    let cl = CommandLine::tokenize(line);
    let nt = cl.ntokens();
    let cmd = if cl.count() > 0 { cl.token(0) } else { &[][..] };

    if nt >= 3 && cmd == b"get" {
        process_get(conn, &cl, ctx);
    } else if (nt == 6 || nt == 7) && cmd == b"set" {
        process_update(conn, &cl, UpdateKind::Set, ctx);
    } else if (nt == 6 || nt == 7) && cmd == b"append" {
        process_update(conn, &cl, UpdateKind::Append, ctx);
    } else if (nt == 4 || nt == 5) && cmd == b"incr" {
        process_arithmetic(conn, &cl, ctx);
    } else if (nt == 3 || nt == 4) && cmd == b"delete" {
        process_delete(conn, &cl, ctx);
    } else if nt >= 2 && cmd == b"stats" {
        process_stats(conn, &cl, ctx);
    } else if nt == 2 && cmd == b"version" {
        conn.out_string(concat!("VERSION ", env!("CARGO_PKG_VERSION")));
    } else if nt == 2 && cmd == b"quit" {
        conn.set_state(State::Closing);
    } else if nt == 3 && cmd == b"verbosity" {
        process_verbosity(conn, &cl, ctx);
    } else if nt == 2 && cmd == b"optimize_stat" {
        process_optimize_stat(conn, ctx);
    } else if (2..=4).contains(&nt) && cmd == b"flush_all" {
        process_flush_all(conn, &cl, ctx);
    } else if ctx.settings.stopme && nt == 2 && cmd == b"stopme" {
        warn!("quit under request");
        ctx.request_quit();
    } else {
        conn.out_string("ERROR");
        return;
    }

    let secs = start.elapsed().as_secs_f64();
    if secs > ctx.settings.slow_cmd_time {
        ctx.stats.slow_cmds.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "access",
            remote = ?conn.remote,
            cmd = %String::from_utf8_lossy(line),
            ms = secs * 1000.0,
            "slow command"
        );
    } else if nt >= 3 && ctx.settings.verbose_at_least(1) {
        debug!(
            target: "access",
            remote = ?conn.remote,
            cmd = %String::from_utf8_lossy(line),
            ms = secs * 1000.0,
            "command"
        );
    }
}

/// `noreply`, when present, is the last token of the line.
fn set_noreply_maybe(conn: &mut Connection, cl: &CommandLine) -> bool {
    if let Some(&last) = cl.tokens().last() {
        if last == b"noreply" {
            conn.noreply = true;
        }
    }
    conn.noreply
}

fn process_get(conn: &mut Connection, cl: &CommandLine, ctx: &ServerContext) {
    let mut gets: u64 = 0;
    let mut hits: u64 = 0;
    let mut misses: u64 = 0;
    let mut oom = false;
    let mut bad_key = false;

    let mut current = *cl;
    let mut idx = 1;
    'keys: loop {
        while idx < current.count() {
            let key = current.token(idx);
            idx += 1;

            if key.len() > MAX_KEY_LEN {
                bad_key = true;
                break 'keys;
            }
            gets += 1;

            match ctx.store.get(key) {
                Some(item) => {
                    if conn.reserve_ilist().is_err() {
                        oom = true;
                        break 'keys;
                    }
                    let i = conn.ilist.len();
                    let nkey = item.nkey();
                    let nbody = item.suffix_and_data().len();
                    conn.ilist.push(item);

                    // Each hit contributes three fragments: "VALUE ", the
                    // key, and suffix-plus-data in one piece.
                    if conn.add_iov(FragBuf::Static(b"VALUE "), 0, 6).is_err()
                        || conn.add_iov(FragBuf::ItemKey(i), 0, nkey).is_err()
                        || conn.add_iov(FragBuf::ItemBody(i), 0, nbody).is_err()
                    {
                        oom = true;
                        break 'keys;
                    }

                    if ctx.settings.verbose_at_least(2) {
                        debug!(remote = ?conn.remote, key = %String::from_utf8_lossy(conn.ilist[i].key()), "sending key");
                    }
                    hits += 1;
                }
                None => misses += 1,
            }
        }
        match current.rest() {
            Some(rest) => {
                current = CommandLine::tokenize(rest);
                idx = 0;
            }
            None => break,
        }
    }

    ctx.stats.get_cmds.fetch_add(gets, Ordering::Relaxed);
    ctx.stats.get_hits.fetch_add(hits, Ordering::Relaxed);
    ctx.stats.get_misses.fetch_add(misses, Ordering::Relaxed);

    conn.icurr = 0;

    if bad_key {
        conn.reset_reply();
        conn.out_string("CLIENT_ERROR bad command line format");
        return;
    }

    // A partial reply cannot be terminated reliably, so it is dropped
    // rather than flushed.
    if oom || conn.add_iov(FragBuf::Static(b"END\r\n"), 0, 5).is_err() {
        conn.reset_reply();
        conn.out_string("SERVER_ERROR out of memory writing get response");
        return;
    }

    conn.set_state(State::MWrite);
    conn.msgcurr = 0;
}

fn process_update(conn: &mut Connection, cl: &CommandLine, kind: UpdateKind, ctx: &ServerContext) {
    set_noreply_maybe(conn, cl);

    let key = cl.token(1);
    if key.len() > MAX_KEY_LEN {
        conn.out_string("CLIENT_ERROR bad command line format");
        warn!(key = %String::from_utf8_lossy(key), "key too long");
        return;
    }

    let flag = parse_u32(cl.token(2));
    let ver = parse_i64(cl.token(3)).and_then(|v| i32::try_from(v).ok());
    let vlen = parse_i64(cl.token(4));
    let (Some(flag), Some(ver), Some(vlen)) = (flag, ver, vlen) else {
        conn.out_string("CLIENT_ERROR bad command line format");
        warn!(cmd = %String::from_utf8_lossy(cl.token(0)), "bad update arguments");
        return;
    };
    if vlen < 0 {
        conn.out_string("CLIENT_ERROR bad command line format");
        return;
    }
    let nbytes = vlen as usize + 2;

    match Item::alloc(key, flag, ver, nbytes) {
        Ok(item) => {
            conn.pending = Some((item, kind));
            conn.ritem = 0;
            conn.rlbytes = nbytes;
            conn.set_state(State::NRead);
        }
        Err(_) => {
            // Swallow the body so the stream stays framed for the next
            // command.
            if conn.noreply {
                conn.noreply = false;
                conn.sbytes = nbytes;
                conn.set_state(State::Swallow);
            } else {
                conn.out_string("SERVER_ERROR out of memory storing object");
                conn.write_and_go = State::Swallow;
                conn.sbytes = nbytes;
            }
        }
    }
}

/// Finish a `set`/`append` once the body is fully read.
pub(crate) fn complete_nread(conn: &mut Connection, ctx: &ServerContext) {
    ctx.stats.set_cmds.fetch_add(1, Ordering::Relaxed);

    let Some((item, kind)) = conn.pending.take() else {
        conn.set_state(State::Closing);
        return;
    };

    if !item.data_ends_in_crlf() {
        conn.out_string("CLIENT_ERROR bad data chunk");
        return;
    }

    let outcome = match kind {
        UpdateKind::Set => ctx
            .store
            .set(item.key(), item.value(), item.flag(), item.ver()),
        UpdateKind::Append => ctx.store.append(item.key(), item.value()),
    };
    conn.out_string(match outcome {
        SetOutcome::Stored => "STORED",
        SetOutcome::Exists => "EXISTS",
        SetOutcome::NotFound => "NOT_FOUND",
        SetOutcome::NotStored => "NOT_STORED",
    });
}

fn process_arithmetic(conn: &mut Connection, cl: &CommandLine, ctx: &ServerContext) {
    set_noreply_maybe(conn, cl);
    ctx.stats.set_cmds.fetch_add(1, Ordering::Relaxed);

    let key = cl.token(1);
    if key.len() > MAX_KEY_LEN {
        conn.out_string("CLIENT_ERROR bad command line format");
        warn!(key = %String::from_utf8_lossy(key), "key too long");
        return;
    }

    let Some(delta) = parse_u64(cl.token(2)) else {
        conn.out_string("CLIENT_ERROR invalid numeric delta argument");
        warn!(delta = %String::from_utf8_lossy(cl.token(2)), "invalid numeric delta argument");
        return;
    };

    let value = ctx.store.incr(key, delta);
    conn.out_string(&value.to_string());
}

fn process_delete(conn: &mut Connection, cl: &CommandLine, ctx: &ServerContext) {
    set_noreply_maybe(conn, cl);
    ctx.stats.delete_cmds.fetch_add(1, Ordering::Relaxed);

    let key = cl.token(1);
    if key.len() > MAX_KEY_LEN {
        conn.out_string("CLIENT_ERROR bad command line format");
        warn!(key = %String::from_utf8_lossy(key), "key too long");
        return;
    }

    conn.out_string(if ctx.store.delete(key) {
        "DELETED"
    } else {
        "NOT_FOUND"
    });
}

fn process_stats(conn: &mut Connection, cl: &CommandLine, ctx: &ServerContext) {
    if cl.ntokens() == 2 {
        conn.out_owned(render_stats(ctx));
        return;
    }

    if cl.token(1) == b"reset" {
        ctx.stats.reset();
        conn.out_string("RESET");
    } else {
        conn.out_string("ERROR");
    }
}

fn render_stats(ctx: &ServerContext) -> Vec<u8> {
    use std::fmt::Write;

    let snap = ctx.stats.snapshot();
    let (total_items, curr_items) = ctx.store.count();
    let (total_space, avail_space) = ctx.store.stat();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let mut out = String::with_capacity(1024);
    let _ = write!(
        out,
        "STAT pid {}\r\n\
         STAT uptime {}\r\n\
         STAT time {}\r\n\
         STAT version {}\r\n\
         STAT pointer_size {}\r\n\
         STAT rusage_maxrss {}\r\n\
         STAT curr_connections {}\r\n\
         STAT total_connections {}\r\n\
         STAT connection_structures {}\r\n\
         STAT cmd_get {}\r\n\
         STAT cmd_set {}\r\n\
         STAT cmd_delete {}\r\n\
         STAT slow_cmd {}\r\n\
         STAT get_hits {}\r\n\
         STAT get_misses {}\r\n\
         STAT curr_items {}\r\n\
         STAT total_items {}\r\n\
         STAT avail_space {}\r\n\
         STAT total_space {}\r\n\
         STAT bytes_read {}\r\n\
         STAT bytes_written {}\r\n\
         STAT threads {}\r\n\
         END\r\n",
        std::process::id(),
        now - snap.started,
        now,
        env!("CARGO_PKG_VERSION"),
        8 * std::mem::size_of::<usize>(),
        maxrss_kb(),
        snap.curr_conns,
        snap.total_conns,
        snap.conn_structs,
        snap.get_cmds,
        snap.set_cmds,
        snap.delete_cmds,
        snap.slow_cmds,
        snap.get_hits,
        snap.get_misses,
        curr_items,
        total_items,
        avail_space,
        total_space,
        snap.bytes_read,
        snap.bytes_written,
        ctx.settings.threads,
    );
    out.into_bytes()
}

/// Resident set size in KB, from /proc/self/statm; 0 where unavailable.
fn maxrss_kb() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let rss_pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|f| f.parse().ok())
        .unwrap_or(0);
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    rss_pages * page_size.max(0) as u64 / 1024
}

fn process_verbosity(conn: &mut Connection, cl: &CommandLine, ctx: &ServerContext) {
    set_noreply_maybe(conn, cl);

    let Some(level) = parse_u32(cl.token(1)) else {
        conn.out_string("CLIENT_ERROR bad command line format");
        return;
    };
    ctx.settings.set_verbose(level);
    conn.out_string("OK");
}

fn process_optimize_stat(conn: &mut Connection, ctx: &ServerContext) {
    let ret = ctx.store.optimize_stat();
    if ret >= 0 {
        conn.out_string(&format!("running bitcast 0x{ret:x}"));
    } else if ret == -1 {
        conn.out_string("success");
    } else {
        conn.out_string("fail");
    }
}

fn process_flush_all(conn: &mut Connection, cl: &CommandLine, ctx: &ServerContext) {
    let noreply = set_noreply_maybe(conn, cl);
    let nt = cl.ntokens() - usize::from(noreply);

    let mut limit: i64 = 10000;
    let mut tree = "@";
    if nt >= 3 {
        match parse_i64(cl.token(1)) {
            Some(parsed) => limit = parsed,
            None => {
                conn.out_string("CLIENT_ERROR bad command line format");
                return;
            }
        }
        if nt >= 4 {
            match std::str::from_utf8(cl.token(2)) {
                Ok(t) => tree = t,
                Err(_) => {
                    conn.out_string("CLIENT_ERROR bad command line format");
                    return;
                }
            }
        }
    }

    conn.out_string(match ctx.store.optimize(limit, tree) {
        OptimizeOutcome::Ok => "OK",
        OptimizeOutcome::ReadOnly => "ERROR READ_ONLY",
        OptimizeOutcome::Running => "ERROR OPTIMIZE_RUNNING",
        OptimizeOutcome::BadArg => "CLIENT_ERROR bad command line format",
    });
}
