//! Per-worker event loops.
//!
//! Each worker owns a `SO_REUSEPORT` listener on the same address, so the
//! kernel balances accepts and a connection lives its whole life on the
//! worker that accepted it. Workers poll with a bounded timeout so the quit
//! flag is observed between epochs.

use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::machine::{drive, DriveOutcome};
use crate::config::Config;
use crate::context::ServerContext;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A connection plus the interest it is currently registered with.
struct Registered {
    conn: Connection,
    registered: Interest,
}

/// Bound listeners, one per worker, ready to spawn.
pub struct Reactor {
    listeners: Vec<std::net::TcpListener>,
    addr: SocketAddr,
}

impl Reactor {
    /// Bind one listener per worker thread. Failing to bind is fatal to
    /// startup.
    pub fn bind(config: &Config) -> io::Result<Reactor> {
        let want: SocketAddr = format!("{}:{}", config.listen, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let first = listener_socket(want)?;
        let addr = first.local_addr()?;
        let mut listeners = vec![first];
        for _ in 1..config.threads.max(1) {
            listeners.push(listener_socket(addr)?);
        }
        Ok(Reactor { listeners, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Spawn the worker threads. Each runs its own poll loop until quit.
    pub fn spawn(self, ctx: Arc<ServerContext>) -> io::Result<Vec<JoinHandle<()>>> {
        let workers = self.listeners.len().max(1);
        let maxconns = (ctx.settings.maxconns / workers).max(1);

        let mut handles = Vec::with_capacity(self.listeners.len());
        for (worker_id, listener) in self.listeners.into_iter().enumerate() {
            let ctx = Arc::clone(&ctx);
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    if let Err(e) = worker_loop(worker_id, listener, maxconns, ctx) {
                        error!(worker = worker_id, error = %e, "worker failed");
                    }
                })?;
            handles.push(handle);
        }
        Ok(handles)
    }
}

/// Listener socket options: address/port reuse, keepalive, no lingering
/// close. Nagle is disabled per accepted stream.
fn listener_socket(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_keepalive(true)?;
    socket.set_linger(Some(Duration::from_secs(0)))?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

fn worker_loop(
    worker_id: usize,
    listener: std::net::TcpListener,
    maxconns: usize,
    ctx: Arc<ServerContext>,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1024);

    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    // Reserved descriptor released to shed accepts when the process runs
    // out of fds. Failing to open it is fatal.
    let mut stub_fd = Some(File::open("/dev/null")?);

    let mut connections: Slab<Registered> = Slab::with_capacity(maxconns.min(1024));

    info!(worker = worker_id, maxconns, "worker started");

    loop {
        if let Err(e) = poll.poll(&mut events, Some(POLL_INTERVAL)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        if ctx.quit_requested() {
            break;
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => accept_loop(
                    &listener,
                    &mut poll,
                    &mut connections,
                    &mut stub_fd,
                    maxconns,
                    worker_id,
                    &ctx,
                ),
                Token(id) => handle_event(id, &mut poll, &mut connections, &ctx),
            }
        }
    }

    // Cooperative shutdown: stop accepting and drop open connections.
    for mut reg in connections.drain() {
        let _ = poll.registry().deregister(&mut reg.conn.stream);
        ctx.stats.curr_conns.fetch_sub(1, Ordering::Relaxed);
    }
    info!(worker = worker_id, "worker exit");
    Ok(())
}

fn accept_loop(
    listener: &TcpListener,
    poll: &mut Poll,
    connections: &mut Slab<Registered>,
    stub_fd: &mut Option<File>,
    maxconns: usize,
    worker_id: usize,
    ctx: &ServerContext,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if connections.len() >= maxconns {
                    warn!(worker = worker_id, "connection limit reached");
                    continue;
                }
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "set_nodelay failed");
                }

                let shell = ctx.pool.take();
                if shell.is_none() {
                    ctx.stats.conn_structs.fetch_add(1, Ordering::Relaxed);
                }
                let conn = Connection::new(stream, shell);

                let id = connections.insert(Registered {
                    conn,
                    registered: Interest::READABLE,
                });
                let reg = &mut connections[id];
                if let Err(e) =
                    poll.registry()
                        .register(&mut reg.conn.stream, Token(id), Interest::READABLE)
                {
                    error!(error = %e, "event registration failed");
                    let reg = connections.remove(id);
                    if let Some(shell) = reg.conn.into_shell() {
                        ctx.pool.put(shell);
                    }
                    continue;
                }

                ctx.stats.curr_conns.fetch_add(1, Ordering::Relaxed);
                ctx.stats.total_conns.fetch_add(1, Ordering::Relaxed);
                if ctx.settings.verbose_at_least(2) {
                    debug!(worker = worker_id, conn_id = id, peer = %peer, "new client connection");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.raw_os_error() == Some(libc::EMFILE) => {
                warn!(worker = worker_id, "too many open connections");
                // Free the reserved fd, shed one pending accept so the
                // backlog drains, then take the fd back.
                drop(stub_fd.take());
                match listener.accept() {
                    Ok((shed, _)) => drop(shed),
                    Err(e2) => error!(error = %e2, "too many open connections"),
                }
                *stub_fd = File::open("/dev/null").ok();
                break;
            }
            Err(e) => {
                error!(error = %e, "accept error");
                break;
            }
        }
    }
}

fn handle_event(id: usize, poll: &mut Poll, connections: &mut Slab<Registered>, ctx: &ServerContext) {
    if !connections.contains(id) {
        return;
    }
    let reg = &mut connections[id];

    match drive(&mut reg.conn, ctx) {
        DriveOutcome::Closed => {
            let mut reg = connections.remove(id);
            let _ = poll.registry().deregister(&mut reg.conn.stream);
            ctx.stats.curr_conns.fetch_sub(1, Ordering::Relaxed);
            if ctx.settings.verbose_at_least(2) {
                debug!(conn_id = id, "connection closed");
            }
            if let Some(shell) = reg.conn.into_shell() {
                ctx.pool.put(shell);
            }
        }
        DriveOutcome::Await => {
            if reg.conn.interest != reg.registered {
                match poll
                    .registry()
                    .reregister(&mut reg.conn.stream, Token(id), reg.conn.interest)
                {
                    Ok(()) => reg.registered = reg.conn.interest,
                    Err(e) => {
                        error!(error = %e, "event rearm failed");
                        let mut reg = connections.remove(id);
                        let _ = poll.registry().deregister(&mut reg.conn.stream);
                        ctx.stats.curr_conns.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}
