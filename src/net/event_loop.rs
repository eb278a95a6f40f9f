//! Per-worker reactor loop.
//!
//! Each worker thread owns its own `mio::Poll` and its own `SO_REUSEPORT`
//! registration of the listener, so the kernel load-balances accepted
//! connections across workers without any cross-thread handoff. A
//! connection is pinned to the worker that accepted it for its lifetime.

use crate::net::connection::{Connection, ServerContext, Suspend};
use crate::net::listener::{bind_reuseport, Guarded};
use crate::net::pool::{ConnResources, ConnectionPool};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

pub struct WorkerConfig {
    pub addr: SocketAddr,
    pub worker_id: usize,
    pub max_connections: usize,
    pub initial_read_buf_size: usize,
    pub first_msg_cap: usize,
    pub freelist_cap: usize,
}

/// Runs one worker's reactor until `ctx.quit` is set. Blocks the calling
/// thread; intended to be spawned once per worker by the caller.
pub fn run(cfg: WorkerConfig, ctx: Arc<ServerContext>) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1024);

    let std_listener = bind_reuseport(cfg.addr)?;
    let mio_listener = mio::net::TcpListener::from_std(std_listener);
    let mut guarded = Guarded::new(mio_listener)?;
    poll.registry()
        .register(&mut guarded.listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut connections: Slab<Connection> = Slab::with_capacity(cfg.max_connections);
    let mut pool = ConnectionPool::new(cfg.freelist_cap);

    info!(worker = cfg.worker_id, addr = %cfg.addr, "worker started");

    while !ctx.quit.load(Ordering::Relaxed) {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => accept_connections(
                    &mut guarded,
                    &mut poll,
                    &mut connections,
                    &mut pool,
                    &cfg,
                    &ctx,
                ),
                Token(conn_id) => {
                    if !connections.contains(conn_id) {
                        continue;
                    }
                    let suspend = connections[conn_id].drive(&ctx);
                    match suspend {
                        Suspend::Readable => {
                            let _ = poll.registry().reregister(
                                &mut connections[conn_id].stream,
                                Token(conn_id),
                                Interest::READABLE,
                            );
                        }
                        Suspend::Writable => {
                            let _ = poll.registry().reregister(
                                &mut connections[conn_id].stream,
                                Token(conn_id),
                                Interest::WRITABLE,
                            );
                        }
                        Suspend::Close => {
                            close_connection(&mut poll, &mut connections, &mut pool, &ctx, conn_id);
                        }
                    }
                }
            }
        }
    }

    info!(worker = cfg.worker_id, "worker shutting down");
    Ok(())
}

fn accept_connections(
    guarded: &mut Guarded,
    poll: &mut Poll,
    connections: &mut Slab<Connection>,
    pool: &mut ConnectionPool,
    cfg: &WorkerConfig,
    ctx: &Arc<ServerContext>,
) {
    loop {
        match guarded.accept() {
            Ok((stream, addr)) => {
                if connections.len() >= cfg.max_connections {
                    warn!(worker = cfg.worker_id, "connection limit reached, dropping");
                    continue;
                }
                let fresh_alloc = pool.is_empty();
                let resources = pool
                    .take()
                    .unwrap_or_else(|| ConnResources::fresh(cfg.initial_read_buf_size, cfg.first_msg_cap));
                let conn = Connection::new(stream, addr.to_string(), resources);
                ctx.stats.conn_opened();
                if fresh_alloc {
                    ctx.stats.conn_struct_allocated();
                }
                let conn_id = connections.insert(conn);
                let conn = &mut connections[conn_id];
                if let Err(e) =
                    poll.registry()
                        .register(&mut conn.stream, Token(conn_id), Interest::READABLE)
                {
                    error!(worker = cfg.worker_id, error = %e, "failed to register connection");
                    connections.remove(conn_id);
                    continue;
                }
                debug!(worker = cfg.worker_id, conn_id, peer = %addr, "accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                warn!(worker = cfg.worker_id, error = %e, "accept surge: dropped a client under fd exhaustion");
                continue;
            }
            Err(e) => {
                error!(worker = cfg.worker_id, error = %e, "accept error");
                break;
            }
        }
    }
}

fn close_connection(
    poll: &mut Poll,
    connections: &mut Slab<Connection>,
    pool: &mut ConnectionPool,
    ctx: &Arc<ServerContext>,
    conn_id: usize,
) {
    if let Some(mut conn) = connections.try_remove(conn_id) {
        let _ = poll.registry().deregister(&mut conn.stream);
        ctx.stats.conn_closed();
        pool.give_back(conn.into_resources());
        debug!(conn_id, "connection closed");
    }
}
