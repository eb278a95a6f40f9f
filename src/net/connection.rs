//! The per-connection state machine.
//!
//! One `Connection` is driven by exactly one worker thread for its entire
//! lifetime. `drive()` runs the machine forward until it must suspend on a
//! readiness event or the connection closes; it is safe to call from both
//! the readable and the writable mio event, since each state only performs
//! the syscall appropriate to it.

use crate::item::Item;
use crate::net::pool::ConnResources;
use crate::net::segment::TransmitResult;
use crate::protocol::command::{self, Command, DataCommandKind};
use crate::protocol::response;
use crate::storage::{OptimizeResult, OptimizeState, Store, StoreResult};
use bytes::Bytes;
use mio::net::TcpStream;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::stats::Stats;

const READ_CHUNK: usize = 16 * 1024;

/// Shared state every connection on a worker needs to dispatch commands:
/// the store, stats, and tunables, collected into one context passed
/// explicitly rather than reached for as statics.
pub struct ServerContext {
    pub store: Arc<Store>,
    pub stats: Arc<Stats>,
    pub max_value_size: usize,
    pub read_buf_high_watermark: usize,
    pub slow_cmd_threshold_ms: u64,
    pub max_verbosity: i64,
    pub enable_stop: bool,
    pub threads: usize,
    pub verbosity: Arc<AtomicI64>,
    pub quit: Arc<AtomicBool>,
}

enum State {
    Read,
    Nread {
        kind: DataCommandKind,
        key: Bytes,
        flag: u32,
        ver: i64,
        value_len: usize,
        collected: Vec<u8>,
        trailing: [u8; 2],
        trailing_read: usize,
        noreply: bool,
    },
    Swallow {
        remaining: usize,
        pending_reply: Option<Vec<u8>>,
    },
    Write,
    Closing,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Suspend {
    Readable,
    Writable,
    Close,
}

pub struct Connection {
    pub stream: TcpStream,
    pub remote: String,
    resources: ConnResources,
    state: State,
}

impl Connection {
    pub fn new(stream: TcpStream, remote: String, resources: ConnResources) -> Self {
        Self {
            stream,
            remote,
            resources,
            state: State::Read,
        }
    }

    /// Tears the connection down and hands its buffers back to the caller
    /// so they can be returned to the freelist.
    pub fn into_resources(self) -> ConnResources {
        self.resources
    }

    pub fn drive(&mut self, ctx: &ServerContext) -> Suspend {
        loop {
            match &self.state {
                State::Read => match self.step_read(ctx) {
                    Some(suspend) => return suspend,
                    None => continue,
                },
                State::Nread { .. } => match self.step_nread(ctx) {
                    Some(suspend) => return suspend,
                    None => continue,
                },
                State::Swallow { .. } => match self.step_swallow() {
                    Some(suspend) => return suspend,
                    None => continue,
                },
                State::Write => match self.step_write(ctx) {
                    Some(suspend) => return suspend,
                    None => continue,
                },
                State::Closing => return Suspend::Close,
            }
        }
    }

    fn step_read(&mut self, ctx: &ServerContext) -> Option<Suspend> {
        if let Some((line_len, consumed)) = find_line(self.resources.read_buf.unconsumed()) {
            let line = self.resources.read_buf.unconsumed()[..line_len].to_vec();
            self.resources.read_buf.consume(consumed);
            self.handle_line(&line, ctx);
            return None;
        }

        let slot = self.resources.read_buf.reserve_for_read(READ_CHUNK);
        match self.stream.read(slot) {
            Ok(0) => {
                self.state = State::Closing;
                None
            }
            Ok(n) => {
                self.resources.read_buf.commit_read(n);
                ctx.stats.add_bytes_read(n as u64);
                None
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Some(Suspend::Readable),
            Err(_) => {
                self.state = State::Closing;
                None
            }
        }
    }

    fn handle_line(&mut self, line: &[u8], ctx: &ServerContext) {
        let started = Instant::now();
        match command::parse(line) {
            Ok(cmd) => {
                let name = command_name(&cmd);
                self.dispatch(cmd, ctx);
                let elapsed_ms = started.elapsed().as_millis() as u64;
                debug!(remote = %self.remote, command = name, ms = elapsed_ms, "command");
                if elapsed_ms > ctx.slow_cmd_threshold_ms {
                    ctx.stats.record_slow_cmd();
                }
            }
            Err(err) => self.queue_reply(err.message().into_bytes(), false),
        }
    }

    fn dispatch(&mut self, cmd: Command, ctx: &ServerContext) {
        match cmd {
            Command::Get { keys } => self.handle_get(&keys, ctx),
            Command::Set {
                key,
                flag,
                ver,
                len,
                noreply,
            } => self.begin_data_command(DataCommandKind::Set, key, flag, ver, len, noreply, ctx),
            Command::Append {
                key,
                flag,
                ver,
                len,
                noreply,
            } => self.begin_data_command(DataCommandKind::Append, key, flag, ver, len, noreply, ctx),
            Command::Incr { key, delta, noreply } => self.handle_incr(&key, delta, noreply, ctx),
            Command::Delete { key, noreply } => self.handle_delete(&key, noreply, ctx),
            Command::Stats { reset } => self.handle_stats(reset, ctx),
            Command::FlushAll { limit, tree, noreply } => {
                self.handle_flush_all(limit, tree, noreply, ctx)
            }
            Command::OptimizeStat => self.handle_optimize_stat(ctx),
            Command::Verbosity { level } => self.handle_verbosity(level, ctx),
            Command::Version => self.queue_reply(response::version("1.0.0"), false),
            Command::Quit => self.state = State::Closing,
            Command::StopMe => {
                if ctx.enable_stop {
                    ctx.quit.store(true, Ordering::Relaxed);
                }
                self.state = State::Closing;
            }
        }
    }

    fn handle_get(&mut self, keys: &[Bytes], ctx: &ServerContext) {
        for key in keys {
            match ctx.store.get(key) {
                Some(item) => {
                    ctx.stats.record_get(true);
                    self.queue_value(key, item);
                }
                None => ctx.stats.record_get(false),
            }
        }
        self.queue_reply(response::END.to_vec(), false);
    }

    fn queue_value(&mut self, key: &[u8], item: Arc<Item>) {
        self.resources.writer.out_value(key, item);
        self.state = State::Write;
    }

    fn begin_data_command(
        &mut self,
        kind: DataCommandKind,
        key: Bytes,
        flag: u32,
        ver: i64,
        len: i32,
        noreply: bool,
        ctx: &ServerContext,
    ) {
        let value_len = len as usize;
        if value_len > ctx.max_value_size {
            let reply = if noreply {
                None
            } else {
                Some(response::server_error("object too large for cache"))
            };
            self.state = State::Swallow {
                remaining: value_len + 2,
                pending_reply: reply,
            };
            return;
        }
        self.state = State::Nread {
            kind,
            key,
            flag,
            ver,
            value_len,
            collected: Vec::with_capacity(value_len),
            trailing: [0; 2],
            trailing_read: 0,
            noreply,
        };
    }

    fn step_nread(&mut self, ctx: &ServerContext) -> Option<Suspend> {
        let (kind, key, flag, ver) = match &self.state {
            State::Nread {
                kind, key, flag, ver, ..
            } => (*kind, key.clone(), *flag, *ver),
            _ => unreachable!(),
        };

        // Drain whatever is already buffered before touching the socket.
        loop {
            let need_value = match &self.state {
                State::Nread {
                    collected,
                    value_len,
                    ..
                } => *value_len - collected.len(),
                _ => unreachable!(),
            };
            if need_value > 0 {
                let available = self.resources.read_buf.unconsumed();
                if available.is_empty() {
                    break;
                }
                let take = need_value.min(available.len());
                let chunk = available[..take].to_vec();
                self.resources.read_buf.consume(take);
                if let State::Nread { collected, .. } = &mut self.state {
                    collected.extend_from_slice(&chunk);
                }
                continue;
            }
            let trailing_need = match &self.state {
                State::Nread {
                    trailing_read, ..
                } => 2 - *trailing_read,
                _ => unreachable!(),
            };
            if trailing_need == 0 {
                break;
            }
            let available = self.resources.read_buf.unconsumed();
            if available.is_empty() {
                break;
            }
            let take = trailing_need.min(available.len());
            let chunk = available[..take].to_vec();
            self.resources.read_buf.consume(take);
            if let State::Nread {
                trailing,
                trailing_read,
                ..
            } = &mut self.state
            {
                trailing[*trailing_read..*trailing_read + take].copy_from_slice(&chunk);
                *trailing_read += take;
            }
        }

        let done = matches!(&self.state,
            State::Nread { collected, value_len, trailing_read, .. }
            if collected.len() == *value_len && *trailing_read == 2
        );
        if done {
            return self.complete_nread(kind, key, flag, ver, ctx);
        }

        // Still short: read directly into a scratch buffer, capped to
        // exactly what this value still needs. The kernel may have more
        // already buffered (e.g. a pipelined command right behind the
        // value), and an uncapped read would hand those extra bytes to
        // `feed_nread`, which only has room for the value + trailing CRLF
        // and would silently drop the rest.
        let remaining = self.nread_remaining();
        let mut buf = [0u8; READ_CHUNK];
        let want = remaining.min(buf.len());
        match self.stream.read(&mut buf[..want]) {
            Ok(0) => {
                self.state = State::Closing;
                None
            }
            Ok(n) => {
                ctx.stats.add_bytes_read(n as u64);
                self.feed_nread(&buf[..n]);
                None
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Some(Suspend::Readable),
            Err(_) => {
                self.state = State::Closing;
                None
            }
        }
    }

    /// Bytes still needed to complete the in-flight `nread`: whatever is
    /// left of the value, plus whatever is left of the trailing `\r\n`.
    fn nread_remaining(&self) -> usize {
        match &self.state {
            State::Nread {
                collected,
                value_len,
                trailing_read,
                ..
            } => (*value_len - collected.len()) + (2 - *trailing_read),
            _ => unreachable!(),
        }
    }

    fn feed_nread(&mut self, mut data: &[u8]) {
        if let State::Nread {
            collected,
            value_len,
            trailing,
            trailing_read,
            ..
        } = &mut self.state
        {
            let need_value = *value_len - collected.len();
            if need_value > 0 {
                let take = need_value.min(data.len());
                collected.extend_from_slice(&data[..take]);
                data = &data[take..];
            }
            if !data.is_empty() {
                let trailing_need = 2 - *trailing_read;
                let take = trailing_need.min(data.len());
                trailing[*trailing_read..*trailing_read + take].copy_from_slice(&data[..take]);
                *trailing_read += take;
            }
        }
    }

    fn complete_nread(
        &mut self,
        kind: DataCommandKind,
        key: Bytes,
        flag: u32,
        ver: i64,
        ctx: &ServerContext,
    ) -> Option<Suspend> {
        let (collected, trailing, noreply) = match std::mem::replace(&mut self.state, State::Read) {
            State::Nread {
                collected,
                trailing,
                noreply,
                ..
            } => (collected, trailing, noreply),
            _ => unreachable!(),
        };

        if trailing != *b"\r\n" {
            self.queue_reply(response::client_error("bad data chunk"), noreply);
            return None;
        }

        let value = Bytes::from(collected);
        let reply: Vec<u8> = match kind {
            DataCommandKind::Set => {
                ctx.stats.record_set();
                match ctx.store.set(key, value, flag, ver as u32) {
                    StoreResult::Stored => response::STORED.to_vec(),
                    StoreResult::Exists => response::EXISTS.to_vec(),
                    StoreResult::NotFound => response::NOT_FOUND.to_vec(),
                    StoreResult::NotStored => response::NOT_STORED.to_vec(),
                }
            }
            DataCommandKind::Append => match ctx.store.append(&key, &value) {
                StoreResult::Stored => response::STORED.to_vec(),
                _ => response::NOT_STORED.to_vec(),
            },
        };
        self.queue_reply(reply, noreply);
        None
    }

    fn step_swallow(&mut self) -> Option<Suspend> {
        let remaining = match &self.state {
            State::Swallow { remaining, .. } => *remaining,
            _ => unreachable!(),
        };
        if remaining == 0 {
            let pending = match std::mem::replace(&mut self.state, State::Read) {
                State::Swallow { pending_reply, .. } => pending_reply,
                _ => unreachable!(),
            };
            if let Some(reply) = pending {
                self.queue_reply(reply, false);
            }
            return None;
        }

        let available = self.resources.read_buf.unconsumed();
        if !available.is_empty() {
            let take = remaining.min(available.len());
            self.resources.read_buf.consume(take);
            if let State::Swallow { remaining, .. } = &mut self.state {
                *remaining -= take;
            }
            return None;
        }

        let mut buf = [0u8; READ_CHUNK];
        let want = remaining.min(buf.len());
        match self.stream.read(&mut buf[..want]) {
            Ok(0) => {
                self.state = State::Closing;
                None
            }
            Ok(n) => {
                if let State::Swallow { remaining, .. } = &mut self.state {
                    *remaining -= n;
                }
                None
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Some(Suspend::Readable),
            Err(_) => {
                self.state = State::Closing;
                None
            }
        }
    }

    fn step_write(&mut self, ctx: &ServerContext) -> Option<Suspend> {
        let (result, n) = self.resources.writer.transmit(&mut self.stream);
        ctx.stats.add_bytes_written(n as u64);
        match result {
            TransmitResult::Complete => {
                self.resources.writer.reset();
                self.resources
                    .read_buf
                    .shrink_if_idle(ctx.read_buf_high_watermark);
                self.state = State::Read;
                None
            }
            TransmitResult::Incomplete => Some(Suspend::Writable),
            TransmitResult::SoftError => Some(Suspend::Writable),
            TransmitResult::HardError => {
                self.state = State::Closing;
                None
            }
        }
    }

    fn handle_incr(&mut self, key: &[u8], delta: i64, noreply: bool, ctx: &ServerContext) {
        let reply = match ctx.store.incr(key, delta) {
            Some(value) => response::numeric(value),
            None => response::NOT_FOUND.to_vec(),
        };
        self.queue_reply(reply, noreply);
    }

    fn handle_delete(&mut self, key: &[u8], noreply: bool, ctx: &ServerContext) {
        ctx.stats.record_delete();
        let reply = if ctx.store.delete(key) {
            response::DELETED.to_vec()
        } else {
            response::NOT_FOUND.to_vec()
        };
        self.queue_reply(reply, noreply);
    }

    fn handle_stats(&mut self, reset: bool, ctx: &ServerContext) {
        if reset {
            ctx.stats.reset();
            self.queue_reply(response::RESET.to_vec(), false);
            return;
        }
        let stat = ctx.store.stat(u64::MAX);
        let report = crate::stats::render_report(
            &ctx.stats,
            crate::net::buffer::INITIAL_READ_BUF_SIZE,
            ctx.store.count(),
            stat.total_items,
            0,
            stat.total_space,
            ctx.threads,
        );
        self.queue_reply(report, false);
    }

    /// `flush_all` triggers the storage engine's optimize/merge pass, not a
    /// cache invalidation: beansdb reuses the memcached verb for compaction
    /// (spec.md §4.2 `hs_optimize(store, limit, tree)`). A client-supplied
    /// `TREE` picks the bucket directly; with none given, the next bucket
    /// after whatever last ran is chosen so repeated bare calls sweep
    /// forward. `LIMIT` passes straight through to the engine.
    fn handle_flush_all(
        &mut self,
        limit: Option<u64>,
        tree: Option<u32>,
        noreply: bool,
        ctx: &ServerContext,
    ) {
        let bucket = tree.unwrap_or_else(|| ctx.store.optimizing_bucket().wrapping_add(1));
        let reply = match ctx.store.optimize(bucket, limit) {
            OptimizeResult::Started => response::OK.to_vec(),
            OptimizeResult::ReadOnly => response::error_line("READ_ONLY"),
            OptimizeResult::AlreadyRunning => response::error_line("OPTIMIZE_RUNNING"),
            OptimizeResult::Failed => response::server_error("optimize failed"),
        };
        self.queue_reply(reply, noreply);
    }

    /// `optimize_stat` only reports the status of whatever optimize pass is
    /// in flight (or last finished); it never starts one itself.
    fn handle_optimize_stat(&mut self, ctx: &ServerContext) {
        let reply = match ctx.store.optimize_stat() {
            OptimizeState::Running => response::optimize_bucket(ctx.store.optimizing_bucket()),
            OptimizeState::Done | OptimizeState::Idle => response::OK.to_vec(),
            OptimizeState::Failed => response::server_error("optimize failed"),
        };
        self.queue_reply(reply, false);
    }

    fn handle_verbosity(&mut self, level: i64, ctx: &ServerContext) {
        let clamped = level.clamp(0, ctx.max_verbosity);
        ctx.verbosity.store(clamped, Ordering::Relaxed);
        self.queue_reply(response::OK.to_vec(), false);
    }

    fn queue_reply(&mut self, bytes: Vec<u8>, noreply: bool) {
        if noreply {
            return;
        }
        self.resources.writer.out_string(&bytes);
        self.state = State::Write;
    }
}

fn find_line(buf: &[u8]) -> Option<(usize, usize)> {
    let nl = buf.iter().position(|&b| b == b'\n')?;
    let mut line_len = nl;
    if line_len > 0 && buf[line_len - 1] == b'\r' {
        line_len -= 1;
    }
    Some((line_len, nl + 1))
}

fn command_name(cmd: &Command) -> &'static str {
    match cmd {
        Command::Get { .. } => "get",
        Command::Set { .. } => "set",
        Command::Append { .. } => "append",
        Command::Incr { .. } => "incr",
        Command::Delete { .. } => "delete",
        Command::Stats { .. } => "stats",
        Command::FlushAll { .. } => "flush_all",
        Command::OptimizeStat => "optimize_stat",
        Command::Verbosity { .. } => "verbosity",
        Command::Version => "version",
        Command::Quit => "quit",
        Command::StopMe => "stopme",
    }
}
