//! beansdb: a memcached-compatible, persistent key-value server.
//!
//! Wires together configuration, logging, signal handling, the storage
//! engine, the background flush thread, and one reactor worker per
//! configured thread.

use beansdb::config::Config;
use beansdb::net::connection::ServerContext;
use beansdb::net::event_loop::WorkerConfig;
use beansdb::stats::Stats;
use beansdb::storage::{spawn_flush_thread, Store};
use beansdb::{net, signals};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        home = %config.home,
        workers = config.workers,
        "starting beansdb"
    );

    let addr: SocketAddr = config.listen.parse()?;
    let quit = Arc::new(AtomicBool::new(false));
    let quit = signals::install(quit)?;

    let store = Store::open(&config.home, 0, 0, config.workers);
    let stats = Arc::new(Stats::new());
    let verbosity = Arc::new(AtomicI64::new(0));

    let flush_handle = spawn_flush_thread(
        Arc::clone(&store),
        config.flush_limit_kb,
        config.flush_period_secs,
        Arc::clone(&quit),
    );

    let ctx = Arc::new(ServerContext {
        store: Arc::clone(&store),
        stats,
        max_value_size: config.max_value_size,
        read_buf_high_watermark: config.read_buf_high_watermark,
        slow_cmd_threshold_ms: config.slow_cmd_threshold_ms,
        max_verbosity: config.max_verbosity,
        enable_stop: config.enable_stop,
        threads: config.workers,
        verbosity,
        quit: Arc::clone(&quit),
    });

    let mut handles = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers {
        let ctx = Arc::clone(&ctx);
        let cfg = WorkerConfig {
            addr,
            worker_id,
            max_connections: config.max_connections,
            initial_read_buf_size: config.read_buf_size,
            first_msg_cap: 1024 * 1024,
            freelist_cap: config.freelist_cap,
        };
        handles.push(
            std::thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    if let Err(e) = net::event_loop::run(cfg, ctx) {
                        tracing::error!(worker = worker_id, error = %e, "worker exited with error");
                    }
                })?,
        );
    }

    for handle in handles {
        let _ = handle.join();
    }

    let _ = flush_handle.join();
    store.close();

    Ok(())
}
