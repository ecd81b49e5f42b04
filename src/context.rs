//! Shared server state passed into the reactor and command handlers,
//! replacing what the original kept in process globals.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::runtime::ConnPool;
use crate::stats::Stats;
use crate::store::Store;

/// Highest level the `verbosity` command will set.
pub const MAX_VERBOSITY_LEVEL: u32 = 2;

/// Cooperative shutdown flag. A static because signal handlers cannot carry
/// context; everything else reads it through [`ServerContext`].
pub static DAEMON_QUIT: AtomicBool = AtomicBool::new(false);

/// Runtime-tunable settings.
pub struct Settings {
    pub verbose: AtomicU32,
    /// Threshold in seconds over which a command counts as slow.
    pub slow_cmd_time: f64,
    pub stopme: bool,
    pub threads: usize,
    pub maxconns: usize,
    pub flush_limit_kb: u32,
    pub flush_period: u32,
}

impl Settings {
    pub fn verbose_at_least(&self, level: u32) -> bool {
        self.verbose.load(Ordering::Relaxed) >= level
    }

    pub fn set_verbose(&self, level: u32) {
        self.verbose
            .store(level.min(MAX_VERBOSITY_LEVEL), Ordering::Relaxed);
    }
}

/// Everything a worker needs to serve connections.
pub struct ServerContext {
    pub store: Arc<dyn Store>,
    pub stats: Stats,
    pub settings: Settings,
    pub pool: ConnPool,
    quit: AtomicBool,
}

impl ServerContext {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Arc<ServerContext> {
        Arc::new(ServerContext {
            store,
            stats: Stats::new(),
            settings: Settings {
                verbose: AtomicU32::new(config.verbose as u32),
                slow_cmd_time: config.slow_cmd_ms as f64 / 1000.0,
                stopme: config.stopme,
                threads: config.threads,
                maxconns: config.maxconns,
                flush_limit_kb: config.flush_limit_kb,
                flush_period: config.flush_period,
            },
            pool: ConnPool::new(config.conn_pool),
            quit: AtomicBool::new(false),
        })
    }

    /// True once this server or the process as a whole was asked to stop.
    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::SeqCst) || DAEMON_QUIT.load(Ordering::SeqCst)
    }

    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }
}
