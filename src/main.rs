//! beansd server binary: load configuration, open the store, spawn the
//! flush worker and the reactor, then wait for a graceful shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use beansd::config::Config;
use beansd::context::{ServerContext, DAEMON_QUIT};
use beansd::runtime::Reactor;
use beansd::store::{MemStore, Store};

extern "C" fn handle_signal(_sig: libc::c_int) {
    DAEMON_QUIT.store(true, Ordering::SeqCst);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let default_level = match config.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if config.stopme {
        warn!("dangerous: the server can be stopped by the `stopme` command");
    }

    raise_nofile_limit(config.maxconns)?;
    install_signal_handlers();

    let store = Arc::new(MemStore::open(
        &config.homes,
        config.height,
        config.before_time,
        config.threads,
    )?);
    let ctx = ServerContext::new(store, &config);

    let reactor = Reactor::bind(&config)?;
    info!(
        addr = %reactor.local_addr(),
        threads = config.threads,
        maxconns = config.maxconns,
        "all ready"
    );

    let flush_ctx = Arc::clone(&ctx);
    let flush = std::thread::Builder::new()
        .name("flush".to_string())
        .spawn(move || {
            while !flush_ctx.quit_requested() {
                flush_ctx
                    .store
                    .flush(flush_ctx.settings.flush_limit_kb, flush_ctx.settings.flush_period);
                std::thread::sleep(Duration::from_secs(1));
            }
            info!("flush thread exit");
        })?;

    for handle in reactor.spawn(Arc::clone(&ctx))? {
        if handle.join().is_err() {
            error!("worker thread panicked");
        }
    }

    if flush.join().is_err() {
        error!("flush thread panicked");
    }
    info!("close done");
    Ok(())
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGQUIT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
    }
}

/// Raise the open-file limit to cover the requested connection count.
/// Failure here means the connection budget cannot be honored, so it is
/// fatal.
fn raise_nofile_limit(maxconns: usize) -> std::io::Result<()> {
    unsafe {
        let mut rlim: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let want = maxconns as libc::rlim_t + 3;
        if rlim.rlim_cur < want {
            rlim.rlim_cur = want;
        }
        if rlim.rlim_max < rlim.rlim_cur {
            rlim.rlim_max = rlim.rlim_cur;
        }
        if libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
