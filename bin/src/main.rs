#[cfg(feature = "jemallocator")]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[macro_use]
extern crate log;

mod cli;

use std::{sync::Arc, thread, time::Duration};

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use nix::sys::signal::{SigSet, Signal};

use fwdproxy_command::{config::FileConfig, logging::setup_logging};
use fwdproxy_lib::{server::Services, Proxy};

use crate::cli::Args;

fn main() -> anyhow::Result<()> {
    let result = run(Args::parse());
    if let Err(error) = &result {
        error!("{:#}", error);
    }
    // file targets are buffered
    log::logger().flush();
    result
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut file_config = match &args.config {
        Some(path) => FileConfig::load_from_path(path)
            .with_context(|| format!("could not load the configuration from {path}"))?,
        None => FileConfig::default(),
    };
    args.apply_to(&mut file_config);
    let config = file_config
        .into_config()
        .context("invalid configuration")?;

    setup_logging(&config.log_target, &config.log_level, "MAIN")
        .context("could not set up logging")?;
    info!("starting fwdproxy {}", env!("CARGO_PKG_VERSION"));
    debug!("configuration: {:?}", config);

    // blocked before any thread exists so that every thread inherits the mask
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals
        .thread_block()
        .context("could not block termination signals")?;

    let mut proxy = Proxy::start(&config).context("could not start the proxy")?;
    println!("fwdproxy listening on {}", proxy.local_address());

    let (stop_statistics, statistics_stopped) = bounded(1);
    let statistics_thread = match config.statistics_interval() {
        Some(interval) => Some(spawn_statistics(proxy.services(), interval, statistics_stopped)?),
        None => None,
    };

    let signal = signals.wait().context("could not wait for a signal")?;
    info!("received {}, shutting down", signal);

    let _ = stop_statistics.send(());
    if let Some(statistics_thread) = statistics_thread {
        if statistics_thread.join().is_err() {
            error!("the statistics thread panicked");
        }
    }

    proxy.shutdown();
    let statistics = proxy.statistics();
    println!(
        "{}",
        serde_json::to_string_pretty(&statistics).context("could not serialize statistics")?
    );
    Ok(())
}

fn spawn_statistics(
    services: Arc<Services>,
    interval: Duration,
    stop: Receiver<()>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("fwdproxy-statistics".to_owned())
        .spawn(move || loop {
            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }

            let snapshot = services.metrics.statistics.snapshot();
            match serde_json::to_string(&snapshot) {
                Ok(line) => info!("statistics: {}", line),
                Err(error) => error!("could not serialize statistics: {}", error),
            }
            match serde_json::to_string(&services.metrics.dump()) {
                Ok(line) => debug!("metrics: {}", line),
                Err(error) => error!("could not serialize metrics: {}", error),
            }
        })
        .context("could not spawn the statistics thread")
}
