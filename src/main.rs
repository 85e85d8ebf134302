pub mod clock;
pub mod config;
pub mod externals;
pub mod models;
pub mod poll;
pub mod schedule;
pub mod tasks;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use clock::SystemClock;
use config::{Args, Config};
use externals::{
    csv_log::CsvLogModule, event_logging::task::task_record_diagnostics,
    one_wire::OneWireModule,
};
use tasks::scheduler::{task_poll_and_log, Scheduler};
use tokio::{runtime::Runtime, signal, sync::broadcast};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Resolve on ctrl-c, or on SIGTERM when running as a service.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = signal::ctrl_c() => res,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    signal::ctrl_c().await
}

fn main() -> Result<()> {
    let config = Config::try_from(Args::parse())?;
    let grace_period = config.scheduler.grace_period;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(config));
    shutdown_runtime(runtime, grace_period);
    result
}

/// Stop the runtime without waiting on sensor reads that never returned.
/// The log file is already closed by the time this runs.
fn shutdown_runtime(runtime: Runtime, grace_period: Duration) {
    runtime.shutdown_timeout(grace_period);
}

async fn run(config: Config) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .with_max_level(config.log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    let tracker = TaskTracker::new();

    let token = CancellationToken::new();

    // NOTE: Carries every written poll record to the diagnostics task.
    let (tx_poll_record, rx_poll_record) = broadcast::channel(32);

    let OneWireModule { bus_service } =
        OneWireModule::initialize(config.devices_root, config.family, config.offsets);

    let CsvLogModule { log_writer } = CsvLogModule::initialize(config.log_writer);

    let scheduler = Scheduler::new(
        Arc::new(bus_service),
        SystemClock,
        log_writer,
        config.scheduler,
        tx_poll_record,
    );

    let token_clone = token.clone();
    let scheduler_handle =
        tracker.spawn(async move { task_poll_and_log(token_clone, scheduler).await });

    let token_clone = token.clone();
    let console = config.console;
    tracker.spawn(async move { task_record_diagnostics(token_clone, rx_poll_record, console).await });

    let token_clone = token.clone();

    tokio::select! {
        _ = token_clone.cancelled() => {}
        res = shutdown_signal() => {
            match res {
                Ok(_) => {
                    tracing::info!("Received shutdown signal.");
                    token.cancel();
                },
                Err(e)=>{
                    tracing::error!("Failed to listen for shutdown signals. Error: {}", e);
                    token.cancel();
                }
            };
        },
    }

    tracker.close();
    tracker.wait().await;

    scheduler_handle.await??;
    tracing::info!("Closing.");

    Ok(())
}
