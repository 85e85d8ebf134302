use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::sync::broadcast::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    clock::Clock,
    externals::{
        csv_log::writer::{LogWriter, LogWriterError},
        one_wire::services::{DiscoveryError, OneWireBusService},
    },
    models::{poll_record::PollRecord, sensor_id::SensorId},
    poll::{poll_all, OutstandingReads},
    schedule::{Schedule, ScheduleOutOfRange},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for the next tick.
    Idle,
    /// Discovering and reading sensors.
    Polling,
    /// Appending the cycle's record to the log.
    Writing,
    /// Shut down. The log file is closed.
    Stopped,
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Sensor discovery failed.")]
    Discovery(#[from] DiscoveryError),

    #[error("Failed to close log file.")]
    LogWriter(#[from] LogWriterError),

    #[error(transparent)]
    Schedule(#[from] ScheduleOutOfRange),

    #[error("Sampling interval {0:?} is out of range.")]
    InvalidInterval(Duration),

    #[error("Discovery worker failed: {0}")]
    WorkerFailed(String),
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    /// Only these sensors are polled. Empty means every discovered sensor.
    pub allowlist: Vec<SensorId>,
    pub cycle_timeout: Option<Duration>,
    /// How long an in-flight cycle may keep running once shutdown is requested.
    pub grace_period: Duration,
}

/// What a run of the scheduler did, for the shutdown log.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSummary {
    pub cycles: u64,
    /// Cycles whose record could not be written to the log.
    pub failed_writes: u64,
    pub overruns: u64,
    pub sleeping: chrono::Duration,
    pub elapsed: chrono::Duration,
    pub final_state: SchedulerState,
}

enum CycleOutcome {
    Completed,
    /// Polled and published, but the log write failed.
    NotWritten,
    /// Shutdown was requested and the cycle outlived the grace period.
    Abandoned,
}

/// Drives one poll cycle per tick and hands each record to the log writer
/// and then to the diagnostic channel. Owns the log writer, so the open file
/// is closed when the scheduler stops.
pub struct Scheduler<B: OneWireBusService, C: Clock> {
    bus: Arc<B>,
    clock: C,
    writer: LogWriter,
    settings: SchedulerSettings,
    tx_poll_record: Sender<PollRecord>,
    state: SchedulerState,
    known_sensors: Option<Vec<SensorId>>,
    outstanding: OutstandingReads,
}

impl<B: OneWireBusService, C: Clock> Scheduler<B, C> {
    pub fn new(
        bus: Arc<B>,
        clock: C,
        writer: LogWriter,
        settings: SchedulerSettings,
        tx_poll_record: Sender<PollRecord>,
    ) -> Self {
        Self {
            bus,
            clock,
            writer,
            settings,
            tx_poll_record,
            state: SchedulerState::Idle,
            known_sensors: None,
            outstanding: OutstandingReads::default(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    fn transition(&mut self, next: SchedulerState) {
        trace!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run until `token` is cancelled or a fatal error occurs. Either way the
    /// log file is flushed and closed before returning.
    pub async fn run(mut self, token: CancellationToken) -> Result<SchedulerSummary, SchedulerError> {
        let started = self.clock.now();
        let interval = chrono::Duration::from_std(self.settings.interval)
            .map_err(|_| SchedulerError::InvalidInterval(self.settings.interval))?;

        let mut schedule = Schedule::aligned(started, interval)?;
        info!("First poll cycle at {}.", schedule.next_tick().format("%H:%M:%S"));

        let mut summary = SchedulerSummary {
            cycles: 0,
            failed_writes: 0,
            overruns: 0,
            sleeping: chrono::Duration::zero(),
            elapsed: chrono::Duration::zero(),
            final_state: SchedulerState::Idle,
        };
        let result = self.run_cycles(&token, &mut schedule, &mut summary).await;

        self.transition(SchedulerState::Stopped);
        let closed = self.writer.close();

        summary.elapsed = self.clock.now() - started;
        summary.final_state = self.state;
        info!(
            "Stopped after {} cycles ({} overruns, {} failed writes). Elapsed time: {}s, sleep time: {}s.",
            summary.cycles,
            summary.overruns,
            summary.failed_writes,
            summary.elapsed.num_seconds(),
            summary.sleeping.num_seconds()
        );

        result?;
        closed?;
        Ok(summary)
    }

    async fn run_cycles(
        &mut self,
        token: &CancellationToken,
        schedule: &mut Schedule,
        summary: &mut SchedulerSummary,
    ) -> Result<(), SchedulerError> {
        loop {
            self.transition(SchedulerState::Idle);
            let tick = schedule.next_tick();
            let before = self.clock.now();

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    warn!("Cancelled.");
                    return Ok(());
                },
                _ = self.clock.sleep_until(tick) => {}
            };
            summary.sleeping = summary.sleeping + (self.clock.now() - before);

            match self.cycle(tick, token).await? {
                CycleOutcome::Completed => summary.cycles += 1,
                CycleOutcome::NotWritten => {
                    summary.cycles += 1;
                    summary.failed_writes += 1;
                }
                CycleOutcome::Abandoned => return Ok(()),
            }

            let advance = schedule.advance(self.clock.now())?;
            if advance.missed > 0 {
                summary.overruns += 1;
                warn!(
                    "Poll cycle overran by {}ms. Skipped {} ticks.",
                    advance.overrun.num_milliseconds(),
                    advance.missed
                );
            }
        }
    }

    /// Poll every sensor for `tick` and write the record. A failed write
    /// loses only this cycle's rows; the file is reopened on the next write.
    async fn cycle(
        &mut self,
        tick: DateTime<Local>,
        token: &CancellationToken,
    ) -> Result<CycleOutcome, SchedulerError> {
        self.transition(SchedulerState::Polling);

        let polled = {
            let bus = self.bus.clone();
            let allowlist = self.settings.allowlist.clone();
            let cycle_timeout = self.settings.cycle_timeout;
            let grace = self.settings.grace_period;
            let outstanding = &mut self.outstanding;
            let work = async move {
                let sensors = discover(bus.clone(), &allowlist).await?;
                let record = poll_all(bus, &sensors, tick, cycle_timeout, outstanding).await;
                Ok::<_, SchedulerError>((sensors, record))
            };
            tokio::pin!(work);

            let res = tokio::select! {
                biased;
                res = &mut work => res,
                _ = token.cancelled() => {
                    info!("Shutdown requested mid-cycle. Waiting up to {:?} for it to finish.", grace);
                    match tokio::time::timeout(grace, &mut work).await {
                        Ok(res) => res,
                        Err(_) => {
                            warn!("Poll cycle did not finish within the grace period. Abandoning it.");
                            return Ok(CycleOutcome::Abandoned);
                        }
                    }
                }
            };
            res
        };
        let (sensors, record) = polled?;
        self.report_sensor_changes(&sensors);

        self.transition(SchedulerState::Writing);
        let outcome = match self.writer.write(&record) {
            Ok(rows) => {
                debug!("Wrote {} rows for {}.", rows, record);
                CycleOutcome::Completed
            }
            Err(e) => {
                error!("Failed to write poll record for {}. Error: {}", record.timestamp, e);
                if let Err(e) = self.writer.close() {
                    debug!("Dropped log file after failed write. Error: {}", e);
                }
                CycleOutcome::NotWritten
            }
        };

        if let Err(e) = self.tx_poll_record.send(record) {
            debug!("No diagnostics listening for poll record. Error: {}", e);
        }
        Ok(outcome)
    }

    /// Log sensors that appeared or vanished since the previous cycle. An
    /// empty bus is reported once when it becomes empty.
    fn report_sensor_changes(&mut self, sensors: &[SensorId]) {
        let previous = self.known_sensors.replace(sensors.to_vec());

        let Some(previous) = previous else {
            if sensors.is_empty() {
                warn!("No sensors found on the bus.");
            } else {
                info!("Start using sensors: {}", join_ids(sensors.iter()));
            }
            return;
        };

        let added = sensors.iter().filter(|id| !previous.contains(id));
        let removed = previous.iter().filter(|id| !sensors.contains(id));
        let added = join_ids(added);
        let removed = join_ids(removed);
        if !added.is_empty() {
            info!("Sensors added: {}", added);
        }
        if !removed.is_empty() {
            warn!("Sensors removed: {}", removed);
        }
        if sensors.is_empty() && !previous.is_empty() {
            warn!("No sensors left on the bus.");
        }
    }
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a SensorId>) -> String {
    ids.map(SensorId::as_str).collect::<Vec<_>>().join(", ")
}

/// Run discovery off the runtime and apply the allowlist.
async fn discover<B: OneWireBusService>(
    bus: Arc<B>,
    allowlist: &[SensorId],
) -> Result<Vec<SensorId>, SchedulerError> {
    let discovered = tokio::task::spawn_blocking(move || bus.discover_sensors())
        .await
        .map_err(|e| SchedulerError::WorkerFailed(e.to_string()))??;

    if allowlist.is_empty() {
        return Ok(discovered);
    }
    Ok(discovered
        .into_iter()
        .filter(|id| allowlist.contains(id))
        .collect())
}

/// Task: Runs the scheduler until cancelled. A fatal scheduler error cancels
/// `token` so the rest of the process shuts down too.
#[tracing::instrument(skip_all)]
pub async fn task_poll_and_log<B: OneWireBusService, C: Clock>(
    token: CancellationToken,
    scheduler: Scheduler<B, C>,
) -> Result<SchedulerSummary, SchedulerError> {
    info!("Started.");
    let result = scheduler.run(token.clone()).await;
    if let Err(e) = &result {
        error!("Scheduler failed. Error: {}", e);
        token.cancel();
    }
    result
}
