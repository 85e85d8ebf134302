use std::collections::BTreeMap;

use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{poll_record::PollRecord, sensor_id::SensorId, temperature::TemperatureUnit};

/// Running read counts for one sensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorStats {
    pub good_reads: u64,
    pub bad_reads: u64,
    pub last_error: Option<String>,
}

/// Read counts for every sensor seen since start-up.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    sensors: BTreeMap<SensorId, SensorStats>,
    records: u64,
}

impl Diagnostics {
    pub fn observe(&mut self, record: &PollRecord) {
        self.records += 1;
        for reading in record.readings.iter() {
            let stats = self.sensors.entry(reading.sensor_id.clone()).or_default();
            match reading.error() {
                None => stats.good_reads += 1,
                Some(e) => {
                    stats.bad_reads += 1;
                    stats.last_error = Some(e.to_string());
                }
            }
        }
    }

    pub fn stats(&self, id: &SensorId) -> Option<&SensorStats> {
        self.sensors.get(id)
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    fn log_summary(&self) {
        info!("Observed {} poll records.", self.records);
        for (id, stats) in self.sensors.iter() {
            info!(
                "Sensor {}: {} good reads, {} bad reads, last error: {}",
                id,
                stats.good_reads,
                stats.bad_reads,
                stats.last_error.as_deref().unwrap_or("none")
            );
        }
    }
}

/// `HH:MM:SS, id=value, id=value`; failed sensors show as `id=--`.
pub fn format_console_line(record: &PollRecord, unit: TemperatureUnit) -> String {
    let values = record
        .readings
        .iter()
        .map(|reading| match reading.temperature() {
            Some(t) => format!("{}={:5.1}", reading.sensor_id, t.in_unit(unit)),
            None => format!("{}=--", reading.sensor_id),
        })
        .collect::<Vec<_>>();

    let mut line = record.timestamp.format("%H:%M:%S").to_string();
    for value in values {
        line.push_str(", ");
        line.push_str(&value);
    }
    line
}

/// Task: The diagnostic channel. Receives every written poll record, reports
/// failed reads, keeps per-sensor statistics and optionally echoes records to
/// stdout. Logs a summary once the record channel closes.
#[tracing::instrument(skip_all)]
pub async fn task_record_diagnostics(
    token: CancellationToken,
    mut rx_poll_record: Receiver<PollRecord>,
    console: Option<TemperatureUnit>,
) -> Diagnostics {
    info!("Started.");
    let mut diagnostics = Diagnostics::default();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                warn!("Cancelled.");
                break;
            },
            res = rx_poll_record.recv() => match res {
                Ok(record) => handle_record(&mut diagnostics, &record, console),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Diagnostics fell behind. Skipped {} records.", skipped);
                }
                Err(RecvError::Closed) => {
                    debug!("Record channel closed.");
                    diagnostics.log_summary();
                    return diagnostics;
                }
            },
        };
    }

    // The scheduler may still finish its in-flight cycle. Keep reporting
    // until it drops the sender.
    loop {
        match rx_poll_record.recv().await {
            Ok(record) => handle_record(&mut diagnostics, &record, console),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Diagnostics fell behind. Skipped {} records.", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }

    diagnostics.log_summary();
    diagnostics
}

fn handle_record(
    diagnostics: &mut Diagnostics,
    record: &PollRecord,
    console: Option<TemperatureUnit>,
) {
    debug!("Got poll record: {}", record);
    for reading in record.failures() {
        if let Some(e) = reading.error() {
            warn!("Failed to read sensor {}. Error: {}", reading.sensor_id, e);
        }
    }
    diagnostics.observe(record);

    if let Some(unit) = console {
        println!("{}", format_console_line(record, unit));
    }
}
