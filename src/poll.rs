use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Local};
use futures::future::join_all;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, trace, warn};

use crate::{
    externals::one_wire::services::{OneWireBusService, ReadError},
    models::{
        poll_record::PollRecord, reading::Reading, sensor_id::SensorId, temperature::Temperature,
    },
};

type ReadHandle = JoinHandle<Result<Temperature, ReadError>>;

/// Blocking reads that outlived the cycle that started them. A sensor with a
/// read in here is not read again until that read returns, so a hung sensor
/// holds at most one blocking thread.
#[derive(Debug, Default)]
pub struct OutstandingReads {
    handles: HashMap<SensorId, ReadHandle>,
}

impl OutstandingReads {
    /// Forget reads that have returned since the last check.
    fn prune(&mut self) {
        self.handles.retain(|_, handle| !handle.is_finished());
    }

    pub fn contains(&self, id: &SensorId) -> bool {
        self.handles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Read every sensor concurrently and gather the results into one record.
///
/// One blocking worker is spawned per sensor, so the cycle takes about as
/// long as the slowest read. Readings come back in the order of `sensors` and
/// are all stamped with `timestamp`. A failed or timed out read becomes a
/// failed `Reading`; it never aborts the rest of the cycle. Timed out reads
/// are parked in `outstanding` and their sensor is skipped until they return.
#[tracing::instrument(skip_all, fields(sensors = sensors.len()))]
pub async fn poll_all<B: OneWireBusService>(
    bus: Arc<B>,
    sensors: &[SensorId],
    timestamp: DateTime<Local>,
    cycle_timeout: Option<Duration>,
    outstanding: &mut OutstandingReads,
) -> PollRecord {
    trace!("Starting poll cycle.");
    outstanding.prune();
    if !outstanding.is_empty() {
        warn!(
            "{} timed out reads from earlier cycles are still running.",
            outstanding.len()
        );
    }
    let deadline = cycle_timeout.map(|timeout| (Instant::now() + timeout, timeout));

    let workers = sensors.iter().cloned().map(|id| {
        let busy = outstanding.contains(&id);
        let bus = bus.clone();

        async move {
            if busy {
                return (Reading::failed(id, timestamp, ReadError::StillRunning), None);
            }

            let worker_id = id.clone();
            let mut handle = tokio::task::spawn_blocking(move || bus.read_sensor(&worker_id));
            let joined = match deadline {
                Some((at, timeout)) => match tokio::time::timeout_at(at, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!("Read of {} timed out after {:?}.", id, timeout);
                        let reading =
                            Reading::failed(id.clone(), timestamp, ReadError::Timeout(timeout));
                        return (reading, Some((id, handle)));
                    }
                },
                None => handle.await,
            };

            let reading = match joined {
                Ok(Ok(temperature)) => Reading::ok(id, timestamp, temperature),
                Ok(Err(e)) => Reading::failed(id, timestamp, e),
                Err(e) => Reading::failed(id, timestamp, ReadError::WorkerFailed(e.to_string())),
            };
            (reading, None)
        }
    });

    let (readings, parked): (Vec<_>, Vec<_>) = join_all(workers).await.into_iter().unzip();
    outstanding.handles.extend(parked.into_iter().flatten());

    let record = PollRecord::new(timestamp, readings);
    debug!("Finished poll cycle: {}", record);
    record
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::{
        externals::one_wire::services::DiscoveryError, models::temperature::Temperature,
    };

    use super::*;

    /// Bus where every sensor takes `latency` to read and returns a fixed value,
    /// or fails when no value is configured.
    struct FakeBus {
        latency: Duration,
        values: HashMap<SensorId, f32>,
        reads: AtomicUsize,
    }

    fn bus(latency: Duration, values: HashMap<SensorId, f32>) -> Arc<FakeBus> {
        Arc::new(FakeBus {
            latency,
            values,
            reads: AtomicUsize::new(0),
        })
    }

    impl OneWireBusService for FakeBus {
        fn discover_sensors(&self) -> Result<Vec<SensorId>, DiscoveryError> {
            Ok(self.values.keys().cloned().collect())
        }

        fn read_sensor(&self, id: &SensorId) -> Result<Temperature, ReadError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.latency);
            match self.values.get(id) {
                Some(v) => Ok(Temperature::try_from(*v)?),
                None => Err(ReadError::CrcMismatch("crc=00 NO".into())),
            }
        }
    }

    fn ids(names: &[&str]) -> Vec<SensorId> {
        names.iter().map(|n| SensorId::from(*n)).collect()
    }

    #[tokio::test]
    async fn test_one_reading_per_sensor_in_order() {
        let bus = bus(
            Duration::from_millis(10),
            HashMap::from([("A".into(), 21.5f32), ("B".into(), 22f32)]),
        );
        let now = Local::now();
        let mut outstanding = OutstandingReads::default();

        let record = poll_all(bus, &ids(&["B", "C", "A"]), now, None, &mut outstanding).await;

        assert_eq!(record.readings.len(), 3);
        let order = record
            .readings
            .iter()
            .map(|r| r.sensor_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["B", "C", "A"]);
        assert!(record.readings.iter().all(|r| r.timestamp == now));
        assert_eq!(record.readings[0].temperature().map(|t| t.value), Some(22f32));
        assert!(matches!(
            record.readings[1].error(),
            Some(ReadError::CrcMismatch(_))
        ));
        assert_eq!(record.readings[2].temperature().map(|t| t.value), Some(21.5f32));
    }

    #[tokio::test]
    async fn test_all_failures_still_yield_full_record() {
        let bus = bus(Duration::ZERO, HashMap::new());

        let mut outstanding = OutstandingReads::default();

        let record = poll_all(bus, &ids(&["A", "B", "C", "D"]), Local::now(), None, &mut outstanding)
            .await;
        assert_eq!(record.readings.len(), 4);
        assert_eq!(record.failures().count(), 4);
    }

    #[tokio::test]
    async fn test_empty_sensor_set() {
        let bus = bus(Duration::ZERO, HashMap::new());

        let record = poll_all(bus, &[], Local::now(), None, &mut OutstandingReads::default()).await;
        assert!(record.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reads_run_in_parallel() {
        let names = ["A", "B", "C", "D", "E", "F"];
        let bus = bus(
            Duration::from_millis(300),
            names.iter().map(|n| (SensorId::from(*n), 20f32)).collect(),
        );
        let mut outstanding = OutstandingReads::default();

        let started = std::time::Instant::now();
        let record = poll_all(bus, &ids(&names), Local::now(), None, &mut outstanding).await;
        let elapsed = started.elapsed();

        assert_eq!(record.successes().count(), names.len());
        // Serial polling would take 1.8s.
        assert!(elapsed < Duration::from_millis(1200), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_cycle_timeout_marks_slow_reads_failed() {
        let bus = bus(Duration::from_millis(500), HashMap::from([("A".into(), 20f32)]));

        let started = std::time::Instant::now();
        let record = poll_all(
            bus,
            &ids(&["A"]),
            Local::now(),
            Some(Duration::from_millis(50)),
            &mut OutstandingReads::default(),
        )
        .await;

        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(matches!(
            record.readings[0].error(),
            Some(ReadError::Timeout(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_sensor_is_skipped_until_its_read_returns() {
        let bus = bus(
            Duration::from_millis(400),
            HashMap::from([("A".into(), 20f32)]),
        );
        let mut outstanding = OutstandingReads::default();
        let timeout = Some(Duration::from_millis(50));

        let first = poll_all(bus.clone(), &ids(&["A"]), Local::now(), timeout, &mut outstanding)
            .await;
        assert!(matches!(first.readings[0].error(), Some(ReadError::Timeout(_))));
        assert!(outstanding.contains(&"A".into()));

        let second = poll_all(bus.clone(), &ids(&["A"]), Local::now(), timeout, &mut outstanding)
            .await;
        assert!(matches!(second.readings[0].error(), Some(ReadError::StillRunning)));
        assert_eq!(bus.reads.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let third = poll_all(bus.clone(), &ids(&["A"]), Local::now(), None, &mut outstanding)
            .await;
        assert!(outstanding.is_empty());
        assert_eq!(third.successes().count(), 1);
        assert_eq!(bus.reads.load(Ordering::SeqCst), 2);
    }
}
