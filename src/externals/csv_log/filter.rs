use std::collections::HashMap;

use chrono::{DateTime, Duration, Local};

use crate::models::sensor_id::SensorId;

/// Per-sensor deadband. A value is only worth a row if it moved at least
/// `min_change` since the last row written for that sensor, or if that row is
/// older than `force_write`. Keeps slowly changing probes from filling the log
/// with identical lines while still proving they are being read.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    min_change: f32,
    force_write: Duration,
    last_written: HashMap<SensorId, (f32, DateTime<Local>)>,
}

impl ChangeFilter {
    pub fn new(min_change: f32, force_write: Duration) -> Self {
        Self {
            min_change,
            force_write,
            last_written: HashMap::new(),
        }
    }

    /// Decide whether a row should be written, and remember it if so.
    pub fn should_write(&mut self, id: &SensorId, value: f32, timestamp: DateTime<Local>) -> bool {
        let write = match self.last_written.get(id) {
            None => true,
            Some((last_value, last_time)) => {
                (value - last_value).abs() >= self.min_change
                    || timestamp - *last_time >= self.force_write
            }
        };

        if write {
            self.last_written.insert(id.clone(), (value, timestamp));
        }
        write
    }

    /// Forget history so the next value of every sensor is written. Called
    /// when a new file is started.
    pub fn reset(&mut self) {
        self.last_written.clear();
    }
}
