use std::fmt::Display;

use chrono::{DateTime, Local};

use crate::externals::one_wire::services::ReadError;

use super::{sensor_id::SensorId, temperature::Temperature};

/// Outcome of reading one sensor during one poll cycle.
#[derive(Debug, Clone)]
pub struct Reading {
    pub sensor_id: SensorId,
    /// Start of the poll cycle this reading belongs to.
    pub timestamp: DateTime<Local>,
    pub outcome: Result<Temperature, ReadError>,
}

impl Reading {
    pub fn ok(sensor_id: SensorId, timestamp: DateTime<Local>, temperature: Temperature) -> Self {
        Self {
            sensor_id,
            timestamp,
            outcome: Ok(temperature),
        }
    }

    pub fn failed(sensor_id: SensorId, timestamp: DateTime<Local>, error: ReadError) -> Self {
        Self {
            sensor_id,
            timestamp,
            outcome: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn temperature(&self) -> Option<Temperature> {
        self.outcome.as_ref().ok().copied()
    }

    pub fn error(&self) -> Option<&ReadError> {
        self.outcome.as_ref().err()
    }
}

impl Display for Reading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.outcome {
            Ok(t) => write!(f, "(Reading: {}={})", self.sensor_id, t),
            Err(e) => write!(f, "(Reading: {} failed: {})", self.sensor_id, e),
        }
    }
}
