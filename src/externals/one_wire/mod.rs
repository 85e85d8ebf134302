use std::{collections::HashMap, path::PathBuf};

use crate::models::sensor_id::SensorId;

use self::services::OneWireBusServiceActual;

pub mod services;

pub struct OneWireModule {
    pub bus_service: OneWireBusServiceActual,
}

impl OneWireModule {
    pub fn initialize(
        devices_root: PathBuf,
        family: String,
        offsets: HashMap<SensorId, f32>,
    ) -> Self {
        Self {
            bus_service: OneWireBusServiceActual::new(devices_root, family, offsets),
        }
    }
}
