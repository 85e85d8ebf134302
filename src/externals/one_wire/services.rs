use std::{
    collections::HashMap,
    fs, io,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::models::{
    sensor_id::SensorId,
    temperature::{Temperature, TemperatureError},
};

/// Default location the w1 bus driver exposes devices under.
pub const DEFAULT_DEVICES_ROOT: &str = "/sys/bus/w1/devices";
/// Family code of DS18B20 temperature probes.
pub const DEFAULT_FAMILY: &str = "28";

/// Value the DS18B20 scratchpad holds after power-on, before a conversion ran.
const POWER_ON_RESET_MILLI_C: i32 = 85_000;

/// This service separates the external logic of talking to the 1-wire bus
/// driver from the polling logic, so the poll cycle and scheduler can be
/// unit tested with a fake bus.
///
/// Both calls block. Callers are expected to run them off the async runtime.
pub trait OneWireBusService: Send + Sync + 'static {
    /// List the sensors currently attached to the bus. An empty list is not
    /// an error. Failing to query the bus at all is.
    fn discover_sensors(&self) -> Result<Vec<SensorId>, DiscoveryError>;

    /// Perform one blocking conversion/read of a single sensor.
    fn read_sensor(&self, id: &SensorId) -> Result<Temperature, ReadError>;
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// The driver directory doesn't exist, usually because the w1 kernel
    /// modules aren't loaded.
    #[error("1-wire directory '{0}' not found.")]
    BusNotFound(PathBuf),

    #[error("Failed to list 1-wire directory '{path}'.")]
    FailedToList {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Everything that can go wrong reading a single sensor. Cloneable so it can
/// travel inside a `PollRecord` over a broadcast channel.
#[derive(Error, Debug, Clone)]
pub enum ReadError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// The driver reported a bad CRC on the first line.
    #[error("CRC check failed: '{0}'")]
    CrcMismatch(String),

    #[error("Malformed sensor data: '{0}'")]
    Malformed(String),

    /// The sensor answered with its power-on default instead of a conversion.
    #[error("Sensor returned power-on reset value")]
    PowerOnReset,

    #[error("Failed to parse temperature: {0}")]
    FailedToParse(#[from] TemperatureError),

    #[error("Read did not finish within {0:?}")]
    Timeout(Duration),

    /// A read from an earlier cycle timed out and has not returned yet.
    #[error("Previous read is still running")]
    StillRunning,

    #[error("Read worker failed: {0}")]
    WorkerFailed(String),
}

/// Talks to the Linux w1 sysfs interface.
pub struct OneWireBusServiceActual {
    devices_root: PathBuf,
    family: String,
    offsets: HashMap<SensorId, f32>,
}

impl OneWireBusServiceActual {
    pub fn new(
        devices_root: impl Into<PathBuf>,
        family: impl Into<String>,
        offsets: HashMap<SensorId, f32>,
    ) -> Self {
        Self {
            devices_root: devices_root.into(),
            family: family.into(),
            offsets,
        }
    }

    fn slave_file(&self, id: &SensorId) -> PathBuf {
        self.devices_root.join(id.as_str()).join("w1_slave")
    }
}

impl OneWireBusService for OneWireBusServiceActual {
    /// Every directory entry named `{family}-...` is a sensor. Sorted so
    /// records come out in a stable order.
    fn discover_sensors(&self) -> Result<Vec<SensorId>, DiscoveryError> {
        if !self.devices_root.is_dir() {
            return Err(DiscoveryError::BusNotFound(self.devices_root.clone()));
        }

        let entries =
            fs::read_dir(&self.devices_root).map_err(|e| DiscoveryError::FailedToList {
                path: self.devices_root.clone(),
                source: e,
            })?;

        let prefix = format!("{}-", self.family);
        let mut sensors = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(&prefix))
            .map(SensorId::new)
            .collect::<Vec<_>>();
        sensors.sort();

        trace!("Discovered {} sensors.", sensors.len());
        Ok(sensors)
    }

    fn read_sensor(&self, id: &SensorId) -> Result<Temperature, ReadError> {
        let path = self.slave_file(id);
        let contents = fs::read_to_string(&path).map_err(|e| ReadError::Io {
            path: path.clone(),
            source: Arc::new(e),
        })?;

        let temperature = parse_w1_slave(&contents)?;
        debug!("Read {} from {}.", temperature, id);

        match self.offsets.get(id) {
            Some(offset) => Ok(temperature.with_offset(*offset)?),
            None => Ok(temperature),
        }
    }
}

/// Parse the two line `w1_slave` format:
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
pub fn parse_w1_slave(contents: &str) -> Result<Temperature, ReadError> {
    let mut lines = contents.lines();

    let status = lines.next().map(str::trim).unwrap_or_default();
    if !status.ends_with("YES") {
        return Err(ReadError::CrcMismatch(status.to_string()));
    }

    let data = lines.next().map(str::trim).unwrap_or_default();
    let milli = data
        .split_once("t=")
        .and_then(|(_, raw)| raw.trim().parse::<i32>().ok())
        .ok_or_else(|| ReadError::Malformed(data.to_string()))?;

    if milli == POWER_ON_RESET_MILLI_C {
        return Err(ReadError::PowerOnReset);
    }

    Ok(Temperature::try_from(milli as f32 / 1000f32)?)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    const GOOD: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n72 01 4b 46 7f ff 0e 10 57 t=23125\n";

    fn write_sensor(root: &Path, name: &str, contents: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).expect("Failed to create sensor dir");
        fs::write(dir.join("w1_slave"), contents).expect("Failed to write w1_slave");
    }

    #[test]
    fn test_parse_good_reading() {
        let t = parse_w1_slave(GOOD).expect("Failed to parse");
        assert_eq!(t.value, 23.125f32);
    }

    #[test]
    fn test_parse_negative_reading() {
        let t = parse_w1_slave("aa : crc=aa YES\naa t=-10250\n").expect("Failed to parse");
        assert_eq!(t.value, -10.25f32);
    }

    #[test]
    fn test_parse_crc_failure() {
        let result = parse_w1_slave("72 01 4b 46 7f ff 0e 10 57 : crc=00 NO\n72 01 t=23125\n");
        assert!(matches!(result, Err(ReadError::CrcMismatch(_))));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_w1_slave("xx YES\nno temperature here\n"),
            Err(ReadError::Malformed(_))
        ));
        assert!(matches!(parse_w1_slave(""), Err(ReadError::CrcMismatch(_))));
    }

    #[test]
    fn test_parse_power_on_reset() {
        assert!(matches!(
            parse_w1_slave("xx YES\nxx t=85000\n"),
            Err(ReadError::PowerOnReset)
        ));
    }

    #[test]
    fn test_discover_filters_by_family_and_sorts() {
        let root = tempfile::tempdir().expect("Failed to create tempdir");
        write_sensor(root.path(), "28-bbbb", GOOD);
        write_sensor(root.path(), "28-aaaa", GOOD);
        fs::create_dir_all(root.path().join("w1_bus_master1")).expect("Failed to create dir");
        fs::create_dir_all(root.path().join("10-cccc")).expect("Failed to create dir");

        let bus = OneWireBusServiceActual::new(root.path(), DEFAULT_FAMILY, HashMap::new());
        let sensors = bus.discover_sensors().expect("Failed to discover");

        assert_eq!(sensors, vec![SensorId::from("28-aaaa"), SensorId::from("28-bbbb")]);
    }

    #[test]
    fn test_discover_empty_bus_is_not_an_error() {
        let root = tempfile::tempdir().expect("Failed to create tempdir");
        let bus = OneWireBusServiceActual::new(root.path(), DEFAULT_FAMILY, HashMap::new());
        assert!(bus.discover_sensors().expect("Failed to discover").is_empty());
    }

    #[test]
    fn test_discover_missing_bus_is_an_error() {
        let root = tempfile::tempdir().expect("Failed to create tempdir");
        let bus = OneWireBusServiceActual::new(
            root.path().join("missing"),
            DEFAULT_FAMILY,
            HashMap::new(),
        );
        assert!(matches!(
            bus.discover_sensors(),
            Err(DiscoveryError::BusNotFound(_))
        ));
    }

    #[test]
    fn test_read_applies_offset() {
        let root = tempfile::tempdir().expect("Failed to create tempdir");
        write_sensor(root.path(), "28-aaaa", GOOD);
        let offsets = HashMap::from([(SensorId::from("28-aaaa"), -0.125f32)]);
        let bus = OneWireBusServiceActual::new(root.path(), DEFAULT_FAMILY, offsets);

        let t = bus
            .read_sensor(&SensorId::from("28-aaaa"))
            .expect("Failed to read");
        assert_eq!(t.value, 23f32);
    }

    #[test]
    fn test_read_unplugged_sensor() {
        let root = tempfile::tempdir().expect("Failed to create tempdir");
        let bus = OneWireBusServiceActual::new(root.path(), DEFAULT_FAMILY, HashMap::new());
        assert!(matches!(
            bus.read_sensor(&SensorId::from("28-gone")),
            Err(ReadError::Io { .. })
        ));
    }
}
