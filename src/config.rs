use std::{collections::HashMap, path::PathBuf, time::Duration};

use clap::Parser;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::{
    externals::{
        csv_log::{
            filter::ChangeFilter,
            writer::{FailedReadPolicy, LogWriterConfig},
        },
        one_wire::services::{DEFAULT_DEVICES_ROOT, DEFAULT_FAMILY},
    },
    models::{sensor_id::SensorId, temperature::TemperatureUnit},
    tasks::scheduler::SchedulerSettings,
};

/// Fastest sampling interval that makes sense for DS18B20 probes.
const MIN_TICK_SECS: f64 = 1.0;
/// One reading a day.
const MAX_TICK_SECS: f64 = 86_400.0;
const MAX_PRECISION: usize = 6;

/// Simple logger for 1-wire temperature sensors. Writes one CSV file per day.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// Directory daily CSV files are written to.
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Base for file names; files are named `{datafile}_{YYYY-MM-DD}.csv`.
    #[arg(short, long, default_value = "sensors")]
    pub datafile: String,

    /// Target time in seconds between readings.
    #[arg(short, long, default_value_t = 5.0)]
    pub tick: f64,

    /// Only log this sensor. Repeat to allow several. Default is every sensor found.
    #[arg(long = "sensor", value_name = "ID")]
    pub sensors: Vec<String>,

    /// Directory the w1 bus driver exposes devices under.
    #[arg(long, default_value = DEFAULT_DEVICES_ROOT)]
    pub devices_root: PathBuf,

    /// Device family prefix to treat as temperature sensors.
    #[arg(long, default_value = DEFAULT_FAMILY)]
    pub family: String,

    /// Calibration offset in degC added to a sensor's readings. Repeatable.
    #[arg(long = "offset", value_name = "ID=VALUE")]
    pub offsets: Vec<String>,

    /// Seconds a poll cycle may take before slow sensors are marked failed.
    #[arg(long)]
    pub cycle_timeout: Option<f64>,

    /// Seconds an in-flight poll cycle may take to finish after shutdown is requested.
    #[arg(long, default_value_t = 3.0)]
    pub grace_period: f64,

    /// What to write for a failed read: `omit` or `marker`.
    #[arg(long, default_value = "omit")]
    pub failed_reads: FailedReadPolicy,

    /// Output unit: `celsius` or `fahrenheit`.
    #[arg(long, default_value = "celsius")]
    pub unit: TemperatureUnit,

    /// Decimal places written to the CSV.
    #[arg(long, default_value_t = 1)]
    pub precision: usize,

    /// Only write a sensor's row when it changed by at least this much. 0 writes every reading.
    #[arg(long, default_value_t = 0.0)]
    pub min_change: f32,

    /// With --min-change, write a row anyway once this many seconds passed since the last one.
    #[arg(long, default_value_t = 60)]
    pub force_write: u64,

    /// Echo each record to stdout.
    #[arg(short, long)]
    pub console: bool,

    /// Maximum log level: off, error, warn, info, debug or trace.
    #[arg(long, default_value = "info")]
    pub log_level: LevelFilter,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Tick must be 1 second or more, got {0}.")]
    TickTooShort(f64),

    #[error("Tick must be at most 86400 seconds (one day), got {0}.")]
    TickTooLong(f64),

    #[error("{0} must be a non-negative number of seconds, got {1}.")]
    InvalidDuration(&'static str, f64),

    #[error("Offset '{0}' must look like ID=VALUE, e.g. 28-000005e2fdc3=-0.25.")]
    MalformedOffset(String),

    #[error("Precision {0} is too large. At most 6 decimals are supported.")]
    PrecisionTooLarge(usize),

    #[error("Minimum change must be a non-negative number, got {0}.")]
    InvalidMinChange(f32),
}

/// Validated settings for the whole process.
#[derive(Debug, Clone)]
pub struct Config {
    pub scheduler: SchedulerSettings,
    pub log_writer: LogWriterConfig,
    pub devices_root: PathBuf,
    pub family: String,
    pub offsets: HashMap<SensorId, f32>,
    /// Unit to echo records to stdout in, if echoing is on.
    pub console: Option<TemperatureUnit>,
    pub log_level: LevelFilter,
}

fn seconds(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration(name, value))
}

fn parse_offset(raw: &str) -> Result<(SensorId, f32), ConfigError> {
    let malformed = || ConfigError::MalformedOffset(raw.to_string());
    let (id, value) = raw.split_once('=').ok_or_else(malformed)?;
    let id = id.trim();
    if id.is_empty() {
        return Err(malformed());
    }
    let value = value.trim().parse::<f32>().map_err(|_| malformed())?;
    if !value.is_finite() {
        return Err(malformed());
    }
    Ok((SensorId::new(id), value))
}

impl TryFrom<Args> for Config {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if !(args.tick >= MIN_TICK_SECS) {
            return Err(ConfigError::TickTooShort(args.tick));
        }
        if args.tick > MAX_TICK_SECS {
            return Err(ConfigError::TickTooLong(args.tick));
        }
        if args.precision > MAX_PRECISION {
            return Err(ConfigError::PrecisionTooLarge(args.precision));
        }
        if !(args.min_change >= 0f32) {
            return Err(ConfigError::InvalidMinChange(args.min_change));
        }

        let offsets = args
            .offsets
            .iter()
            .map(|raw| parse_offset(raw))
            .collect::<Result<HashMap<_, _>, _>>()?;

        let cycle_timeout = args
            .cycle_timeout
            .map(|secs| seconds("Cycle timeout", secs))
            .transpose()?;

        let force_write = chrono::Duration::from_std(Duration::from_secs(args.force_write))
            .map_err(|_| ConfigError::InvalidDuration("Force write", args.force_write as f64))?;
        let change_filter =
            (args.min_change > 0f32).then(|| ChangeFilter::new(args.min_change, force_write));

        Ok(Config {
            scheduler: SchedulerSettings {
                interval: seconds("Tick", args.tick)?,
                allowlist: args.sensors.into_iter().map(SensorId::new).collect(),
                cycle_timeout,
                grace_period: seconds("Grace period", args.grace_period)?,
            },
            log_writer: LogWriterConfig {
                directory: args.output_dir,
                base_name: args.datafile,
                unit: args.unit,
                precision: args.precision,
                failed_reads: args.failed_reads,
                change_filter,
            },
            devices_root: args.devices_root,
            family: args.family,
            offsets,
            console: args.console.then_some(args.unit),
            log_level: args.log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(extra: &[&str]) -> Result<Config, ConfigError> {
        let args = Args::try_parse_from(std::iter::once("w1_temp_logger").chain(extra.iter().copied()))
            .expect("Failed to parse arguments");
        Config::try_from(args)
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).expect("Failed to build config");

        assert_eq!(config.scheduler.interval, Duration::from_secs(5));
        assert_eq!(config.scheduler.grace_period, Duration::from_secs(3));
        assert!(config.scheduler.allowlist.is_empty());
        assert_eq!(config.scheduler.cycle_timeout, None);
        assert_eq!(config.log_writer.directory, PathBuf::from("."));
        assert_eq!(config.log_writer.base_name, "sensors");
        assert_eq!(config.log_writer.failed_reads, FailedReadPolicy::Omit);
        assert!(config.log_writer.change_filter.is_none());
        assert_eq!(config.devices_root, PathBuf::from("/sys/bus/w1/devices"));
        assert_eq!(config.family, "28");
        assert_eq!(config.console, None);
        assert_eq!(config.log_level, LevelFilter::INFO);
    }

    #[test]
    fn test_full_command_line() {
        let config = config(&[
            "-o",
            "/var/log/temps",
            "-d",
            "greenhouse",
            "-t",
            "2.5",
            "--sensor",
            "28-aaaa",
            "--sensor",
            "28-bbbb",
            "--offset",
            "28-aaaa=-0.25",
            "--cycle-timeout",
            "2",
            "--failed-reads",
            "marker",
            "--unit",
            "fahrenheit",
            "--min-change",
            "0.2",
            "-c",
            "--log-level",
            "debug",
        ])
        .expect("Failed to build config");

        assert_eq!(config.scheduler.interval, Duration::from_millis(2500));
        assert_eq!(
            config.scheduler.allowlist,
            vec![SensorId::from("28-aaaa"), SensorId::from("28-bbbb")]
        );
        assert_eq!(config.offsets.get(&SensorId::from("28-aaaa")), Some(&-0.25f32));
        assert_eq!(config.scheduler.cycle_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.log_writer.directory, PathBuf::from("/var/log/temps"));
        assert_eq!(config.log_writer.base_name, "greenhouse");
        assert_eq!(config.log_writer.failed_reads, FailedReadPolicy::Marker);
        assert_eq!(config.log_writer.unit, TemperatureUnit::Fahrenheit);
        assert!(config.log_writer.change_filter.is_some());
        assert_eq!(config.console, Some(TemperatureUnit::Fahrenheit));
        assert_eq!(config.log_level, LevelFilter::DEBUG);
    }

    #[test]
    fn test_tick_too_short() {
        assert!(matches!(
            config(&["--tick", "0.5"]),
            Err(ConfigError::TickTooShort(_))
        ));
    }

    #[test]
    fn test_tick_too_long() {
        assert!(matches!(
            config(&["--tick", "10000000000000"]),
            Err(ConfigError::TickTooLong(_))
        ));
        assert!(config(&["--tick", "86400"]).is_ok());
    }

    #[test]
    fn test_malformed_offsets() {
        for bad in ["28-aaaa", "=1.0", "28-aaaa=warm", "28-aaaa=inf"] {
            assert!(
                matches!(
                    config(&["--offset", bad]),
                    Err(ConfigError::MalformedOffset(_))
                ),
                "accepted '{}'",
                bad
            );
        }
    }

    #[test]
    fn test_negative_grace_period() {
        assert!(matches!(
            config(&["--grace-period=-1"]),
            Err(ConfigError::InvalidDuration(..))
        ));
    }

    #[test]
    fn test_precision_limit() {
        assert!(matches!(
            config(&["--precision", "9"]),
            Err(ConfigError::PrecisionTooLarge(9))
        ));
    }

    #[test]
    fn test_unknown_unit_is_rejected_by_parser() {
        assert!(Args::try_parse_from(["w1_temp_logger", "--unit", "kelvin"]).is_err());
    }
}
