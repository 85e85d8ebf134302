use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, Local, NaiveDate};
use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::models::{poll_record::PollRecord, reading::Reading, temperature::TemperatureUnit};

use super::filter::ChangeFilter;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// What to do with a failed reading in the CSV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailedReadPolicy {
    /// Leave it out. The failure is still reported on the diagnostic channel.
    #[default]
    Omit,
    /// Write a row with an empty temperature field.
    Marker,
}

#[derive(Error, Debug)]
#[error("Unknown failed read policy '{0}'. Expected 'omit' or 'marker'.")]
pub struct UnknownPolicyError(String);

impl FromStr for FailedReadPolicy {
    type Err = UnknownPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "omit" => Ok(FailedReadPolicy::Omit),
            "marker" => Ok(FailedReadPolicy::Marker),
            other => Err(UnknownPolicyError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogWriterConfig {
    pub directory: PathBuf,
    pub base_name: String,
    pub unit: TemperatureUnit,
    pub precision: usize,
    pub failed_reads: FailedReadPolicy,
    pub change_filter: Option<ChangeFilter>,
}

impl Default for LogWriterConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            base_name: "sensors".to_string(),
            unit: TemperatureUnit::Celsius,
            precision: 1,
            failed_reads: FailedReadPolicy::Omit,
            change_filter: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum LogWriterError {
    #[error("Failed to create log directory '{path}'.")]
    FailedToCreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open log file '{path}'.")]
    FailedToOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write to log file '{path}'.")]
    FailedToWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The one file currently receiving rows.
struct OpenLogFile {
    date: NaiveDate,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl OpenLogFile {
    fn write_line(&mut self, line: &str) -> Result<(), LogWriterError> {
        writeln!(self.writer, "{}", line).map_err(|e| LogWriterError::FailedToWrite {
            path: self.path.clone(),
            source: e,
        })
    }

    fn flush(&mut self) -> Result<(), LogWriterError> {
        self.writer.flush().map_err(|e| LogWriterError::FailedToWrite {
            path: self.path.clone(),
            source: e,
        })
    }
}

/// Appends poll records to one CSV file per calendar day.
///
/// The file for a day is opened lazily by the first record of that day and
/// replaced when a record from another day arrives. Existing files are
/// appended to, never truncated. The open file is flushed after every record
/// and closed on `close` or drop.
pub struct LogWriter {
    config: LogWriterConfig,
    current: Option<OpenLogFile>,
}

impl LogWriter {
    pub fn new(config: LogWriterConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    /// `{directory}/{base_name}_{YYYY-MM-DD}.csv`
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.config.directory.join(format!(
            "{}_{}.csv",
            self.config.base_name,
            date.format("%Y-%m-%d")
        ))
    }

    /// Path of the file currently open, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|f| f.path.as_path())
    }

    pub fn current_date(&self) -> Option<NaiveDate> {
        self.current.as_ref().map(|f| f.date)
    }

    fn header(&self) -> String {
        format!("timestamp,sensor_id,{}", self.config.unit.column_name())
    }

    /// Write one record. Returns the number of data rows written.
    #[tracing::instrument(skip_all)]
    pub fn write(&mut self, record: &PollRecord) -> Result<usize, LogWriterError> {
        self.rotate_if_needed(record.date())?;

        let lines = record
            .readings
            .iter()
            .filter_map(|reading| self.format_row(record.timestamp, reading))
            .collect::<Vec<_>>();

        let Some(file) = self.current.as_mut() else {
            return Ok(0);
        };
        for line in lines.iter() {
            file.write_line(line)?;
        }
        file.flush()?;

        trace!("Wrote {} rows to {}.", lines.len(), file.path.display());
        Ok(lines.len())
    }

    /// Produce the CSV row for a reading, or `None` if it shouldn't be written.
    fn format_row(&mut self, timestamp: DateTime<Local>, reading: &Reading) -> Option<String> {
        let stamp = timestamp.format(TIMESTAMP_FORMAT);
        match reading.temperature() {
            Some(temperature) => {
                let value = temperature.in_unit(self.config.unit);
                if let Some(filter) = self.config.change_filter.as_mut() {
                    if !filter.should_write(&reading.sensor_id, value, timestamp) {
                        return None;
                    }
                }
                Some(format!(
                    "{},{},{:.*}",
                    stamp, reading.sensor_id, self.config.precision, value
                ))
            }
            None => match self.config.failed_reads {
                FailedReadPolicy::Omit => None,
                FailedReadPolicy::Marker => Some(format!("{},{},", stamp, reading.sensor_id)),
            },
        }
    }

    /// Make sure the file for `date` is the open one.
    fn rotate_if_needed(&mut self, date: NaiveDate) -> Result<(), LogWriterError> {
        if self.current_date() == Some(date) {
            return Ok(());
        }
        if self.current.is_some() {
            info!("Date changed to {}. Rolling over log file.", date);
        }
        self.close()?;
        self.open(date)
    }

    /// Open (or create) the file for `date`, closing any other open file.
    pub fn open(&mut self, date: NaiveDate) -> Result<(), LogWriterError> {
        self.close()?;

        let directory = &self.config.directory;
        fs::create_dir_all(directory).map_err(|e| LogWriterError::FailedToCreateDirectory {
            path: directory.clone(),
            source: e,
        })?;

        let path = self.path_for(date);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LogWriterError::FailedToOpen {
                path: path.clone(),
                source: e,
            })?;
        let is_new = file
            .metadata()
            .map_err(|e| LogWriterError::FailedToOpen {
                path: path.clone(),
                source: e,
            })?
            .len()
            == 0;

        let mut open = OpenLogFile {
            date,
            path,
            writer: BufWriter::new(file),
        };
        if is_new {
            open.write_line(&self.header())?;
            open.flush()?;
            info!("New log file created: {}", open.path.display());
        } else {
            info!("Continuing existing log file: {}", open.path.display());
        }

        if let Some(filter) = self.config.change_filter.as_mut() {
            filter.reset();
        }
        self.current = Some(open);
        Ok(())
    }

    /// Flush and close the open file. Does nothing if none is open.
    pub fn close(&mut self) -> Result<(), LogWriterError> {
        if let Some(mut file) = self.current.take() {
            file.flush()?;
            debug!("Closed log file {}.", file.path.display());
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close log file on drop. Error: {}", e);
        }
    }
}
