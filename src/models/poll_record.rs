use std::fmt::Display;

use chrono::{DateTime, Local, NaiveDate};

use super::reading::Reading;

/// Every reading taken in one poll cycle. All readings share `timestamp`,
/// the instant the cycle started.
#[derive(Debug, Clone)]
pub struct PollRecord {
    pub timestamp: DateTime<Local>,
    pub readings: Vec<Reading>,
}

impl PollRecord {
    pub fn new(timestamp: DateTime<Local>, readings: Vec<Reading>) -> Self {
        Self {
            timestamp,
            readings,
        }
    }

    pub fn empty(timestamp: DateTime<Local>) -> Self {
        Self::new(timestamp, vec![])
    }

    /// Calendar day (local time) the record belongs to.
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn successes(&self) -> impl Iterator<Item = &Reading> {
        self.readings.iter().filter(|r| r.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &Reading> {
        self.readings.iter().filter(|r| !r.is_ok())
    }
}

impl Display for PollRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<PollRecord | {} | {} ok, {} failed>",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.successes().count(),
            self.failures().count()
        )
    }
}
