use chrono::{DateTime, Duration, Local};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Tick interval {0} moves the schedule past the representable date range.")]
pub struct ScheduleOutOfRange(pub Duration);

/// Fixed-period tick generator. Ticks are computed from the first tick, not
/// from when the previous cycle finished, so cycle run time never accumulates
/// as drift.
#[derive(Debug, Clone)]
pub struct Schedule {
    interval: Duration,
    next_tick: DateTime<Local>,
}

/// Result of moving the schedule past a finished cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    /// Ticks that were skipped because the cycle ran past them.
    pub missed: u32,
    /// How far past the first missed tick the cycle finished.
    pub overrun: Duration,
}

impl Schedule {
    /// Start ticking at `first_tick`.
    pub fn starting_at(first_tick: DateTime<Local>, interval: Duration) -> Self {
        Self {
            interval,
            next_tick: first_tick,
        }
    }

    /// Start at the next wall-clock multiple of `interval` strictly after
    /// `now`, so a 5 second tick lands on :00, :05, :10...
    pub fn aligned(now: DateTime<Local>, interval: Duration) -> Result<Self, ScheduleOutOfRange> {
        let out_of_range = || ScheduleOutOfRange(interval);
        let interval_ms = interval.num_milliseconds().max(1);
        let now_ms = now.timestamp_millis();
        let next_ms = (now_ms.div_euclid(interval_ms) + 1)
            .checked_mul(interval_ms)
            .ok_or_else(out_of_range)?;

        let first_tick = DateTime::from_timestamp_millis(next_ms)
            .map(|t| t.with_timezone(&Local))
            .ok_or_else(out_of_range)?;

        Ok(Self::starting_at(first_tick, interval))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_tick(&self) -> DateTime<Local> {
        self.next_tick
    }

    /// Move to the tick after the one just serviced. If the cycle finished
    /// (`now`) after that tick, skip forward to the first tick not yet passed
    /// instead of bursting to catch up.
    pub fn advance(&mut self, now: DateTime<Local>) -> Result<Advance, ScheduleOutOfRange> {
        self.next_tick = self.tick_after(self.next_tick)?;

        let mut missed = 0;
        let overrun = now - self.next_tick;
        while self.next_tick < now {
            self.next_tick = self.tick_after(self.next_tick)?;
            missed += 1;
        }

        Ok(Advance {
            missed,
            overrun: if missed > 0 { overrun } else { Duration::zero() },
        })
    }

    fn tick_after(&self, tick: DateTime<Local>) -> Result<DateTime<Local>, ScheduleOutOfRange> {
        tick.checked_add_signed(self.interval)
            .ok_or(ScheduleOutOfRange(self.interval))
    }
}
