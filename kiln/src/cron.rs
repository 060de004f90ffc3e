//! Cron and time-zone capability used by the recurring scheduler.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Computes the instants a cron expression fires at.
pub trait OccurrenceCalculator: Send + Sync {
    fn validate(&self, expression: &str, time_zone: &str) -> Result<()>;

    /// Instants in `(from, to]`, ascending.
    fn occurrences(
        &self,
        expression: &str,
        time_zone: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>>;

    /// First instant strictly after `after`.
    fn next_occurrence(
        &self,
        expression: &str,
        time_zone: &str,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;
}

/// [`OccurrenceCalculator`] on top of the `cron` and `chrono-tz` crates.
///
/// Accepts the `cron` crate's six or seven field syntax (seconds first) and
/// classic five field expressions, which fire at second zero.
#[derive(Clone, Debug)]
pub struct CronOccurrences {
    /// Upper bound on instants returned from one catch-up window.
    pub max_occurrences: usize,
}

impl Default for CronOccurrences {
    fn default() -> Self {
        Self {
            max_occurrences: 1000,
        }
    }
}

impl CronOccurrences {
    fn schedule(expression: &str) -> Result<Schedule> {
        let trimmed = expression.trim();
        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };
        Schedule::from_str(&normalized).map_err(|e| Error::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
    }

    fn time_zone(id: &str) -> Result<Tz> {
        Tz::from_str(id).map_err(|_| Error::UnknownTimeZone(id.to_string()))
    }
}

impl OccurrenceCalculator for CronOccurrences {
    fn validate(&self, expression: &str, time_zone: &str) -> Result<()> {
        Self::schedule(expression)?;
        Self::time_zone(time_zone)?;
        Ok(())
    }

    fn occurrences(
        &self,
        expression: &str,
        time_zone: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let schedule = Self::schedule(expression)?;
        let tz = Self::time_zone(time_zone)?;
        Ok(schedule
            .after(&from.with_timezone(&tz))
            .map(|at| at.with_timezone(&Utc))
            .take_while(|at| *at <= to)
            .take(self.max_occurrences)
            .collect())
    }

    fn next_occurrence(
        &self,
        expression: &str,
        time_zone: &str,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let schedule = Self::schedule(expression)?;
        let tz = Self::time_zone(time_zone)?;
        Ok(schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|at| at.with_timezone(&Utc)))
    }
}
