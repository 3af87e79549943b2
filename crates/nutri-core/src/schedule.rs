//! # Job Scheduling
//!
//! Background jobs (overdue invoice reminders, outbox flushing, lock
//! expiry sweeps) run on simple UTC schedules:
//!
//! - `every <n>m` / `every <n>h`: fixed interval from the last run
//! - `daily HH:MM`
//! - `weekly <mon..sun> HH:MM`
//!
//! [`JobTable`] tracks which jobs are enabled, manually triggered and due.
//! It holds no clock and runs nothing; the API's scheduler task polls
//! [`JobTable::due`] and reports back through [`JobTable::mark_ran`].

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheduling errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The schedule expression could not be parsed.
    #[error("invalid schedule '{input}': {reason}")]
    Parse {
        /// Offending input.
        input: String,
        /// What was wrong.
        reason: &'static str,
    },

    /// No job with this name is registered.
    #[error("unknown job '{0}'")]
    UnknownJob(String),

    /// A job with this name is already registered.
    #[error("job '{0}' already registered")]
    DuplicateJob(String),
}

/// A recurring UTC schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Schedule {
    /// Fixed interval in minutes.
    Every {
        /// Interval length in minutes (≥ 1).
        minutes: u32,
    },
    /// Once a day at a fixed time.
    Daily {
        /// Time of day (UTC).
        at: NaiveTime,
    },
    /// Once a week on a fixed day and time.
    Weekly {
        /// Day of week.
        day: Weekday,
        /// Time of day (UTC).
        at: NaiveTime,
    },
}

fn parse_err(input: &str, reason: &'static str) -> ScheduleError {
    ScheduleError::Parse {
        input: input.to_string(),
        reason,
    }
}

fn parse_time(input: &str, s: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| parse_err(input, "time must be HH:MM"))
}

fn parse_weekday(input: &str, s: &str) -> Result<Weekday, ScheduleError> {
    Ok(match s {
        "mon" => Weekday::Mon,
        "tue" => Weekday::Tue,
        "wed" => Weekday::Wed,
        "thu" => Weekday::Thu,
        "fri" => Weekday::Fri,
        "sat" => Weekday::Sat,
        "sun" => Weekday::Sun,
        _ => return Err(parse_err(input, "day must be one of mon..sun")),
    })
}

fn weekday_str(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

impl Schedule {
    /// Parse a schedule expression.
    pub fn parse(input: &str) -> Result<Self, ScheduleError> {
        let lowered = input.trim().to_ascii_lowercase();
        let parts: Vec<&str> = lowered.split_whitespace().collect();
        match parts.as_slice() {
            ["every", spec] => {
                let (num, per_unit) = if let Some(num) = spec.strip_suffix('m') {
                    (num, 1)
                } else if let Some(num) = spec.strip_suffix('h') {
                    (num, 60)
                } else {
                    return Err(parse_err(input, "interval unit must be m or h"));
                };
                let n: u32 = num
                    .parse()
                    .map_err(|_| parse_err(input, "interval must be a positive integer"))?;
                let minutes = n.checked_mul(per_unit);
                match minutes {
                    Some(m) if m >= 1 && m <= 7 * 24 * 60 => Ok(Self::Every { minutes: m }),
                    _ => Err(parse_err(input, "interval must be between 1m and 168h")),
                }
            }
            ["daily", time] => Ok(Self::Daily {
                at: parse_time(input, time)?,
            }),
            ["weekly", day, time] => Ok(Self::Weekly {
                day: parse_weekday(input, day)?,
                at: parse_time(input, time)?,
            }),
            _ => Err(parse_err(
                input,
                "expected 'every <n>m|h', 'daily HH:MM' or 'weekly <day> HH:MM'",
            )),
        }
    }

    /// The first scheduled instant strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Self::Every { minutes } => t + Duration::minutes(i64::from(minutes)),
            Self::Daily { at } => {
                let today = t.date_naive().and_time(at).and_utc();
                if today > t {
                    today
                } else {
                    today + Duration::days(1)
                }
            }
            Self::Weekly { day, at } => {
                let current = t.weekday().num_days_from_monday() as i64;
                let target = day.num_days_from_monday() as i64;
                let ahead = (target - current).rem_euclid(7);
                let candidate = (t.date_naive() + Duration::days(ahead)).and_time(at).and_utc();
                if candidate > t {
                    candidate
                } else {
                    candidate + Duration::days(7)
                }
            }
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Every { minutes } if minutes % 60 == 0 => write!(f, "every {}h", minutes / 60),
            Self::Every { minutes } => write!(f, "every {minutes}m"),
            Self::Daily { at } => write!(f, "daily {}", at.format("%H:%M")),
            Self::Weekly { day, at } => {
                write!(f, "weekly {} {}", weekday_str(*day), at.format("%H:%M"))
            }
        }
    }
}

impl TryFrom<String> for Schedule {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Schedule> for String {
    fn from(value: Schedule) -> Self {
        value.to_string()
    }
}

/// Outcome of a job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The run completed; detail is a short summary.
    Success(String),
    /// The run failed; detail is the error message.
    Failed(String),
}

/// A registered job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job name.
    pub name: String,
    /// When the job runs.
    pub schedule: Schedule,
    /// Disabled jobs only run when triggered.
    pub enabled: bool,
    /// Set by [`JobTable::trigger`]; cleared after the next run.
    pub triggered: bool,
    /// Next scheduled run.
    pub next_run: DateTime<Utc>,
    /// Last run instant.
    pub last_run: Option<DateTime<Utc>>,
    /// Last run outcome.
    pub last_outcome: Option<JobOutcome>,
}

/// The set of registered jobs, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobTable {
    jobs: BTreeMap<String, Job>,
}

impl JobTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an enabled job; its first run is scheduled after `now`.
    pub fn register(
        &mut self,
        name: &str,
        schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        if self.jobs.contains_key(name) {
            return Err(ScheduleError::DuplicateJob(name.to_string()));
        }
        self.jobs.insert(
            name.to_string(),
            Job {
                name: name.to_string(),
                schedule,
                enabled: true,
                triggered: false,
                next_run: schedule.next_after(now),
                last_run: None,
                last_outcome: None,
            },
        );
        Ok(())
    }

    fn job_mut(&mut self, name: &str) -> Result<&mut Job, ScheduleError> {
        self.jobs
            .get_mut(name)
            .ok_or_else(|| ScheduleError::UnknownJob(name.to_string()))
    }

    /// Look up a job.
    pub fn get(&self, name: &str) -> Option<&Job> {
        self.jobs.get(name)
    }

    /// All jobs ordered by name.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Enable a job, rescheduling it from `now`.
    pub fn enable(&mut self, name: &str, now: DateTime<Utc>) -> Result<&Job, ScheduleError> {
        let job = self.job_mut(name)?;
        if !job.enabled {
            job.enabled = true;
            job.next_run = job.schedule.next_after(now);
        }
        Ok(job)
    }

    /// Disable a job. A pending trigger still runs.
    pub fn disable(&mut self, name: &str) -> Result<&Job, ScheduleError> {
        let job = self.job_mut(name)?;
        job.enabled = false;
        Ok(job)
    }

    /// Request an immediate run on the next poll.
    pub fn trigger(&mut self, name: &str) -> Result<&Job, ScheduleError> {
        let job = self.job_mut(name)?;
        job.triggered = true;
        Ok(job)
    }

    /// Names of jobs that should run at `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        self.jobs
            .values()
            .filter(|j| j.triggered || (j.enabled && j.next_run <= now))
            .map(|j| j.name.clone())
            .collect()
    }

    /// Record a run, clear any trigger and schedule the next run.
    pub fn mark_ran(
        &mut self,
        name: &str,
        now: DateTime<Utc>,
        outcome: JobOutcome,
    ) -> Result<(), ScheduleError> {
        let job = self.job_mut(name)?;
        job.triggered = false;
        job.last_run = Some(now);
        job.last_outcome = Some(outcome);
        job.next_run = job.schedule.next_after(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parses_and_displays() {
        for (input, shown) in [
            ("every 15m", "every 15m"),
            ("every 2h", "every 2h"),
            ("every 120m", "every 2h"),
            ("DAILY 07:30", "daily 07:30"),
            ("weekly fri 18:00", "weekly fri 18:00"),
        ] {
            assert_eq!(Schedule::parse(input).unwrap().to_string(), shown, "{input}");
        }
    }

    #[test]
    fn rejects_bad_expressions() {
        for bad in [
            "",
            "every",
            "every 0m",
            "every 5s",
            "every xh",
            "every 169h",
            "daily 25:00",
            "daily 7",
            "weekly funday 10:00",
            "monthly 1 10:00",
        ] {
            assert!(Schedule::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn interval_next_after() {
        let s = Schedule::parse("every 15m").unwrap();
        assert_eq!(s.next_after(at("2026-01-01T10:00:00Z")), at("2026-01-01T10:15:00Z"));
    }

    #[test]
    fn daily_next_after() {
        let s = Schedule::parse("daily 07:30").unwrap();
        assert_eq!(s.next_after(at("2026-01-01T06:00:00Z")), at("2026-01-01T07:30:00Z"));
        assert_eq!(s.next_after(at("2026-01-01T07:30:00Z")), at("2026-01-02T07:30:00Z"));
        assert_eq!(s.next_after(at("2026-12-31T23:00:00Z")), at("2027-01-01T07:30:00Z"));
    }

    #[test]
    fn weekly_next_after() {
        // 2026-01-01 is a Thursday.
        let s = Schedule::parse("weekly fri 18:00").unwrap();
        assert_eq!(s.next_after(at("2026-01-01T12:00:00Z")), at("2026-01-02T18:00:00Z"));
        assert_eq!(s.next_after(at("2026-01-02T18:00:00Z")), at("2026-01-09T18:00:00Z"));
        let thu = Schedule::parse("weekly thu 09:00").unwrap();
        assert_eq!(thu.next_after(at("2026-01-01T08:00:00Z")), at("2026-01-01T09:00:00Z"));
        assert_eq!(thu.next_after(at("2026-01-01T10:00:00Z")), at("2026-01-08T09:00:00Z"));
    }

    #[test]
    fn job_table_lifecycle() {
        let t0 = at("2026-01-01T10:00:00Z");
        let mut table = JobTable::new();
        table.register("reminders", Schedule::parse("every 10m").unwrap(), t0).unwrap();
        assert_eq!(
            table.register("reminders", Schedule::parse("every 1h").unwrap(), t0),
            Err(ScheduleError::DuplicateJob("reminders".into()))
        );

        assert!(table.due(t0).is_empty());
        let t1 = t0 + Duration::minutes(10);
        assert_eq!(table.due(t1), vec!["reminders".to_string()]);
        table.mark_ran("reminders", t1, JobOutcome::Success("0 sent".into())).unwrap();
        assert!(table.due(t1).is_empty());
        assert_eq!(table.get("reminders").unwrap().next_run, t1 + Duration::minutes(10));

        table.disable("reminders").unwrap();
        assert!(table.due(t1 + Duration::hours(5)).is_empty());
        table.trigger("reminders").unwrap();
        assert_eq!(table.due(t1).len(), 1, "triggered jobs run even when disabled");
        table.mark_ran("reminders", t1, JobOutcome::Failed("boom".into())).unwrap();
        assert!(!table.get("reminders").unwrap().triggered);

        let t2 = t1 + Duration::hours(1);
        table.enable("reminders", t2).unwrap();
        assert_eq!(table.get("reminders").unwrap().next_run, t2 + Duration::minutes(10));
    }

    #[test]
    fn unknown_jobs_error() {
        let mut table = JobTable::new();
        assert_eq!(table.trigger("nope").unwrap_err(), ScheduleError::UnknownJob("nope".into()));
        assert!(table.disable("nope").is_err());
        assert!(table
            .mark_ran("nope", Utc::now(), JobOutcome::Success(String::new()))
            .is_err());
    }

    #[test]
    fn serde_uses_expression() {
        let s: Schedule = serde_json::from_str("\"weekly mon 08:15\"").unwrap();
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"weekly mon 08:15\"");
        assert!(serde_json::from_str::<Schedule>("\"hourly\"").is_err());
    }
}
