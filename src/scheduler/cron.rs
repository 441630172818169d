//! Next-run computation for the three schedule kinds.

use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use super::TaskSchedule;

/// Reject malformed cron expressions and zero intervals at creation time.
pub fn validate_schedule(schedule: &TaskSchedule) -> Result<()> {
    match schedule {
        TaskSchedule::Once { .. } => Ok(()),
        TaskSchedule::Interval { every_secs, .. } => {
            anyhow::ensure!(*every_secs > 0, "interval must be at least one second");
            Ok(())
        }
        TaskSchedule::Cron { expr, .. } => {
            CronSchedule::from_str(expr)
                .map_err(|e| anyhow::anyhow!("invalid cron expression '{}': {}", expr, e))?;
            Ok(())
        }
    }
}

/// First `next_run` for a task created (or resumed) at `now`.
pub fn initial_next_run(schedule: &TaskSchedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        TaskSchedule::Once { at } => Some(*at),
        TaskSchedule::Interval { every_secs, end_time } => {
            bounded(now + Duration::seconds(*every_secs as i64), *end_time)
        }
        TaskSchedule::Cron { expr, end_time } => {
            let parsed = CronSchedule::from_str(expr).ok()?;
            bounded(parsed.after(&now).next()?, *end_time)
        }
    }
}

/// The run after a fire at `fired_at`. `None` means the schedule is
/// exhausted (one-shot done, or `end_time` passed).
pub fn next_run_after(schedule: &TaskSchedule, fired_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        TaskSchedule::Once { .. } => None,
        TaskSchedule::Interval { every_secs, end_time } => {
            bounded(fired_at + Duration::seconds(*every_secs as i64), *end_time)
        }
        TaskSchedule::Cron { expr, end_time } => {
            let parsed = CronSchedule::from_str(expr).ok()?;
            bounded(parsed.after(&fired_at).next()?, *end_time)
        }
    }
}

/// Fire times within (start, end], for dry-run previews.
pub fn fires_between(
    schedule: &TaskSchedule,
    next_run: Option<DateTime<Utc>>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    match schedule {
        TaskSchedule::Once { at } => {
            if *at > start && *at <= end {
                vec![*at]
            } else {
                Vec::new()
            }
        }
        TaskSchedule::Interval { every_secs, end_time } => {
            let mut fires = Vec::new();
            let mut at = match next_run {
                Some(at) => at,
                None => return fires,
            };
            let step = Duration::seconds(*every_secs as i64);
            while at <= end {
                if at > start && end_time.map_or(true, |cutoff| at <= cutoff) {
                    fires.push(at);
                }
                at += step;
            }
            fires
        }
        TaskSchedule::Cron { expr, end_time } => {
            let parsed = match CronSchedule::from_str(expr) {
                Ok(parsed) => parsed,
                Err(_) => return Vec::new(),
            };
            parsed
                .after(&start)
                .take_while(|at| *at <= end)
                .filter(|at| end_time.map_or(true, |cutoff| *at <= cutoff))
                .collect()
        }
    }
}

fn bounded(at: DateTime<Utc>, end_time: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match end_time {
        Some(cutoff) if at > cutoff => None,
        _ => Some(at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_interval_next_run_is_fire_time_plus_interval() {
        let schedule = TaskSchedule::Interval { every_secs: 3600, end_time: None };
        let fired = at(10, 0);
        assert_eq!(next_run_after(&schedule, fired), Some(at(11, 0)));
    }

    #[test]
    fn test_missed_interval_recomputes_from_wake_time() {
        // Scheduled for 10:00, scheduler wakes at 12:30: one fire, next at
        // 13:30 -- no backlog of missed slots.
        let schedule = TaskSchedule::Interval { every_secs: 3600, end_time: None };
        let woke = at(12, 30);
        assert_eq!(next_run_after(&schedule, woke), Some(at(13, 30)));
    }

    #[test]
    fn test_once_never_reschedules() {
        let schedule = TaskSchedule::Once { at: at(10, 0) };
        assert_eq!(initial_next_run(&schedule, at(9, 0)), Some(at(10, 0)));
        assert_eq!(next_run_after(&schedule, at(10, 0)), None);
    }

    #[test]
    fn test_cron_next_is_strictly_after_now() {
        let schedule = TaskSchedule::Cron { expr: "0 0 3 * * * *".to_string(), end_time: None };
        let next = initial_next_run(&schedule, at(3, 0)).unwrap();
        assert!(next > at(3, 0));
    }

    #[test]
    fn test_end_time_exhausts_schedule() {
        let schedule = TaskSchedule::Interval {
            every_secs: 3600,
            end_time: Some(at(11, 30)),
        };
        assert_eq!(next_run_after(&schedule, at(10, 0)), Some(at(11, 0)));
        assert_eq!(next_run_after(&schedule, at(11, 0)), None);
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        assert!(validate_schedule(&TaskSchedule::Interval { every_secs: 0, end_time: None }).is_err());
        assert!(validate_schedule(&TaskSchedule::Cron {
            expr: "not a cron".to_string(),
            end_time: None,
        })
        .is_err());
        assert!(validate_schedule(&TaskSchedule::Cron {
            expr: "0 0 3 * * * *".to_string(),
            end_time: None,
        })
        .is_ok());
    }

    #[test]
    fn test_fires_between_counts_interval_slots() {
        let schedule = TaskSchedule::Interval { every_secs: 1800, end_time: None };
        let fires = fires_between(&schedule, Some(at(10, 0)), at(9, 45), at(11, 0));
        assert_eq!(fires, vec![at(10, 0), at(10, 30), at(11, 0)]);
    }
}
