use crate::errors::{RollupError, RollupResult};
use crate::rollup::models::{ExecutionCursor, RollupTask, Schedule, Window};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use std::collections::BTreeSet;

// Two leap cycles, so a Feb 29 schedule is found across a skipped
// century leap year.
const CRON_SCAN_LIMIT_DAYS: i64 = 8 * 366;

/// Oldest window of `task` that is complete and due at `now`, if any.
///
/// The candidate always starts at the cursor position. It is due when its end
/// is at or before `now - safety_margin` and the task schedule fired somewhere
/// in `[end, now]`. Disabled tasks and cursors still inside a retry backoff
/// never yield a window. Backlogs drain one window per call.
pub fn next_due_window(
    task: &RollupTask,
    cursor: &ExecutionCursor,
    now: DateTime<Utc>,
    safety_margin: Duration,
) -> Option<Window> {
    if !task.enabled || task.window_seconds <= 0 {
        return None;
    }
    if let Some(gate) = cursor.next_attempt_at {
        if gate > now {
            return None;
        }
    }

    let start = cursor.position;
    let end = start + task.window();
    if end > now - safety_margin {
        return None;
    }

    let fired_at = next_fire_at_or_after(&task.schedule, end)?;
    if fired_at > now {
        return None;
    }

    Some(Window::new(start, end))
}

/// Largest multiple of `seconds` since the epoch that is `<= at`.
pub fn align_floor(at: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    if seconds <= 0 {
        return at;
    }
    let ts = at.timestamp();
    let floored = ts - ts.rem_euclid(seconds);
    Utc.timestamp_opt(floored, 0).single().unwrap_or(at)
}

/// First schedule firing at or after `from`.
pub fn next_fire_at_or_after(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Interval { seconds } => {
            if *seconds <= 0 {
                return None;
            }
            let floored = align_floor(from, *seconds);
            if floored == from {
                Some(from)
            } else {
                Some(floored + Duration::seconds(*seconds))
            }
        }
        Schedule::Cron { expression } => {
            let spec = CronSpec::parse(expression).ok()?;
            spec.next_at_or_after(from)
        }
    }
}

pub fn validate_schedule(schedule: &Schedule) -> RollupResult<()> {
    match schedule {
        Schedule::Interval { seconds } => {
            if *seconds <= 0 {
                return Err(RollupError::Validation(
                    "interval schedule seconds must be > 0".to_string(),
                ));
            }
            Ok(())
        }
        Schedule::Cron { expression } => validate_cron_expression(expression),
    }
}

/// Rejects malformed expressions and ones that name no real date, such as
/// `0 0 30 2 *`.
pub fn validate_cron_expression(expr: &str) -> RollupResult<()> {
    let spec = CronSpec::parse(expr)?;
    let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_else(Utc::now);
    if spec.next_at_or_after(epoch).is_none() {
        return Err(RollupError::Validation(format!(
            "Cron expression '{}' never fires",
            expr
        )));
    }
    Ok(())
}

/// Finest period at which `schedule` can fire, used to warn about poll
/// intervals that would miss windows.
pub fn finest_period_seconds(schedule: &Schedule) -> i64 {
    match schedule {
        Schedule::Interval { seconds } => *seconds,
        Schedule::Cron { .. } => 60,
    }
}

struct CronSpec {
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSpec {
    fn parse(expr: &str) -> RollupResult<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(RollupError::Validation(
                "Cron expression must contain 5 fields: min hour day month dow".to_string(),
            ));
        }

        let mut days_of_week = parse_cron_field(parts[4], 0, 7)?;
        // 7 and 0 both mean Sunday
        if days_of_week.remove(&7) {
            days_of_week.insert(0);
        }

        Ok(Self {
            minutes: parse_cron_field(parts[0], 0, 59)?,
            hours: parse_cron_field(parts[1], 0, 23)?,
            days_of_month: parse_cron_field(parts[2], 1, 31)?,
            months: parse_cron_field(parts[3], 1, 12)?,
            days_of_week,
            dom_restricted: parts[2] != "*",
            dow_restricted: parts[4] != "*",
        })
    }

    fn day_matches(&self, at: DateTime<Utc>) -> bool {
        if !self.months.contains(&at.month()) {
            return false;
        }

        let dom_match = self.days_of_month.contains(&at.day());
        let dow_match = self
            .days_of_week
            .contains(&at.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom_match || dow_match
        } else {
            dom_match && dow_match
        }
    }

    fn next_at_or_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let minute_floor = align_floor(from, 60);
        let mut probe = if minute_floor == from {
            from
        } else {
            minute_floor + Duration::minutes(1)
        };

        // Skips whole days and hours that cannot match.
        let limit = probe + Duration::days(CRON_SCAN_LIMIT_DAYS);
        while probe < limit {
            if !self.day_matches(probe) {
                probe = align_floor(probe, 86_400) + Duration::days(1);
            } else if !self.hours.contains(&probe.hour()) {
                probe = align_floor(probe, 3_600) + Duration::hours(1);
            } else if !self.minutes.contains(&probe.minute()) {
                probe += Duration::minutes(1);
            } else {
                return Some(probe);
            }
        }

        None
    }
}

fn parse_cron_field(field: &str, min: u32, max: u32) -> RollupResult<BTreeSet<u32>> {
    let invalid = |message: String| RollupError::Validation(message);
    let mut out = BTreeSet::new();
    for part in field.split(',') {
        let token = part.trim();
        if token.is_empty() {
            return Err(invalid(format!("Invalid cron token '{}'", field)));
        }

        if token == "*" {
            out.extend(min..=max);
            continue;
        }

        if let Some(step_raw) = token.strip_prefix("*/") {
            let step: u32 = step_raw
                .parse()
                .map_err(|_| invalid(format!("Invalid cron step '{}'", token)))?;
            if step == 0 {
                return Err(invalid("Cron step cannot be 0".to_string()));
            }
            out.extend((min..=max).step_by(step as usize));
            continue;
        }

        if let Some((start_raw, end_raw)) = token.split_once('-') {
            let start: u32 = start_raw
                .parse()
                .map_err(|_| invalid(format!("Invalid cron range '{}'", token)))?;
            let end: u32 = end_raw
                .parse()
                .map_err(|_| invalid(format!("Invalid cron range '{}'", token)))?;
            if start > end || start < min || end > max {
                return Err(invalid(format!("Cron range out of bounds '{}'", token)));
            }
            out.extend(start..=end);
            continue;
        }

        let value: u32 = token
            .parse()
            .map_err(|_| invalid(format!("Invalid cron value '{}'", token)))?;
        if value < min || value > max {
            return Err(invalid(format!("Cron value out of bounds '{}'", token)));
        }
        out.insert(value);
    }

    if out.is_empty() {
        return Err(invalid("Cron field resolved to empty set".to_string()));
    }

    Ok(out)
}
