//! Cron arithmetic and the timezone a schedule lives in.
//!
//! Parsing and "next occurrence" come from the `cron` crate; this module only
//! adapts crontab syntax to it and pins the calculation to a zone.

use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, FixedOffset, Local, TimeDelta, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};

/// Zone used for cron evaluation and run timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleTz {
    /// Host local time.
    #[default]
    Local,
    Named(Tz),
}

impl ScheduleTz {
    /// Empty means host local time; anything else must be an IANA name.
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(ScheduleTz::Local);
        }
        name.parse::<Tz>()
            .map(ScheduleTz::Named)
            .map_err(|e| SchedulerError::InvalidTimezone {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        self.localize(Utc::now())
    }

    pub fn localize(&self, t: DateTime<Utc>) -> DateTime<FixedOffset> {
        match self {
            ScheduleTz::Local => t.with_timezone(&Local).fixed_offset(),
            ScheduleTz::Named(tz) => t.with_timezone(tz).fixed_offset(),
        }
    }
}

impl fmt::Display for ScheduleTz {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleTz::Local => f.write_str("Local"),
            ScheduleTz::Named(tz) => f.write_str(tz.name()),
        }
    }
}

/// Parse a cron expression.
///
/// Accepts the crontab 5-field form (minute precision, weekday 0 or 7 for
/// Sunday), the seconds-first 6/7-field form, and `@hourly`-style macros.
pub fn parse_cron(expr: &str) -> std::result::Result<cron::Schedule, cron::error::Error> {
    cron::Schedule::from_str(&normalize(expr))
}

pub fn is_valid(expr: &str) -> bool {
    parse_cron(expr).is_ok()
}

/// First occurrence of `expr` after `reference`, evaluated in `tz`.
///
/// With `include_ref`, `reference` itself counts when it matches. Returns
/// `None` if the expression is invalid or never fires again.
pub fn next_tick_after(
    expr: &str,
    reference: DateTime<Utc>,
    tz: ScheduleTz,
    include_ref: bool,
) -> Option<DateTime<Utc>> {
    let schedule = parse_cron(expr).ok()?;
    match tz {
        ScheduleTz::Local => next_in(&schedule, reference.with_timezone(&Local), include_ref),
        ScheduleTz::Named(tz) => next_in(&schedule, reference.with_timezone(&tz), include_ref),
    }
}

fn next_in<Z: TimeZone>(
    schedule: &cron::Schedule,
    reference: DateTime<Z>,
    include_ref: bool,
) -> Option<DateTime<Utc>> {
    if include_ref {
        let second = reference.clone().with_nanosecond(0)?;
        let probe = schedule
            .after(&(second.clone() - TimeDelta::seconds(1)))
            .next();
        if probe.as_ref() == Some(&second) {
            return Some(reference.with_timezone(&Utc));
        }
    }
    schedule
        .after(&reference)
        .next()
        .map(|t| t.with_timezone(&Utc))
}

fn normalize(expr: &str) -> String {
    let expr = expr.trim();
    if let Some(tag) = expr.strip_prefix('@') {
        return match tag {
            "always" => "0 * * * * *".to_string(),
            "5minutes" | "10minutes" | "15minutes" | "30minutes" => {
                format!("0 */{} * * * *", tag.trim_end_matches("minutes"))
            }
            _ => expr.to_string(),
        };
    }
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return fields.join(" ");
    }
    format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        shift_weekdays(fields[4])
    )
}

/// crontab numbers weekdays 0-6 from Sunday (7 is Sunday too); the `cron`
/// crate uses 1-7 from Sunday.
///
/// Numeric items are expanded to explicit day lists, since a range such as
/// `5-7` has no contiguous equivalent once Sunday moves to the front. Names
/// and `*` items are left alone.
fn shift_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(|item| shift_weekday_item(item).unwrap_or_else(|| item.to_string()))
        .collect::<Vec<_>>()
        .join(",")
}

/// `None` when `item` is not a numeric day, range or stepped range; the
/// item then reaches the `cron` crate unchanged.
fn shift_weekday_item(item: &str) -> Option<String> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step.parse::<usize>().ok().filter(|s| *s > 0)?)),
        None => (item, None),
    };
    let (lo, hi) = match base.split_once('-') {
        Some((lo, hi)) => (lo.parse::<u8>().ok()?, hi.parse::<u8>().ok()?),
        None => {
            let day = base.parse::<u8>().ok()?;
            (day, if step.is_some() { 7 } else { day })
        }
    };
    if lo > hi || hi > 7 {
        return None;
    }
    let days: BTreeSet<u8> = (lo..=hi)
        .step_by(step.unwrap_or(1))
        .map(|n| (n % 7) + 1)
        .collect();
    Some(
        days.iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(","),
    )
}
