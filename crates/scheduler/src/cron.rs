//! Timezone-aware 5-field cron evaluation.
//!
//! Expressions are parsed once into per-field bitmasks
//! (minute hour day-of-month month day-of-week), then matched against
//! local wall-clock minutes. DST: spring-forward gaps are skipped;
//! fall-back overlaps resolve to the earliest (pre-transition) instant.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use hearth_domain::error::{Error, Result};

const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];
const FIELD_RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];

/// One cron field as a bitmask of allowed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldMask(u64);

impl FieldMask {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }
}

fn parse_field(field: &str, name: &str, min: u32, max: u32) -> Result<FieldMask> {
    let mut mask = 0u64;
    let invalid = |detail: String| Error::InvalidInput(format!("cron {name}: {detail}"));

    if field == "*" {
        for v in min..=max {
            mask |= 1 << v;
        }
        return Ok(FieldMask(mask));
    }

    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step
            .parse()
            .map_err(|_| invalid(format!("bad step '*/{step}'")))?;
        if n == 0 || n > max {
            return Err(invalid(format!("step {n} out of range 1..={max}")));
        }
        for v in min..=max {
            if v % n == 0 {
                mask |= 1 << v;
            }
        }
        return Ok(FieldMask(mask));
    }

    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            let start: u32 = start_s
                .parse()
                .map_err(|_| invalid(format!("bad range start '{start_s}'")))?;
            let end: u32 = end_s
                .parse()
                .map_err(|_| invalid(format!("bad range end '{end_s}'")))?;
            if start < min || end > max || start > end {
                return Err(invalid(format!("range {start}-{end} out of {min}..={max}")));
            }
            for v in start..=end {
                mask |= 1 << v;
            }
        } else {
            let v: u32 = part
                .parse()
                .map_err(|_| invalid(format!("bad value '{part}'")))?;
            if v < min || v > max {
                return Err(invalid(format!("value {v} out of {min}..={max}")));
            }
            mask |= 1 << v;
        }
    }

    if mask == 0 {
        return Err(invalid("empty field".into()));
    }
    Ok(FieldMask(mask))
}

/// A parsed cron expression bound to a timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    fields: [FieldMask; 5],
    tz: Tz,
}

impl CronSchedule {
    pub fn parse(spec: &str, timezone: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(Error::InvalidInput(format!(
                "cron: expected 5 fields (minute hour dom month dow), got {}",
                parts.len()
            )));
        }
        let mut fields = [FieldMask(0); 5];
        for (i, part) in parts.iter().enumerate() {
            let (min, max) = FIELD_RANGES[i];
            fields[i] = parse_field(part, FIELD_NAMES[i], min, max)?;
        }
        let tz: Tz = timezone
            .parse()
            .map_err(|_| Error::InvalidInput(format!("unknown timezone '{timezone}'")))?;
        Ok(Self { fields, tz })
    }

    fn matches_local(&self, dt: &NaiveDateTime) -> bool {
        self.fields[0].contains(dt.minute())
            && self.fields[1].contains(dt.hour())
            && self.fields[2].contains(dt.day())
            && self.fields[3].contains(dt.month())
            && self.fields[4].contains(dt.weekday().num_days_from_sunday())
    }

    /// Next matching instant strictly after `after`, as UTC.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Advance to the next whole local minute.
        let local_after = after.with_timezone(&self.tz).naive_local();
        let seconds_past = local_after.second() as i64;
        let mut candidate =
            (local_after + chrono::Duration::seconds(60 - seconds_past)).with_second(0)?;

        // Bounded scan: one year of minutes.
        let max_checks = 366 * 24 * 60;
        for _ in 0..max_checks {
            if self.matches_local(&candidate) {
                match self.tz.from_local_datetime(&candidate) {
                    chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                    chrono::LocalResult::Ambiguous(earliest, _) => {
                        return Some(earliest.with_timezone(&Utc))
                    }
                    // Spring-forward gap: this local minute does not exist.
                    chrono::LocalResult::None => {}
                }
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }

    /// Did at least one scheduled instant elapse in `(since, until]`?
    pub fn missed_since(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> bool {
        match self.next_after(since) {
            Some(next) => next <= until,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parse_rejects_malformed_specs() {
        assert!(CronSchedule::parse("0 * * *", "UTC").is_err()); // 4 fields
        assert!(CronSchedule::parse("61 * * * *", "UTC").is_err());
        assert!(CronSchedule::parse("*/0 * * * *", "UTC").is_err());
        assert!(CronSchedule::parse("5-2 * * * *", "UTC").is_err());
        assert!(CronSchedule::parse("0 * * * *", "Mars/Olympus").is_err());
    }

    #[test]
    fn hourly_advances_to_top_of_hour() {
        let cron = CronSchedule::parse("0 * * * *", "UTC").unwrap();
        let next = cron.next_after(utc(2026, 6, 15, 10, 20)).unwrap();
        assert_eq!(next, utc(2026, 6, 15, 11, 0));
        // Exactly on the boundary: strictly after.
        let next = cron.next_after(utc(2026, 6, 15, 11, 0)).unwrap();
        assert_eq!(next, utc(2026, 6, 15, 12, 0));
    }

    #[test]
    fn lists_ranges_and_steps() {
        let cron = CronSchedule::parse("*/15 9-17 * * 1-5", "UTC").unwrap();
        // Monday 2026-06-15 09:00 matches.
        let next = cron.next_after(utc(2026, 6, 15, 8, 50)).unwrap();
        assert_eq!(next, utc(2026, 6, 15, 9, 0));
        let next = cron.next_after(next).unwrap();
        assert_eq!(next, utc(2026, 6, 15, 9, 15));

        let weekday = CronSchedule::parse("30 6 * * 0,6", "UTC").unwrap();
        // From a Monday, next firing is Saturday 06:30.
        let next = weekday.next_after(utc(2026, 6, 15, 0, 0)).unwrap();
        assert_eq!(next, utc(2026, 6, 20, 6, 30));
    }

    #[test]
    fn timezone_evaluation_converts_to_utc() {
        // 09:00 in New York is 13:00 UTC during DST.
        let cron = CronSchedule::parse("0 9 * * *", "America/New_York").unwrap();
        let next = cron.next_after(utc(2026, 6, 15, 0, 0)).unwrap();
        assert_eq!(next, utc(2026, 6, 15, 13, 0));
    }

    #[test]
    fn spring_forward_gap_is_skipped() {
        // 2026-03-08 02:30 does not exist in New York.
        let cron = CronSchedule::parse("30 2 8 3 *", "America/New_York").unwrap();
        let next = cron.next_after(utc(2026, 3, 7, 0, 0));
        // The only candidate this year falls in the gap → pushed a year
        // out or absent within the scan window.
        if let Some(next) = next {
            assert!(next > utc(2026, 3, 9, 0, 0));
        }
    }

    #[test]
    fn missed_since_detects_elapsed_instants() {
        let cron = CronSchedule::parse("0 * * * *", "UTC").unwrap();
        // Last fired three hours ago → missed.
        assert!(cron.missed_since(utc(2026, 6, 15, 7, 0), utc(2026, 6, 15, 10, 5)));
        // Fired this hour → nothing missed yet.
        assert!(!cron.missed_since(utc(2026, 6, 15, 10, 0), utc(2026, 6, 15, 10, 5)));
    }
}
