use std::{fmt::Display, str::FromStr};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, SubsecRound};
use serde::Serialize;

use crate::{
    error::{Error, Result},
    utils::time::{format_timestamp, parse_timestamp},
};

/// Separator between start and end in a log line.
pub const DELIMITER: &str = " - ";

/// Days between 0001-01-01 and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// Identifies a local calendar day as a number of days since 1970-01-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DayKey(i64);

impl DayKey {
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.num_days_from_ce() as i64 - UNIX_EPOCH_DAYS_FROM_CE)
    }

    pub fn epoch_day(&self) -> i64 {
        self.0
    }

    pub fn date(&self) -> Option<NaiveDate> {
        i32::try_from(self.0 + UNIX_EPOCH_DAYS_FROM_CE)
            .ok()
            .and_then(NaiveDate::from_num_days_from_ce_opt)
    }
}

impl From<NaiveDate> for DayKey {
    fn from(date: NaiveDate) -> Self {
        Self::from_date(date)
    }
}

/// One closed period of work, `[start, end)`. The end is always strictly after the start and
/// both are kept with second precision, so an interval survives formatting and parsing
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Interval {
    start: NaiveDateTime,
    end: NaiveDateTime,
}

impl Interval {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self> {
        let start = start.trunc_subsecs(0);
        let end = end.trunc_subsecs(0);
        if start >= end {
            return Err(Error::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    /// Parses a single `<start> - <end>` line.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim_end();
        let mut parts = trimmed.split(DELIMITER);
        let (Some(start), Some(end), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::malformed(
                line,
                format!("expected exactly one {DELIMITER:?} delimiter"),
            ));
        };

        let start = parse_timestamp(start)
            .map_err(|e| Error::malformed(line, format!("bad start timestamp: {e}")))?;
        let end = parse_timestamp(end)
            .map_err(|e| Error::malformed(line, format!("bad end timestamp: {e}")))?;

        Self::new(start, end)
    }

    pub fn format(&self) -> String {
        format!(
            "{}{DELIMITER}{}",
            format_timestamp(self.start),
            format_timestamp(self.end)
        )
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn end(&self) -> NaiveDateTime {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Day the interval is attributed to. Intervals crossing midnight belong to the day they
    /// started on.
    pub fn day_key(&self) -> DayKey {
        DayKey::from_date(self.start.date())
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, NaiveDateTime};

    use crate::error::Error;

    use super::{DayKey, Interval};

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_format_parse_round_trip() {
        let interval = Interval::new(at(1, 9, 0), at(1, 10, 30)).unwrap();
        let line = interval.format();

        assert_eq!(line, "01/01/2024 09:00:00 - 01/01/2024 10:30:00");
        assert_eq!(Interval::parse(&line).unwrap(), interval);
        assert_eq!(line.parse::<Interval>().unwrap(), interval);
    }

    #[test]
    fn test_parse_ignores_line_ending() {
        let interval = Interval::parse("01/01/2024 09:00:00 - 01/01/2024 10:30:00\r\n").unwrap();
        assert_eq!(interval, Interval::new(at(1, 9, 0), at(1, 10, 30)).unwrap());
    }

    #[test]
    fn test_parse_missing_delimiter() {
        let result = Interval::parse("01/01/2024 09:00:00 01/01/2024 10:30:00");
        assert!(matches!(result, Err(Error::MalformedLogLine { .. })));
    }

    #[test]
    fn test_parse_too_many_delimiters() {
        let result =
            Interval::parse("01/01/2024 09:00:00 - 01/01/2024 10:30:00 - 01/01/2024 11:00:00");
        assert!(matches!(result, Err(Error::MalformedLogLine { .. })));
    }

    #[test]
    fn test_parse_bad_timestamp() {
        let result = Interval::parse("2024-01-01 09:00:00 - 01/01/2024 10:30:00");
        assert!(matches!(result, Err(Error::MalformedLogLine { .. })));
    }

    #[test]
    fn test_parse_reversed_interval() {
        let result = Interval::parse("01/01/2024 10:30:00 - 01/01/2024 09:00:00");
        assert!(matches!(result, Err(Error::InvalidInterval { .. })));
    }

    #[test]
    fn test_new_rejects_empty_interval() {
        let result = Interval::new(at(1, 9, 0), at(1, 9, 0));
        assert!(matches!(result, Err(Error::InvalidInterval { .. })));
    }

    #[test]
    fn test_new_drops_subseconds() {
        let start = at(1, 9, 0) + Duration::milliseconds(400);
        let end = at(1, 9, 1) + Duration::milliseconds(900);
        let interval = Interval::new(start, end).unwrap();

        assert_eq!(interval.duration(), Duration::seconds(60));
        assert_eq!(Interval::parse(&interval.format()).unwrap(), interval);
    }

    #[test]
    fn test_sub_second_session_is_invalid() {
        let start = at(1, 9, 0) + Duration::milliseconds(100);
        let end = at(1, 9, 0) + Duration::milliseconds(900);
        assert!(matches!(
            Interval::new(start, end),
            Err(Error::InvalidInterval { .. })
        ));
    }

    #[test]
    fn test_day_key_uses_start_date() {
        let interval = Interval::new(at(1, 23, 0), at(2, 1, 0)).unwrap();
        let key = interval.day_key();

        assert_eq!(key, DayKey::from(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()));
        assert_eq!(key.epoch_day(), 19723);
        assert_eq!(key.date(), NaiveDate::from_ymd_opt(2024, 1, 1));
    }

    #[test]
    fn test_day_key_epoch() {
        let epoch = DayKey::from_date(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
        assert_eq!(epoch.epoch_day(), 0);
    }
}
