use chrono::{Duration, NaiveDate, NaiveDateTime};

/// Pattern used for every timestamp written into log and lock files. All fields are zero padded,
/// so a formatted timestamp always has the same width.
pub const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// This is the standard way of converting a timestamp to a string in punchclock.
pub fn format_timestamp(time: NaiveDateTime) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(text: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

/// Formats duration as `H:MM:SS`. Hours aren't wrapped into days.
pub fn format_duration(v: Duration) -> String {
    let seconds = v.num_seconds().abs();
    format!(
        "{}:{:02}:{:02}",
        seconds / 3600,
        seconds / 60 % 60,
        seconds % 60
    )
}

/// Same as [format_duration], but always carries a sign. Used for differences between
/// planned and recorded time.
pub fn format_balance(v: Duration) -> String {
    let sign = if v < Duration::zero() { '-' } else { '+' };
    format!("{sign}{}", format_duration(v))
}

pub(crate) mod duration_ser {
    use chrono::Duration;
    use serde::Serializer;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(duration.num_seconds())
    }
}
