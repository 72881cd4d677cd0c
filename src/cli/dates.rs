use std::fmt::Display;

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, SubsecRound};
use chrono_english::parse_date_string;
use clap::ValueEnum;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DateStyle {
    Uk,
    Us,
}

impl From<DateStyle> for chrono_english::Dialect {
    fn from(value: DateStyle) -> Self {
        match value {
            DateStyle::Uk => Self::Uk,
            DateStyle::Us => Self::Us,
        }
    }
}

impl Display for DateStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateStyle::Uk => write!(f, "uk"),
            DateStyle::Us => write!(f, "us"),
        }
    }
}

/// Parses a human written moment like "yesterday 17:00", "1 hour ago" or "12:00 16/03/2025"
/// into local time.
pub fn parse_moment(text: &str, style: DateStyle) -> Result<NaiveDateTime> {
    let parsed = parse_date_string(text, Local::now(), style.into())
        .map_err(|e| anyhow!("Can't parse {text:?} as a date: {e}"))?;
    Ok(parsed.with_timezone(&Local).naive_local().trunc_subsecs(0))
}

pub fn parse_day(text: &str, style: DateStyle) -> Result<NaiveDate> {
    Ok(parse_moment(text, style)?.date())
}
