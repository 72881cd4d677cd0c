use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    io::ErrorKind,
    path::Path,
};

use chrono::{Duration, NaiveDate};
use fs4::tokio::AsyncFileExt;
use serde::Serialize;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    fs::operations::write_atomic,
    utils::time::duration_ser,
};

use super::interval::{DayKey, Interval};

/// Intervals of one project keyed by the day they started on.
pub type GroupedLog = BTreeMap<DayKey, Vec<Interval>>;

/// Ordered list of closed intervals of a single project.
///
/// Intervals never overlap and go forward in time: for every neighbouring pair the first one
/// ends no later than the second one starts. [IntervalLog::append] enforces it, while a log
/// read from a manually edited file may violate it, which is reported through
/// [IntervalLog::is_out_of_order].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalLog {
    intervals: Vec<Interval>,
    out_of_order: bool,
}

/// Work recorded on a single day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaySummary {
    pub day: NaiveDate,
    #[serde(with = "duration_ser", rename = "total_seconds")]
    pub total: Duration,
    pub intervals: Vec<Interval>,
}

impl IntervalLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a log file. Reading stops at the first blank line or at the end of the file, and a
    /// missing file is an empty log.
    ///
    /// A line that can't be parsed fails the whole read with [Error::CorruptLog].
    pub async fn read_all(path: &Path) -> Result<Self> {
        debug!("Reading log {path:?}");
        let file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        file.lock_shared()?;

        let mut lines = BufReader::new(file).lines();
        let mut intervals = vec![];
        let mut line_number = 0;
        while let Some(line) = lines.next_line().await? {
            line_number += 1;
            if line.trim().is_empty() {
                break;
            }
            let interval = Interval::parse(&line).map_err(|e| Error::CorruptLog {
                path: path.to_path_buf(),
                line_number,
                source: Box::new(e),
            })?;
            intervals.push(interval);
        }
        lines.into_inner().into_inner().unlock_async().await?;

        let out_of_order = !is_ordered(&intervals);
        if out_of_order {
            warn!("Intervals in {path:?} are not in chronological order");
        }

        Ok(Self {
            intervals,
            out_of_order,
        })
    }

    /// Adds an interval at the end of the log. It has to start no earlier than the last
    /// interval ends.
    pub fn append(&mut self, interval: Interval) -> Result<()> {
        if let Some(last) = self.intervals.last() {
            if interval.start() < last.end() {
                return Err(Error::OutOfOrderAppend {
                    start: interval.start(),
                    last_end: last.end(),
                });
            }
        }
        self.intervals.push(interval);
        Ok(())
    }

    /// Persists every interval, one per line, replacing the file atomically.
    pub async fn write_all(&self, path: &Path) -> Result<()> {
        let mut buffer = String::new();
        for interval in &self.intervals {
            buffer.push_str(&interval.format());
            buffer.push('\n');
        }
        write_atomic(path, buffer.as_bytes()).await?;
        debug!("Wrote {} intervals into {path:?}", self.intervals.len());
        Ok(())
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn last(&self) -> Option<&Interval> {
        self.intervals.last()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Whether the file this log was read from had overlapping or unordered intervals.
    pub fn is_out_of_order(&self) -> bool {
        self.out_of_order
    }

    pub fn group_by_day(&self) -> GroupedLog {
        let mut grouped = GroupedLog::new();
        for interval in &self.intervals {
            grouped
                .entry(interval.day_key())
                .or_default()
                .push(*interval);
        }
        grouped
    }

    /// Days with at least one interval starting on them.
    pub fn days(&self) -> BTreeSet<DayKey> {
        self.intervals.iter().map(Interval::day_key).collect()
    }

    /// Sums durations of intervals that started on one of `filter` days, or of all intervals
    /// when there's no filter.
    pub fn total_duration(&self, filter: Option<&HashSet<DayKey>>) -> Duration {
        self.intervals
            .iter()
            .filter(|v| filter.map_or(true, |days| days.contains(&v.day_key())))
            .map(Interval::duration)
            .fold(Duration::zero(), |sum, v| sum + v)
    }

    /// Per day totals ordered by day.
    pub fn daily_summaries(&self, filter: Option<&HashSet<DayKey>>) -> Vec<DaySummary> {
        self.group_by_day()
            .into_iter()
            .filter(|(day, _)| filter.map_or(true, |days| days.contains(day)))
            .filter_map(|(day, intervals)| {
                let total = intervals
                    .iter()
                    .map(Interval::duration)
                    .fold(Duration::zero(), |sum, v| sum + v);
                Some(DaySummary {
                    day: day.date()?,
                    total,
                    intervals,
                })
            })
            .collect()
    }
}

fn is_ordered(intervals: &[Interval]) -> bool {
    intervals.windows(2).all(|w| w[0].end() <= w[1].start())
}
