use std::{
    collections::{BTreeSet, HashSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use futures::{stream, StreamExt, TryStreamExt};
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{Error, Result},
    utils::clock::Clock,
};

use super::{
    interval::{DayKey, Interval, DELIMITER},
    interval_log::IntervalLog,
    pending::{HeldSession, PendingSession, SessionRecovery},
};

pub const LOG_EXTENSION: &str = "log";
pub const LOCK_EXTENSION: &str = "lock";

/// How many project logs are read at the same time by the cross project queries.
const CONCURRENT_READS: usize = 4;

/// What to do with a session left open by a process that didn't close it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Record the session up to its last heartbeat.
    Apply,
    /// Record the session up to the given moment.
    Edit(NaiveDateTime),
    /// Forget the session.
    Discard,
}

/// Entry point for recording work. Every project is a pair of files in one directory:
/// `<name>.log` with the closed intervals and `<name>.lock` while a session is open.
///
/// Mutating operations of one store never run concurrently, so a heartbeat can't interleave
/// with the end of the same session.
pub struct ProjectStore {
    project_dir: PathBuf,
    clock: Arc<dyn Clock>,
    guard: Mutex<()>,
}

impl ProjectStore {
    pub fn new(project_dir: PathBuf, clock: Arc<dyn Clock>) -> Result<Self> {
        std::fs::create_dir_all(&project_dir)?;
        Ok(Self {
            project_dir,
            clock,
            guard: Mutex::new(()),
        })
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn log_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.project_dir.join(format!("{name}.{LOG_EXTENSION}")))
    }

    pub fn lock_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.project_dir.join(format!("{name}.{LOCK_EXTENSION}")))
    }

    fn recovery(&self, name: &str) -> Result<SessionRecovery> {
        Ok(SessionRecovery::new(self.lock_path(name)?))
    }

    /// Opens a session for `name`. The project is created by its first session.
    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> Result<PendingSession> {
        let recovery = self.recovery(name)?;
        let _guard = self.guard.lock().await;

        let already_running = |pending| Error::SessionAlreadyRunning {
            project: name.to_owned(),
            pending,
        };

        if recovery.is_open().await? {
            return Err(already_running(recovery.pending().await.ok().flatten()));
        }
        match recovery.begin(self.clock.now()).await {
            Ok(pending) => Ok(pending),
            // Someone else created the lock between the check and the creation.
            Err(Error::AlreadyOpen { .. }) => {
                Err(already_running(recovery.pending().await.ok().flatten()))
            }
            Err(e) => Err(e),
        }
    }

    /// Refreshes the provisional end of the open session.
    pub async fn heartbeat(&self, name: &str) -> Result<PendingSession> {
        let recovery = self.recovery(name)?;
        let _guard = self.guard.lock().await;
        recovery.heartbeat(self.clock.now()).await
    }

    /// Refreshes the provisional end of the session opened at `started`. Fails with
    /// [Error::NoOpenSession] once that session was closed, even if a newer one is open.
    pub async fn heartbeat_session(
        &self,
        name: &str,
        started: NaiveDateTime,
    ) -> Result<PendingSession> {
        let recovery = self.recovery(name)?;
        let _guard = self.guard.lock().await;
        recovery.heartbeat_session(started, self.clock.now()).await
    }

    /// Closes the open session now and records it. The lock is only removed once the interval
    /// is safely in the log, so a failure at any point leaves the session recoverable.
    #[instrument(skip(self))]
    pub async fn end(&self, name: &str) -> Result<Interval> {
        let recovery = self.recovery(name)?;
        let _guard = self.guard.lock().await;

        let held = recovery.hold().await?;
        self.close_held(name, held).await
    }

    /// Same as [ProjectStore::end], limited to the session opened at `started`.
    #[instrument(skip(self))]
    pub async fn end_session(&self, name: &str, started: NaiveDateTime) -> Result<Interval> {
        let recovery = self.recovery(name)?;
        let _guard = self.guard.lock().await;

        let held = recovery.hold_session(started).await?;
        self.close_held(name, held).await
    }

    /// Drops the session opened at `started` if it has no recorded progress. A session whose
    /// provisional end moved past its start is kept and `None` is returned.
    #[instrument(skip(self))]
    pub async fn discard_empty_session(
        &self,
        name: &str,
        started: NaiveDateTime,
    ) -> Result<Option<PendingSession>> {
        let recovery = self.recovery(name)?;
        let _guard = self.guard.lock().await;

        let held = recovery.hold_session(started).await?;
        let pending = held.pending();
        if pending.elapsed() > Duration::zero() {
            held.unlock().await?;
            return Ok(None);
        }
        held.release().await?;
        info!("Discarded empty session {pending} of {name}");
        Ok(Some(pending))
    }

    async fn close_held(&self, name: &str, held: HeldSession) -> Result<Interval> {
        let interval = match Interval::new(held.pending().start(), self.clock.now()) {
            Ok(v) => v,
            Err(e) => {
                held.unlock().await?;
                return Err(e);
            }
        };
        self.commit(name, held, interval).await
    }

    /// Reads the open session, if any, without changing it.
    pub async fn pending_session(&self, name: &str) -> Result<Option<PendingSession>> {
        self.recovery(name)?.pending().await
    }

    /// Resolves a session left open by a previous process. Returns the recorded interval, or
    /// `None` when the session was discarded.
    #[instrument(skip(self))]
    pub async fn recover(&self, name: &str, action: RecoveryAction) -> Result<Option<Interval>> {
        let recovery = self.recovery(name)?;
        let _guard = self.guard.lock().await;

        let end = match action {
            RecoveryAction::Discard => {
                let discarded = recovery.discard().await?;
                info!("Discarded pending session {discarded:?} of {name}");
                return Ok(None);
            }
            RecoveryAction::Apply => None,
            RecoveryAction::Edit(end) => Some(end),
        };

        let held = recovery.hold().await?;
        let pending = held.pending();
        let interval = match end.map_or_else(
            || pending.to_interval(),
            |end| Interval::new(pending.start(), end),
        ) {
            Ok(v) => v,
            Err(e) => {
                held.unlock().await?;
                return Err(e);
            }
        };
        self.commit(name, held, interval).await.map(Some)
    }

    /// Appends `interval` to the log of `name`, and closes the held session once the log is
    /// written and reads back with the interval at its end.
    async fn commit(&self, name: &str, held: HeldSession, interval: Interval) -> Result<Interval> {
        let log_path = self.log_path(name)?;
        let written = async {
            let mut log = IntervalLog::read_all(&log_path).await?;
            let expected_len = log.len() + 1;
            log.append(interval).map_err(|e| Error::CorruptionDetected {
                project: name.to_owned(),
                interval,
                source: Box::new(e),
            })?;
            log.write_all(&log_path).await?;

            let stored = IntervalLog::read_all(&log_path).await?;
            if stored.len() != expected_len || stored.last() != Some(&interval) {
                let last_line = stored.last().map(Interval::format).unwrap_or_default();
                return Err(Error::CorruptionDetected {
                    project: name.to_owned(),
                    interval,
                    source: Box::new(Error::malformed(
                        &last_line,
                        "log doesn't end with the interval that was just written",
                    )),
                });
            }
            Ok::<_, Error>(())
        }
        .await;

        match written {
            Ok(()) => {
                held.release().await?;
                info!("Recorded {interval} for {name}");
                Ok(interval)
            }
            Err(e) => {
                warn!("Keeping session of {name} open, failed to record {interval}: {e}");
                held.unlock().await?;
                Err(e)
            }
        }
    }

    /// Removes the log of a project. Projects with an open session can't be deleted.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let recovery = self.recovery(name)?;
        let log_path = self.log_path(name)?;
        let _guard = self.guard.lock().await;

        if recovery.is_open().await? {
            return Err(Error::SessionRunning {
                project: name.to_owned(),
            });
        }
        match fs::remove_file(&log_path).await {
            Ok(()) => {
                info!("Deleted project {name}");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::ProjectNotFound {
                project: name.to_owned(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load(&self, name: &str) -> Result<IntervalLog> {
        IntervalLog::read_all(&self.log_path(name)?).await
    }

    pub async fn project_exists(&self, name: &str) -> Result<bool> {
        Ok(fs::try_exists(self.log_path(name)?).await?
            || fs::try_exists(self.lock_path(name)?).await?)
    }

    pub async fn total_duration(
        &self,
        name: &str,
        filter: Option<&HashSet<DayKey>>,
    ) -> Result<Duration> {
        Ok(self.load(name).await?.total_duration(filter))
    }

    /// Names of all projects that have a log or an open session, sorted.
    pub async fn list_projects(&self) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        let mut entries = fs::read_dir(&self.project_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_project_file = path
                .extension()
                .is_some_and(|ext| ext == LOG_EXTENSION || ext == LOCK_EXTENSION);
            if !is_project_file {
                continue;
            }
            match path.file_stem().and_then(|v| v.to_str()) {
                Some(name) if validate_name(name).is_ok() => {
                    names.insert(name.to_owned());
                }
                _ => debug!("Skipping {path:?}"),
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Every day with work recorded in any project, most recent first.
    pub async fn list_dates_with_activity(&self) -> Result<Vec<NaiveDate>> {
        let days = self
            .project_logs()
            .await?
            .into_iter()
            .flat_map(|(_, log)| log.days())
            .collect::<BTreeSet<_>>();
        Ok(days.into_iter().rev().filter_map(|v| v.date()).collect())
    }

    /// Projects with at least one interval started on `day`.
    pub async fn projects_active_on(&self, day: NaiveDate) -> Result<Vec<String>> {
        let key = DayKey::from(day);
        Ok(self
            .project_logs()
            .await?
            .into_iter()
            .filter(|(_, log)| log.intervals().iter().any(|v| v.day_key() == key))
            .map(|(name, _)| name)
            .collect())
    }

    async fn project_logs(&self) -> Result<Vec<(String, IntervalLog)>> {
        let names = self.list_projects().await?;
        stream::iter(names)
            .map(|name| async move {
                let log = self.load(&name).await?;
                Ok::<_, Error>((name, log))
            })
            .buffered(CONCURRENT_READS)
            .try_collect()
            .await
    }
}

/// Project names become file names and share the line format with timestamps, so anything that
/// could escape the directory or confuse the parser is rejected.
fn validate_name(name: &str) -> Result<()> {
    let reason = if name.trim().is_empty() {
        Some("name is empty")
    } else if name.contains(['/', '\\']) {
        Some("name contains a path separator")
    } else if name.starts_with('.') {
        Some("name starts with a dot")
    } else if name.contains(DELIMITER) {
        Some("name contains the interval delimiter")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidProjectName {
            name: name.to_owned(),
            reason,
        }),
        None => Ok(()),
    }
}
