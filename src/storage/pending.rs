use std::{
    fmt::Display,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{Duration, NaiveDateTime, SubsecRound};
use fs4::tokio::AsyncFileExt;
use serde::Serialize;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncReadExt,
};
use tracing::{debug, info, trace, warn};

use crate::{
    error::{Error, Result},
    fs::operations::{create_exclusive, is_same_file, overwrite_in_place},
    utils::time::{format_timestamp, parse_timestamp},
};

use super::interval::{Interval, DELIMITER};

/// A session that was started but not closed yet. `provisional_end` is the last moment the
/// session was known to be alive and is what a crashed session gets recovered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingSession {
    start: NaiveDateTime,
    provisional_end: NaiveDateTime,
}

impl PendingSession {
    pub fn opened_at(start: NaiveDateTime) -> Self {
        let start = start.trunc_subsecs(0);
        Self {
            start,
            provisional_end: start,
        }
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn provisional_end(&self) -> NaiveDateTime {
        self.provisional_end
    }

    /// Moves the provisional end forward. A clock that went backwards leaves it where it was.
    pub fn with_provisional_end(self, now: NaiveDateTime) -> Self {
        Self {
            provisional_end: now.trunc_subsecs(0).max(self.provisional_end),
            ..self
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.provisional_end - self.start
    }

    /// The interval this session would be recorded as if it ended at the last heartbeat.
    pub fn to_interval(&self) -> Result<Interval> {
        Interval::new(self.start, self.provisional_end)
    }

    pub fn format(&self) -> String {
        format!(
            "{}{DELIMITER}{}",
            format_timestamp(self.start),
            format_timestamp(self.provisional_end)
        )
    }

    /// Same line format as [Interval::parse], but a zero length session is allowed.
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
        let provisional_end = parse_timestamp(end)
            .map_err(|e| Error::malformed(line, format!("bad end timestamp: {e}")))?;
        if provisional_end < start {
            return Err(Error::InvalidInterval {
                start,
                end: provisional_end,
            });
        }
        Ok(Self {
            start,
            provisional_end,
        })
    }

    fn lock_content(&self) -> String {
        let mut line = self.format();
        line.push('\n');
        line
    }
}

impl Display for PendingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

/// Keeps track of the open session of one project through its lock file.
///
/// The lock file exists exactly while a session is open. It's created with an exclusive create,
/// so of two processes starting the same project only one succeeds. While the session is open
/// the file holds `start - provisional_end`, where the end is refreshed by heartbeats. If the
/// process dies the file stays behind and the session can be recovered from it.
#[derive(Debug, Clone)]
pub struct SessionRecovery {
    lock_path: PathBuf,
}

impl SessionRecovery {
    pub fn new(lock_path: PathBuf) -> Self {
        Self { lock_path }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub async fn is_open(&self) -> Result<bool> {
        Ok(fs::try_exists(&self.lock_path).await?)
    }

    /// Reads the open session without touching it.
    pub async fn pending(&self) -> Result<Option<PendingSession>> {
        match fs::read_to_string(&self.lock_path).await {
            Ok(content) => Ok(Some(self.parse_lock(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Opens a session. Fails with [Error::AlreadyOpen] if the lock file is already there,
    /// regardless of whether it belongs to a live process or to a crashed one.
    pub async fn begin(&self, start: NaiveDateTime) -> Result<PendingSession> {
        let pending = PendingSession::opened_at(start);
        match create_exclusive(&self.lock_path, pending.lock_content().as_bytes()).await {
            Ok(()) => {
                info!("Opened session {pending} in {:?}", self.lock_path);
                Ok(pending)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::AlreadyOpen {
                path: self.lock_path.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Records `now` as the provisional end of the open session. A lock that was removed in the
    /// meantime is never recreated.
    pub async fn heartbeat(&self, now: NaiveDateTime) -> Result<PendingSession> {
        self.refresh(self.hold().await?, now).await
    }

    /// Same as [SessionRecovery::heartbeat], but only for the session opened at `started`. Any
    /// other session is reported as [Error::NoOpenSession].
    pub async fn heartbeat_session(
        &self,
        started: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<PendingSession> {
        self.refresh(self.hold_session(started).await?, now).await
    }

    async fn refresh(&self, mut held: HeldSession, now: NaiveDateTime) -> Result<PendingSession> {
        let pending = held.pending.with_provisional_end(now);
        let written = overwrite_in_place(&mut held.file, pending.lock_content().as_bytes()).await;
        held.unlock().await?;
        written?;
        trace!("Heartbeat {pending} in {:?}", self.lock_path);
        Ok(pending)
    }

    /// Closes the session at `end` and removes the lock. The lock stays if `end` doesn't make a
    /// valid interval.
    pub async fn finalize(&self, end: NaiveDateTime) -> Result<Interval> {
        let held = self.hold().await?;
        match Interval::new(held.pending.start, end) {
            Ok(interval) => {
                held.release().await?;
                info!("Closed session {interval} in {:?}", self.lock_path);
                Ok(interval)
            }
            Err(e) => {
                held.unlock().await?;
                Err(e)
            }
        }
    }

    /// Turns a session left behind by a crashed process into the interval it covered up to its
    /// last heartbeat, and removes the lock. What happens with the interval is up to the caller.
    pub async fn recover_orphan(&self) -> Result<Interval> {
        let held = self.hold().await?;
        match held.pending.to_interval() {
            Ok(interval) => {
                held.release().await?;
                info!("Recovered session {interval} from {:?}", self.lock_path);
                Ok(interval)
            }
            Err(e) => {
                held.unlock().await?;
                Err(e)
            }
        }
    }

    /// Drops the open session without recording it. Works on unreadable locks as well, since
    /// there's nothing else to do with them.
    pub async fn discard(&self) -> Result<Option<PendingSession>> {
        let (file, content) = match self.acquire().await {
            Ok(v) => v,
            Err(Error::NoOpenSession { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let pending = self
            .parse_lock(&content)
            .inspect_err(|e| warn!("Discarding unreadable lock {e}"))
            .ok();
        fs::remove_file(&self.lock_path).await?;
        file.unlock_async().await?;
        info!("Discarded session {pending:?} in {:?}", self.lock_path);
        Ok(pending)
    }

    /// Opens and exclusively locks the lock file. The session stays open until the returned
    /// handle is released.
    pub(crate) async fn hold(&self) -> Result<HeldSession> {
        let (file, content) = self.acquire().await?;
        let pending = self.parse_lock(&content)?;
        Ok(HeldSession {
            file,
            path: self.lock_path.clone(),
            pending,
        })
    }

    /// Like [SessionRecovery::hold], but only holds the session opened at `started`. A session
    /// that was closed and replaced by a newer one is reported as [Error::NoOpenSession].
    pub(crate) async fn hold_session(&self, started: NaiveDateTime) -> Result<HeldSession> {
        let held = self.hold().await?;
        if held.pending.start != started {
            debug!(
                "Session started at {started} was replaced by {} in {:?}",
                held.pending, self.lock_path
            );
            held.unlock().await?;
            return Err(Error::NoOpenSession {
                path: self.lock_path.clone(),
            });
        }
        Ok(held)
    }

    async fn acquire(&self) -> Result<(File, String)> {
        loop {
            let mut file = match OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.lock_path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(Error::NoOpenSession {
                        path: self.lock_path.clone(),
                    })
                }
                Err(e) => return Err(e.into()),
            };

            file.lock_exclusive()?;
            // Whoever held the lock before might have closed the session, removed the file or
            // opened a new session under the same path.
            if !is_same_file(&file, &self.lock_path).await? {
                debug!("Lock {:?} was replaced while waiting for it", self.lock_path);
                file.unlock_async().await?;
                continue;
            }

            let mut content = String::new();
            file.read_to_string(&mut content).await?;
            return Ok((file, content));
        }
    }

    fn parse_lock(&self, content: &str) -> Result<PendingSession> {
        let line = content.lines().next().unwrap_or_default();
        PendingSession::parse(line).map_err(|e| Error::CorruptLock {
            path: self.lock_path.clone(),
            source: Box::new(e),
        })
    }
}

/// An open session whose lock file is exclusively locked by this process.
pub(crate) struct HeldSession {
    file: File,
    path: PathBuf,
    pending: PendingSession,
}

impl HeldSession {
    pub(crate) fn pending(&self) -> PendingSession {
        self.pending
    }

    /// Closes the session by removing the lock file.
    pub(crate) async fn release(self) -> Result<()> {
        // Removing before unlocking makes anyone waiting on the lock see the session as closed.
        fs::remove_file(&self.path).await?;
        self.file.unlock_async().await?;
        Ok(())
    }

    /// Lets go of the lock file while keeping the session open.
    pub(crate) async fn unlock(self) -> Result<()> {
        self.file.unlock_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use tempfile::{tempdir, TempDir};

    use crate::{error::Error, storage::interval::Interval, utils::logging::TEST_LOGGING};

    use super::{PendingSession, SessionRecovery};

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn recovery() -> Result<(TempDir, SessionRecovery)> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let recovery = SessionRecovery::new(dir.path().join("project.lock"));
        Ok((dir, recovery))
    }

    #[tokio::test]
    async fn test_begin_writes_zero_length_session() -> Result<()> {
        let (_dir, recovery) = recovery()?;

        recovery.begin(at(9, 0)).await?;

        let content = tokio::fs::read_to_string(recovery.lock_path()).await?;
        assert_eq!(content, "01/01/2024 09:00:00 - 01/01/2024 09:00:00\n");
        assert!(recovery.is_open().await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_begin_twice_fails() -> Result<()> {
        let (_dir, recovery) = recovery()?;
        recovery.begin(at(9, 0)).await?;

        let result = recovery.begin(at(9, 5)).await;

        assert!(matches!(result, Err(Error::AlreadyOpen { .. })));
        assert_eq!(recovery.pending().await?.unwrap().start(), at(9, 0));
        Ok(())
    }

    #[tokio::test]
    async fn test_heartbeat_moves_provisional_end() -> Result<()> {
        let (_dir, recovery) = recovery()?;
        recovery.begin(at(9, 0)).await?;

        recovery.heartbeat(at(9, 5)).await?;
        let pending = recovery.heartbeat(at(9, 10)).await?;

        assert_eq!(pending.provisional_end(), at(9, 10));
        assert_eq!(recovery.pending().await?, Some(pending));
        assert_eq!(pending.elapsed(), Duration::minutes(10));
        Ok(())
    }

    #[tokio::test]
    async fn test_heartbeat_with_clock_going_backwards() -> Result<()> {
        let (_dir, recovery) = recovery()?;
        recovery.begin(at(9, 0)).await?;

        let pending = recovery.heartbeat(at(8, 0)).await?;
        assert_eq!(pending.provisional_end(), at(9, 0));

        recovery.heartbeat(at(9, 30)).await?;
        let pending = recovery.heartbeat(at(8, 30)).await?;
        assert_eq!(pending.provisional_end(), at(9, 30));
        Ok(())
    }

    #[tokio::test]
    async fn test_heartbeat_does_not_recreate_lock() -> Result<()> {
        let (_dir, recovery) = recovery()?;
        recovery.begin(at(9, 0)).await?;
        tokio::fs::remove_file(recovery.lock_path()).await?;

        let result = recovery.heartbeat(at(9, 5)).await;

        assert!(matches!(result, Err(Error::NoOpenSession { .. })));
        assert!(!recovery.is_open().await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_heartbeat_session_ignores_newer_session() -> Result<()> {
        let (_dir, recovery) = recovery()?;
        recovery.begin(at(9, 0)).await?;
        recovery.finalize(at(9, 30)).await?;
        recovery.begin(at(9, 45)).await?;

        let result = recovery.heartbeat_session(at(9, 0), at(10, 0)).await;

        assert!(matches!(result, Err(Error::NoOpenSession { .. })));
        let pending = recovery.pending().await?.unwrap();
        assert_eq!(pending.start(), at(9, 45));
        assert_eq!(pending.provisional_end(), at(9, 45));

        let pending = recovery.heartbeat_session(at(9, 45), at(10, 0)).await?;
        assert_eq!(pending.provisional_end(), at(10, 0));
        Ok(())
    }

    #[tokio::test]
    async fn test_finalize_closes_session() -> Result<()> {
        let (_dir, recovery) = recovery()?;
        recovery.begin(at(9, 0)).await?;
        recovery.heartbeat(at(9, 30)).await?;

        let interval = recovery.finalize(at(10, 0)).await?;

        assert_eq!(interval, Interval::new(at(9, 0), at(10, 0))?);
        assert!(!recovery.is_open().await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_finalize_without_session() -> Result<()> {
        let (_dir, recovery) = recovery()?;

        let result = recovery.finalize(at(10, 0)).await;

        assert!(matches!(result, Err(Error::NoOpenSession { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_finalize_keeps_lock_on_invalid_end() -> Result<()> {
        let (_dir, recovery) = recovery()?;
        recovery.begin(at(9, 0)).await?;

        let result = recovery.finalize(at(9, 0)).await;

        assert!(matches!(result, Err(Error::InvalidInterval { .. })));
        assert!(recovery.is_open().await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_recover_orphan_from_manual_lock() -> Result<()> {
        let (_dir, recovery) = recovery()?;
        tokio::fs::write(
            recovery.lock_path(),
            "01/01/2024 09:00:00 - 01/01/2024 11:15:00\n",
        )
        .await?;

        let interval = recovery.recover_orphan().await?;

        assert_eq!(interval, Interval::new(at(9, 0), at(11, 15))?);
        assert!(!recovery.is_open().await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_recover_orphan_from_corrupt_lock() -> Result<()> {
        let (_dir, recovery) = recovery()?;
        tokio::fs::write(recovery.lock_path(), "garbage\n").await?;

        let result = recovery.recover_orphan().await;

        assert!(matches!(result, Err(Error::CorruptLock { .. })));
        assert!(recovery.is_open().await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_discard_corrupt_lock() -> Result<()> {
        let (_dir, recovery) = recovery()?;
        tokio::fs::write(recovery.lock_path(), "").await?;

        let discarded = recovery.discard().await?;

        assert_eq!(discarded, None);
        assert!(!recovery.is_open().await?);
        assert_eq!(recovery.discard().await?, None);
        Ok(())
    }

    #[test]
    fn test_pending_parse_rejects_reversed() {
        let result = PendingSession::parse("01/01/2024 10:00:00 - 01/01/2024 09:00:00");
        assert!(matches!(result, Err(Error::InvalidInterval { .. })));
    }
}
