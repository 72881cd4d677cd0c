use std::{sync::Arc, time::Duration};

use chrono::NaiveDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    error::{Error, Result},
    storage::{
        interval::Interval,
        pending::PendingSession,
        project_store::ProjectStore,
    },
};

pub mod shutdown;

/// A crash loses at most this much of a session.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(300);

/// Callback invoked with the interval of a session closed by the runner.
pub type TerminateHook = Box<dyn FnOnce(&Interval) + Send>;

/// How a session driven by [SessionRunner] came to an end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The runner closed the session and recorded it.
    Closed(Interval),
    /// The session was too short to be recorded and was dropped.
    Discarded(PendingSession),
    /// The clock is behind the session, so it couldn't be closed. The session stays open with
    /// its last heartbeat and has to be recovered explicitly.
    Unresolved(PendingSession),
    /// Somebody else closed the session, for example `end` from another process.
    EndedElsewhere,
}

/// Keeps one session alive. Starts it, refreshes its provisional end every heartbeat period
/// and closes it once the shutdown token is cancelled.
pub struct SessionRunner {
    store: Arc<ProjectStore>,
    project: String,
    heartbeat_period: Duration,
    shutdown: CancellationToken,
    on_terminate: Option<TerminateHook>,
}

impl SessionRunner {
    pub fn new(store: Arc<ProjectStore>, project: String, shutdown: CancellationToken) -> Self {
        Self {
            store,
            project,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            shutdown,
            on_terminate: None,
        }
    }

    pub fn with_heartbeat_period(self, heartbeat_period: Duration) -> Self {
        Self {
            heartbeat_period,
            ..self
        }
    }

    /// Registers a callback for the moment the runner closes the session.
    pub fn on_terminate(self, hook: impl FnOnce(&Interval) + Send + 'static) -> Self {
        Self {
            on_terminate: Some(Box::new(hook)),
            ..self
        }
    }

    /// Executes the session loop. Fails right away if the session can't be started, for example
    /// because another one is already running.
    pub async fn run(mut self) -> Result<SessionOutcome> {
        let started = self.store.start(&self.project).await?.start();
        info!("Started {} at {started}", self.project);

        let clock = self.store.clock();
        let mut heartbeat_point = clock.instant();
        loop {
            heartbeat_point += self.heartbeat_period;

            let cancelled = tokio::select! {
                _ = self.shutdown.cancelled() => true,
                _ = clock.sleep_until(heartbeat_point) => false,
            };
            if cancelled {
                return self.close(started).await;
            }

            let span = info_span!("Heartbeat", project = %self.project);
            match self
                .store
                .heartbeat_session(&self.project, started)
                .instrument(span)
                .await
            {
                Ok(pending) => debug!("Session is alive until {}", pending.provisional_end()),
                Err(Error::NoOpenSession { .. }) => {
                    info!("Session of {} was closed elsewhere", self.project);
                    return Ok(SessionOutcome::EndedElsewhere);
                }
                // The previous heartbeat stays on disk.
                Err(e) => error!("Heartbeat failed {e:?}"),
            }
        }
    }

    async fn close(&mut self, started: NaiveDateTime) -> Result<SessionOutcome> {
        match self.store.end_session(&self.project, started).await {
            Ok(interval) => {
                if let Some(hook) = self.on_terminate.take() {
                    hook(&interval);
                }
                Ok(SessionOutcome::Closed(interval))
            }
            Err(Error::InvalidInterval { .. }) => self.close_invalid(started).await,
            Err(Error::NoOpenSession { .. }) => Ok(SessionOutcome::EndedElsewhere),
            Err(e) => Err(e),
        }
    }

    /// The clock isn't past the start of the session. Without any heartbeat there's nothing to
    /// record, otherwise the session is left for an explicit recovery.
    async fn close_invalid(&mut self, started: NaiveDateTime) -> Result<SessionOutcome> {
        let discarded = match self
            .store
            .discard_empty_session(&self.project, started)
            .await
        {
            Ok(v) => v,
            Err(Error::NoOpenSession { .. }) => return Ok(SessionOutcome::EndedElsewhere),
            Err(e) => return Err(e),
        };
        if let Some(pending) = discarded {
            warn!("Session of {} is too short to be recorded", self.project);
            return Ok(SessionOutcome::Discarded(pending));
        }
        match self.store.pending_session(&self.project).await? {
            Some(pending) if pending.start() == started => {
                warn!(
                    "Clock went back before the start of {pending}, keeping the session of {} open",
                    self.project
                );
                Ok(SessionOutcome::Unresolved(pending))
            }
            _ => Ok(SessionOutcome::EndedElsewhere),
        }
    }
}

#[cfg(test)]
mod session_tests {
    use std::{
        path::Path,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
    use tempfile::tempdir;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::{
        storage::{interval::Interval, project_store::ProjectStore},
        utils::{clock::Clock, logging::TEST_LOGGING},
    };

    use super::{SessionOutcome, SessionRunner};

    fn test_start_date() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, 7, 4)
            .unwrap()
            .and_time(NaiveTime::MIN)
    }

    /// Clock where every real millisecond is a second, so that sessions lasting a fraction of a
    /// second are long enough to be recorded.
    struct FastClock {
        start_time: NaiveDateTime,
        reference: Instant,
    }

    #[async_trait]
    impl Clock for FastClock {
        fn now(&self) -> NaiveDateTime {
            let elapsed = self.reference.elapsed().as_millis() as i64;
            self.start_time + TimeDelta::seconds(elapsed)
        }

        fn instant(&self) -> Instant {
            Instant::now()
        }

        async fn sleep_until(&self, instant: Instant) {
            tokio::time::sleep_until(instant).await;
        }
    }

    /// Clock showing whatever time the test sets.
    struct ManualClock {
        now: Mutex<NaiveDateTime>,
    }

    impl ManualClock {
        fn set(&self, now: NaiveDateTime) {
            *self.now.lock().unwrap() = now;
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> NaiveDateTime {
            *self.now.lock().unwrap()
        }

        fn instant(&self) -> Instant {
            Instant::now()
        }

        async fn sleep_until(&self, instant: Instant) {
            tokio::time::sleep_until(instant).await;
        }
    }

    fn fall_back_night(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 10, 27)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn fast_clock() -> Arc<dyn Clock> {
        Arc::new(FastClock {
            start_time: test_start_date(),
            reference: Instant::now(),
        })
    }

    fn store_with(dir: &Path, clock: &Arc<dyn Clock>) -> Result<Arc<ProjectStore>> {
        Ok(Arc::new(ProjectStore::new(dir.to_path_buf(), clock.clone())?))
    }

    async fn wait_for_lock(store: &ProjectStore, project: &str) -> Result<()> {
        for _ in 0..200 {
            if store.pending_session(project).await?.is_some() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        anyhow::bail!("session of {project} never started")
    }

    #[tokio::test]
    async fn test_runner_closes_session_on_shutdown() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let store = store_with(dir.path(), &fast_clock())?;
        let shutdown = CancellationToken::new();
        let terminated = Arc::new(Mutex::new(None::<Interval>));

        let runner = SessionRunner::new(store.clone(), "thesis".into(), shutdown.clone())
            .with_heartbeat_period(Duration::from_millis(50))
            .on_terminate({
                let terminated = terminated.clone();
                move |interval| *terminated.lock().unwrap() = Some(*interval)
            });
        let handle = tokio::spawn(runner.run());

        wait_for_lock(&store, "thesis").await?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let alive_until = store.pending_session("thesis").await?.unwrap();
        shutdown.cancel();

        let outcome = handle.await??;

        let SessionOutcome::Closed(interval) = outcome else {
            panic!("session should have been closed");
        };
        assert!(alive_until.provisional_end() > alive_until.start());
        assert!(interval.end() >= alive_until.provisional_end());
        assert_eq!(*terminated.lock().unwrap(), Some(interval));
        assert_eq!(store.load("thesis").await?.intervals(), &[interval]);
        assert!(store.pending_session("thesis").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_runner_stops_when_ended_elsewhere() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let clock = fast_clock();
        let store = store_with(dir.path(), &clock)?;
        let shutdown = CancellationToken::new();

        let runner = SessionRunner::new(store.clone(), "thesis".into(), shutdown.clone())
            .with_heartbeat_period(Duration::from_millis(20));
        let handle = tokio::spawn(runner.run());

        wait_for_lock(&store, "thesis").await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Another process closing the session only shares the directory.
        let other = store_with(dir.path(), &clock)?;
        other.end("thesis").await?;

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await???;

        assert_eq!(outcome, SessionOutcome::EndedElsewhere);
        assert_eq!(store.load("thesis").await?.len(), 1);
        assert!(!shutdown.is_cancelled());
        Ok(())
    }

    #[tokio::test]
    async fn test_runner_leaves_newer_session_alone() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let clock = fast_clock();
        let store = store_with(dir.path(), &clock)?;
        let shutdown = CancellationToken::new();

        let runner = SessionRunner::new(store.clone(), "thesis".into(), shutdown.clone())
            .with_heartbeat_period(Duration::from_secs(3600))
            .on_terminate(|_| panic!("the session belongs to another process"));
        let handle = tokio::spawn(runner.run());

        wait_for_lock(&store, "thesis").await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let other = store_with(dir.path(), &clock)?;
        other.end("thesis").await?;
        let theirs = other.start("thesis").await?;
        shutdown.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await???;

        assert_eq!(outcome, SessionOutcome::EndedElsewhere);
        assert_eq!(store.pending_session("thesis").await?, Some(theirs));
        assert_eq!(store.load("thesis").await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_runner_keeps_session_when_clock_goes_back() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let manual = Arc::new(ManualClock {
            now: Mutex::new(fall_back_night(2, 30)),
        });
        let clock: Arc<dyn Clock> = manual.clone();
        let store = store_with(dir.path(), &clock)?;
        let shutdown = CancellationToken::new();

        let runner = SessionRunner::new(store.clone(), "thesis".into(), shutdown.clone())
            .with_heartbeat_period(Duration::from_millis(10));
        let handle = tokio::spawn(runner.run());

        wait_for_lock(&store, "thesis").await?;
        manual.set(fall_back_night(2, 55));
        for _ in 0..200 {
            let pending = store.pending_session("thesis").await?;
            if pending.is_some_and(|v| v.provisional_end() == fall_back_night(2, 55)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        manual.set(fall_back_night(1, 55));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await???;

        let pending = match outcome {
            SessionOutcome::Unresolved(pending) => pending,
            other => panic!("session should have been kept, got {other:?}"),
        };
        assert_eq!(pending.start(), fall_back_night(2, 30));
        assert_eq!(pending.provisional_end(), fall_back_night(2, 55));
        assert_eq!(store.pending_session("thesis").await?, Some(pending));
        assert!(store.load("thesis").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_runner_discards_empty_session() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let clock: Arc<dyn Clock> = Arc::new(ManualClock {
            now: Mutex::new(test_start_date()),
        });
        let store = store_with(dir.path(), &clock)?;
        let shutdown = CancellationToken::new();

        let runner = SessionRunner::new(store.clone(), "thesis".into(), shutdown.clone())
            .with_heartbeat_period(Duration::from_secs(3600));
        let handle = tokio::spawn(runner.run());
        wait_for_lock(&store, "thesis").await?;
        shutdown.cancel();

        let outcome = handle.await??;

        let pending = match outcome {
            SessionOutcome::Discarded(pending) => pending,
            other => panic!("session should have been discarded, got {other:?}"),
        };
        assert_eq!(pending.start(), test_start_date());
        assert!(store.pending_session("thesis").await?.is_none());
        assert!(store.load("thesis").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_runner_refuses_second_session() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let store = store_with(dir.path(), &fast_clock())?;
        store.start("thesis").await?;

        let result = SessionRunner::new(store.clone(), "thesis".into(), CancellationToken::new())
            .run()
            .await;

        assert!(matches!(
            result,
            Err(crate::error::Error::SessionAlreadyRunning { .. })
        ));
        Ok(())
    }
}
