use async_trait::async_trait;
use chrono::{Local, NaiveDateTime, SubsecRound};
#[cfg(test)]
use mockall::automock;
use tokio::time::Instant;

/// Represents an entity responsible for providing time across the application. Swapping it out
/// allows sessions to be tested without waiting on a wall clock.
///
/// Timestamps are local wall-clock time truncated to whole seconds, which is the precision of
/// the log files.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Clock: Sync + Send + 'static {
    fn now(&self) -> NaiveDateTime;

    fn instant(&self) -> Instant;

    async fn sleep_until(&self, instant: Instant);
}

pub struct DefaultClock;

#[async_trait]
impl Clock for DefaultClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local().trunc_subsecs(0)
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, instant: Instant) {
        tokio::time::sleep_until(instant).await;
    }
}
