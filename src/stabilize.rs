//! Debounced wait for a page to stop changing.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, warn};

use crate::page::{ChangeSource, Page};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// No change for a full debounce interval, after the minimum wait.
    Quiet,
    /// Still changing when the hard limit was reached.
    TimedOut,
    /// Observation disabled; only the minimum wait was honoured.
    Skipped,
}

/// Longest any single wait may be configured to; keeps deadline arithmetic
/// on `Instant` from overflowing.
const LONGEST_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stabilizer {
    min_wait: Duration,
    max_wait: Duration,
    debounce: Duration,
}

impl Stabilizer {
    pub fn new(min_wait: Duration, max_wait: Duration, debounce: Duration) -> Self {
        Self {
            min_wait: min_wait.min(LONGEST_WAIT),
            max_wait: max_wait.min(LONGEST_WAIT),
            debounce: debounce.min(LONGEST_WAIT),
        }
    }

    /// Every change pushes the quiet deadline out by `debounce`; the wait
    /// ends once that deadline passes with `min_wait` also satisfied, or at
    /// `max_wait` no matter what.
    pub async fn settle(&self, source: &mut dyn ChangeSource) -> Settled {
        let start = Instant::now();
        if self.max_wait.is_zero() {
            sleep(self.min_wait).await;
            return Settled::Skipped;
        }

        let hard_stop = start + self.max_wait;
        let min_done = start + self.min_wait;
        let mut quiet_at = (start + self.debounce).max(min_done);
        let mut open = true;
        let mut changes = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = sleep_until(quiet_at) => {
                    debug!(changes, elapsed_ms = start.elapsed().as_millis() as u64, "page settled");
                    return Settled::Quiet;
                }
                _ = sleep_until(hard_stop) => {
                    debug!(changes, "page still changing at stabilization limit");
                    return Settled::TimedOut;
                }
                change = source.next_change(), if open => match change {
                    Some(()) => {
                        changes += 1;
                        quiet_at = (Instant::now() + self.debounce).max(min_done);
                    }
                    None => open = false,
                },
            }
        }
    }

    /// Settle against the page's own mutation feed. If the page cannot be
    /// observed the minimum wait still applies.
    pub async fn settle_page<P: Page + ?Sized>(&self, page: &P) -> Settled {
        if self.max_wait.is_zero() {
            sleep(self.min_wait).await;
            return Settled::Skipped;
        }
        match page.observe_changes().await {
            Ok(mut source) => self.settle(source.as_mut()).await,
            Err(e) => {
                warn!("cannot observe page changes: {}", e);
                sleep(self.min_wait).await;
                Settled::Skipped
            }
        }
    }
}

#[async_trait]
impl ChangeSource for mpsc::Receiver<()> {
    async fn next_change(&mut self) -> Option<()> {
        self.recv().await
    }
}

/// A page that never reports changes.
pub struct Silent;

#[async_trait]
impl ChangeSource for Silent {
    async fn next_change(&mut self) -> Option<()> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stabilizer(min: u64, max: u64, debounce: u64) -> Stabilizer {
        Stabilizer::new(
            Duration::from_millis(min),
            Duration::from_millis(max),
            Duration::from_millis(debounce),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_page_waits_for_minimum() {
        let start = Instant::now();
        let settled = stabilizer(500, 3000, 300).settle(&mut Silent).await;
        assert_eq!(settled, Settled::Quiet);
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn each_change_restarts_the_debounce() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for _ in 0..3 {
                sleep(Duration::from_millis(200)).await;
                let _ = tx.send(()).await;
            }
        });

        let start = Instant::now();
        let settled = stabilizer(100, 3000, 300).settle(&mut rx).await;
        assert_eq!(settled, Settled::Quiet);
        // last change at 600ms, then a full 300ms of quiet
        assert_eq!(start.elapsed(), Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_changes_hit_the_hard_limit() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_millis(50)).await;
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        });

        let start = Instant::now();
        let settled = stabilizer(500, 2000, 300).settle(&mut rx).await;
        assert_eq!(settled, Settled::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_limit_is_capped_instead_of_overflowing() {
        let huge = Stabilizer::new(Duration::MAX, Duration::MAX, Duration::MAX);
        assert_eq!(
            huge,
            Stabilizer::new(LONGEST_WAIT, LONGEST_WAIT, LONGEST_WAIT)
        );

        let start = Instant::now();
        let settled = Stabilizer::new(
            Duration::from_millis(500),
            Duration::MAX,
            Duration::from_millis(300),
        )
        .settle(&mut Silent)
        .await;
        assert_eq!(settled, Settled::Quiet);
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limit_skips_observation() {
        let (_tx, mut rx) = mpsc::channel::<()>(1);
        let start = Instant::now();
        let settled = stabilizer(400, 0, 300).settle(&mut rx).await;
        assert_eq!(settled, Settled::Skipped);
        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }
}
