//! Poll scheduling and deadline enforcement.
//!
//! A session makes progress only through ticks of its [`PollScheduler`]; nothing
//! on the caller's side ever waits on the pipe. The [`TimeoutGuard`] runs as a
//! separate task so a deadline fires even when the worker never produces a byte.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What a tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Schedule another tick.
    Continue,
    /// The session reached a terminal condition.
    Finished,
}

/// Drives a tick function on a fixed interval until it finishes or is stopped.
#[derive(Debug, Clone)]
pub struct PollScheduler {
    interval: Duration,
    stop: CancellationToken,
}

impl PollScheduler {
    /// Creates a scheduler ticking every `interval` until `stop` is cancelled.
    pub fn new(interval: Duration, stop: CancellationToken) -> Self {
        Self { interval, stop }
    }

    /// Returns the tick interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs `tick` until it returns [`TickOutcome::Finished`] or the stop token is
    /// cancelled. The first tick happens one interval after the call.
    ///
    /// Returns the number of ticks executed.
    pub async fn run<F>(&self, mut tick: F) -> u64
    where
        F: FnMut() -> TickOutcome,
    {
        let Some(first) = Instant::now().checked_add(self.interval) else {
            tracing::warn!(interval = ?self.interval, "poll interval out of range, waiting for stop");
            self.stop.cancelled().await;
            return 0;
        };
        let mut ticker = tokio::time::interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut ticks = 0;
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    ticks += 1;
                    if tick() == TickOutcome::Finished {
                        break;
                    }
                }
            }
        }
        ticks
    }
}

/// Single-shot deadline running independently of the poll loop.
#[derive(Debug)]
pub struct TimeoutGuard {
    handle: JoinHandle<()>,
}

impl TimeoutGuard {
    /// Arms a deadline of `duration`.
    ///
    /// `on_expire` runs once when the deadline elapses, unless `stop` is cancelled
    /// first.
    pub fn arm<F>(duration: Duration, stop: CancellationToken, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(duration) => on_expire(),
            }
        });
        Self { handle }
    }

    /// Cancels the deadline without firing it.
    pub fn disarm(self) {
        self.handle.abort();
    }

    /// Returns true once the guard fired or was stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn scheduler_stops_when_tick_finishes() {
        let scheduler = PollScheduler::new(Duration::from_millis(5), CancellationToken::new());
        let mut calls = 0;

        let ticks = scheduler
            .run(|| {
                calls += 1;
                if calls == 3 {
                    TickOutcome::Finished
                } else {
                    TickOutcome::Continue
                }
            })
            .await;

        assert_eq!(ticks, 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn scheduler_stops_on_cancellation() {
        let stop = CancellationToken::new();
        let scheduler = PollScheduler::new(Duration::from_millis(5), stop.clone());

        let canceller = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                stop.cancel();
            })
        };

        let ticks = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.run(|| TickOutcome::Continue),
        )
        .await
        .expect("scheduler ignored stop token");
        canceller.await.unwrap();

        assert!(ticks >= 1);
    }

    #[tokio::test]
    async fn scheduler_does_not_tick_after_stop() {
        let stop = CancellationToken::new();
        stop.cancel();
        let scheduler = PollScheduler::new(Duration::from_millis(1), stop);

        let ticks = scheduler.run(|| TickOutcome::Continue).await;
        assert_eq!(ticks, 0);
    }

    #[tokio::test]
    async fn scheduler_tolerates_out_of_range_interval() {
        let stop = CancellationToken::new();
        stop.cancel();
        let scheduler = PollScheduler::new(Duration::MAX, stop);

        let ticks = scheduler.run(|| TickOutcome::Continue).await;
        assert_eq!(ticks, 0);
    }

    #[tokio::test]
    async fn timeout_guard_fires_once() {
        let fired = Arc::new(AtomicU32::new(0));
        let guard = TimeoutGuard::arm(Duration::from_millis(20), CancellationToken::new(), {
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(guard.is_finished());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_guard_respects_stop() {
        let fired = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();
        let _guard = TimeoutGuard::arm(Duration::from_millis(50), stop.clone(), {
            let fired = fired.clone();
            move || fired.store(true, Ordering::SeqCst)
        });

        stop.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn disarmed_guard_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let guard = TimeoutGuard::arm(Duration::from_millis(30), CancellationToken::new(), {
            let fired = fired.clone();
            move || fired.store(true, Ordering::SeqCst)
        });

        guard.disarm();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
