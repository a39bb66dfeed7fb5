//! Session clock.
//!
//! Remaining time is always recomputed from the server-issued start anchor:
//! `max(0, duration - (now - started_at))`. The local interval only decides
//! *when* to recompute, never *how much* time is left, so a sleeping tab or
//! a delayed timer callback cannot stretch the session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Source of wall-clock time.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used by tests and demos.
#[derive(Debug)]
pub struct ManualTimeSource {
    now: Mutex<DateTime<Utc>>,
}

impl ManualTimeSource {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *crate::lock(&self.now) = to;
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        let mut now = crate::lock(&self.now);
        *now += delta;
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> DateTime<Utc> {
        *crate::lock(&self.now)
    }
}

/// Remaining whole seconds of an attempt at `now`.
///
/// A local clock running behind the server never yields more than the full
/// duration.
pub fn remaining_seconds(started_at: DateTime<Utc>, duration_seconds: u64, now: DateTime<Utc>) -> u64 {
    let elapsed = (now - started_at).num_seconds().max(0) as u64;
    duration_seconds.saturating_sub(elapsed)
}

/// Ticking timer for one attempt.
///
/// Each instance owns its interval task; dropping or stopping it cancels the
/// task, so independent sessions never share timer state.
pub struct SessionTimer {
    time: Arc<dyn TimeSource>,
    tick_interval: Duration,
    anchor: Option<(DateTime<Utc>, u64)>,
    task: Option<JoinHandle<()>>,
}

impl SessionTimer {
    pub fn new(time: Arc<dyn TimeSource>, tick_interval: Duration) -> Self {
        Self {
            time,
            tick_interval,
            anchor: None,
            task: None,
        }
    }

    /// Start ticking against `started_at + duration_seconds`.
    ///
    /// `on_tick` receives the recomputed remaining seconds on every tick,
    /// the first one immediately. When the remaining time reaches zero
    /// `on_expire` runs once and the timer stops. Calling `start` again
    /// replaces the previous run; with the same anchor it reports exactly
    /// what a fresh timer would.
    pub fn start<T, E>(&mut self, started_at: DateTime<Utc>, duration_seconds: u64, on_tick: T, on_expire: E)
    where
        T: Fn(u64) + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        self.stop();
        self.anchor = Some((started_at, duration_seconds));

        let time = Arc::clone(&self.time);
        let period = self.tick_interval;
        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let remaining = remaining_seconds(started_at, duration_seconds, time.now());
                on_tick(remaining);
                if remaining == 0 {
                    tracing::debug!("session timer reached zero");
                    on_expire();
                    break;
                }
            }
        }));
    }

    /// Remaining seconds right now, or `None` if the timer was never started.
    pub fn remaining(&self) -> Option<u64> {
        self.anchor
            .map(|(started_at, duration)| remaining_seconds(started_at, duration, self.time.now()))
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop ticking. The anchor is kept so `remaining` still answers.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Stop ticking and forget the anchor.
    pub fn dispose(&mut self) {
        self.stop();
        self.anchor = None;
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    fn t0() -> DateTime<Utc> {
        "2026-03-01T09:00:00Z".parse().unwrap()
    }

    #[test]
    fn remaining_from_anchor() {
        let start = t0();
        assert_eq!(remaining_seconds(start, 1800, start), 1800);
        assert_eq!(
            remaining_seconds(start, 1800, start + chrono::Duration::seconds(400)),
            1400
        );
        assert_eq!(
            remaining_seconds(start, 1800, start + chrono::Duration::seconds(4000)),
            0
        );
    }

    #[test]
    fn local_clock_behind_server_is_capped() {
        let start = t0();
        let now = start - chrono::Duration::seconds(90);
        assert_eq!(remaining_seconds(start, 600, now), 600);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_reflect_wall_clock_not_tick_count() {
        let clock = Arc::new(ManualTimeSource::new(t0()));
        let mut timer = SessionTimer::new(clock.clone(), Duration::from_secs(1));
        let last = Arc::new(AtomicU64::new(u64::MAX));
        let ticks = Arc::new(AtomicU32::new(0));

        let (l, n) = (last.clone(), ticks.clone());
        timer.start(
            t0(),
            1800,
            move |r| {
                l.store(r, Ordering::SeqCst);
                n.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        );
        tokio::task::yield_now().await;
        assert_eq!(last.load(Ordering::SeqCst), 1800);

        // Tab backgrounded: 400s of wall time pass, one more tick is delivered.
        clock.advance(Duration::from_secs(400));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        tokio::task::yield_now().await;

        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert_eq!(last.load(Ordering::SeqCst), 1400);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_fires_once_and_stops() {
        let clock = Arc::new(ManualTimeSource::new(t0()));
        let mut timer = SessionTimer::new(clock.clone(), Duration::from_secs(1));
        let expired = Arc::new(AtomicU32::new(0));

        let e = expired.clone();
        timer.start(t0(), 5, |_| {}, move || {
            e.fetch_add(1, Ordering::SeqCst);
        });
        clock.advance(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
        assert_eq!(timer.remaining(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_with_same_anchor_matches_fresh_timer() {
        let clock = Arc::new(ManualTimeSource::new(t0()));
        let mut first = SessionTimer::new(clock.clone(), Duration::from_secs(1));
        first.start(t0(), 900, |_| {}, || {});
        clock.advance(Duration::from_secs(123));
        first.stop();
        first.start(t0(), 900, |_| {}, || {});

        let mut fresh = SessionTimer::new(clock.clone(), Duration::from_secs(1));
        fresh.start(t0(), 900, |_| {}, || {});

        assert_eq!(first.remaining(), Some(777));
        assert_eq!(first.remaining(), fresh.remaining());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_cancels_ticking() {
        let clock = Arc::new(ManualTimeSource::new(t0()));
        let mut timer = SessionTimer::new(clock, Duration::from_secs(1));
        let ticks = Arc::new(AtomicU32::new(0));
        let n = ticks.clone();
        timer.start(t0(), 60, move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        }, || {});
        tokio::task::yield_now().await;
        timer.dispose();
        let before = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), before);
        assert_eq!(timer.remaining(), None);
    }
}
