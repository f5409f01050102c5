//! Cancellable timers on top of `tokio::time`.
//!
//! Everything here runs on the tokio clock, so tests using
//! `start_paused = true` drive timers without sleeping.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

/// One-shot scheduled task. Aborted on `cancel()` or on drop unless detached.
pub struct TimerHandle {
    task: Option<JoinHandle<()>>,
    detached: bool,
}

impl TimerHandle {
    /// Run `f` once after `delay`
    pub fn once<F, Fut>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            time::sleep(delay).await;
            f().await;
        });
        Self {
            task: Some(task),
            detached: false,
        }
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Keep running after the handle is dropped
    pub fn detach(mut self) {
        self.detached = true;
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if !self.detached {
            self.cancel();
        }
    }
}

/// Fixed-period ticker. Restarting resets the phase.
pub struct PeriodicTimer {
    period: Duration,
    on_tick: Arc<dyn Fn() + Send + Sync>,
    task: Option<JoinHandle<()>>,
    starts: u64,
}

impl PeriodicTimer {
    pub fn new(period: Duration, on_tick: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            period,
            on_tick: Arc::new(on_tick),
            task: None,
            starts: 0,
        }
    }

    /// Start ticking at the current period. First tick is one period out.
    pub fn start(&mut self) {
        self.stop();
        let period = self.period;
        let on_tick = Arc::clone(&self.on_tick);
        self.task = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                on_tick();
            }
        }));
        self.starts += 1;
        debug!("Periodic timer started ({}ms)", period.as_millis());
    }

    /// Stop and start again at `period`
    pub fn restart(&mut self, period: Duration) {
        self.period = period;
        self.start();
    }

    /// Change the period; takes effect on the next start
    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// How many times the timer has been (re)started
    pub fn starts(&self) -> u64 {
        self.starts
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let handle = TimerHandle::once(Duration::from_secs(5), move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_drop_abort() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f1 = Arc::clone(&fired);
        let mut cancelled = TimerHandle::once(Duration::from_secs(1), move || async move {
            f1.fetch_add(1, Ordering::SeqCst);
        });
        cancelled.cancel();
        let f2 = Arc::clone(&fired);
        drop(TimerHandle::once(Duration::from_secs(1), move || async move {
            f2.fetch_add(1, Ordering::SeqCst);
        }));
        let f3 = Arc::clone(&fired);
        TimerHandle::once(Duration::from_secs(1), move || async move {
            f3.fetch_add(10, Ordering::SeqCst);
        })
        .detach();

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_restart_changes_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        let mut timer = PeriodicTimer::new(Duration::from_secs(30), move || {
            t.fetch_add(1, Ordering::SeqCst);
        });
        timer.start();
        time::sleep(Duration::from_secs(31)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        timer.restart(Duration::from_secs(20));
        assert_eq!(timer.period(), Duration::from_secs(20));
        time::sleep(Duration::from_secs(41)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(timer.starts(), 2);

        timer.stop();
        assert!(!timer.is_running());
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
