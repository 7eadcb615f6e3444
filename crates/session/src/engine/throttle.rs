// Rate limiter for roster recomputation.
//
// Leading edge plus trailing edge: the first trigger in a quiet period runs
// immediately, triggers inside the window collapse into a single trailing run
// at the end of it. Default window is 100ms, clamped to 16–1000ms.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_THROTTLE_MS: u64 = 100;
const MIN_THROTTLE_MS: u64 = 16;
const MAX_THROTTLE_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self { interval: Duration::from_millis(DEFAULT_THROTTLE_MS) }
    }
}

impl ThrottleConfig {
    /// Interval in milliseconds, clamped to [16, 1000].
    pub fn with_millis(ms: u64) -> Self {
        let clamped = ms.clamp(MIN_THROTTLE_MS, MAX_THROTTLE_MS);
        Self { interval: Duration::from_millis(clamped) }
    }
}

/// What a trigger asks the driver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RunNow,
    /// Schedule the trailing run for this instant.
    Schedule(Instant),
    /// A trailing run is already scheduled; nothing to do.
    Coalesced,
}

/// Pure throttle state. The async driver feeds it the clock.
#[derive(Debug)]
pub struct ThrottleWindow {
    interval: Duration,
    last_run: Option<Instant>,
    pending: bool,
}

impl ThrottleWindow {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_run: None, pending: false }
    }

    pub fn trigger_at(&mut self, now: Instant) -> Decision {
        match self.last_run {
            Some(last) if now.duration_since(last) < self.interval => {
                if self.pending {
                    Decision::Coalesced
                } else {
                    self.pending = true;
                    Decision::Schedule(last + self.interval)
                }
            }
            _ => {
                self.last_run = Some(now);
                self.pending = false;
                Decision::RunNow
            }
        }
    }

    /// Called when a scheduled deadline fires. Returns true if the trailing run should happen.
    pub fn fire_at(&mut self, now: Instant) -> bool {
        if !self.pending {
            return false;
        }
        self.pending = false;
        self.last_run = Some(now);
        true
    }

    pub fn cancel(&mut self) {
        self.pending = false;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }
}

/// Tokio driver around [`ThrottleWindow`]. Cloning shares the same window.
#[derive(Clone)]
pub struct Throttle {
    inner: Arc<ThrottleInner>,
}

struct ThrottleInner {
    window: Mutex<ThrottleWindow>,
    action: Box<dyn Fn() + Send + Sync>,
    cancelled: AtomicBool,
    runs: AtomicU64,
}

impl Throttle {
    pub fn new<F>(config: ThrottleConfig, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ThrottleInner {
                window: Mutex::new(ThrottleWindow::new(config.interval)),
                action: Box::new(action),
                cancelled: AtomicBool::new(false),
                runs: AtomicU64::new(0),
            }),
        }
    }

    pub fn trigger(&self) {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let decision = self.inner.lock().trigger_at(Instant::now());
        match decision {
            Decision::RunNow => self.inner.run(),
            Decision::Schedule(deadline) => match Handle::try_current() {
                Ok(handle) => {
                    let weak = Arc::downgrade(&self.inner);
                    handle.spawn(async move {
                        tokio::time::sleep_until(deadline).await;
                        if let Some(inner) = weak.upgrade() {
                            inner.fire();
                        }
                    });
                }
                Err(_) => {
                    debug!("no tokio runtime for trailing throttle run, running inline");
                    self.inner.fire();
                }
            },
            Decision::Coalesced => {}
        }
    }

    /// Drop any scheduled trailing run and refuse later triggers.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.lock().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// How many times the action has run.
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::SeqCst)
    }
}

impl ThrottleInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, ThrottleWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let due = self.lock().fire_at(Instant::now());
        if due {
            self.run();
        }
    }

    fn run(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        (self.action)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── ThrottleConfig ─────────────────────────────────────────────

    #[test]
    fn default_interval_is_100ms() {
        assert_eq!(ThrottleConfig::default().interval, Duration::from_millis(100));
    }

    #[test]
    fn interval_is_clamped() {
        assert_eq!(ThrottleConfig::with_millis(1).interval, Duration::from_millis(16));
        assert_eq!(ThrottleConfig::with_millis(250).interval, Duration::from_millis(250));
        assert_eq!(ThrottleConfig::with_millis(60_000).interval, Duration::from_millis(1000));
    }

    // ── ThrottleWindow ─────────────────────────────────────────────

    #[test]
    fn first_trigger_runs_immediately() {
        let mut window = ThrottleWindow::new(Duration::from_millis(100));
        assert_eq!(window.trigger_at(Instant::now()), Decision::RunNow);
    }

    #[test]
    fn burst_inside_window_schedules_one_trailing_run() {
        let mut window = ThrottleWindow::new(Duration::from_millis(100));
        let t0 = Instant::now();

        assert_eq!(window.trigger_at(t0), Decision::RunNow);
        assert_eq!(
            window.trigger_at(t0 + Duration::from_millis(10)),
            Decision::Schedule(t0 + Duration::from_millis(100))
        );
        for ms in [20, 50, 99] {
            assert_eq!(window.trigger_at(t0 + Duration::from_millis(ms)), Decision::Coalesced);
        }

        assert!(window.fire_at(t0 + Duration::from_millis(100)));
        assert!(!window.fire_at(t0 + Duration::from_millis(100)));
    }

    #[test]
    fn trailing_run_opens_a_new_window() {
        let mut window = ThrottleWindow::new(Duration::from_millis(100));
        let t0 = Instant::now();
        window.trigger_at(t0);
        window.trigger_at(t0 + Duration::from_millis(30));
        assert!(window.fire_at(t0 + Duration::from_millis(100)));

        // 150ms is only 50ms after the trailing run.
        assert_eq!(
            window.trigger_at(t0 + Duration::from_millis(150)),
            Decision::Schedule(t0 + Duration::from_millis(200))
        );
    }

    #[test]
    fn trigger_after_quiet_period_runs_immediately() {
        let mut window = ThrottleWindow::new(Duration::from_millis(100));
        let t0 = Instant::now();
        window.trigger_at(t0);
        assert_eq!(window.trigger_at(t0 + Duration::from_millis(250)), Decision::RunNow);
        assert!(!window.is_pending());
    }

    #[test]
    fn cancel_clears_pending_run() {
        let mut window = ThrottleWindow::new(Duration::from_millis(100));
        let t0 = Instant::now();
        window.trigger_at(t0);
        window.trigger_at(t0 + Duration::from_millis(5));
        window.cancel();
        assert!(!window.fire_at(t0 + Duration::from_millis(100)));
    }

    // ── Throttle driver ────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn driver_runs_leading_and_trailing_edges() {
        let throttle = Throttle::new(ThrottleConfig::default(), || {});

        for _ in 0..10 {
            throttle.trigger();
            tokio::time::advance(Duration::from_millis(5)).await;
        }
        assert_eq!(throttle.runs(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(throttle.runs(), 2);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(throttle.runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_driver_never_runs_again() {
        let throttle = Throttle::new(ThrottleConfig::default(), || {});
        throttle.trigger();
        throttle.trigger();
        throttle.cancel();

        tokio::time::sleep(Duration::from_millis(300)).await;
        throttle.trigger();
        assert_eq!(throttle.runs(), 1);
        assert!(throttle.is_cancelled());
    }
}
