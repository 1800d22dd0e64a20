//! Debounced one-shot timers for idle, touch and display power tracking.
//!
//! `reset()` schedules one reset callback and arms a countdown; further
//! resets push the deadline forward. When the deadline passes without
//! another reset, the expiry callback fires. Consumers debounce the repeated
//! reset notifications by comparing against their cached timer state.

use crate::clock::{Clock, Nanos, NANOS_PER_MS};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

type TimerCallback = Box<dyn Fn() + Send>;

struct TimerControl {
    deadline: Option<Nanos>,
    /// The thread owes an on_reset call.
    fire_reset: bool,
    stop: bool,
}

struct TimerInner {
    control: Mutex<TimerControl>,
    cond: Condvar,
    interval: Nanos,
    clock: Arc<dyn Clock>,
}

/// A debounced timer running on a private thread. Dropping it joins the
/// thread.
pub struct OneShotTimer {
    name: String,
    inner: Arc<TimerInner>,
    thread: Option<JoinHandle<()>>,
}

impl OneShotTimer {
    /// Create and start the timer. The countdown is armed immediately, so
    /// with no resets the expiry callback fires after `interval_ms`.
    pub fn new(
        name: &str,
        interval_ms: u64,
        clock: Arc<dyn Clock>,
        on_reset: TimerCallback,
        on_expired: TimerCallback,
    ) -> Self {
        let interval = interval_ms as Nanos * NANOS_PER_MS;
        let first_deadline = clock.now() + interval;
        let inner = Arc::new(TimerInner {
            control: Mutex::new(TimerControl {
                deadline: Some(first_deadline),
                fire_reset: false,
                stop: false,
            }),
            cond: Condvar::new(),
            interval,
            clock,
        });

        let thread_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name(format!("timer-{}", name))
            .spawn(move || timer_loop(thread_inner, on_reset, on_expired))
            .expect("failed to spawn one-shot timer thread");

        Self {
            name: name.to_string(),
            inner,
            thread: Some(thread),
        }
    }

    /// Schedule the reset callback and push the deadline forward.
    pub fn reset(&self) {
        let mut control = self.inner.control.lock().unwrap();
        control.fire_reset = true;
        control.deadline = Some(self.inner.clock.now() + self.inner.interval);
        drop(control);
        self.inner.cond.notify_all();
    }

    /// One-line status for the dump surface.
    pub fn dump(&self) -> String {
        let control = self.inner.control.lock().unwrap();
        format!(
            "{} ({}ms, {})",
            self.name,
            self.inner.interval / NANOS_PER_MS,
            if control.deadline.is_some() {
                "armed"
            } else {
                "expired"
            }
        )
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        {
            let mut control = self.inner.control.lock().unwrap();
            control.stop = true;
        }
        self.inner.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!(name = %self.name, "one-shot timer stopped");
    }
}

fn timer_loop(inner: Arc<TimerInner>, on_reset: TimerCallback, on_expired: TimerCallback) {
    let mut control = inner.control.lock().unwrap();
    loop {
        if control.stop {
            break;
        }

        if control.fire_reset {
            control.fire_reset = false;
            drop(control);
            on_reset();
            control = inner.control.lock().unwrap();
            continue;
        }

        match control.deadline {
            None => {
                control = inner.cond.wait(control).unwrap();
            }
            Some(deadline) => {
                let now = inner.clock.now();
                if now >= deadline {
                    control.deadline = None;
                    drop(control);
                    on_expired();
                    control = inner.control.lock().unwrap();
                } else {
                    let (guard, _) = inner
                        .cond
                        .wait_timeout(control, Duration::from_nanos((deadline - now) as u64))
                        .unwrap();
                    control = guard;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_timer(interval_ms: u64) -> (OneShotTimer, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let resets = Arc::new(AtomicUsize::new(0));
        let expiries = Arc::new(AtomicUsize::new(0));
        let cb_resets = Arc::clone(&resets);
        let cb_expiries = Arc::clone(&expiries);
        let timer = OneShotTimer::new(
            "test",
            interval_ms,
            Arc::new(MonotonicClock::new()),
            Box::new(move || {
                cb_resets.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move || {
                cb_expiries.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (timer, resets, expiries)
    }

    #[test]
    fn test_expires_after_interval() {
        let (_timer, resets, expiries) = counting_timer(30);

        thread::sleep(Duration::from_millis(10));
        assert_eq!(expiries.load(Ordering::SeqCst), 0);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(expiries.load(Ordering::SeqCst), 1);
        assert_eq!(resets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reset_pushes_deadline() {
        let (timer, _resets, expiries) = counting_timer(50);

        for _ in 0..4 {
            thread::sleep(Duration::from_millis(20));
            timer.reset();
        }
        // 80ms elapsed, but the deadline kept moving.
        assert_eq!(expiries.load(Ordering::SeqCst), 0);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(expiries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_every_reset_schedules_the_callback() {
        let (timer, resets, expiries) = counting_timer(25);

        timer.reset();
        thread::sleep(Duration::from_millis(5));
        timer.reset();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(resets.load(Ordering::SeqCst), 2);
        assert_eq!(expiries.load(Ordering::SeqCst), 1);

        // Re-arming after expiry works the same way.
        timer.reset();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(resets.load(Ordering::SeqCst), 3);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(expiries.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drop_joins_quickly() {
        let (timer, _resets, _expiries) = counting_timer(10_000);
        let start = std::time::Instant::now();
        drop(timer);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
