//! Timed vsync callback dispatch.
//!
//! A priority queue of callback registrations serviced by a dedicated timer
//! thread. Each registration asks to be woken at
//! `vsync - (work_duration + ready_duration)`; wake times are recomputed
//! whenever the timing model shifts, but a registration is only moved when
//! its target vsync changes by more than the move threshold, so small model
//! corrections do not re-arm the OS timer.

use crate::clock::{Clock, Nanos, NANOS_PER_MS};
use crate::tracker::VsyncTracker;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, trace};

/// Tracker shared between the controller, the dispatch and the façade.
pub type SharedVsyncTracker = Arc<Mutex<dyn VsyncTracker>>;

/// Callbacks may fire up to this much before their nominal wake time.
pub const TIMER_SLACK: Nanos = 500_000;

/// A registration keeps its stale schedule unless the new target vsync
/// differs from the old one by more than this.
pub const VSYNC_MOVE_THRESHOLD: Nanos = 3 * NANOS_PER_MS;

/// Wake timing request for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTiming {
    /// Time the subscriber needs between wake and work-done.
    pub work_duration: Nanos,
    /// Time the subscriber needs between work-done and vsync.
    pub ready_duration: Nanos,
    /// Earliest vsync the subscriber is interested in; 0 means "next".
    pub earliest_vsync: Nanos,
}

/// Times handed to a fired callback.
#[derive(Debug, Clone, Copy)]
pub struct VsyncCallbackData {
    /// The targeted vsync.
    pub vsync_time: Nanos,
    /// The nominal wake time the callback was scheduled for.
    pub wakeup_time: Nanos,
    /// The latest time the subscriber's work should be done by.
    pub ready_time: Nanos,
}

type Callback = Arc<dyn Fn(VsyncCallbackData) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Armed {
    wakeup: Nanos,
    vsync: Nanos,
    ready: Nanos,
}

struct Entry {
    name: String,
    callback: Callback,
    seq: u64,
    armed: Option<Armed>,
    last_timing: Option<ScheduleTiming>,
    running_on: Option<ThreadId>,
}

struct DispatchState {
    entries: HashMap<u64, Entry>,
    next_token: u64,
    next_seq: u64,
    running: bool,
}

struct Inner {
    state: Mutex<DispatchState>,
    /// Wakes the timer thread when the earliest deadline may have changed.
    timer_cond: Condvar,
    /// Signaled when an in-flight callback returns.
    fired_cond: Condvar,
    clock: Arc<dyn Clock>,
    tracker: SharedVsyncTracker,
    timer_slack: Nanos,
    move_threshold: Nanos,
}

impl Inner {
    /// Compute the wake entry for `timing` as of `now`.
    ///
    /// The target vsync is the smallest predicted vsync at or after
    /// `max(earliest_vsync, now + work + ready)`.
    fn compute(&self, now: Nanos, timing: ScheduleTiming) -> Armed {
        let lead = timing.work_duration + timing.ready_duration;
        let earliest = timing.earliest_vsync.max(now + lead);
        let vsync = self
            .tracker
            .lock()
            .unwrap()
            .next_anticipated_vsync_from(earliest);
        Armed {
            wakeup: vsync - lead,
            vsync,
            ready: vsync - timing.ready_duration,
        }
    }
}

/// The timer queue. Owns the timer thread; dropping it joins the thread.
pub struct VsyncDispatch {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl VsyncDispatch {
    pub fn new(clock: Arc<dyn Clock>, tracker: SharedVsyncTracker) -> Self {
        Self::with_tuning(clock, tracker, TIMER_SLACK, VSYNC_MOVE_THRESHOLD)
    }

    pub fn with_tuning(
        clock: Arc<dyn Clock>,
        tracker: SharedVsyncTracker,
        timer_slack: Nanos,
        move_threshold: Nanos,
    ) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(DispatchState {
                entries: HashMap::new(),
                next_token: 0,
                next_seq: 0,
                running: true,
            }),
            timer_cond: Condvar::new(),
            fired_cond: Condvar::new(),
            clock,
            tracker,
            timer_slack,
            move_threshold,
        });

        let thread_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("vsync-dispatch".to_string())
            .spawn(move || timer_loop(thread_inner))
            .expect("failed to spawn vsync dispatch thread");

        Self {
            inner,
            thread: Some(thread),
        }
    }

    /// Register a named callback. The registration handle schedules,
    /// cancels, and on drop removes the callback from the queue.
    pub fn register<F>(&self, name: &str, callback: F) -> VsyncCallbackRegistration
    where
        F: Fn(VsyncCallbackData) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        let token = state.next_token;
        state.next_token += 1;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            token,
            Entry {
                name: name.to_string(),
                callback: Arc::new(callback),
                seq,
                armed: None,
                last_timing: None,
                running_on: None,
            },
        );
        trace!(name, token, "registered vsync callback");

        VsyncCallbackRegistration {
            inner: Arc::clone(&self.inner),
            token,
        }
    }

    /// Re-evaluate every armed registration against the current model.
    ///
    /// A registration only moves when its target vsync shifts by more than
    /// the move threshold; otherwise the stale schedule is kept to avoid
    /// re-arming the timer on every model correction.
    pub fn on_model_changed(&self) {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock().unwrap();
        let mut moved = false;

        let tokens: Vec<u64> = state.entries.keys().copied().collect();
        for token in tokens {
            let Some(entry) = state.entries.get(&token) else {
                continue;
            };
            let (Some(armed), Some(timing)) = (entry.armed, entry.last_timing) else {
                continue;
            };
            let fresh = self.inner.compute(now, timing);
            if (fresh.vsync - armed.vsync).abs() > self.inner.move_threshold {
                trace!(
                    name = %entry.name,
                    old = armed.vsync,
                    new = fresh.vsync,
                    "moving vsync callback"
                );
                state.entries.get_mut(&token).unwrap().armed = Some(fresh);
                moved = true;
            }
        }

        if moved {
            self.inner.timer_cond.notify_all();
        }
    }

    /// Append a human-readable description of the queue.
    pub fn dump(&self, result: &mut String) {
        let state = self.inner.state.lock().unwrap();
        result.push_str(&format!(
            "  timer slack: {}ns, move threshold: {}ns\n",
            self.inner.timer_slack, self.inner.move_threshold
        ));
        let mut entries: Vec<&Entry> = state.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        for entry in entries {
            match entry.armed {
                Some(armed) => result.push_str(&format!(
                    "  {}: wakeup {}ns for vsync {}ns\n",
                    entry.name, armed.wakeup, armed.vsync
                )),
                None => result.push_str(&format!("  {}: disarmed\n", entry.name)),
            }
        }
    }
}

impl Drop for VsyncDispatch {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.running = false;
        }
        self.inner.timer_cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Handle to a registered callback.
///
/// Dropping the handle removes the registration; if its callback is running
/// on another thread at that moment, the drop blocks until it returns, so no
/// callback fires after the drop completes.
pub struct VsyncCallbackRegistration {
    inner: Arc<Inner>,
    token: u64,
}

impl VsyncCallbackRegistration {
    /// Arm (or re-arm) the registration and return the scheduled wake time.
    ///
    /// Scheduling is idempotent: repeating the same request against an
    /// unchanged model yields the same wake time.
    pub fn schedule(&self, timing: ScheduleTiming) -> Option<Nanos> {
        let now = self.inner.clock.now();
        let armed = self.inner.compute(now, timing);

        let mut state = self.inner.state.lock().unwrap();
        let entry = state.entries.get_mut(&self.token)?;
        entry.armed = Some(armed);
        entry.last_timing = Some(timing);
        drop(state);

        self.inner.timer_cond.notify_all();
        Some(armed.wakeup)
    }

    /// Disarm the registration. An in-flight callback completes, but the
    /// registration will not fire again until rescheduled.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(&self.token) {
            entry.armed = None;
        }
        drop(state);
        self.inner.timer_cond.notify_all();
    }

    /// The currently scheduled wake time, if armed.
    pub fn scheduled_wake_time(&self) -> Option<Nanos> {
        let state = self.inner.state.lock().unwrap();
        state
            .entries
            .get(&self.token)
            .and_then(|e| e.armed)
            .map(|a| a.wakeup)
    }
}

impl Drop for VsyncCallbackRegistration {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap();
        // Wait out a callback running on another thread. A callback dropping
        // its own registration must not wait for itself.
        loop {
            match state.entries.get(&self.token).and_then(|e| e.running_on) {
                Some(id) if id != thread::current().id() => {
                    state = self.inner.fired_cond.wait(state).unwrap();
                }
                _ => break,
            }
        }
        state.entries.remove(&self.token);
        drop(state);
        self.inner.timer_cond.notify_all();
    }
}

fn timer_loop(inner: Arc<Inner>) {
    let mut state = inner.state.lock().unwrap();
    loop {
        if !state.running {
            break;
        }

        let now = inner.clock.now();

        // Collect every armed entry due within the slack window, in
        // non-decreasing wake order with registration order breaking ties.
        let mut due: Vec<(u64, Armed, Callback, u64)> = state
            .entries
            .iter()
            .filter_map(|(&token, entry)| {
                entry
                    .armed
                    .filter(|armed| armed.wakeup <= now + inner.timer_slack)
                    .map(|armed| (token, armed, Arc::clone(&entry.callback), entry.seq))
            })
            .collect();
        due.sort_by_key(|&(_, armed, _, seq)| (armed.wakeup, seq));

        if !due.is_empty() {
            let me = thread::current().id();
            for (token, _, _, _) in &due {
                let entry = state.entries.get_mut(token).unwrap();
                entry.armed = None;
                entry.running_on = Some(me);
            }
            drop(state);

            // Callbacks run without the lock so they may call back into the
            // dispatch to reschedule or cancel.
            for (_, armed, callback, _) in &due {
                callback(VsyncCallbackData {
                    vsync_time: armed.vsync,
                    wakeup_time: armed.wakeup,
                    ready_time: armed.ready,
                });
            }

            state = inner.state.lock().unwrap();
            for (token, _, _, _) in &due {
                if let Some(entry) = state.entries.get_mut(token) {
                    entry.running_on = None;
                }
            }
            inner.fired_cond.notify_all();
            continue;
        }

        // Sleep until the earliest wake, or until something changes.
        let next_wake = state
            .entries
            .values()
            .filter_map(|e| e.armed)
            .map(|a| a.wakeup)
            .min();

        match next_wake {
            Some(wake) => {
                let sleep = (wake - now).max(0) as u64;
                let (guard, _) = inner
                    .timer_cond
                    .wait_timeout(state, Duration::from_nanos(sleep))
                    .unwrap();
                state = guard;
            }
            None => {
                state = inner.timer_cond.wait(state).unwrap();
            }
        }
    }
    debug!("vsync dispatch thread exiting");
}
