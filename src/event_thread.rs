//! Vsync event fan-out to subscribers.
//!
//! Each connection handle owns one `EventThread` fed by a `VsyncSource`
//! (dispatch-backed in production, injected for tests and screenshots).
//! The thread serializes vsync, mode-change, hotplug and override events
//! per subscriber, throttling vsyncs for uids with a frame rate override.

use crate::clock::Nanos;
use crate::dispatch::{ScheduleTiming, VsyncCallbackData, VsyncDispatch};
use crate::display_mode::{DisplayMode, DisplayModeId, FrameRateOverride, Uid};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// An event delivered to a display event connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DisplayEvent {
    Vsync {
        /// When the event was emitted.
        timestamp: Nanos,
        /// The vsync this event leads up to.
        expected_present: Nanos,
        /// Delivery period for this subscriber (base period times its
        /// override divider).
        vsync_period: Nanos,
    },
    ModeChanged {
        mode_id: DisplayModeId,
        vsync_period: Nanos,
    },
    Hotplug {
        connected: bool,
    },
    FrameRateOverrides(Vec<FrameRateOverride>),
}

/// Which optional event classes a connection subscribed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventRegistrationFlags {
    pub mode_changed: bool,
    pub frame_rate_overrides: bool,
}

/// A vsync produced by a source.
#[derive(Debug, Clone, Copy)]
pub struct SourceVsync {
    pub timestamp: Nanos,
    pub expected_present: Nanos,
    pub deadline: Nanos,
}

pub type SourceCallback = Arc<dyn Fn(SourceVsync) + Send + Sync>;

/// Producer of vsync beats for an event thread.
pub trait VsyncSource: Send + Sync {
    fn set_callback(&self, callback: Option<SourceCallback>);
    fn set_vsync_enabled(&self, enabled: bool);
}

/// Source driven by the dispatch timer queue. Re-arms itself after every
/// delivered vsync while enabled.
pub struct DispatchVsyncSource {
    inner: Arc<DispatchSourceInner>,
}

struct DispatchSourceInner {
    enabled: AtomicBool,
    work_duration: Nanos,
    ready_duration: Nanos,
    callback: Mutex<Option<SourceCallback>>,
    registration: Mutex<Option<crate::dispatch::VsyncCallbackRegistration>>,
}

impl DispatchVsyncSource {
    pub fn new(
        dispatch: &VsyncDispatch,
        name: &str,
        work_duration: Nanos,
        ready_duration: Nanos,
    ) -> Self {
        let inner = Arc::new(DispatchSourceInner {
            enabled: AtomicBool::new(false),
            work_duration,
            ready_duration,
            callback: Mutex::new(None),
            registration: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let registration = dispatch.register(name, move |data| {
            if let Some(inner) = weak.upgrade() {
                inner.on_vsync(data);
            }
        });
        *inner.registration.lock().unwrap() = Some(registration);

        Self { inner }
    }
}

impl DispatchSourceInner {
    fn timing(&self, earliest_vsync: Nanos) -> ScheduleTiming {
        ScheduleTiming {
            work_duration: self.work_duration,
            ready_duration: self.ready_duration,
            earliest_vsync,
        }
    }

    fn on_vsync(&self, data: VsyncCallbackData) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }

        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(SourceVsync {
                timestamp: data.wakeup_time,
                expected_present: data.vsync_time,
                deadline: data.ready_time,
            });
        }

        // Ask for the vsync after the one just delivered.
        if self.enabled.load(Ordering::SeqCst) {
            if let Some(registration) = self.registration.lock().unwrap().as_ref() {
                let _ = registration.schedule(self.timing(data.vsync_time + 1));
            }
        }
    }
}

impl VsyncSource for DispatchVsyncSource {
    fn set_callback(&self, callback: Option<SourceCallback>) {
        *self.inner.callback.lock().unwrap() = callback;
    }

    fn set_vsync_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        if let Some(registration) = self.inner.registration.lock().unwrap().as_ref() {
            if enabled {
                let _ = registration.schedule(self.inner.timing(0));
            } else {
                registration.cancel();
            }
        }
    }
}

/// Source whose vsyncs come from explicit injection calls.
pub struct InjectVsyncSource {
    callback: Mutex<Option<SourceCallback>>,
}

impl InjectVsyncSource {
    pub fn new() -> Self {
        Self {
            callback: Mutex::new(None),
        }
    }

    pub fn inject(&self, when: Nanos, expected_present: Nanos, deadline: Nanos) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(SourceVsync {
                timestamp: when,
                expected_present,
                deadline,
            });
        }
    }
}

impl Default for InjectVsyncSource {
    fn default() -> Self {
        Self::new()
    }
}

impl VsyncSource for InjectVsyncSource {
    fn set_callback(&self, callback: Option<SourceCallback>) {
        *self.callback.lock().unwrap() = callback;
    }

    fn set_vsync_enabled(&self, _enabled: bool) {}
}

/// Returns true when the vsync at `expected_present` must be skipped for
/// `uid`.
pub type ThrottleVsyncFn = Arc<dyn Fn(Nanos, Uid) -> bool + Send + Sync>;

/// Delivery period for a subscriber, honoring its override divider.
pub type VsyncPeriodFn = Arc<dyn Fn(Option<Uid>) -> Nanos + Send + Sync>;

/// Observes every vsync the thread fans out, before throttling.
pub type InterceptVsyncsFn = Arc<dyn Fn(Nanos) + Send + Sync>;

enum PendingEvent {
    Vsync {
        timestamp: Nanos,
        expected_present: Nanos,
    },
    Broadcast(DisplayEvent),
}

struct ConnectionRecord {
    id: u64,
    uid: Option<Uid>,
    flags: EventRegistrationFlags,
    sender: mpsc::Sender<DisplayEvent>,
}

struct EventThreadState {
    pending: VecDeque<PendingEvent>,
    connections: Vec<ConnectionRecord>,
    next_connection_id: u64,
    screen_acquired: bool,
    display_connected: bool,
    source_enabled: bool,
    shutdown: bool,
}

struct EventThreadShared {
    state: Mutex<EventThreadState>,
    cond: Condvar,
}

impl EventThreadShared {
    fn post(&self, event: PendingEvent) {
        let mut state = self.state.lock().unwrap();
        state.pending.push_back(event);
        drop(state);
        self.cond.notify_all();
    }
}

/// Fan-out worker for one connection handle.
pub struct EventThread {
    name: String,
    shared: Arc<EventThreadShared>,
    source: Arc<dyn VsyncSource>,
    thread: Option<JoinHandle<()>>,
}

impl EventThread {
    pub fn new(
        name: &str,
        source: Arc<dyn VsyncSource>,
        throttle: Option<ThrottleVsyncFn>,
        vsync_period_for: VsyncPeriodFn,
        intercept: Option<InterceptVsyncsFn>,
    ) -> Self {
        let shared = Arc::new(EventThreadShared {
            state: Mutex::new(EventThreadState {
                pending: VecDeque::new(),
                connections: Vec::new(),
                next_connection_id: 0,
                screen_acquired: false,
                display_connected: false,
                source_enabled: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let weak = Arc::downgrade(&shared);
        source.set_callback(Some(Arc::new(move |vsync: SourceVsync| {
            if let Some(shared) = weak.upgrade() {
                shared.post(PendingEvent::Vsync {
                    timestamp: vsync.timestamp,
                    expected_present: vsync.expected_present,
                });
            }
        })));

        let worker_shared = Arc::clone(&shared);
        let worker_source = Arc::clone(&source);
        let thread = thread::Builder::new()
            .name(format!("event-{}", name))
            .spawn(move || {
                fan_out_loop(
                    worker_shared,
                    worker_source,
                    throttle,
                    vsync_period_for,
                    intercept,
                )
            })
            .expect("failed to spawn event thread");

        Self {
            name: name.to_string(),
            shared,
            source,
            thread: Some(thread),
        }
    }

    /// Subscribe. `on_resync` is invoked when the subscriber requests the
    /// next vsync, letting the scheduler resync its timing model.
    pub fn create_connection(
        &self,
        uid: Option<Uid>,
        flags: EventRegistrationFlags,
        on_resync: Arc<dyn Fn() + Send + Sync>,
    ) -> EventConnection {
        let (sender, receiver) = mpsc::channel();
        let mut state = self.shared.state.lock().unwrap();
        let id = state.next_connection_id;
        state.next_connection_id += 1;
        state.connections.push(ConnectionRecord {
            id,
            uid,
            flags,
            sender,
        });
        drop(state);
        self.shared.cond.notify_all();

        trace!(thread = %self.name, id, ?uid, "created event connection");
        EventConnection {
            receiver,
            on_resync,
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    pub fn on_hotplug_received(&self, connected: bool) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.display_connected = connected;
            state
                .pending
                .push_back(PendingEvent::Broadcast(DisplayEvent::Hotplug { connected }));
        }
        self.shared.cond.notify_all();
    }

    pub fn on_screen_acquired(&self) {
        self.shared.state.lock().unwrap().screen_acquired = true;
        self.shared.cond.notify_all();
    }

    pub fn on_screen_released(&self) {
        self.shared.state.lock().unwrap().screen_acquired = false;
        self.shared.cond.notify_all();
    }

    pub fn on_mode_changed(&self, mode: DisplayMode) {
        self.shared
            .post(PendingEvent::Broadcast(DisplayEvent::ModeChanged {
                mode_id: mode.id,
                vsync_period: mode.vsync_period,
            }));
    }

    pub fn on_frame_rate_overrides_changed(&self, overrides: Vec<FrameRateOverride>) {
        self.shared
            .post(PendingEvent::Broadcast(DisplayEvent::FrameRateOverrides(
                overrides,
            )));
    }

    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().unwrap().connections.len()
    }

    /// Append a human-readable description of the thread state.
    pub fn dump(&self, result: &mut String) {
        let state = self.shared.state.lock().unwrap();
        result.push_str(&format!(
            "  {}: {} connections, screen {}, display {}, source {}\n",
            self.name,
            state.connections.len(),
            if state.screen_acquired { "on" } else { "off" },
            if state.display_connected {
                "connected"
            } else {
                "disconnected"
            },
            if state.source_enabled {
                "enabled"
            } else {
                "disabled"
            },
        ));
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.source.set_callback(None);
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!(name = %self.name, "event thread stopped");
    }
}

/// Subscriber end of an event thread.
///
/// Events arrive over a private channel in delivery order. Dropping the
/// connection unsubscribes.
pub struct EventConnection {
    receiver: mpsc::Receiver<DisplayEvent>,
    on_resync: Arc<dyn Fn() + Send + Sync>,
    shared: Weak<EventThreadShared>,
    id: u64,
}

impl EventConnection {
    /// Ask the scheduler to resynchronize; subscribers call this when they
    /// need the next vsync promptly.
    pub fn request_next_vsync(&self) {
        (self.on_resync)();
    }

    /// Non-blocking event read.
    pub fn poll_event(&self) -> Option<DisplayEvent> {
        self.receiver.try_recv().ok()
    }

    /// Blocking event read with a timeout.
    pub fn wait_event(&self, timeout: Duration) -> Option<DisplayEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

impl Drop for EventConnection {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock().unwrap();
            state.connections.retain(|c| c.id != self.id);
            drop(state);
            shared.cond.notify_all();
        }
    }
}

fn fan_out_loop(
    shared: Arc<EventThreadShared>,
    source: Arc<dyn VsyncSource>,
    throttle: Option<ThrottleVsyncFn>,
    vsync_period_for: VsyncPeriodFn,
    intercept: Option<InterceptVsyncsFn>,
) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            break;
        }

        // The source runs only while the display can show frames and
        // someone is listening.
        let want_source =
            state.screen_acquired && state.display_connected && !state.connections.is_empty();
        if want_source != state.source_enabled {
            state.source_enabled = want_source;
            drop(state);
            source.set_vsync_enabled(want_source);
            state = shared.state.lock().unwrap();
            continue;
        }

        let Some(event) = state.pending.pop_front() else {
            state = shared.cond.wait(state).unwrap();
            continue;
        };

        // Snapshot the fan-out targets, then deliver without the lock so
        // throttle callbacks can take their own locks.
        let targets: Vec<(u64, Option<Uid>, EventRegistrationFlags, mpsc::Sender<DisplayEvent>)> =
            state
                .connections
                .iter()
                .map(|c| (c.id, c.uid, c.flags, c.sender.clone()))
                .collect();
        drop(state);

        if let PendingEvent::Vsync { timestamp, .. } = &event {
            if let Some(intercept) = &intercept {
                intercept(*timestamp);
            }
        }

        let mut dead = Vec::new();
        for (id, uid, flags, sender) in &targets {
            let outgoing = match &event {
                PendingEvent::Vsync {
                    timestamp,
                    expected_present,
                } => {
                    let throttled = match (&throttle, uid) {
                        (Some(throttle), Some(uid)) => throttle(*expected_present, *uid),
                        _ => false,
                    };
                    if throttled {
                        trace!(?uid, expected_present = *expected_present, "throttled vsync");
                        continue;
                    }
                    DisplayEvent::Vsync {
                        timestamp: *timestamp,
                        expected_present: *expected_present,
                        vsync_period: vsync_period_for(*uid),
                    }
                }
                PendingEvent::Broadcast(event) => {
                    let wanted = match event {
                        DisplayEvent::ModeChanged { .. } => flags.mode_changed,
                        DisplayEvent::FrameRateOverrides(_) => flags.frame_rate_overrides,
                        _ => true,
                    };
                    if !wanted {
                        continue;
                    }
                    event.clone()
                }
            };
            if sender.send(outgoing).is_err() {
                dead.push(*id);
            }
        }

        state = shared.state.lock().unwrap();
        if !dead.is_empty() {
            state.connections.retain(|c| !dead.contains(&c.id));
        }
    }
}
