//! Scheduler façade.
//!
//! Owns the timing model, the dispatch queue, the reactor, layer history,
//! the policy engine, the event threads and the debounce timers, and exposes
//! the outward API of the display composition scheduler.
//!
//! Lock order (acquire order, never reversed):
//! `features` -> `connections` -> `hw_vsync` -> `overrides`. The dispatch
//! queue mutex, the tracker mutex, the policy table and the layer history
//! are leaves. Host callbacks are invoked with no scheduler lock held, with
//! one documented exception on [`SchedulerCallback::get_mode_from_fps`].

use crate::clock::{Clock, Nanos, NANOS_PER_MS};
use crate::config::SchedulerOptions;
use crate::controller::{PresentFence, VsyncController};
use crate::dispatch::{
    ScheduleTiming, SharedVsyncTracker, VsyncCallbackRegistration, VsyncDispatch,
};
use crate::display_mode::{DisplayMode, DisplayModeId, Fps, FrameRateOverride, LayerId, Uid};
use crate::error::{InjectionError, SchedulerError};
use crate::event_thread::{
    DispatchVsyncSource, EventConnection, EventRegistrationFlags, EventThread, InjectVsyncSource,
    InterceptVsyncsFn, ThrottleVsyncFn, VsyncPeriodFn, VsyncSource,
};
use crate::layer_history::{LayerHistory, LayerUpdateType, LayerVoteType, WindowType};
use crate::one_shot_timer::OneShotTimer;
use crate::policy::{ConsideredSignals, GlobalSignals, RefreshRatePolicy, TimerState, TouchState};
use crate::tracker::VsyncPredictor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, trace, warn};

/// Resync requests within this window of the previous one are dropped.
const RESYNC_IGNORE_DELAY: Nanos = 750 * NANOS_PER_MS;

/// Reported "new vsync applied" times are clamped to now + this.
const MAX_VSYNC_APPLIED_TIME: Nanos = 500 * NANOS_PER_MS;

/// Above this rate the kernel idle timer leaves hardware vsync alone.
const KERNEL_TIMER_FPS_THRESHOLD: f32 = 65.0;

/// Whether a mode switch should be reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeEvent {
    None,
    Changed,
}

/// Opaque identifier of a scheduler connection. Handles are assigned
/// monotonically and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

/// Snapshot of the vsync timeline for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayStatInfo {
    pub vsync_time: Nanos,
    pub vsync_period: Nanos,
}

/// Timeline the hardware reports for an in-flight period change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsyncPeriodChangeTimeline {
    pub new_vsync_applied_time: Nanos,
    pub refresh_required: bool,
    pub refresh_time: Nanos,
}

/// Host compositor hooks consumed by the scheduler.
pub trait SchedulerCallback: Send + Sync {
    /// Ask the hardware to start or stop emitting vsync timestamps.
    fn set_vsync_enabled(&self, enabled: bool);

    /// Request a display mode switch.
    fn change_refresh_rate(&self, mode: DisplayMode, event: ModeEvent);

    /// Request a full recomposition.
    fn repaint_everything_for_hwc(&self);

    fn kernel_timer_changed(&self, expired: bool);

    /// Largest mode at or below `fps`.
    ///
    /// Called while scheduler state is held: implementations must return
    /// promptly and must not call back into the scheduler.
    fn get_mode_from_fps(&self, fps: f32) -> Option<DisplayMode>;

    fn trigger_on_frame_rate_overrides_changed(&self);
}

#[derive(Debug, Clone, Copy)]
struct CachedModeParams {
    handle: ConnectionHandle,
    mode: DisplayMode,
}

struct FeatureState {
    mode_id: Option<DisplayModeId>,
    content_requirements: Vec<crate::layer_history::LayerVoteSummary>,
    touch: TouchState,
    idle_timer: TimerState,
    display_power_timer: TimerState,
    is_display_power_state_normal: bool,
    cached_mode_changed_params: Option<CachedModeParams>,
}

impl Default for FeatureState {
    fn default() -> Self {
        Self {
            mode_id: None,
            content_requirements: Vec::new(),
            touch: TouchState::Inactive,
            idle_timer: TimerState::Reset,
            display_power_timer: TimerState::Reset,
            is_display_power_state_normal: true,
            cached_mode_changed_params: None,
        }
    }
}

#[derive(Default)]
struct HwVsyncState {
    enabled: bool,
    available: bool,
}

/// Backdoor overrides shadow content-derived ones for the same uid.
#[derive(Default)]
struct OverrideStore {
    backdoor: HashMap<Uid, Fps>,
    by_content: HashMap<Uid, Fps>,
}

impl OverrideStore {
    fn get(&self, uid: Uid) -> Option<Fps> {
        self.backdoor
            .get(&uid)
            .or_else(|| self.by_content.get(&uid))
            .copied()
    }

    fn effective(&self) -> Vec<FrameRateOverride> {
        let mut overrides: Vec<FrameRateOverride> = self
            .backdoor
            .iter()
            .map(|(&uid, &fps)| FrameRateOverride {
                uid,
                fps: fps.hz(),
            })
            .collect();
        for (&uid, &fps) in &self.by_content {
            if !self.backdoor.contains_key(&uid) {
                overrides.push(FrameRateOverride {
                    uid,
                    fps: fps.hz(),
                });
            }
        }
        overrides.sort_by_key(|o| o.uid);
        overrides
    }
}

struct Injector {
    handle: ConnectionHandle,
    source: Arc<InjectVsyncSource>,
}

/// Flips a traced parity bit on every predicted vsync.
struct PredictedVsyncTracer {
    _registration: Arc<Mutex<Option<VsyncCallbackRegistration>>>,
}

impl PredictedVsyncTracer {
    fn new(dispatch: &VsyncDispatch) -> Self {
        let slot: Arc<Mutex<Option<VsyncCallbackRegistration>>> = Arc::new(Mutex::new(None));
        let parity = AtomicBool::new(false);
        let weak_slot = Arc::downgrade(&slot);
        let registration = dispatch.register("predicted-vsync-trace", move |data| {
            let flipped = !parity.load(Ordering::Relaxed);
            parity.store(flipped, Ordering::Relaxed);
            trace!(parity = flipped, vsync = data.vsync_time, "predicted vsync");
            if let Some(slot) = weak_slot.upgrade() {
                if let Some(registration) = slot.lock().unwrap().as_ref() {
                    let _ = registration.schedule(ScheduleTiming {
                        work_duration: 0,
                        ready_duration: 0,
                        earliest_vsync: data.vsync_time + 1,
                    });
                }
            }
        });
        let _ = registration.schedule(ScheduleTiming {
            work_duration: 0,
            ready_duration: 0,
            earliest_vsync: 0,
        });
        *slot.lock().unwrap() = Some(registration);
        Self {
            _registration: slot,
        }
    }
}

/// The display composition scheduler.
///
/// Construct with [`Scheduler::new`]; all state hangs off the returned
/// `Arc` and is torn down in dependency order on drop.
pub struct Scheduler {
    // Field order is teardown order: event threads go first (they hold
    // dispatch registrations), then timers, the trace loop, the dispatch
    // thread, and finally the reactor and the model.
    connections: Mutex<HashMap<ConnectionHandle, EventThread>>,
    injector: Mutex<Option<Injector>>,
    idle_timer: Mutex<Option<OneShotTimer>>,
    touch_timer: Mutex<Option<OneShotTimer>>,
    display_power_timer: Mutex<Option<OneShotTimer>>,
    predicted_vsync_tracer: Mutex<Option<PredictedVsyncTracer>>,
    dispatch: Arc<VsyncDispatch>,
    controller: Mutex<VsyncController>,
    tracker: SharedVsyncTracker,

    policy: Arc<RwLock<RefreshRatePolicy>>,
    layer_history: Mutex<LayerHistory>,
    features: Mutex<FeatureState>,
    hw_vsync: Mutex<HwVsyncState>,
    overrides: Arc<RwLock<OverrideStore>>,
    vsync_timeline: Mutex<Option<VsyncPeriodChangeTimeline>>,

    callback: Arc<dyn SchedulerCallback>,
    options: SchedulerOptions,
    clock: Arc<dyn Clock>,
    thermal_fps: Mutex<f32>,
    last_resync: AtomicI64,
    display_idle: AtomicBool,
    inject_vsyncs: AtomicBool,
    next_handle: AtomicU64,
}

impl Scheduler {
    pub fn new(
        modes: Vec<DisplayMode>,
        current_mode: DisplayModeId,
        callback: Arc<dyn SchedulerCallback>,
        options: SchedulerOptions,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let policy = Arc::new(RwLock::new(RefreshRatePolicy::new(modes, current_mode)));
        let ideal_period = policy.read().unwrap().current_mode().vsync_period;
        let tracker: SharedVsyncTracker =
            Arc::new(Mutex::new(VsyncPredictor::new(ideal_period)));
        let dispatch = Arc::new(VsyncDispatch::new(Arc::clone(&clock), Arc::clone(&tracker)));
        let controller = VsyncController::new(Arc::clone(&tracker), Arc::clone(&dispatch));

        let scheduler = Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            injector: Mutex::new(None),
            idle_timer: Mutex::new(None),
            touch_timer: Mutex::new(None),
            display_power_timer: Mutex::new(None),
            predicted_vsync_tracer: Mutex::new(None),
            dispatch,
            controller: Mutex::new(controller),
            tracker,
            policy,
            layer_history: Mutex::new(LayerHistory::new()),
            features: Mutex::new(FeatureState::default()),
            hw_vsync: Mutex::new(HwVsyncState::default()),
            overrides: Arc::new(RwLock::new(OverrideStore::default())),
            vsync_timeline: Mutex::new(None),
            callback,
            options,
            clock,
            thermal_fps: Mutex::new(0.0),
            // Sentinel outside the throttle window: the injected clock may
            // start at 0, and the first resync must always go through.
            last_resync: AtomicI64::new(-RESYNC_IGNORE_DELAY - 1),
            display_idle: AtomicBool::new(false),
            inject_vsyncs: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
        });

        // The hardware starts quiet until the scheduler asks for samples.
        scheduler.callback.set_vsync_enabled(false);

        Self::start_timers(&scheduler);
        if scheduler.options.show_predicted_vsync {
            *scheduler.predicted_vsync_tracer.lock().unwrap() =
                Some(PredictedVsyncTracer::new(&scheduler.dispatch));
        }

        info!(
            content_detection = scheduler.options.use_content_detection,
            kernel_timer = scheduler.options.support_kernel_timer,
            "scheduler started"
        );
        scheduler
    }

    fn start_timers(scheduler: &Arc<Self>) {
        let options = &scheduler.options;
        if options.idle_timer_ms > 0 {
            let reset = Arc::downgrade(scheduler);
            let expired = Arc::downgrade(scheduler);
            *scheduler.idle_timer.lock().unwrap() = Some(OneShotTimer::new(
                "idle",
                options.idle_timer_ms,
                Arc::clone(&scheduler.clock),
                Box::new(move || {
                    if let Some(scheduler) = reset.upgrade() {
                        scheduler.idle_timer_fired(TimerState::Reset);
                    }
                }),
                Box::new(move || {
                    if let Some(scheduler) = expired.upgrade() {
                        scheduler.idle_timer_fired(TimerState::Expired);
                    }
                }),
            ));
        }

        if options.touch_timer_ms > 0 {
            let reset = Arc::downgrade(scheduler);
            let expired = Arc::downgrade(scheduler);
            *scheduler.touch_timer.lock().unwrap() = Some(OneShotTimer::new(
                "touch",
                options.touch_timer_ms,
                Arc::clone(&scheduler.clock),
                Box::new(move || {
                    if let Some(scheduler) = reset.upgrade() {
                        scheduler.touch_timer_fired(TimerState::Reset);
                    }
                }),
                Box::new(move || {
                    if let Some(scheduler) = expired.upgrade() {
                        scheduler.touch_timer_fired(TimerState::Expired);
                    }
                }),
            ));
        }

        if options.display_power_timer_ms > 0 {
            let reset = Arc::downgrade(scheduler);
            let expired = Arc::downgrade(scheduler);
            *scheduler.display_power_timer.lock().unwrap() = Some(OneShotTimer::new(
                "display-power",
                options.display_power_timer_ms,
                Arc::clone(&scheduler.clock),
                Box::new(move || {
                    if let Some(scheduler) = reset.upgrade() {
                        scheduler.display_power_timer_fired(TimerState::Reset);
                    }
                }),
                Box::new(move || {
                    if let Some(scheduler) = expired.upgrade() {
                        scheduler.display_power_timer_fired(TimerState::Expired);
                    }
                }),
            ));
        }
    }

    // ---- connection lifecycle ----------------------------------------

    /// Create an event thread fed by the dispatch queue and return its
    /// handle. `intercept` observes every vsync the thread fans out.
    pub fn create_connection(
        &self,
        name: &str,
        work_duration: Nanos,
        ready_duration: Nanos,
        intercept: Option<InterceptVsyncsFn>,
    ) -> ConnectionHandle {
        let source = Arc::new(DispatchVsyncSource::new(
            &self.dispatch,
            name,
            work_duration,
            ready_duration,
        ));
        let thread = EventThread::new(
            name,
            source as Arc<dyn VsyncSource>,
            self.make_throttle_fn(),
            self.make_vsync_period_fn(),
            intercept,
        );
        self.register_event_thread(thread)
    }

    fn register_event_thread(&self, thread: EventThread) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.connections.lock().unwrap().insert(handle, thread);
        debug!(?handle, "created scheduler connection");
        handle
    }

    fn make_throttle_fn(&self) -> Option<ThrottleVsyncFn> {
        if !self.policy.read().unwrap().supports_frame_rate_override() {
            return None;
        }
        let overrides = Arc::clone(&self.overrides);
        let tracker = Arc::clone(&self.tracker);
        Some(Arc::new(move |expected_present, uid| {
            match overrides.read().unwrap().get(uid) {
                Some(fps) => !tracker
                    .lock()
                    .unwrap()
                    .is_vsync_in_phase(expected_present, fps),
                None => false,
            }
        }))
    }

    fn make_vsync_period_fn(&self) -> VsyncPeriodFn {
        let overrides = Arc::clone(&self.overrides);
        let policy = Arc::clone(&self.policy);
        Arc::new(move |uid| {
            let mode = policy.read().unwrap().current_mode();
            let Some(uid) = uid else {
                return mode.vsync_period;
            };
            let Some(fps) = overrides.read().unwrap().get(uid) else {
                return mode.vsync_period;
            };
            match Fps::divider(mode.fps, fps) {
                divider if divider > 1 => mode.vsync_period * divider,
                _ => mode.vsync_period,
            }
        })
    }

    /// Subscribe to the event thread behind `handle`. Connections with
    /// `trigger_refresh` also force a repaint when the display is idle.
    pub fn create_display_event_connection(
        self: &Arc<Self>,
        handle: ConnectionHandle,
        uid: Option<Uid>,
        trigger_refresh: bool,
        flags: EventRegistrationFlags,
    ) -> Result<EventConnection, SchedulerError> {
        let weak = Arc::downgrade(self);
        let on_resync: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            if let Some(scheduler) = weak.upgrade() {
                if trigger_refresh {
                    scheduler.resync_and_refresh();
                } else {
                    scheduler.resync();
                }
            }
        });
        self.with_thread(handle, |thread| {
            thread.create_connection(uid, flags, on_resync)
        })
    }

    fn with_thread<R>(
        &self,
        handle: ConnectionHandle,
        f: impl FnOnce(&EventThread) -> R,
    ) -> Result<R, SchedulerError> {
        let connections = self.connections.lock().unwrap();
        match connections.get(&handle) {
            Some(thread) => Ok(f(thread)),
            None => {
                warn!(?handle, "unknown connection handle");
                Err(SchedulerError::InvalidHandle(handle))
            }
        }
    }

    // ---- display events ----------------------------------------------

    pub fn on_hotplug_received(
        &self,
        handle: ConnectionHandle,
        connected: bool,
    ) -> Result<(), SchedulerError> {
        self.with_thread(handle, |thread| thread.on_hotplug_received(connected))
    }

    pub fn on_screen_acquired(&self, handle: ConnectionHandle) -> Result<(), SchedulerError> {
        self.with_thread(handle, |thread| thread.on_screen_acquired())
    }

    pub fn on_screen_released(&self, handle: ConnectionHandle) -> Result<(), SchedulerError> {
        self.with_thread(handle, |thread| thread.on_screen_released())
    }

    pub fn on_primary_display_mode_changed(
        &self,
        handle: ConnectionHandle,
        mode: DisplayMode,
    ) -> Result<(), SchedulerError> {
        {
            let mut features = self.features.lock().unwrap();
            // Cache the last reported mode and invalidate the content based
            // selection so it is recomputed against the new rate.
            features.cached_mode_changed_params = Some(CachedModeParams { handle, mode });
            features.content_requirements.clear();
        }
        self.on_non_primary_display_mode_changed(handle, mode)
    }

    pub fn on_non_primary_display_mode_changed(
        &self,
        handle: ConnectionHandle,
        mode: DisplayMode,
    ) -> Result<(), SchedulerError> {
        self.with_thread(handle, |thread| thread.on_mode_changed(mode))
    }

    pub fn on_frame_rate_overrides_changed(
        &self,
        handle: ConnectionHandle,
    ) -> Result<(), SchedulerError> {
        let overrides = self.overrides.read().unwrap().effective();
        self.with_thread(handle, |thread| {
            thread.on_frame_rate_overrides_changed(overrides)
        })
    }

    pub fn on_primary_display_area_changed(&self, display_area: u32) {
        self.layer_history.lock().unwrap().set_display_area(display_area);
    }

    /// The host applied a mode switch; keep the mode table in step.
    pub fn set_display_mode(&self, id: DisplayModeId) {
        self.policy.write().unwrap().set_current_mode(id);
    }

    // ---- hardware vsync ----------------------------------------------

    pub fn enable_hardware_vsync(&self) {
        let mut turn_on = false;
        {
            let mut hw_vsync = self.hw_vsync.lock().unwrap();
            if !hw_vsync.enabled && hw_vsync.available {
                hw_vsync.enabled = true;
                turn_on = true;
            }
        }
        if turn_on {
            self.tracker.lock().unwrap().reset_model();
            self.callback.set_vsync_enabled(true);
        }
    }

    pub fn disable_hardware_vsync(&self, make_unavailable: bool) {
        let mut turn_off = false;
        {
            let mut hw_vsync = self.hw_vsync.lock().unwrap();
            if hw_vsync.enabled {
                hw_vsync.enabled = false;
                turn_off = true;
            }
            if make_unavailable {
                hw_vsync.available = false;
            }
        }
        if turn_off {
            self.callback.set_vsync_enabled(false);
        }
    }

    /// Resynchronize to the hardware, optionally (re)marking it available.
    /// A no-op while the hardware is unavailable and `make_available` is
    /// not set.
    pub fn resync_to_hardware_vsync(&self, make_available: bool, period: Nanos, force: bool) {
        {
            let mut hw_vsync = self.hw_vsync.lock().unwrap();
            if make_available {
                hw_vsync.available = true;
            } else if !hw_vsync.available {
                return;
            }
        }
        if period <= 0 {
            return;
        }
        self.set_vsync_period(period, force);
    }

    fn set_vsync_period(&self, period: Nanos, force: bool) {
        let mut turn_on = false;
        {
            let mut hw_vsync = self.hw_vsync.lock().unwrap();
            self.controller
                .lock()
                .unwrap()
                .start_period_transition(period);
            if !hw_vsync.enabled || force {
                hw_vsync.enabled = true;
                turn_on = true;
            }
        }
        if turn_on {
            self.tracker.lock().unwrap().reset_model();
            self.callback.set_vsync_enabled(true);
        }
    }

    /// Throttled resync: requests within 750ms of the last one are dropped.
    pub fn resync(&self) {
        let now = self.clock.now();
        let last = self.last_resync.swap(now, Ordering::SeqCst);
        if now - last > RESYNC_IGNORE_DELAY {
            let period = self.policy.read().unwrap().current_mode().vsync_period;
            self.resync_to_hardware_vsync(false, period, false);
        }
    }

    /// Resync, and when the display was flagged idle also force a repaint
    /// and turn hardware vsync back on.
    pub fn resync_and_refresh(&self) {
        self.resync();

        if !self.display_idle.load(Ordering::SeqCst) {
            return;
        }

        debug!("refresh requested on idle display");
        let period = self.policy.read().unwrap().current_mode().vsync_period;
        self.callback.repaint_everything_for_hwc();
        self.resync_to_hardware_vsync(true, period, true);
        self.display_idle.store(false, Ordering::SeqCst);
    }

    /// Feed a hardware vsync timestamp. Returns whether this sample
    /// completed a period transition.
    pub fn add_resync_sample(&self, timestamp: Nanos, hwc_period: Option<Nanos>) -> bool {
        let mut needs_hw_vsync = false;
        let mut period_flushed = false;
        {
            let hw_vsync = self.hw_vsync.lock().unwrap();
            if hw_vsync.enabled {
                let feedback = self
                    .controller
                    .lock()
                    .unwrap()
                    .add_hw_vsync(timestamp, hwc_period);
                needs_hw_vsync = feedback.needs_hw_vsync;
                period_flushed = feedback.period_flushed;
            }
        }

        if needs_hw_vsync {
            self.enable_hardware_vsync();
        } else {
            self.disable_hardware_vsync(false);
        }
        period_flushed
    }

    pub fn add_present_fence(&self, fence: PresentFence) {
        let needs_hw_vsync = self.controller.lock().unwrap().add_present_fence(fence);
        if needs_hw_vsync {
            self.enable_hardware_vsync();
        } else {
            self.disable_hardware_vsync(false);
        }
    }

    pub fn set_ignore_present_fences(&self, ignore: bool) {
        self.controller
            .lock()
            .unwrap()
            .set_ignore_present_fences(ignore);
    }

    // ---- injection ----------------------------------------------------

    /// Toggle vsync injection. The injector connection is created lazily on
    /// first use; repeated calls with the same flag are no-ops.
    pub fn enable_vsync_injection(&self, enable: bool) -> ConnectionHandle {
        let mut injector = self.injector.lock().unwrap();
        if self.inject_vsyncs.load(Ordering::SeqCst) == enable {
            return injector
                .as_ref()
                .map(|i| i.handle)
                .unwrap_or(ConnectionHandle(0));
        }

        if injector.is_none() {
            let source = Arc::new(InjectVsyncSource::new());
            let thread = EventThread::new(
                "injector",
                Arc::clone(&source) as Arc<dyn VsyncSource>,
                None,
                self.make_vsync_period_fn(),
                None,
            );
            // The injector acts as a connected, powered display.
            thread.on_hotplug_received(true);
            thread.on_screen_acquired();
            let handle = self.register_event_thread(thread);
            *injector = Some(Injector { handle, source });
        }

        self.inject_vsyncs.store(enable, Ordering::SeqCst);
        info!(enable, "vsync injection toggled");
        injector.as_ref().unwrap().handle
    }

    pub fn inject_vsync(
        &self,
        when: Nanos,
        expected_present: Nanos,
        deadline: Nanos,
    ) -> Result<(), InjectionError> {
        if !self.inject_vsyncs.load(Ordering::SeqCst) {
            return Err(InjectionError::NotEnabled);
        }
        let injector = self.injector.lock().unwrap();
        match injector.as_ref() {
            Some(injector) => {
                injector.source.inject(when, expected_present, deadline);
                Ok(())
            }
            None => Err(InjectionError::NotEnabled),
        }
    }

    // ---- layers and policy --------------------------------------------

    pub fn register_layer(
        &self,
        id: LayerId,
        name: &str,
        owner_uid: Uid,
        window_type: WindowType,
    ) {
        let vote = if !self.options.use_content_detection || window_type == WindowType::StatusBar {
            LayerVoteType::NoVote
        } else if window_type == WindowType::Wallpaper {
            // Wallpaper running at the floor is part of content detection.
            LayerVoteType::Min
        } else {
            LayerVoteType::Heuristic
        };
        self.layer_history
            .lock()
            .unwrap()
            .register_layer(id, name, owner_uid, vote);
    }

    pub fn deregister_layer(&self, id: LayerId) {
        self.layer_history.lock().unwrap().deregister_layer(id);
    }

    pub fn record_layer_history(
        &self,
        id: LayerId,
        present_time: Nanos,
        update_type: LayerUpdateType,
    ) {
        if self.policy.read().unwrap().can_switch() {
            self.layer_history
                .lock()
                .unwrap()
                .record(id, present_time, self.clock.now(), update_type);
        }
    }

    /// Set or clear a layer's explicit frame rate vote.
    pub fn set_layer_frame_rate(&self, id: LayerId, vote: Option<(LayerVoteType, Fps)>) {
        self.layer_history.lock().unwrap().set_vote(id, vote);
    }

    pub fn set_mode_change_pending(&self, pending: bool) {
        self.layer_history
            .lock()
            .unwrap()
            .set_mode_change_pending(pending);
    }

    pub fn update_thermal_fps(&self, fps: f32) {
        *self.thermal_fps.lock().unwrap() = fps;
        self.layer_history.lock().unwrap().set_thermal_fps(fps);
    }

    /// Restrict mode selection to `[min, max]` fps.
    pub fn set_policy_range(&self, min: Fps, max: Fps) {
        self.policy.write().unwrap().set_policy_range(min, max);
    }

    /// Re-evaluate the refresh rate from the current layer history.
    pub fn choose_refresh_rate_for_content(&self) {
        if !self.policy.read().unwrap().can_switch() {
            return;
        }
        let summary = self
            .layer_history
            .lock()
            .unwrap()
            .summarize(self.clock.now());
        self.re_evaluate(&mut |features| {
            features.content_requirements = summary.clone();
            true
        });
    }

    fn calculate_selection(&self, features: &FeatureState) -> crate::policy::Selection {
        let touch_active =
            self.touch_timer.lock().unwrap().is_some() && features.touch == TouchState::Active;
        let idle = self.idle_timer.lock().unwrap().is_some()
            && features.idle_timer == TimerState::Expired;
        let power_timer = self
            .display_power_timer
            .lock()
            .unwrap()
            .is_some()
            .then_some(features.display_power_timer);

        let signals = GlobalSignals {
            touch: touch_active,
            idle,
            display_power_normal: features.is_display_power_state_normal,
        };
        self.policy
            .read()
            .unwrap()
            .select(&features.content_requirements, signals, power_timer)
    }

    /// Shared policy loop: apply `update` to the feature state, reselect the
    /// mode, refresh content overrides, and emit the change callbacks.
    /// `update` returns false to abort when nothing changed.
    fn re_evaluate(
        &self,
        update: &mut dyn FnMut(&mut FeatureState) -> bool,
    ) -> ConsideredSignals {
        let mut considered = ConsideredSignals::default();
        let mut emit: Option<DisplayMode> = None;
        let mut overrides_changed = false;
        let mut cached_dispatch: Option<(ConnectionHandle, DisplayMode)> = None;
        {
            let mut features = self.features.lock().unwrap();
            if !update(&mut features) {
                return considered;
            }

            let selection = self.calculate_selection(&features);
            considered = selection.considered;
            overrides_changed =
                self.update_frame_rate_overrides(considered, selection.mode.fps, &features);

            // Thermal cap, resolved with a single mode lookup so the cached
            // id and the emitted event always agree.
            let mut new_mode = selection.mode;
            let thermal_fps = *self.thermal_fps.lock().unwrap();
            if thermal_fps > 0.0 && new_mode.fps.hz() > thermal_fps {
                if let Some(mode) = self.callback.get_mode_from_fps(thermal_fps) {
                    debug!(from = new_mode.fps.hz(), to = mode.fps.hz(), "thermal cap");
                    new_mode = mode;
                }
            }

            if features.mode_id == Some(new_mode.id) {
                // The mode is unchanged, but an event suppressed by an
                // earlier idle-driven selection may still be owed.
                if !considered.idle {
                    cached_dispatch = self.cached_mode_to_dispatch(&mut features);
                }
            } else {
                features.mode_id = Some(new_mode.id);
                emit = Some(new_mode);
            }
        }

        if let Some((handle, mode)) = cached_dispatch {
            let _ = self.on_non_primary_display_mode_changed(handle, mode);
        }
        if let Some(mode) = emit {
            let event = if considered.idle {
                ModeEvent::None
            } else {
                ModeEvent::Changed
            };
            info!(fps = mode.fps.hz(), ?event, "refresh rate selected");
            self.callback.change_refresh_rate(mode, event);
        }
        if overrides_changed {
            self.callback.trigger_on_frame_rate_overrides_changed();
        }
        considered
    }

    fn cached_mode_to_dispatch(
        &self,
        features: &mut FeatureState,
    ) -> Option<(ConnectionHandle, DisplayMode)> {
        let Some(mode_id) = features.mode_id else {
            warn!("no mode id cached, not dispatching reported mode");
            return None;
        };
        features.cached_mode_changed_params.as_ref()?;

        let policy = self.policy.read().unwrap();
        // A pending switch dispatches its own event once it lands.
        if policy.current_mode().id != mode_id {
            return None;
        }
        let mode = policy.mode(mode_id)?;
        drop(policy);

        let params = features.cached_mode_changed_params.as_mut().unwrap();
        if params.mode.id == mode.id && params.mode.vsync_period == mode.vsync_period {
            return None;
        }
        params.mode = mode;
        Some((params.handle, mode))
    }

    fn update_frame_rate_overrides(
        &self,
        considered: ConsideredSignals,
        display_fps: Fps,
        features: &FeatureState,
    ) -> bool {
        let policy = self.policy.read().unwrap();
        if !policy.supports_frame_rate_override() || considered.idle {
            return false;
        }
        let fresh = policy.frame_rate_overrides(
            &features.content_requirements,
            display_fps,
            considered.touch,
        );
        drop(policy);

        let mut store = self.overrides.write().unwrap();
        let changed = store.by_content.len() != fresh.len()
            || fresh.iter().any(|(uid, fps)| {
                store
                    .by_content
                    .get(uid)
                    .map_or(true, |old| !old.approx_eq(*fps))
            });
        if changed {
            store.by_content = fresh;
        }
        changed
    }

    // ---- timers and state ---------------------------------------------

    pub fn reset_idle_timer(&self) {
        if let Some(timer) = self.idle_timer.lock().unwrap().as_ref() {
            timer.reset();
        }
    }

    pub fn notify_touch_event(&self) {
        let had_timer = {
            let touch_timer = self.touch_timer.lock().unwrap();
            match touch_timer.as_ref() {
                Some(timer) => {
                    timer.reset();
                    true
                }
                None => false,
            }
        };
        if had_timer && self.options.support_kernel_timer {
            self.reset_idle_timer();
        }
    }

    /// Flag the display as idle; the next triggerRefresh subscriber resync
    /// forces a repaint.
    pub fn set_idle_state(&self) {
        self.display_idle.store(true, Ordering::SeqCst);
    }

    pub fn set_display_power_state(&self, normal: bool) {
        {
            self.features.lock().unwrap().is_display_power_state_normal = normal;
        }
        if let Some(timer) = self.display_power_timer.lock().unwrap().as_ref() {
            timer.reset();
        }
        // The power event boosts to performance; drop stale fps detection.
        self.layer_history.lock().unwrap().clear();
    }

    fn idle_timer_fired(&self, state: TimerState) {
        if self.options.support_kernel_timer {
            self.kernel_idle_timer_fired(state);
        } else {
            self.re_evaluate(&mut |features| {
                if features.idle_timer == state {
                    false
                } else {
                    features.idle_timer = state;
                    true
                }
            });
        }
    }

    fn kernel_idle_timer_fired(&self, state: TimerState) {
        let current = self.policy.read().unwrap().current_mode();
        let threshold = Fps::from_hz(KERNEL_TIMER_FPS_THRESHOLD);

        if state == TimerState::Reset && current.fps.greater_than_with_margin(threshold) {
            // Below the threshold the rate during power collapse is the
            // same, so only performance rates need a resync.
            self.resync_to_hardware_vsync(true, current.vsync_period, false);
        } else if state == TimerState::Expired
            && current.fps.less_than_or_equal_with_margin(threshold)
        {
            // No frames are being pushed; the model update can wait.
            self.disable_hardware_vsync(false);
        }

        self.callback.kernel_timer_changed(state == TimerState::Expired);
    }

    fn touch_timer_fired(&self, state: TimerState) {
        let touch = if state == TimerState::Reset {
            TouchState::Active
        } else {
            TouchState::Inactive
        };
        let considered = self.re_evaluate(&mut |features| {
            if features.touch == touch {
                false
            } else {
                features.touch = touch;
                true
            }
        });
        // A touch boost invalidates the collected fps detection.
        if considered.touch {
            self.layer_history.lock().unwrap().clear();
        }
    }

    fn display_power_timer_fired(&self, state: TimerState) {
        self.re_evaluate(&mut |features| {
            if features.display_power_timer == state {
                false
            } else {
                features.display_power_timer = state;
                true
            }
        });
    }

    // ---- overrides ----------------------------------------------------

    /// Set, replace or clear (fps = 0) the backdoor override for a uid.
    /// Rates in (0, 1) are not meaningful and are ignored.
    pub fn set_preferred_refresh_rate_for_uid(&self, frame_rate_override: FrameRateOverride) {
        let FrameRateOverride { uid, fps } = frame_rate_override;
        if fps > 0.0 && fps < 1.0 {
            debug!(?uid, fps, "ignoring sub-1Hz frame rate override");
            return;
        }

        let mut store = self.overrides.write().unwrap();
        if fps != 0.0 {
            store.backdoor.insert(uid, Fps::from_hz(fps));
        } else {
            store.backdoor.remove(&uid);
        }
    }

    /// Effective override for a uid: backdoor first, then content-derived.
    pub fn get_frame_rate_override(&self, uid: Uid) -> Option<Fps> {
        if !self.policy.read().unwrap().supports_frame_rate_override() {
            return None;
        }
        self.overrides.read().unwrap().get(uid)
    }

    // ---- introspection -------------------------------------------------

    pub fn get_display_stat_info(&self, now: Nanos) -> DisplayStatInfo {
        let tracker = self.tracker.lock().unwrap();
        DisplayStatInfo {
            vsync_time: tracker.next_anticipated_vsync_from(now),
            vsync_period: tracker.current_period(),
        }
    }

    /// The vsync preceding `expected_present_time`.
    pub fn get_previous_vsync_from(&self, expected_present_time: Nanos) -> Nanos {
        expected_present_time - self.tracker.lock().unwrap().current_period()
    }

    pub fn get_preferred_mode_id(&self) -> Option<DisplayModeId> {
        let mut features = self.features.lock().unwrap();
        // Refresh the cached id before handing it out.
        if features.mode_id.is_some() {
            let selection = self.calculate_selection(&features);
            features.mode_id = Some(selection.mode.id);
        }
        features.mode_id
    }

    // ---- period change timeline ----------------------------------------

    pub fn on_new_vsync_period_change_timeline(&self, timeline: VsyncPeriodChangeTimeline) {
        if timeline.refresh_required {
            self.callback.repaint_everything_for_hwc();
        }

        let mut stored = timeline;
        let max_applied = self.clock.now() + MAX_VSYNC_APPLIED_TIME;
        if stored.new_vsync_applied_time > max_applied {
            stored.new_vsync_applied_time = max_applied;
        }
        *self.vsync_timeline.lock().unwrap() = Some(stored);
    }

    /// The display finished a refresh; re-request repaint while the period
    /// change timeline still demands one.
    pub fn on_display_refreshed(&self, timestamp: Nanos) {
        let mut call_repaint = false;
        {
            let mut timeline = self.vsync_timeline.lock().unwrap();
            if let Some(timeline) = timeline.as_mut() {
                if timeline.refresh_required {
                    if timeline.refresh_time < timestamp {
                        timeline.refresh_required = false;
                    } else {
                        call_repaint = true;
                    }
                }
            }
        }
        if call_repaint {
            self.callback.repaint_everything_for_hwc();
        }
    }

    // ---- dump ----------------------------------------------------------

    pub fn dump(&self, result: &mut String) {
        let timer_line = |timer: &Mutex<Option<OneShotTimer>>| {
            timer
                .lock()
                .unwrap()
                .as_ref()
                .map(|t| t.dump())
                .unwrap_or_else(|| "off".to_string())
        };
        result.push_str(&format!("+  Idle timer: {}\n", timer_line(&self.idle_timer)));
        result.push_str(&format!(
            "+  Touch timer: {}\n",
            timer_line(&self.touch_timer)
        ));
        result.push_str(&format!(
            "+  Content detection: {} ",
            if self.options.use_content_detection {
                "on"
            } else {
                "off"
            }
        ));
        self.layer_history.lock().unwrap().dump(result);
        result.push('\n');

        let store = self.overrides.read().unwrap();
        result.push_str("Frame Rate Overrides (backdoor): {");
        for (uid, fps) in &store.backdoor {
            result.push_str(&format!("[uid: {} frameRate: {}], ", uid.0, fps));
        }
        result.push_str("}\n");
        result.push_str("Frame Rate Overrides (by content): {");
        for (uid, fps) in &store.by_content {
            result.push_str(&format!("[uid: {} frameRate: {}], ", uid.0, fps));
        }
        result.push_str("}\n");
        drop(store);

        self.policy.read().unwrap().dump(result);

        let connections = self.connections.lock().unwrap();
        result.push_str(&format!("Connections: {}\n", connections.len()));
        for thread in connections.values() {
            thread.dump(result);
        }
    }

    pub fn dump_vsync(&self, result: &mut String) {
        result.push_str("VsyncController:\n");
        self.controller.lock().unwrap().dump(result);
        result.push_str("VsyncDispatch:\n");
        self.dispatch.dump(result);
    }
}
