//! Vsync signal reactor.
//!
//! Mediates between external vsync signals (hardware timestamps and present
//! fences) and the timing model: feeds accepted samples to the tracker,
//! nudges the dispatch to re-evaluate wake times, and tracks period
//! transitions so hardware vsync stays enabled until the model confirms the
//! new period.

use crate::clock::Nanos;
use crate::dispatch::{SharedVsyncTracker, VsyncDispatch};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Maximum number of unsignaled fences kept; overflow discards oldest.
const PENDING_FENCE_LIMIT: usize = 20;

/// Relative tolerance for confirming a period transition: the observed
/// period must be within 1/50th (2%) of the target.
const PERIOD_CONFIRM_DIVISOR: Nanos = 50;

/// Sentinel stored in a fence that has not signaled yet.
const FENCE_PENDING: Nanos = i64::MIN;

/// A present fence: a signal that a submitted frame has been scanned out.
///
/// The signal time is an observed vsync. Handles are cheap clones over a
/// shared slot, so the producer can signal after handing the fence to the
/// scheduler.
#[derive(Clone)]
pub struct PresentFence {
    signal_time: Arc<AtomicI64>,
}

impl PresentFence {
    /// A fence that has not signaled yet.
    pub fn pending() -> Self {
        Self {
            signal_time: Arc::new(AtomicI64::new(FENCE_PENDING)),
        }
    }

    /// A fence that already signaled at `time`.
    pub fn signaled(time: Nanos) -> Self {
        Self {
            signal_time: Arc::new(AtomicI64::new(time)),
        }
    }

    /// Record the scanout time. Signaling twice keeps the first time.
    pub fn signal(&self, time: Nanos) {
        let _ = self.signal_time.compare_exchange(
            FENCE_PENDING,
            time,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn signal_time(&self) -> Option<Nanos> {
        match self.signal_time.load(Ordering::SeqCst) {
            FENCE_PENDING => None,
            time => Some(time),
        }
    }
}

/// Result of feeding a hardware vsync timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwVsyncFeedback {
    /// The tracker still wants hardware samples (or a transition is
    /// pending).
    pub needs_hw_vsync: bool,
    /// This sample completed a period transition.
    pub period_flushed: bool,
}

/// Reactor between vsync signals and the tracker.
pub struct VsyncController {
    tracker: SharedVsyncTracker,
    dispatch: Arc<VsyncDispatch>,
    pending_fences: VecDeque<PresentFence>,
    /// Target period of an in-flight transition, if any.
    period_transition: Option<Nanos>,
    ignore_present_fences: bool,
    last_hw_vsync: Option<Nanos>,
}

impl VsyncController {
    pub fn new(tracker: SharedVsyncTracker, dispatch: Arc<VsyncDispatch>) -> Self {
        Self {
            tracker,
            dispatch,
            pending_fences: VecDeque::with_capacity(PENDING_FENCE_LIMIT),
            period_transition: None,
            ignore_present_fences: false,
            last_hw_vsync: None,
        }
    }

    /// Feed a hardware vsync timestamp, with the period the hardware
    /// composer reports for it when available.
    pub fn add_hw_vsync(&mut self, timestamp: Nanos, hwc_period: Option<Nanos>) -> HwVsyncFeedback {
        let accepted = self.tracker.lock().unwrap().add_sample(timestamp);
        self.last_hw_vsync = Some(timestamp);

        let mut period_flushed = false;
        if let Some(target) = self.period_transition {
            let confirmed = match hwc_period {
                // The composer told us the period outright.
                Some(period) => within_tolerance(period, target),
                // Otherwise wait for the model to agree.
                None => {
                    let tracker = self.tracker.lock().unwrap();
                    accepted
                        && !tracker.needs_more_samples()
                        && within_tolerance(tracker.current_period(), target)
                }
            };
            if confirmed {
                debug!(period = target, "vsync period transition complete");
                self.period_transition = None;
                period_flushed = true;
            }
        }

        if accepted {
            self.dispatch.on_model_changed();
        }

        HwVsyncFeedback {
            needs_hw_vsync: self.needs_hw_vsync(),
            period_flushed,
        }
    }

    /// Queue a present fence; signaled fences are consumed as vsync samples.
    /// Returns whether hardware vsync is still needed.
    pub fn add_present_fence(&mut self, fence: PresentFence) -> bool {
        if self.ignore_present_fences {
            return self.needs_hw_vsync();
        }

        if self.pending_fences.len() >= PENDING_FENCE_LIMIT {
            trace!("present fence queue full, discarding oldest");
            self.pending_fences.pop_front();
        }
        self.pending_fences.push_back(fence);

        // Drain every fence that has signaled since the last call.
        let mut accepted_any = false;
        {
            let mut tracker = self.tracker.lock().unwrap();
            self.pending_fences.retain(|fence| match fence.signal_time() {
                Some(time) => {
                    if tracker.add_sample(time) {
                        accepted_any = true;
                    }
                    false
                }
                None => true,
            });
        }
        if accepted_any {
            self.dispatch.on_model_changed();
        }

        self.needs_hw_vsync()
    }

    /// Enter a period transition: the model is reset to the new period and
    /// hardware vsync must stay enabled until a sample confirms it.
    pub fn start_period_transition(&mut self, new_period: Nanos) {
        debug!(new_period, "starting vsync period transition");
        self.period_transition = Some(new_period);
        self.pending_fences.clear();

        let mut tracker = self.tracker.lock().unwrap();
        tracker.set_ideal_period(new_period);
        tracker.reset_model();
    }

    /// When set, fences are accepted but not forwarded to the tracker.
    pub fn set_ignore_present_fences(&mut self, ignore: bool) {
        self.ignore_present_fences = ignore;
        if ignore {
            self.pending_fences.clear();
        }
    }

    /// True while the tracker wants samples or a transition is pending.
    pub fn needs_hw_vsync(&self) -> bool {
        self.period_transition.is_some() || self.tracker.lock().unwrap().needs_more_samples()
    }

    #[cfg(test)]
    fn pending_fence_count(&self) -> usize {
        self.pending_fences.len()
    }

    /// Append a human-readable description of the reactor state.
    pub fn dump(&self, result: &mut String) {
        result.push_str(&format!(
            "  pending fences: {}\n  period transition: {}\n  ignoring fences: {}\n  last hw vsync: {}\n",
            self.pending_fences.len(),
            self.period_transition
                .map(|p| format!("{}ns", p))
                .unwrap_or_else(|| "none".to_string()),
            self.ignore_present_fences,
            self.last_hw_vsync
                .map(|t| format!("{}ns", t))
                .unwrap_or_else(|| "never".to_string()),
        ));
        self.tracker.lock().unwrap().dump(result);
    }
}

fn within_tolerance(period: Nanos, target: Nanos) -> bool {
    (period - target).abs() <= target / PERIOD_CONFIRM_DIVISOR
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::tracker::VsyncPredictor;
    use std::sync::Mutex;

    const PERIOD_60HZ: Nanos = 16_666_667;
    const PERIOD_90HZ: Nanos = 11_111_111;

    fn controller() -> (VsyncController, SharedVsyncTracker) {
        let tracker: SharedVsyncTracker =
            Arc::new(Mutex::new(VsyncPredictor::new(PERIOD_60HZ)));
        let clock = Arc::new(ManualClock::new(0));
        let dispatch = Arc::new(VsyncDispatch::new(clock, Arc::clone(&tracker)));
        (
            VsyncController::new(Arc::clone(&tracker), dispatch),
            tracker,
        )
    }

    #[test]
    fn test_needs_hw_vsync_until_model_ready() {
        let (mut controller, _tracker) = controller();
        assert!(controller.needs_hw_vsync());

        for i in 0..10 {
            let feedback = controller.add_hw_vsync(i * PERIOD_60HZ, None);
            assert!(!feedback.period_flushed);
        }
        assert!(!controller.needs_hw_vsync());
    }

    #[test]
    fn test_signaled_fences_feed_the_tracker() {
        let (mut controller, tracker) = controller();

        for i in 0..10 {
            controller.add_present_fence(PresentFence::signaled(i * PERIOD_60HZ));
        }

        assert!(!controller.needs_hw_vsync());
        assert_eq!(tracker.lock().unwrap().current_period(), PERIOD_60HZ);
    }

    #[test]
    fn test_pending_fences_drain_when_signaled() {
        let (mut controller, _tracker) = controller();

        let fence = PresentFence::pending();
        controller.add_present_fence(fence.clone());
        assert_eq!(controller.pending_fence_count(), 1);

        fence.signal(0);
        controller.add_present_fence(PresentFence::signaled(PERIOD_60HZ));
        assert_eq!(controller.pending_fence_count(), 0);
    }

    #[test]
    fn test_fence_queue_overflow_discards_oldest() {
        let (mut controller, _tracker) = controller();

        for _ in 0..30 {
            controller.add_present_fence(PresentFence::pending());
        }
        assert_eq!(controller.pending_fence_count(), PENDING_FENCE_LIMIT);
    }

    #[test]
    fn test_ignored_fences_do_not_reach_tracker() {
        let (mut controller, _tracker) = controller();
        controller.set_ignore_present_fences(true);

        for i in 0..10 {
            controller.add_present_fence(PresentFence::signaled(i * PERIOD_60HZ));
        }

        // Nothing was forwarded, so the model still wants samples.
        assert!(controller.needs_hw_vsync());
        assert_eq!(controller.pending_fence_count(), 0);
    }

    #[test]
    fn test_period_transition_confirmed_by_hwc_period() {
        let (mut controller, _tracker) = controller();
        controller.start_period_transition(PERIOD_90HZ);
        assert!(controller.needs_hw_vsync());

        // The composer reporting the target period confirms immediately.
        let feedback = controller.add_hw_vsync(0, Some(PERIOD_90HZ));
        assert!(feedback.period_flushed);
        // The model itself still wants samples.
        assert!(feedback.needs_hw_vsync);
    }

    #[test]
    fn test_period_transition_confirmed_by_model() {
        let (mut controller, tracker) = controller();
        controller.start_period_transition(PERIOD_90HZ);

        let mut flushed = false;
        for i in 0..10 {
            let feedback = controller.add_hw_vsync(i * PERIOD_90HZ, None);
            flushed |= feedback.period_flushed;
        }

        assert!(flushed);
        assert!(!controller.needs_hw_vsync());
        assert_eq!(tracker.lock().unwrap().current_period(), PERIOD_90HZ);
    }

    #[test]
    fn test_wrong_hwc_period_does_not_confirm() {
        let (mut controller, _tracker) = controller();
        controller.start_period_transition(PERIOD_90HZ);

        let feedback = controller.add_hw_vsync(0, Some(PERIOD_60HZ));
        assert!(!feedback.period_flushed);
        assert!(feedback.needs_hw_vsync);
    }

    #[test]
    fn test_fence_signal_is_first_write_wins() {
        let fence = PresentFence::pending();
        assert_eq!(fence.signal_time(), None);

        fence.signal(100);
        fence.signal(200);
        assert_eq!(fence.signal_time(), Some(100));
    }
}
