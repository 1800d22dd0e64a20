//! Per-layer frame rate vote aggregation.
//!
//! Keeps a small ring of recent present times per registered layer and turns
//! them into refresh rate votes: heuristic layers get a rate estimated from
//! their inter-frame intervals, wallpaper-style layers vote for the minimum,
//! and explicit votes pass through unchanged.

use crate::clock::{Nanos, NANOS_PER_SEC};
use crate::display_mode::{Fps, LayerId, Uid};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Present samples older than this are ignored by the heuristic.
const HEURISTIC_WINDOW: Nanos = NANOS_PER_SEC;

/// Minimum present samples inside the window for a numeric heuristic vote.
const HEURISTIC_MIN_FRAMES: usize = 2;

/// Maximum present times kept per layer.
const PRESENT_RING_CAPACITY: usize = 90;

/// How a layer wants to influence the refresh rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerVoteType {
    /// The layer abstains.
    NoVote,
    /// Vote for the minimum allowed rate.
    Min,
    /// Rate is estimated from the layer's present cadence.
    Heuristic,
    /// The app asked for a rate but tolerates multiples.
    ExplicitDefault,
    /// The app demands the exact rate (or a clean divider of the display).
    ExplicitExact,
}

/// What kind of layer update produced a history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerUpdateType {
    /// A new buffer was queued; counts as a presented frame.
    Buffer,
    /// An animation transaction; activity without a frame.
    AnimationTx,
    /// A frame rate API change; activity without a frame.
    SetFrameRate,
}

/// Window type of a layer, used to assign its default vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    Application,
    StatusBar,
    Wallpaper,
}

/// One layer's contribution to the policy summary.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerVoteSummary {
    pub layer_id: LayerId,
    pub owner_uid: Uid,
    pub vote: LayerVoteType,
    pub fps: Fps,
    pub weight: f32,
}

struct LayerInfo {
    name: String,
    owner_uid: Uid,
    default_vote: LayerVoteType,
    /// Vote set through the frame rate API, overriding the default.
    explicit_vote: Option<(LayerVoteType, Fps)>,
    present_times: Vec<Nanos>,
    last_update: Nanos,
}

impl LayerInfo {
    fn record_present(&mut self, present_time: Nanos) {
        if self.present_times.len() >= PRESENT_RING_CAPACITY {
            self.present_times.remove(0);
        }
        self.present_times.push(present_time);
    }

    /// Frame rate estimated from the present times inside the window, or
    /// None when the layer is inactive or has too few samples.
    fn heuristic_fps(&self, now: Nanos) -> Option<Fps> {
        let newest = *self.present_times.last()?;
        if newest < now - HEURISTIC_WINDOW {
            return None;
        }

        let cutoff = now - HEURISTIC_WINDOW;
        let recent: Vec<Nanos> = self
            .present_times
            .iter()
            .copied()
            .filter(|&t| t >= cutoff)
            .collect();
        if recent.len() < HEURISTIC_MIN_FRAMES {
            return None;
        }

        let elapsed = recent[recent.len() - 1] - recent[0];
        if elapsed <= 0 {
            return None;
        }
        let intervals = (recent.len() - 1) as f32;
        Some(Fps::from_hz(intervals * NANOS_PER_SEC as f32 / elapsed as f32))
    }
}

/// Registry of layers and their vote state.
///
/// Holds only layer ids and metadata, never the layers themselves.
pub struct LayerHistory {
    layers: HashMap<LayerId, LayerInfo>,
    mode_change_pending: bool,
    /// Summary frozen while a mode change is in flight.
    cached_summary: Vec<LayerVoteSummary>,
    /// Cap applied to heuristic votes, 0 when uncapped.
    thermal_fps: f32,
    display_area: u32,
}

impl LayerHistory {
    pub fn new() -> Self {
        Self {
            layers: HashMap::new(),
            mode_change_pending: false,
            cached_summary: Vec::new(),
            thermal_fps: 0.0,
            display_area: 0,
        }
    }

    pub fn register_layer(
        &mut self,
        id: LayerId,
        name: &str,
        owner_uid: Uid,
        default_vote: LayerVoteType,
    ) {
        trace!(?id, name, ?default_vote, "registering layer");
        self.layers.insert(
            id,
            LayerInfo {
                name: name.to_string(),
                owner_uid,
                default_vote,
                explicit_vote: None,
                present_times: Vec::new(),
                last_update: 0,
            },
        );
    }

    pub fn deregister_layer(&mut self, id: LayerId) {
        if self.layers.remove(&id).is_none() {
            debug!(?id, "deregistering unknown layer");
        }
    }

    /// Record layer activity. Only buffer updates contribute present times;
    /// other update types refresh the activity timestamp.
    pub fn record(&mut self, id: LayerId, present_time: Nanos, now: Nanos, kind: LayerUpdateType) {
        let Some(layer) = self.layers.get_mut(&id) else {
            debug!(?id, "recording history for unknown layer");
            return;
        };
        layer.last_update = now;
        if kind == LayerUpdateType::Buffer {
            layer.record_present(present_time);
        }
    }

    /// Set or clear an explicit vote for a layer (frame rate API).
    pub fn set_vote(&mut self, id: LayerId, vote: Option<(LayerVoteType, Fps)>) {
        if let Some(layer) = self.layers.get_mut(&id) {
            layer.explicit_vote = vote;
        }
    }

    /// Freeze summaries until the in-flight mode change lands.
    pub fn set_mode_change_pending(&mut self, pending: bool) {
        self.mode_change_pending = pending;
    }

    /// Drop all recorded present times, keeping registrations.
    pub fn clear(&mut self) {
        for layer in self.layers.values_mut() {
            layer.present_times.clear();
        }
    }

    pub fn set_thermal_fps(&mut self, fps: f32) {
        self.thermal_fps = fps;
    }

    pub fn set_display_area(&mut self, area: u32) {
        self.display_area = area;
    }

    /// Produce the per-layer votes as of `now`.
    pub fn summarize(&mut self, now: Nanos) -> Vec<LayerVoteSummary> {
        if self.mode_change_pending {
            return self.cached_summary.clone();
        }

        let mut summary = Vec::new();
        for (&id, layer) in &self.layers {
            let (vote, fps) = match layer.explicit_vote {
                Some((vote, fps)) => (vote, fps),
                None => match layer.default_vote {
                    LayerVoteType::NoVote => continue,
                    LayerVoteType::Min => (LayerVoteType::Min, Fps::from_hz(0.0)),
                    LayerVoteType::Heuristic => match layer.heuristic_fps(now) {
                        Some(fps) => (LayerVoteType::Heuristic, self.cap_thermal(fps)),
                        None => continue,
                    },
                    explicit => (explicit, Fps::from_hz(0.0)),
                },
            };
            summary.push(LayerVoteSummary {
                layer_id: id,
                owner_uid: layer.owner_uid,
                vote,
                fps,
                weight: 1.0,
            });
        }

        self.cached_summary = summary.clone();
        summary
    }

    fn cap_thermal(&self, fps: Fps) -> Fps {
        if self.thermal_fps > 0.0 && fps.hz() > self.thermal_fps {
            Fps::from_hz(self.thermal_fps)
        } else {
            fps
        }
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Append a human-readable description of the registry.
    pub fn dump(&self, result: &mut String) {
        result.push_str(&format!(
            "{} layers, display area {}\n",
            self.layers.len(),
            self.display_area
        ));
        for layer in self.layers.values() {
            result.push_str(&format!(
                "  {}: {:?}, {} presents\n",
                layer.name,
                layer.default_vote,
                layer.present_times.len()
            ));
        }
    }
}

impl Default for LayerHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PERIOD_30HZ: Nanos = 33_333_333;

    fn history_with_heuristic_layer() -> LayerHistory {
        let mut history = LayerHistory::new();
        history.register_layer(LayerId(1), "video", Uid(1000), LayerVoteType::Heuristic);
        history
    }

    #[test]
    fn test_heuristic_estimates_present_cadence() {
        let mut history = history_with_heuristic_layer();

        let mut now = 0;
        for i in 0..10 {
            now = i * PERIOD_30HZ;
            history.record(LayerId(1), now, now, LayerUpdateType::Buffer);
        }

        let summary = history.summarize(now);
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].vote, LayerVoteType::Heuristic);
        assert!(
            (summary[0].fps.hz() - 30.0).abs() < 0.5,
            "estimated {} instead of 30Hz",
            summary[0].fps.hz()
        );
    }

    #[test]
    fn test_heuristic_needs_minimum_samples() {
        let mut history = history_with_heuristic_layer();
        history.record(LayerId(1), 0, 0, LayerUpdateType::Buffer);

        // A single present time is not enough for a numeric vote.
        assert!(history.summarize(PERIOD_30HZ).is_empty());
    }

    #[test]
    fn test_heuristic_ignores_stale_layers() {
        let mut history = history_with_heuristic_layer();
        for i in 0..5 {
            history.record(
                LayerId(1),
                i * PERIOD_30HZ,
                i * PERIOD_30HZ,
                LayerUpdateType::Buffer,
            );
        }

        // Two seconds later the layer has gone quiet.
        let later = 5 * PERIOD_30HZ + 2 * NANOS_PER_SEC;
        assert!(history.summarize(later).is_empty());
    }

    #[test]
    fn test_non_buffer_updates_do_not_count_as_frames() {
        let mut history = history_with_heuristic_layer();
        for i in 0..10 {
            history.record(
                LayerId(1),
                i * PERIOD_30HZ,
                i * PERIOD_30HZ,
                LayerUpdateType::SetFrameRate,
            );
        }
        assert!(history.summarize(10 * PERIOD_30HZ).is_empty());
    }

    #[test]
    fn test_min_vote_passes_through() {
        let mut history = LayerHistory::new();
        history.register_layer(LayerId(2), "wallpaper", Uid(1000), LayerVoteType::Min);

        let summary = history.summarize(0);
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].vote, LayerVoteType::Min);
    }

    #[test]
    fn test_explicit_vote_overrides_default() {
        let mut history = history_with_heuristic_layer();
        history.set_vote(
            LayerId(1),
            Some((LayerVoteType::ExplicitExact, Fps::from_hz(60.0))),
        );

        let summary = history.summarize(0);
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].vote, LayerVoteType::ExplicitExact);
        assert_eq!(summary[0].fps, Fps::from_hz(60.0));

        history.set_vote(LayerId(1), None);
        assert!(history.summarize(0).is_empty());
    }

    #[test]
    fn test_mode_change_pending_freezes_summary() {
        let mut history = history_with_heuristic_layer();
        for i in 0..10 {
            history.record(
                LayerId(1),
                i * PERIOD_30HZ,
                i * PERIOD_30HZ,
                LayerUpdateType::Buffer,
            );
        }
        let before = history.summarize(10 * PERIOD_30HZ);
        assert_eq!(before.len(), 1);

        history.set_mode_change_pending(true);
        // The layer goes stale, but the frozen summary is returned.
        let frozen = history.summarize(10 * PERIOD_30HZ + 5 * NANOS_PER_SEC);
        assert_eq!(frozen, before);

        history.set_mode_change_pending(false);
        assert!(history
            .summarize(10 * PERIOD_30HZ + 5 * NANOS_PER_SEC)
            .is_empty());
    }

    #[test]
    fn test_clear_drops_present_times() {
        let mut history = history_with_heuristic_layer();
        for i in 0..10 {
            history.record(
                LayerId(1),
                i * PERIOD_30HZ,
                i * PERIOD_30HZ,
                LayerUpdateType::Buffer,
            );
        }
        history.clear();
        assert!(history.summarize(10 * PERIOD_30HZ).is_empty());
        assert_eq!(history.layer_count(), 1);
    }

    #[test]
    fn test_thermal_cap_limits_heuristic_votes() {
        let mut history = LayerHistory::new();
        history.register_layer(LayerId(3), "game", Uid(1000), LayerVoteType::Heuristic);
        history.set_thermal_fps(60.0);

        // ~90Hz cadence.
        let period = 11_111_111;
        for i in 0..10 {
            history.record(LayerId(3), i * period, i * period, LayerUpdateType::Buffer);
        }

        let summary = history.summarize(9 * period);
        assert_eq!(summary.len(), 1);
        assert!(summary[0].fps.hz() <= 60.0 + 0.001);
    }

    #[test]
    fn test_deregistered_layer_stops_voting() {
        let mut history = history_with_heuristic_layer();
        history.set_vote(
            LayerId(1),
            Some((LayerVoteType::ExplicitDefault, Fps::from_hz(90.0))),
        );
        assert_eq!(history.summarize(0).len(), 1);

        history.deregister_layer(LayerId(1));
        assert!(history.summarize(0).is_empty());
        assert_eq!(history.layer_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_present_ring_is_bounded(count in 0usize..300) {
            let mut history = history_with_heuristic_layer();
            for i in 0..count {
                history.record(
                    LayerId(1),
                    i as Nanos * PERIOD_30HZ,
                    i as Nanos * PERIOD_30HZ,
                    LayerUpdateType::Buffer,
                );
            }
            let layer = history.layers.get(&LayerId(1)).unwrap();
            prop_assert!(layer.present_times.len() <= PRESENT_RING_CAPACITY);
        }

        #[test]
        fn prop_heuristic_tracks_regular_cadence(hz in 5.0f32..=120.0) {
            let mut history = history_with_heuristic_layer();
            let period = (NANOS_PER_SEC as f32 / hz) as Nanos;
            let mut now = 0;
            for i in 0..20 {
                now = i * period;
                history.record(LayerId(1), now, now, LayerUpdateType::Buffer);
            }

            let summary = history.summarize(now);
            prop_assert_eq!(summary.len(), 1);
            let estimated = summary[0].fps.hz();
            prop_assert!(
                (estimated - hz).abs() / hz < 0.05,
                "estimated {} for {}Hz cadence", estimated, hz
            );
        }
    }
}
