//! Refresh rate selection policy.
//!
//! Pure decision core: given the layer vote summary and the global signals,
//! pick the best display mode and report which signals actually influenced
//! the choice. Also derives the per-uid frame rate overrides implied by
//! explicit layer votes.

use crate::display_mode::{DisplayMode, DisplayModeId, Fps, Uid};
use crate::layer_history::{LayerVoteSummary, LayerVoteType};
use std::collections::HashMap;
use tracing::{trace, warn};

/// Debounced timer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Reset,
    Expired,
}

/// Touch interaction state derived from the touch timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchState {
    Active,
    Inactive,
}

/// Boolean inputs to the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalSignals {
    pub touch: bool,
    pub idle: bool,
    pub display_power_normal: bool,
}

/// Which signals influenced a selection. Callers suppress "mode changed"
/// events when `idle` drove the decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsideredSignals {
    pub touch: bool,
    pub idle: bool,
    pub power: bool,
}

/// Result of a policy evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Selection {
    pub mode: DisplayMode,
    pub considered: ConsideredSignals,
}

/// Mode table plus selection rules.
pub struct RefreshRatePolicy {
    /// Supported modes, ascending by fps.
    modes: Vec<DisplayMode>,
    current: DisplayModeId,
    /// Allowed fps range; selections are clamped into it.
    range_min: Fps,
    range_max: Fps,
    frame_rate_override_enabled: bool,
}

impl RefreshRatePolicy {
    pub fn new(mut modes: Vec<DisplayMode>, current: DisplayModeId) -> Self {
        assert!(!modes.is_empty(), "at least one display mode is required");
        modes.sort_by(|a, b| a.fps.hz().partial_cmp(&b.fps.hz()).unwrap());
        let range_min = modes.first().unwrap().fps;
        let range_max = modes.last().unwrap().fps;
        Self {
            modes,
            current,
            range_min,
            range_max,
            frame_rate_override_enabled: true,
        }
    }

    /// Restrict selections to `[min, max]` fps.
    pub fn set_policy_range(&mut self, min: Fps, max: Fps) {
        self.range_min = min;
        self.range_max = max;
    }

    pub fn set_frame_rate_override_enabled(&mut self, enabled: bool) {
        self.frame_rate_override_enabled = enabled;
    }

    pub fn supports_frame_rate_override(&self) -> bool {
        self.frame_rate_override_enabled
    }

    pub fn mode(&self, id: DisplayModeId) -> Option<DisplayMode> {
        self.modes.iter().copied().find(|m| m.id == id)
    }

    pub fn current_mode(&self) -> DisplayMode {
        self.mode(self.current).unwrap_or(self.modes[0])
    }

    pub fn set_current_mode(&mut self, id: DisplayModeId) {
        if self.mode(id).is_some() {
            self.current = id;
        } else {
            warn!(?id, "ignoring switch to unknown display mode");
        }
    }

    /// Whether there is more than one mode to choose from.
    pub fn can_switch(&self) -> bool {
        self.allowed_modes().len() > 1
    }

    fn allowed_modes(&self) -> Vec<DisplayMode> {
        let allowed: Vec<DisplayMode> = self
            .modes
            .iter()
            .copied()
            .filter(|m| {
                m.fps.hz() >= self.range_min.hz() - 0.001
                    && m.fps.hz() <= self.range_max.hz() + 0.001
            })
            .collect();
        if allowed.is_empty() {
            // A misconfigured range must not leave us with nothing.
            self.modes.clone()
        } else {
            allowed
        }
    }

    pub fn min_mode_by_policy(&self) -> DisplayMode {
        self.allowed_modes()[0]
    }

    pub fn max_mode_by_policy(&self) -> DisplayMode {
        *self.allowed_modes().last().unwrap()
    }

    /// Pick the best mode for the given votes and signals.
    ///
    /// `power_timer` carries the display power timer state, or None when no
    /// power timer is configured.
    pub fn select(
        &self,
        summary: &[LayerVoteSummary],
        signals: GlobalSignals,
        power_timer: Option<TimerState>,
    ) -> Selection {
        let mut considered = ConsideredSignals::default();

        // Outside normal power operation (and during the grace period right
        // after it) the display runs at performance rates.
        if power_timer.is_some()
            && (!signals.display_power_normal || power_timer == Some(TimerState::Reset))
        {
            considered.power = true;
            return Selection {
                mode: self.max_mode_by_policy(),
                considered,
            };
        }

        let votes: Vec<&LayerVoteSummary> = summary
            .iter()
            .filter(|v| v.vote != LayerVoteType::NoVote)
            .collect();
        let has_explicit = votes.iter().any(|v| {
            matches!(
                v.vote,
                LayerVoteType::ExplicitDefault | LayerVoteType::ExplicitExact
            )
        });

        // Touch boost, unless an app explicitly asked for a rate.
        if signals.touch && !has_explicit {
            considered.touch = true;
            return Selection {
                mode: self.max_mode_by_policy(),
                considered,
            };
        }

        if votes.is_empty() {
            if signals.idle {
                considered.idle = true;
                return Selection {
                    mode: self.min_mode_by_policy(),
                    considered,
                };
            }
            // Nothing to go on; keep the current mode, clamped to policy.
            let current = self.current_mode();
            let allowed = self.allowed_modes();
            let mode = if allowed.iter().any(|m| m.id == current.id) {
                current
            } else {
                *allowed.last().unwrap()
            };
            return Selection { mode, considered };
        }

        let allowed = self.allowed_modes();
        let min_fps = allowed[0].fps;
        let max_fps = allowed.last().unwrap().fps;

        let mut best = allowed[0];
        let mut best_score = f32::MIN;
        for &mode in &allowed {
            let mut score = 0.0;
            for vote in &votes {
                score += vote.weight * layer_score(vote.vote, vote.fps, mode.fps, min_fps, max_fps);
            }
            trace!(fps = mode.fps.hz(), score, "scored candidate mode");
            // Strictly-greater keeps the lower-fps mode on ties.
            if score > best_score + f32::EPSILON {
                best_score = score;
                best = mode;
            }
        }

        Selection {
            mode: best,
            considered,
        }
    }

    /// Per-uid frame rate overrides implied by explicit layer votes.
    ///
    /// A uid whose explicit vote cleanly divides the display rate gets its
    /// delivered rate stepped down to `display / divider`. Touch suppresses
    /// overrides from `ExplicitDefault` votes, which tolerate boosting.
    pub fn frame_rate_overrides(
        &self,
        summary: &[LayerVoteSummary],
        display_fps: Fps,
        touch: bool,
    ) -> HashMap<Uid, Fps> {
        let mut overrides = HashMap::new();
        if !self.frame_rate_override_enabled {
            return overrides;
        }

        // Aggregate the strongest explicit ask per uid.
        let mut desired: HashMap<Uid, Fps> = HashMap::new();
        for vote in summary {
            let relevant = match vote.vote {
                LayerVoteType::ExplicitExact => true,
                LayerVoteType::ExplicitDefault => !touch,
                _ => false,
            };
            if !relevant || vote.fps.hz() <= 0.0 {
                continue;
            }
            desired
                .entry(vote.owner_uid)
                .and_modify(|fps| {
                    if vote.fps.hz() > fps.hz() {
                        *fps = vote.fps;
                    }
                })
                .or_insert(vote.fps);
        }

        for (uid, fps) in desired {
            let divider = Fps::divider(display_fps, fps);
            if divider > 1 {
                overrides.insert(uid, Fps::from_hz(display_fps.hz() / divider as f32));
            }
        }
        overrides
    }

    /// Append a human-readable description of the mode table.
    pub fn dump(&self, result: &mut String) {
        result.push_str(&format!(
            "  modes: {:?}\n  current: {:?}\n  policy range: [{}, {}]\n",
            self.modes
                .iter()
                .map(|m| format!("{:?}@{}", m.id, m.fps))
                .collect::<Vec<_>>(),
            self.current,
            self.range_min,
            self.range_max
        ));
    }
}

/// Score one layer's vote against a candidate mode. Higher is better.
fn layer_score(
    vote: LayerVoteType,
    desired: Fps,
    mode_fps: Fps,
    min_fps: Fps,
    max_fps: Fps,
) -> f32 {
    match vote {
        LayerVoteType::NoVote => 0.0,
        LayerVoteType::Min => {
            // 1.0 at the policy floor, falling off toward the ceiling.
            let span = (max_fps.hz() - min_fps.hz()).max(1.0);
            1.0 - (mode_fps.hz() - min_fps.hz()) / span
        }
        LayerVoteType::ExplicitExact => {
            // Only the exact rate or a clean multiple scores at all, and the
            // lowest clean multiple scores best.
            match Fps::divider(mode_fps, desired) {
                0 => 0.0,
                divider => 1.0 / divider as f32,
            }
        }
        LayerVoteType::Heuristic | LayerVoteType::ExplicitDefault => {
            if desired.hz() <= 0.0 {
                return 0.0;
            }
            let ratio = mode_fps.hz() / desired.hz();
            if ratio < 1.0 - 0.01 {
                // Slower than the content: steep penalty.
                return 0.5 * ratio * ratio;
            }
            // Prefer rates that are clean multiples of the content, and the
            // lowest such multiple most of all.
            let frac = (ratio - ratio.round()).abs();
            (1.0 / (1.0 + 2.0 * frac)) / ratio
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display_mode::LayerId;
    use proptest::prelude::*;

    fn policy_60_90_120() -> RefreshRatePolicy {
        RefreshRatePolicy::new(
            vec![
                DisplayMode::new(0, 60.0),
                DisplayMode::new(1, 90.0),
                DisplayMode::new(2, 120.0),
            ],
            DisplayModeId(1),
        )
    }

    fn vote(vote: LayerVoteType, fps: f32) -> LayerVoteSummary {
        LayerVoteSummary {
            layer_id: LayerId(1),
            owner_uid: Uid(1000),
            vote,
            fps: Fps::from_hz(fps),
            weight: 1.0,
        }
    }

    fn quiet_signals() -> GlobalSignals {
        GlobalSignals {
            touch: false,
            idle: false,
            display_power_normal: true,
        }
    }

    #[test]
    fn test_abnormal_power_forces_max_mode() {
        let policy = policy_60_90_120();
        let signals = GlobalSignals {
            display_power_normal: false,
            ..quiet_signals()
        };

        let selection = policy.select(&[], signals, Some(TimerState::Expired));
        assert_eq!(selection.mode.fps, Fps::from_hz(120.0));
        assert!(selection.considered.power);
    }

    #[test]
    fn test_power_timer_reset_grants_grace_period() {
        let policy = policy_60_90_120();
        let selection = policy.select(
            &[vote(LayerVoteType::Heuristic, 30.0)],
            quiet_signals(),
            Some(TimerState::Reset),
        );
        assert_eq!(selection.mode.fps, Fps::from_hz(120.0));
        assert!(selection.considered.power);
    }

    #[test]
    fn test_touch_boosts_to_max() {
        let policy = policy_60_90_120();
        let signals = GlobalSignals {
            touch: true,
            ..quiet_signals()
        };

        let selection = policy.select(&[vote(LayerVoteType::Heuristic, 30.0)], signals, None);
        assert_eq!(selection.mode.fps, Fps::from_hz(120.0));
        assert!(selection.considered.touch);
    }

    #[test]
    fn test_explicit_vote_suppresses_touch_boost() {
        let policy = policy_60_90_120();
        let signals = GlobalSignals {
            touch: true,
            ..quiet_signals()
        };

        let selection = policy.select(&[vote(LayerVoteType::ExplicitExact, 60.0)], signals, None);
        assert!(!selection.considered.touch);
        assert_eq!(selection.mode.fps, Fps::from_hz(60.0));
    }

    #[test]
    fn test_idle_with_no_votes_picks_min() {
        let policy = policy_60_90_120();
        let signals = GlobalSignals {
            idle: true,
            ..quiet_signals()
        };

        let selection = policy.select(&[], signals, None);
        assert_eq!(selection.mode.fps, Fps::from_hz(60.0));
        assert!(selection.considered.idle);
    }

    #[test]
    fn test_no_votes_keeps_current_mode() {
        let policy = policy_60_90_120();
        let selection = policy.select(&[], quiet_signals(), None);
        assert_eq!(selection.mode.id, DisplayModeId(1));
        assert_eq!(selection.considered, ConsideredSignals::default());
    }

    #[test]
    fn test_heuristic_vote_picks_matching_rate() {
        let policy = policy_60_90_120();

        let selection = policy.select(&[vote(LayerVoteType::Heuristic, 60.0)], quiet_signals(), None);
        assert_eq!(selection.mode.fps, Fps::from_hz(60.0));

        let selection = policy.select(&[vote(LayerVoteType::Heuristic, 90.0)], quiet_signals(), None);
        assert_eq!(selection.mode.fps, Fps::from_hz(90.0));
    }

    #[test]
    fn test_heuristic_30_picks_lowest_clean_multiple() {
        let policy = policy_60_90_120();
        let selection = policy.select(&[vote(LayerVoteType::Heuristic, 30.0)], quiet_signals(), None);
        // 60, 90 and 120 are all multiples of 30; the lowest wins.
        assert_eq!(selection.mode.fps, Fps::from_hz(60.0));
    }

    #[test]
    fn test_min_vote_pulls_selection_down() {
        let policy = policy_60_90_120();
        let selection = policy.select(&[vote(LayerVoteType::Min, 0.0)], quiet_signals(), None);
        assert_eq!(selection.mode.fps, Fps::from_hz(60.0));
    }

    #[test]
    fn test_policy_range_clamps_selection() {
        let mut policy = policy_60_90_120();
        policy.set_policy_range(Fps::from_hz(90.0), Fps::from_hz(120.0));

        let selection = policy.select(&[vote(LayerVoteType::Heuristic, 30.0)], quiet_signals(), None);
        assert!(selection.mode.fps.hz() >= 90.0 - 0.001);

        let signals = GlobalSignals {
            idle: true,
            ..quiet_signals()
        };
        let selection = policy.select(&[], signals, None);
        assert_eq!(selection.mode.fps, Fps::from_hz(90.0));
    }

    #[test]
    fn test_frame_rate_overrides_from_explicit_votes() {
        let policy = policy_60_90_120();
        let summary = vec![
            LayerVoteSummary {
                layer_id: LayerId(1),
                owner_uid: Uid(2000),
                vote: LayerVoteType::ExplicitDefault,
                fps: Fps::from_hz(60.0),
                weight: 1.0,
            },
            LayerVoteSummary {
                layer_id: LayerId(2),
                owner_uid: Uid(3000),
                vote: LayerVoteType::Heuristic,
                fps: Fps::from_hz(60.0),
                weight: 1.0,
            },
        ];

        let overrides = policy.frame_rate_overrides(&summary, Fps::from_hz(120.0), false);
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[&Uid(2000)], Fps::from_hz(60.0));
    }

    #[test]
    fn test_touch_suppresses_default_vote_overrides() {
        let policy = policy_60_90_120();
        let summary = vec![vote(LayerVoteType::ExplicitDefault, 60.0)];

        let overrides = policy.frame_rate_overrides(&summary, Fps::from_hz(120.0), true);
        assert!(overrides.is_empty());

        // Exact votes survive the touch boost.
        let summary = vec![vote(LayerVoteType::ExplicitExact, 60.0)];
        let overrides = policy.frame_rate_overrides(&summary, Fps::from_hz(120.0), true);
        assert_eq!(overrides[&Uid(1000)], Fps::from_hz(60.0));
    }

    #[test]
    fn test_uneven_rates_get_no_override(){
        let policy = policy_60_90_120();
        let summary = vec![vote(LayerVoteType::ExplicitExact, 50.0)];
        let overrides = policy.frame_rate_overrides(&summary, Fps::from_hz(120.0), false);
        assert!(overrides.is_empty());
    }

    #[test]
    fn test_overrides_disabled() {
        let mut policy = policy_60_90_120();
        policy.set_frame_rate_override_enabled(false);
        let summary = vec![vote(LayerVoteType::ExplicitExact, 60.0)];
        assert!(policy
            .frame_rate_overrides(&summary, Fps::from_hz(120.0), false)
            .is_empty());
    }

    proptest! {
        #[test]
        fn prop_selection_stays_in_policy_range(
            desired in 1.0f32..=200.0,
            touch in any::<bool>(),
            idle in any::<bool>(),
        ) {
            let mut policy = policy_60_90_120();
            policy.set_policy_range(Fps::from_hz(60.0), Fps::from_hz(90.0));
            let signals = GlobalSignals { touch, idle, display_power_normal: true };

            let selection = policy.select(
                &[vote(LayerVoteType::Heuristic, desired)],
                signals,
                None,
            );
            prop_assert!(selection.mode.fps.hz() >= 60.0 - 0.001);
            prop_assert!(selection.mode.fps.hz() <= 90.0 + 0.001);
        }

        #[test]
        fn prop_override_rate_divides_display(desired in 1.0f32..=120.0) {
            let policy = policy_60_90_120();
            let summary = vec![vote(LayerVoteType::ExplicitExact, desired)];
            let overrides = policy.frame_rate_overrides(&summary, Fps::from_hz(120.0), false);

            for fps in overrides.values() {
                let divider = Fps::divider(Fps::from_hz(120.0), *fps);
                prop_assert!(divider >= 1, "override {} does not divide 120Hz", fps);
            }
        }
    }
}
