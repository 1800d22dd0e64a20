//! Vsync timing model.
//!
//! Consumes hardware vsync timestamps (and present-fence signal times, which
//! are observed vsyncs) and maintains a closed-form `t = phase + k * period`
//! model of the display's cadence via an outlier-trimmed least-squares fit.

use crate::clock::Nanos;
use crate::display_mode::Fps;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Number of timestamps kept in the sample ring.
const HISTORY_SIZE: usize = 20;

/// Minimum samples before the fitted model is trusted.
const MIN_SAMPLES_FOR_PREDICTION: usize = 6;

/// Percent of highest and lowest residuals discarded before the final fit.
const OUTLIER_TRIM_PERCENT: usize = 20;

/// Phase tolerance divisor: a time point counts as "on a vsync" when within
/// period/4 of the predicted grid.
const PHASE_TOLERANCE_DIVISOR: Nanos = 4;

/// Capability interface of the vsync timing model.
///
/// Swappable so tests can substitute a fixed-grid model.
pub trait VsyncTracker: Send {
    /// Integrate a hardware vsync timestamp. Returns whether the sample was
    /// accepted into the model.
    fn add_sample(&mut self, timestamp: Nanos) -> bool;

    /// Smallest predicted vsync at or after `time_point`.
    fn next_anticipated_vsync_from(&self, time_point: Nanos) -> Nanos;

    /// Current best estimate of the vsync period.
    fn current_period(&self) -> Nanos;

    /// Whether `time_point` lands on a vsync that a subscriber throttled to
    /// `fps` (a divider of the base rate) should receive.
    fn is_vsync_in_phase(&self, time_point: Nanos, fps: Fps) -> bool;

    /// Whether the model still wants hardware samples.
    fn needs_more_samples(&self) -> bool;

    /// Forget all history and revert to the ideal period.
    fn reset_model(&mut self);

    /// Change the ideal (nominal) period, e.g. on a mode switch.
    fn set_ideal_period(&mut self, period: Nanos);

    /// The nominal period predictions fall back to without a model.
    fn ideal_period(&self) -> Nanos;

    /// Append a human-readable description of the model state.
    fn dump(&self, result: &mut String);
}

/// Fitted line through the sample ring.
#[derive(Debug, Clone, Copy)]
struct Model {
    /// Estimated vsync period in nanoseconds.
    period: f64,
    /// Absolute phase: the line passes through `phase + k * period`.
    phase: f64,
}

/// Least-squares vsync predictor.
///
/// Keeps the last [`HISTORY_SIZE`] accepted timestamps. Ordinals are
/// recovered by rounding elapsed time against the current period estimate,
/// an initial fit flags outlier residuals, and the final fit runs on the
/// trimmed set. The phase is corrected so the model passes through the most
/// recent sample.
pub struct VsyncPredictor {
    ideal_period: Nanos,
    samples: VecDeque<Nanos>,
    model: Option<Model>,
    /// Set when the latest sample was rejected; cleared by the next accept.
    rejected_outlier: bool,
}

impl VsyncPredictor {
    pub fn new(ideal_period: Nanos) -> Self {
        Self {
            ideal_period,
            samples: VecDeque::with_capacity(HISTORY_SIZE),
            model: None,
            rejected_outlier: false,
        }
    }

    /// Period bounds implied by the ideal period. Samples outside are
    /// rejected and fits outside are discarded.
    fn period_bounds(&self) -> (Nanos, Nanos) {
        (self.ideal_period / 4, self.ideal_period * 4)
    }

    /// Effective (period, phase) used for predictions, falling back to the
    /// ideal grid anchored at the newest sample when the fit is not ready.
    fn effective_model(&self) -> Model {
        if let Some(model) = self.model {
            return model;
        }
        Model {
            period: self.ideal_period as f64,
            phase: self.samples.back().copied().unwrap_or(0) as f64,
        }
    }

    fn refit(&mut self) {
        if self.samples.len() < MIN_SAMPLES_FOR_PREDICTION {
            self.model = None;
            return;
        }

        let t0 = self.samples[0];
        let estimate = self
            .model
            .map(|m| m.period)
            .unwrap_or(self.ideal_period as f64);

        // Recover ordinals by rounding elapsed time against the estimate.
        let points: Vec<(f64, f64)> = self
            .samples
            .iter()
            .map(|&t| {
                let rel = (t - t0) as f64;
                ((rel / estimate).round(), rel)
            })
            .collect();

        let Some((slope, intercept)) = linear_fit(&points) else {
            return;
        };

        // Trim the largest and smallest residuals, then refit.
        let trim = points.len() * OUTLIER_TRIM_PERCENT / 100;
        let (slope, intercept) = if trim > 0 {
            let mut by_residual: Vec<(f64, f64)> = points.clone();
            by_residual.sort_by(|a, b| {
                let ra = a.1 - (intercept + slope * a.0);
                let rb = b.1 - (intercept + slope * b.0);
                ra.partial_cmp(&rb).unwrap_or(std::cmp::Ordering::Equal)
            });
            let kept = &by_residual[trim..by_residual.len() - trim];
            linear_fit(kept).unwrap_or((slope, intercept))
        } else {
            (slope, intercept)
        };

        let (min_period, max_period) = self.period_bounds();
        if slope < min_period as f64 || slope > max_period as f64 {
            debug!(slope, "discarding vsync fit with out-of-range period");
            return;
        }

        // Correct the phase through the most recent sample.
        let newest = *self.samples.back().unwrap() as f64 - t0 as f64;
        let ordinal = ((newest - intercept) / slope).round();
        let phase = t0 as f64 + newest - ordinal * slope;

        trace!(period = slope, phase, "vsync model updated");
        self.model = Some(Model {
            period: slope,
            phase,
        });
    }
}

impl VsyncTracker for VsyncPredictor {
    fn add_sample(&mut self, timestamp: Nanos) -> bool {
        if let Some(&newest) = self.samples.back() {
            let delta = timestamp - newest;
            let (min_period, max_period) = self.period_bounds();
            if delta < min_period || delta > max_period {
                debug!(
                    timestamp,
                    delta, "rejecting vsync sample outside period bounds"
                );
                self.rejected_outlier = true;
                return false;
            }
        }

        if self.samples.len() >= HISTORY_SIZE {
            self.samples.pop_front();
        }
        self.samples.push_back(timestamp);
        self.rejected_outlier = false;
        self.refit();
        true
    }

    fn next_anticipated_vsync_from(&self, time_point: Nanos) -> Nanos {
        let Model { period, phase } = self.effective_model();

        let mut ordinal = ((time_point as f64 - phase) / period).ceil();
        // Guard against floating point landing one grid point off.
        if ((phase + (ordinal - 1.0) * period).round() as Nanos) >= time_point {
            ordinal -= 1.0;
        }
        let mut vsync = (phase + ordinal * period).round() as Nanos;
        if vsync < time_point {
            vsync = (phase + (ordinal + 1.0) * period).round() as Nanos;
        }
        vsync
    }

    fn current_period(&self) -> Nanos {
        self.model
            .map(|m| m.period.round() as Nanos)
            .unwrap_or(self.ideal_period)
    }

    fn is_vsync_in_phase(&self, time_point: Nanos, fps: Fps) -> bool {
        let base = Fps::from_period(self.current_period());
        let divider = Fps::divider(base, fps);
        if divider <= 1 {
            return true;
        }

        let Model { period, phase } = self.effective_model();
        let ordinal = ((time_point as f64 - phase) / period).round();
        let error = time_point as f64 - (phase + ordinal * period);
        if error.abs() > period / PHASE_TOLERANCE_DIVISOR as f64 {
            return false;
        }
        (ordinal as i64).rem_euclid(divider) == 0
    }

    fn needs_more_samples(&self) -> bool {
        self.samples.len() < MIN_SAMPLES_FOR_PREDICTION || self.rejected_outlier
    }

    fn reset_model(&mut self) {
        debug!("resetting vsync model");
        self.samples.clear();
        self.model = None;
        self.rejected_outlier = false;
    }

    fn set_ideal_period(&mut self, period: Nanos) {
        self.ideal_period = period;
    }

    fn ideal_period(&self) -> Nanos {
        self.ideal_period
    }

    fn dump(&self, result: &mut String) {
        result.push_str(&format!(
            "  period: {}ns (ideal {}ns)\n  samples: {}\n  needs samples: {}\n",
            self.current_period(),
            self.ideal_period,
            self.samples.len(),
            self.needs_more_samples()
        ));
    }
}

/// Ordinary least squares over `(ordinal, time)` points.
/// Returns `(slope, intercept)`, or None for degenerate input.
fn linear_fit(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }

    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for &(x, y) in points {
        numerator += (x - mean_x) * (y - mean_y);
        denominator += (x - mean_x) * (x - mean_x);
    }
    if denominator == 0.0 {
        return None;
    }

    let slope = numerator / denominator;
    let intercept = mean_y - slope * mean_x;
    Some((slope, intercept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PERIOD_60HZ: Nanos = 16_666_667;

    fn predictor_with_samples(period: Nanos, count: usize) -> VsyncPredictor {
        let mut predictor = VsyncPredictor::new(period);
        for i in 0..count {
            assert!(predictor.add_sample(i as Nanos * period));
        }
        predictor
    }

    #[test]
    fn test_reports_ideal_period_before_enough_samples() {
        let predictor = predictor_with_samples(PERIOD_60HZ, MIN_SAMPLES_FOR_PREDICTION - 1);
        assert!(predictor.needs_more_samples());
        assert_eq!(predictor.current_period(), PERIOD_60HZ);
    }

    #[test]
    fn test_converges_on_regular_samples() {
        let predictor = predictor_with_samples(PERIOD_60HZ, 10);
        assert!(!predictor.needs_more_samples());

        let period = predictor.current_period();
        let error = (period - PERIOD_60HZ).abs() as f64 / PERIOD_60HZ as f64;
        assert!(error < 0.001, "period {} too far from 60Hz", period);
    }

    #[test]
    fn test_next_anticipated_vsync_lands_on_grid() {
        let predictor = predictor_with_samples(PERIOD_60HZ, 10);

        // 50ms falls just before the third grid point at 50,000,001ns.
        assert_eq!(predictor.next_anticipated_vsync_from(50_000_000), 50_000_001);
        // A time exactly on the grid predicts itself.
        assert_eq!(predictor.next_anticipated_vsync_from(50_000_001), 50_000_001);
        // Just past a vsync rolls to the next one.
        assert_eq!(
            predictor.next_anticipated_vsync_from(50_000_002),
            50_000_001 + PERIOD_60HZ
        );
    }

    #[test]
    fn test_prediction_without_model_uses_ideal_grid() {
        let mut predictor = VsyncPredictor::new(PERIOD_60HZ);
        predictor.add_sample(0);
        assert_eq!(
            predictor.next_anticipated_vsync_from(1_000_000),
            PERIOD_60HZ
        );
    }

    #[test]
    fn test_rejects_sample_outside_period_bounds() {
        let mut predictor = predictor_with_samples(PERIOD_60HZ, 10);
        let period_before = predictor.current_period();
        let newest = 9 * PERIOD_60HZ;

        // Implied period of 1ms is below ideal/4.
        assert!(!predictor.add_sample(newest + 1_000_000));
        // Implied period of 100ms is above 4x ideal.
        assert!(!predictor.add_sample(newest + 100_000_000));

        // Rejection leaves the model untouched but is visible through
        // needs_more_samples until the next accepted sample.
        assert_eq!(predictor.current_period(), period_before);
        assert!(predictor.needs_more_samples());

        assert!(predictor.add_sample(newest + PERIOD_60HZ));
        assert!(!predictor.needs_more_samples());
    }

    #[test]
    fn test_outlier_trimming_absorbs_jitter_spike() {
        let mut predictor = VsyncPredictor::new(PERIOD_60HZ);
        for i in 0..20 {
            let jitter = if i == 7 { 2_000_000 } else { 0 };
            predictor.add_sample(i * PERIOD_60HZ + jitter);
        }

        let period = predictor.current_period();
        let error = (period - PERIOD_60HZ).abs() as f64 / PERIOD_60HZ as f64;
        assert!(error < 0.01, "period {} degraded by one outlier", period);
    }

    #[test]
    fn test_reset_model_reverts_to_ideal() {
        let mut predictor = predictor_with_samples(PERIOD_60HZ, 10);
        predictor.reset_model();

        assert!(predictor.needs_more_samples());
        assert_eq!(predictor.current_period(), PERIOD_60HZ);
    }

    #[test]
    fn test_in_phase_follows_divider() {
        // 120Hz display.
        let period = 8_333_333;
        let predictor = predictor_with_samples(period, 10);
        let base = predictor.next_anticipated_vsync_from(100_000_000);

        // Walk 8 consecutive predicted vsyncs; a 30Hz subscriber sees every
        // 4th, a 60Hz subscriber every 2nd, full rate sees all.
        let mut hits_30 = Vec::new();
        let mut hits_60 = Vec::new();
        let mut vsync = base;
        for i in 0..8 {
            if predictor.is_vsync_in_phase(vsync, Fps::from_hz(30.0)) {
                hits_30.push(i);
            }
            if predictor.is_vsync_in_phase(vsync, Fps::from_hz(60.0)) {
                hits_60.push(i);
            }
            assert!(predictor.is_vsync_in_phase(vsync, Fps::from_hz(120.0)));
            vsync = predictor.next_anticipated_vsync_from(vsync + 1);
        }

        assert_eq!(hits_30.len(), 2);
        assert_eq!(hits_30[1] - hits_30[0], 4);
        assert_eq!(hits_60.len(), 4);
        assert_eq!(hits_60[1] - hits_60[0], 2);

        // 60Hz vsyncs are a superset of 30Hz ones.
        for hit in &hits_30 {
            assert!(hits_60.contains(hit));
        }
    }

    #[test]
    fn test_in_phase_rejects_midpoint_times() {
        let predictor = predictor_with_samples(PERIOD_60HZ, 10);
        let vsync = predictor.next_anticipated_vsync_from(100_000_000);
        let midpoint = vsync + PERIOD_60HZ / 2;
        assert!(!predictor.is_vsync_in_phase(midpoint, Fps::from_hz(30.0)));
    }

    proptest! {
        #[test]
        fn prop_period_always_within_bounds(
            deltas in prop::collection::vec(1_000_000i64..=80_000_000, 1..40)
        ) {
            let mut predictor = VsyncPredictor::new(PERIOD_60HZ);
            let mut t = 0;
            for delta in deltas {
                t += delta;
                predictor.add_sample(t);
                let period = predictor.current_period();
                prop_assert!(period >= PERIOD_60HZ / 4);
                prop_assert!(period <= PERIOD_60HZ * 4);
            }
        }

        #[test]
        fn prop_converges_to_actual_period(offset in -0.1f64..=0.1) {
            let actual = (PERIOD_60HZ as f64 * (1.0 + offset)) as Nanos;
            let mut predictor = VsyncPredictor::new(PERIOD_60HZ);
            for i in 0..20 {
                predictor.add_sample(i * actual);
            }

            let period = predictor.current_period();
            let error = (period - actual).abs() as f64 / actual as f64;
            prop_assert!(error < 0.01, "estimate {} vs actual {}", period, actual);
        }

        #[test]
        fn prop_next_vsync_never_before_query(
            query in 0i64..=2_000_000_000,
            samples in 6usize..=20,
        ) {
            let predictor = predictor_with_samples(PERIOD_60HZ, samples);
            let vsync = predictor.next_anticipated_vsync_from(query);
            prop_assert!(vsync >= query);
            prop_assert!(vsync - query <= predictor.current_period() + 1);
        }
    }
}
