//! Display mode and frame rate types.
//!
//! `Fps` carries the margin-based equality used everywhere rates are
//! compared, plus the divider math behind per-uid frame rate overrides.

use crate::clock::{Nanos, NANOS_PER_SEC};
use serde::{Deserialize, Serialize};

/// Equality margin for frame rates, in Hz.
pub const FPS_EPSILON: f32 = 0.001;

/// A frame rate in Hz.
///
/// Two rates are considered equal when within [`FPS_EPSILON`] of each other;
/// use [`Fps::approx_eq`] (or `==`, which applies the margin) rather than
/// comparing raw values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Fps(f32);

impl Fps {
    pub fn from_hz(hz: f32) -> Self {
        Self(hz)
    }

    /// Rate whose vsync period is `period` nanoseconds.
    pub fn from_period(period: Nanos) -> Self {
        if period <= 0 {
            return Self(0.0);
        }
        Self(NANOS_PER_SEC as f32 / period as f32)
    }

    pub fn hz(self) -> f32 {
        self.0
    }

    /// Vsync period in nanoseconds, rounded.
    pub fn period(self) -> Nanos {
        if self.0 <= 0.0 {
            return 0;
        }
        (NANOS_PER_SEC as f64 / self.0 as f64).round() as Nanos
    }

    pub fn approx_eq(self, other: Fps) -> bool {
        (self.0 - other.0).abs() < FPS_EPSILON
    }

    pub fn greater_than_with_margin(self, other: Fps) -> bool {
        self.0 > other.0 + FPS_EPSILON
    }

    pub fn less_than_or_equal_with_margin(self, other: Fps) -> bool {
        self.0 <= other.0 + FPS_EPSILON
    }

    /// Integer divider that steps `base` down to `rate`.
    ///
    /// Returns 0 when `rate` does not cleanly divide `base` (within the
    /// equality margin), or when either rate is non-positive. A divider of 1
    /// means "no throttling".
    pub fn divider(base: Fps, rate: Fps) -> i64 {
        if base.0 <= 0.0 || rate.0 <= 0.0 {
            return 0;
        }
        let divider = (base.0 / rate.0).round() as i64;
        if divider < 1 {
            return 0;
        }
        let stepped = Fps(base.0 / divider as f32);
        if stepped.approx_eq(rate) {
            divider
        } else {
            0
        }
    }
}

impl PartialEq for Fps {
    fn eq(&self, other: &Self) -> bool {
        self.approx_eq(*other)
    }
}

impl std::fmt::Display for Fps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}Hz", self.0)
    }
}

/// Identifier of a display mode, immutable per id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DisplayModeId(pub u32);

/// A discrete refresh rate the hardware supports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayMode {
    pub id: DisplayModeId,
    pub fps: Fps,
    pub vsync_period: Nanos,
}

impl DisplayMode {
    pub fn new(id: u32, fps: f32) -> Self {
        let fps = Fps::from_hz(fps);
        Self {
            id: DisplayModeId(id),
            fps,
            vsync_period: fps.period(),
        }
    }
}

/// Application identifier used for per-uid frame rate overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(pub u32);

/// Identifier of a registered layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerId(pub u64);

/// Per-application cap on the delivered vsync rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameRateOverride {
    pub uid: Uid,
    pub fps: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fps_period_round_trip() {
        let fps = Fps::from_hz(60.0);
        assert_eq!(fps.period(), 16_666_667);
        assert!(Fps::from_period(16_666_667).approx_eq(fps));
    }

    #[test]
    fn test_fps_margin_equality() {
        assert_eq!(Fps::from_hz(60.0), Fps::from_hz(60.0005));
        assert_ne!(Fps::from_hz(60.0), Fps::from_hz(60.1));
    }

    #[test]
    fn test_divider_clean_multiples() {
        let base = Fps::from_hz(120.0);
        assert_eq!(Fps::divider(base, Fps::from_hz(120.0)), 1);
        assert_eq!(Fps::divider(base, Fps::from_hz(60.0)), 2);
        assert_eq!(Fps::divider(base, Fps::from_hz(30.0)), 4);
    }

    #[test]
    fn test_divider_rejects_uneven_rates() {
        let base = Fps::from_hz(120.0);
        assert_eq!(Fps::divider(base, Fps::from_hz(50.0)), 0);
        assert_eq!(Fps::divider(base, Fps::from_hz(0.0)), 0);
        assert_eq!(Fps::divider(Fps::from_hz(0.0), Fps::from_hz(60.0)), 0);
    }

    proptest! {
        #[test]
        fn prop_divider_is_exact_or_zero(base_hz in 10.0f32..=480.0, div in 1i64..=8) {
            let base = Fps::from_hz(base_hz);
            let rate = Fps::from_hz(base_hz / div as f32);
            prop_assert_eq!(Fps::divider(base, rate), div);
        }

        #[test]
        fn prop_period_inverts_rate(hz in 1.0f32..=480.0) {
            let fps = Fps::from_hz(hz);
            let back = Fps::from_period(fps.period());
            prop_assert!((back.hz() - hz).abs() < 0.01, "{} vs {}", back.hz(), hz);
        }
    }
}
