//! Display composition scheduler.
//!
//! Decides what refresh rate the display should run at, wakes vsync
//! subscribers at the right moments, and keeps a predictive model of the
//! display's vsync cadence aligned with hardware reality.
//!
//! Three subsystems form the core:
//!
//! - [`tracker::VsyncPredictor`] fits a `t = phase + k * period` model to
//!   hardware vsync timestamps and present-fence completion times;
//! - [`dispatch::VsyncDispatch`] wakes callback holders at
//!   `vsync - (work + ready)` on a dedicated timer thread, continuously
//!   revised as the model shifts;
//! - [`policy::RefreshRatePolicy`] turns per-layer frame rate votes and the
//!   touch/idle/power signals into a display mode choice and per-uid
//!   throttling decisions.
//!
//! The [`scheduler::Scheduler`] façade owns all of them and talks to the
//! host compositor through [`scheduler::SchedulerCallback`].

pub mod clock;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod display_mode;
pub mod error;
pub mod event_thread;
pub mod layer_history;
pub mod logging;
pub mod one_shot_timer;
pub mod policy;
pub mod scheduler;
pub mod tracker;

pub use clock::{Clock, ManualClock, MonotonicClock, Nanos};
pub use config::{OptionsManager, SchedulerOptions};
pub use controller::{PresentFence, VsyncController};
pub use dispatch::{ScheduleTiming, VsyncCallbackRegistration, VsyncDispatch};
pub use display_mode::{DisplayMode, DisplayModeId, Fps, FrameRateOverride, LayerId, Uid};
pub use error::{ConfigError, InjectionError, LoggingError, SchedulerError};
pub use event_thread::{DisplayEvent, EventConnection, EventRegistrationFlags, EventThread};
pub use logging::{init_logging, init_logging_to, LogGuard};
pub use layer_history::{LayerHistory, LayerUpdateType, LayerVoteType, WindowType};
pub use policy::{ConsideredSignals, GlobalSignals, RefreshRatePolicy, TimerState};
pub use scheduler::{
    ConnectionHandle, DisplayStatInfo, ModeEvent, Scheduler, SchedulerCallback,
    VsyncPeriodChangeTimeline,
};
pub use tracker::{VsyncPredictor, VsyncTracker};
