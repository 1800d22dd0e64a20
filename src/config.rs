//! Configuration module for persistent scheduler options.
//!
//! This module handles loading, saving, and validating the startup options
//! of the scheduler. All timers are optional; an interval of 0 disables the
//! corresponding timer.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Upper bound for timer intervals, in milliseconds.
const MAX_TIMER_MS: u64 = 60_000;

/// Scheduler startup options.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SchedulerOptions {
    /// Use the kernel idle timer flavor of the idle callback.
    pub support_kernel_timer: bool,
    /// Derive refresh rate votes from layer content.
    pub use_content_detection: bool,
    /// Idle timer interval in milliseconds, 0 to disable.
    pub idle_timer_ms: u64,
    /// Touch timer interval in milliseconds, 0 to disable.
    pub touch_timer_ms: u64,
    /// Display power timer interval in milliseconds, 0 to disable.
    pub display_power_timer_ms: u64,
    /// Emit a trace point on every predicted vsync.
    #[serde(default)]
    pub show_predicted_vsync: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            support_kernel_timer: false,
            use_content_detection: true,
            idle_timer_ms: 0,
            touch_timer_ms: 0,
            display_power_timer_ms: 0,
            show_predicted_vsync: false,
        }
    }
}

impl SchedulerOptions {
    /// Validate option values.
    /// Returns Ok(()) if valid, Err with descriptive message if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, millis) in [
            ("idle_timer_ms", self.idle_timer_ms),
            ("touch_timer_ms", self.touch_timer_ms),
            ("display_power_timer_ms", self.display_power_timer_ms),
        ] {
            if millis > MAX_TIMER_MS {
                return Err(ConfigError::ValidationError(format!(
                    "{} ({}) must not exceed {}ms",
                    name, millis, MAX_TIMER_MS
                )));
            }
        }

        Ok(())
    }
}

/// Options manager with file I/O.
pub struct OptionsManager {
    options: RwLock<SchedulerOptions>,
    path: PathBuf,
}

impl OptionsManager {
    /// Load options from file or use defaults.
    /// If the file doesn't exist, returns a manager with default options.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let options = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                ConfigError::ParseError(format!("Failed to read options file: {}", e))
            })?;

            let options: SchedulerOptions = serde_json::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(format!("Invalid JSON: {}", e)))?;

            // Validate loaded options
            options.validate()?;
            options
        } else {
            SchedulerOptions::default()
        };

        Ok(Self {
            options: RwLock::new(options),
            path: path.to_path_buf(),
        })
    }

    /// Save options to file using atomic write.
    pub fn save(&self) -> Result<(), ConfigError> {
        let options = self
            .options
            .read()
            .map_err(|_| ConfigError::ValidationError("Failed to acquire read lock".to_string()))?;

        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&*options)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize options: {}", e)))?;

        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Get the current options.
    pub fn get(&self) -> SchedulerOptions {
        self.options
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Replace the current options after validation.
    pub fn set(&self, options: SchedulerOptions) -> Result<(), ConfigError> {
        options.validate()?;
        if let Ok(mut guard) = self.options.write() {
            *guard = options;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        assert!(SchedulerOptions::default().validate().is_ok());
    }

    #[test]
    fn test_oversized_timer_rejected() {
        let options = SchedulerOptions {
            idle_timer_ms: MAX_TIMER_MS + 1,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let manager =
            OptionsManager::load_or_default(Path::new("/nonexistent/options.json")).unwrap();
        assert_eq!(manager.get(), SchedulerOptions::default());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = std::env::temp_dir().join("vsync-scheduler-test-config");
        let path = dir.join("options.json");
        let _ = fs::remove_file(&path);

        let manager = OptionsManager::load_or_default(&path).unwrap();
        let options = SchedulerOptions {
            support_kernel_timer: true,
            idle_timer_ms: 80,
            touch_timer_ms: 200,
            ..Default::default()
        };
        manager.set(options.clone()).unwrap();
        manager.save().unwrap();

        let reloaded = OptionsManager::load_or_default(&path).unwrap();
        assert_eq!(reloaded.get(), options);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_set_validates() {
        let manager =
            OptionsManager::load_or_default(Path::new("/nonexistent/options.json")).unwrap();
        let bad = SchedulerOptions {
            touch_timer_ms: MAX_TIMER_MS * 2,
            ..Default::default()
        };
        assert!(manager.set(bad).is_err());
        assert_eq!(manager.get(), SchedulerOptions::default());
    }
}
