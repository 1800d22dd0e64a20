//! Error types for the display scheduler.
//!
//! This module defines custom error enums for each component of the
//! scheduler, providing descriptive error messages with context information.

use crate::scheduler::ConnectionHandle;
use thiserror::Error;

/// Errors surfaced by the scheduler façade.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Unknown connection handle {0:?}")]
    InvalidHandle(ConnectionHandle),
}

/// Errors related to vsync injection.
#[derive(Error, Debug)]
pub enum InjectionError {
    #[error("VSYNC injection is not enabled")]
    NotEnabled,
}

/// Errors related to logging initialization.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Could not determine home directory (HOME or USERPROFILE not set)")]
    NoHomeDirectory,

    #[error("Failed to create log directory '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create log file appender: {0}")]
    CreateAppender(String),
}

/// Errors related to configuration management.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found at '{0}'")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Failed to write configuration: {0}")]
    WriteError(#[from] std::io::Error),
}
