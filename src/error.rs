//! Error types for the acquisition core.
//!
//! All failures in the suite are expressed through [`SuiteError`], built with
//! `thiserror` so that errors compose with `?` across the adapter, registry,
//! scheduler and session layers.
//!
//! The scheduler cares about one distinction: **transient** errors
//! (timeouts that a retry may heal) versus everything else, which is fatal
//! on first occurrence. [`SuiteError::is_transient`] encodes that policy in
//! one place so retry behavior stays testable without hardware.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the suite error type.
pub type SuiteResult<T> = std::result::Result<T, SuiteError>;

#[derive(Error, Debug)]
pub enum SuiteError {
    /// The device is unreachable, already claimed, or dropped the channel.
    #[error("connection error on '{device}': {message}")]
    Connection { device: String, message: String },

    /// A device option was rejected, or a response did not make sense for
    /// the device's configuration.
    #[error("configuration error on '{device}': {message}")]
    Configuration { device: String, message: String },

    /// The device class does not implement this capability (e.g. `move`
    /// on a spectrometer).
    #[error("device '{device}' does not support operation '{operation}'")]
    UnsupportedOperation {
        device: String,
        operation: &'static str,
    },

    /// No response arrived within the device's read deadline.
    #[error("read timeout on '{device}' after {after:?}")]
    ReadTimeout { device: String, after: Duration },

    /// A stage failed to settle within tolerance before its deadline.
    #[error("motion timeout on '{device}': target {target} not reached within {elapsed:?}")]
    MotionTimeout {
        device: String,
        target: f64,
        elapsed: Duration,
    },

    /// A second registration was attempted under an existing logical name.
    #[error("device '{0}' is already registered")]
    DuplicateDevice(String),

    /// A command referenced a logical name with no live adapter.
    #[error("no device registered under '{0}'")]
    UnknownDevice(String),

    /// A scheduled capture step produced no matching reading; the repeat
    /// is discarded rather than padded with defaults.
    #[error("incomplete record for repeat {repeat}: missing {missing}")]
    IncompleteRecord { repeat: usize, missing: String },

    /// A sequence failed structural validation before execution.
    #[error("invalid acquisition sequence: {0}")]
    InvalidSequence(String),

    /// The run was cancelled cooperatively at a step boundary.
    #[error("run cancelled by operator")]
    Cancelled,

    /// A run aborted mid-flight; wraps the triggering cause.
    #[error("run aborted during repeat {repeat}")]
    RunAborted {
        repeat: usize,
        #[source]
        source: Box<SuiteError>,
    },

    /// Registry teardown completed, but some devices failed to disconnect.
    #[error("shutdown completed with {} device error(s)", .0.len())]
    Shutdown(Vec<SuiteError>),

    /// The session controller was asked for something its run state cannot
    /// honor (start while running, wait with no run).
    #[error("session error: {0}")]
    Session(String),

    /// Functionality compiled out by a cargo feature.
    #[error("feature '{0}' is not enabled. Rebuild with --features {0}")]
    FeatureDisabled(&'static str),

    #[error("configuration file error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SuiteError {
    /// Whether the scheduler may retry the failed operation.
    ///
    /// Only device timeouts qualify; registry errors, connection losses and
    /// record integrity failures always abort.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SuiteError::ReadTimeout { .. } | SuiteError::MotionTimeout { .. }
        )
    }

    /// The logical device name an error originates from, when there is one.
    pub fn device(&self) -> Option<&str> {
        match self {
            SuiteError::Connection { device, .. }
            | SuiteError::Configuration { device, .. }
            | SuiteError::UnsupportedOperation { device, .. }
            | SuiteError::ReadTimeout { device, .. }
            | SuiteError::MotionTimeout { device, .. } => Some(device),
            SuiteError::DuplicateDevice(name) | SuiteError::UnknownDevice(name) => Some(name),
            SuiteError::RunAborted { source, .. } => source.device(),
            _ => None,
        }
    }
}
