//! Low-level transport abstraction for instrument communication.
//!
//! Device drivers speak a line-oriented command/response protocol through
//! the [`Transport`] trait and never touch the wire directly. This is what
//! lets every driver be exercised against [`MockTransport`] in tests while
//! the same code runs over RS-232 in the lab.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SuiteResult;

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;

pub use mock::MockTransport;
#[cfg(feature = "instrument_serial")]
pub use serial::SerialTransport;

/// Connection parameters for one device channel.
///
/// Opaque to the orchestration layers; only the transport implementation
/// interprets it. An `endpoint` of the form `mock:*` selects the in-memory
/// transport in the default adapter factory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Port path or pseudo-endpoint (e.g. "/dev/ttyUSB0", "COM3", "mock:")
    pub endpoint: String,
    /// Baud rate for serial endpoints
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Response deadline for a single query
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout() -> Duration {
    Duration::from_millis(500)
}

impl TransportSettings {
    /// Settings for an in-memory endpoint, used by tests and demos.
    pub fn mock() -> Self {
        Self {
            endpoint: "mock:".to_string(),
            baud_rate: default_baud_rate(),
            timeout: default_timeout(),
        }
    }

    /// Whether the endpoint selects the in-memory transport.
    pub fn is_mock(&self) -> bool {
        self.endpoint.starts_with("mock:")
    }
}

/// Line-oriented command channel to one instrument.
///
/// Implementations are not internally synchronized; the owning adapter is
/// serialized by the registry's per-device lock.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the channel is currently open.
    fn is_connected(&self) -> bool;

    /// Open the channel. Fails with [`crate::error::SuiteError::Connection`]
    /// if the endpoint is unreachable or claimed elsewhere.
    async fn connect(&mut self) -> SuiteResult<()>;

    /// Close the channel. Idempotent.
    async fn disconnect(&mut self) -> SuiteResult<()>;

    /// Write one command without waiting for a response.
    async fn send(&mut self, command: &str) -> SuiteResult<()>;

    /// Write one command and read the response line, honoring the
    /// configured deadline.
    async fn query(&mut self, command: &str) -> SuiteResult<String>;
}
