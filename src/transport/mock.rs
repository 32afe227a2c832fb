//! In-memory transport with scripted responses.
//!
//! Drivers under test are fed canned response lines in FIFO order; every
//! command written is recorded so tests can assert the exact wire protocol.
//! Timeouts and connection drops are injected by queueing the corresponding
//! script entries instead of plain responses.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{Transport, TransportSettings};
use crate::error::{SuiteError, SuiteResult};

#[derive(Debug)]
enum Scripted {
    Line(String),
    Timeout,
    Drop(String),
}

#[derive(Default)]
struct Script {
    responses: VecDeque<Scripted>,
    sent: Vec<String>,
}

/// Scripted mock transport. Cloning shares the script, so a test can keep a
/// handle for assertions while the driver owns the transport.
#[derive(Clone)]
pub struct MockTransport {
    settings: TransportSettings,
    connected: bool,
    refuse_connect: bool,
    script: Arc<Mutex<Script>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            settings: TransportSettings::mock(),
            connected: false,
            refuse_connect: false,
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    /// Make the next `connect` fail as if the endpoint were claimed.
    pub fn refuse_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    /// Queue a response line for the next query.
    pub fn push_line(&self, line: &str) {
        if let Ok(mut script) = self.script.lock() {
            script.responses.push_back(Scripted::Line(line.to_string()));
        }
    }

    /// Queue a read timeout for the next query.
    pub fn push_timeout(&self) {
        if let Ok(mut script) = self.script.lock() {
            script.responses.push_back(Scripted::Timeout);
        }
    }

    /// Queue a connection drop for the next query.
    pub fn push_drop(&self, message: &str) {
        if let Ok(mut script) = self.script.lock() {
            script
                .responses
                .push_back(Scripted::Drop(message.to_string()));
        }
    }

    /// Commands written so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.script
            .lock()
            .map(|s| s.sent.clone())
            .unwrap_or_default()
    }

    fn record(&self, command: &str) {
        if let Ok(mut script) = self.script.lock() {
            script.sent.push(command.to_string());
        }
    }

    fn next_response(&self) -> SuiteResult<String> {
        let scripted = self
            .script
            .lock()
            .ok()
            .and_then(|mut s| s.responses.pop_front());
        match scripted {
            Some(Scripted::Line(line)) => Ok(line),
            Some(Scripted::Timeout) | None => Err(SuiteError::ReadTimeout {
                device: self.settings.endpoint.clone(),
                after: self.settings.timeout,
            }),
            Some(Scripted::Drop(message)) => Err(SuiteError::Connection {
                device: self.settings.endpoint.clone(),
                message,
            }),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> SuiteResult<()> {
        if self.refuse_connect {
            return Err(SuiteError::Connection {
                device: self.settings.endpoint.clone(),
                message: "endpoint refused connection".to_string(),
            });
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> SuiteResult<()> {
        self.connected = false;
        Ok(())
    }

    async fn send(&mut self, command: &str) -> SuiteResult<()> {
        if !self.connected {
            return Err(SuiteError::Connection {
                device: self.settings.endpoint.clone(),
                message: "not connected".to_string(),
            });
        }
        self.record(command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> SuiteResult<String> {
        if !self.connected {
            return Err(SuiteError::Connection {
                device: self.settings.endpoint.clone(),
                message: "not connected".to_string(),
            });
        }
        self.record(command);
        self.next_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_responses_in_fifo_order() {
        let mut transport = MockTransport::new();
        transport.push_line("1.0");
        transport.push_line("2.0");
        transport.connect().await.unwrap();

        assert_eq!(transport.query("TP").await.unwrap(), "1.0");
        assert_eq!(transport.query("TP").await.unwrap(), "2.0");
        assert_eq!(transport.sent(), vec!["TP", "TP"]);
    }

    #[tokio::test]
    async fn exhausted_script_times_out() {
        let mut transport = MockTransport::new();
        transport.connect().await.unwrap();
        let err = transport.query("D?").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn injected_drop_is_fatal() {
        let mut transport = MockTransport::new();
        transport.push_drop("cable pulled");
        transport.connect().await.unwrap();
        let err = transport.query("D?").await.unwrap_err();
        assert!(matches!(err, SuiteError::Connection { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn disconnected_transport_rejects_io() {
        let mut transport = MockTransport::new();
        assert!(transport.send("*IDN?").await.is_err());
        transport.connect().await.unwrap();
        transport.send("*IDN?").await.unwrap();
        transport.disconnect().await.unwrap();
        assert!(transport.query("*IDN?").await.is_err());
    }
}
