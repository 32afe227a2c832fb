//! RS-232 transport over the `serialport` crate.
//!
//! Serial I/O is synchronous, so every operation runs on Tokio's blocking
//! executor. The port handle lives behind `Arc<Mutex>` because the write
//! and read halves of a query must happen under one guard while the async
//! wrapper awaits the blocking task.

use async_trait::async_trait;
use log::debug;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task;

use super::{Transport, TransportSettings};
use crate::error::{SuiteError, SuiteResult};

const LINE_TERMINATOR: &str = "\r\n";
const RESPONSE_DELIMITER: u8 = b'\n';

/// Serial transport for RS-232 instruments.
pub struct SerialTransport {
    settings: TransportSettings,
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            port: None,
        }
    }

    fn port(&self) -> SuiteResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port.clone().ok_or_else(|| SuiteError::Connection {
            device: self.settings.endpoint.clone(),
            message: "serial port not open".to_string(),
        })
    }

    fn lock_port(
        port: &Arc<Mutex<Box<dyn SerialPort>>>,
        endpoint: &str,
    ) -> SuiteResult<std::sync::MutexGuard<'_, Box<dyn SerialPort>>> {
        port.lock().map_err(|_| SuiteError::Connection {
            device: endpoint.to_string(),
            message: "serial port mutex poisoned".to_string(),
        })
    }

    fn write_command(
        guard: &mut Box<dyn SerialPort>,
        endpoint: &str,
        command: &str,
    ) -> SuiteResult<()> {
        let framed = format!("{}{}", command, LINE_TERMINATOR);
        guard
            .write_all(framed.as_bytes())
            .and_then(|()| guard.flush())
            .map_err(|e| SuiteError::Connection {
                device: endpoint.to_string(),
                message: format!("serial write failed: {}", e),
            })?;
        debug!("serial {} <- {}", endpoint, command);
        Ok(())
    }

    fn read_line(
        guard: &mut Box<dyn SerialPort>,
        endpoint: &str,
        deadline: Duration,
    ) -> SuiteResult<String> {
        let mut response = Vec::new();
        let mut buffer = [0u8; 1];
        let start = Instant::now();

        loop {
            if start.elapsed() > deadline {
                return Err(SuiteError::ReadTimeout {
                    device: endpoint.to_string(),
                    after: deadline,
                });
            }

            match guard.read(&mut buffer) {
                Ok(1) => {
                    if buffer[0] == RESPONSE_DELIMITER {
                        break;
                    }
                    response.push(buffer[0]);
                }
                Ok(_) => {
                    return Err(SuiteError::Connection {
                        device: endpoint.to_string(),
                        message: "unexpected EOF on serial port".to_string(),
                    });
                }
                // The port's own timeout is shorter than the query deadline;
                // keep polling until the deadline expires.
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    return Err(SuiteError::Connection {
                        device: endpoint.to_string(),
                        message: format!("serial read failed: {}", e),
                    });
                }
            }
        }

        let line = String::from_utf8_lossy(&response).trim().to_string();
        debug!("serial {} -> {}", endpoint, line);
        Ok(line)
    }

    async fn run_blocking<T, F>(&self, op: F) -> SuiteResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> SuiteResult<T> + Send + 'static,
    {
        task::spawn_blocking(op)
            .await
            .map_err(|e| SuiteError::Connection {
                device: self.settings.endpoint.clone(),
                message: format!("serial I/O task failed: {}", e),
            })?
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn connect(&mut self) -> SuiteResult<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let endpoint = self.settings.endpoint.clone();
        let baud_rate = self.settings.baud_rate;
        let port = self
            .run_blocking(move || {
                serialport::new(&endpoint, baud_rate)
                    // Short internal timeout; the query deadline governs
                    .timeout(Duration::from_millis(50))
                    .open()
                    .map_err(|e| SuiteError::Connection {
                        device: endpoint.clone(),
                        message: format!("failed to open at {} baud: {}", baud_rate, e),
                    })
            })
            .await?;

        self.port = Some(Arc::new(Mutex::new(port)));
        debug!(
            "serial port '{}' opened at {} baud",
            self.settings.endpoint, self.settings.baud_rate
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> SuiteResult<()> {
        if self.port.take().is_some() {
            debug!("serial port '{}' closed", self.settings.endpoint);
        }
        Ok(())
    }

    async fn send(&mut self, command: &str) -> SuiteResult<()> {
        let port = self.port()?;
        let endpoint = self.settings.endpoint.clone();
        let command = command.to_string();

        self.run_blocking(move || {
            let mut guard = Self::lock_port(&port, &endpoint)?;
            Self::write_command(&mut guard, &endpoint, &command)
        })
        .await
    }

    async fn query(&mut self, command: &str) -> SuiteResult<String> {
        let port = self.port()?;
        let endpoint = self.settings.endpoint.clone();
        let command = command.to_string();
        let deadline = self.settings.timeout;

        self.run_blocking(move || {
            let mut guard = Self::lock_port(&port, &endpoint)?;
            Self::write_command(&mut guard, &endpoint, &command)?;
            Self::read_line(&mut guard, &endpoint, deadline)
        })
        .await
    }
}
