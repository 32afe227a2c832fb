//! Motorized linear stage driver.
//!
//! Speaks an ESP300-style command set: `xPA` for absolute moves, `xTP` for
//! position queries, `xVA` for velocity. A move is issued once and then the
//! position is polled until it settles within tolerance; a stage that never
//! settles fails with a motion timeout after the configured deadline.
//!
//! ## Options
//!
//! ```toml
//! [devices.options]
//! axis = 1
//! velocity = 5.0            # units/s
//! min_position = 0.0
//! max_position = 100.0
//! poll_interval_ms = 50
//! settle_timeout_ms = 5000
//! ```

use async_trait::async_trait;
use log::{info, warn};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::core::{DeviceAdapter, DeviceClass, DeviceDescriptor, DeviceState, ParamMap, Sample};
use crate::error::{SuiteError, SuiteResult};
use crate::transport::Transport;

pub struct LinearStage {
    name: String,
    unit: String,
    state: DeviceState,
    transport: Box<dyn Transport>,
    axis: usize,
    min_position: f64,
    max_position: f64,
    poll_interval: Duration,
    settle_timeout: Duration,
}

impl LinearStage {
    pub fn new(descriptor: &DeviceDescriptor, transport: Box<dyn Transport>) -> Self {
        Self {
            name: descriptor.name.clone(),
            unit: descriptor.unit.clone(),
            state: DeviceState::Disconnected,
            transport,
            axis: 1,
            min_position: 0.0,
            max_position: 100.0,
            poll_interval: Duration::from_millis(50),
            settle_timeout: Duration::from_secs(5),
        }
    }

    async fn query_position(&mut self) -> SuiteResult<f64> {
        let response = self.transport.query(&format!("{}TP", self.axis)).await?;
        response.parse::<f64>().map_err(|_| {
            self.state = DeviceState::Error;
            SuiteError::Connection {
                device: self.name.clone(),
                message: format!("unparseable position response: '{}'", response),
            }
        })
    }

    fn check_limits(&self, target: f64) -> SuiteResult<()> {
        if target < self.min_position || target > self.max_position {
            return Err(SuiteError::Configuration {
                device: self.name.clone(),
                message: format!(
                    "target {} outside travel range [{}, {}]",
                    target, self.min_position, self.max_position
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceAdapter for LinearStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> DeviceClass {
        DeviceClass::Stage
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    async fn connect(&mut self) -> SuiteResult<()> {
        self.state = DeviceState::Connecting;
        self.transport.connect().await.map_err(|e| {
            self.state = DeviceState::Error;
            e
        })?;

        // Controllers that power up mid-move answer the version query late;
        // treat any failure here as an unreachable device.
        match self.transport.query("VE").await {
            Ok(version) => {
                info!("stage '{}' connected: {}", self.name, version);
                self.state = DeviceState::Idle;
                Ok(())
            }
            Err(e) => {
                self.state = DeviceState::Error;
                let _ = self.transport.disconnect().await;
                Err(SuiteError::Connection {
                    device: self.name.clone(),
                    message: format!("no response to version query: {}", e),
                })
            }
        }
    }

    async fn configure(&mut self, options: &ParamMap) -> SuiteResult<()> {
        for (key, value) in options {
            match key.as_str() {
                "axis" => {
                    let axis = value.as_i64().filter(|a| (1..=3).contains(a));
                    self.axis = axis.ok_or_else(|| SuiteError::Configuration {
                        device: self.name.clone(),
                        message: format!("axis must be 1-3, got {:?}", value),
                    })? as usize;
                }
                "velocity" => {
                    let velocity =
                        value
                            .as_f64()
                            .filter(|v| *v > 0.0)
                            .ok_or_else(|| SuiteError::Configuration {
                                device: self.name.clone(),
                                message: format!("velocity must be positive, got {:?}", value),
                            })?;
                    self.transport
                        .send(&format!("{}VA{}", self.axis, velocity))
                        .await?;
                }
                "min_position" => {
                    self.min_position =
                        value.as_f64().ok_or_else(|| SuiteError::Configuration {
                            device: self.name.clone(),
                            message: "min_position must be a number".into(),
                        })?;
                }
                "max_position" => {
                    self.max_position =
                        value.as_f64().ok_or_else(|| SuiteError::Configuration {
                            device: self.name.clone(),
                            message: "max_position must be a number".into(),
                        })?;
                }
                "poll_interval_ms" => {
                    let ms = value.as_i64().filter(|v| *v > 0).ok_or_else(|| {
                        SuiteError::Configuration {
                            device: self.name.clone(),
                            message: "poll_interval_ms must be a positive integer".into(),
                        }
                    })?;
                    self.poll_interval = Duration::from_millis(ms as u64);
                }
                "settle_timeout_ms" => {
                    let ms = value.as_i64().filter(|v| *v > 0).ok_or_else(|| {
                        SuiteError::Configuration {
                            device: self.name.clone(),
                            message: "settle_timeout_ms must be a positive integer".into(),
                        }
                    })?;
                    self.settle_timeout = Duration::from_millis(ms as u64);
                }
                other => {
                    return Err(SuiteError::Configuration {
                        device: self.name.clone(),
                        message: format!("unsupported option '{}' for a stage", other),
                    });
                }
            }
        }
        Ok(())
    }

    async fn read(&mut self, channel: &str) -> SuiteResult<Sample> {
        if channel != "position" {
            return Err(SuiteError::Configuration {
                device: self.name.clone(),
                message: format!("unknown stage channel '{}'", channel),
            });
        }
        let position = self.query_position().await?;
        Ok(Sample {
            channel: channel.to_string(),
            value: position,
            unit: self.unit.clone(),
        })
    }

    async fn move_to(&mut self, target: f64, tolerance: f64) -> SuiteResult<()> {
        self.check_limits(target)?;

        self.transport
            .send(&format!("{}PA{}", self.axis, target))
            .await?;

        let start = Instant::now();
        loop {
            sleep(self.poll_interval).await;

            let position = self.query_position().await?;
            if (position - target).abs() <= tolerance {
                info!(
                    "stage '{}' settled at {} {} (target {})",
                    self.name, position, self.unit, target
                );
                return Ok(());
            }

            if start.elapsed() > self.settle_timeout {
                warn!(
                    "stage '{}' stuck at {} {} short of {}",
                    self.name, position, self.unit, target
                );
                return Err(SuiteError::MotionTimeout {
                    device: self.name.clone(),
                    target,
                    elapsed: start.elapsed(),
                });
            }
        }
    }

    async fn disconnect(&mut self) -> SuiteResult<()> {
        self.transport.disconnect().await?;
        self.state = DeviceState::Disconnected;
        Ok(())
    }
}
