//! Fiber spectrometer driver.
//!
//! Exposes integration-time control and per-pixel intensity reads within a
//! configured wavelength window. Channels are pixel indices ("0", "1", ...)
//! relative to the window. Peak fitting and width extraction live with the
//! analysis collaborators, not here.

use async_trait::async_trait;
use log::info;

use crate::core::{DeviceAdapter, DeviceClass, DeviceDescriptor, DeviceState, ParamMap, Sample};
use crate::error::{SuiteError, SuiteResult};
use crate::transport::Transport;

pub struct FiberSpectrometer {
    name: String,
    unit: String,
    state: DeviceState,
    transport: Box<dyn Transport>,
    window_nm: (f64, f64),
}

impl FiberSpectrometer {
    pub fn new(descriptor: &DeviceDescriptor, transport: Box<dyn Transport>) -> Self {
        Self {
            name: descriptor.name.clone(),
            unit: descriptor.unit.clone(),
            state: DeviceState::Disconnected,
            transport,
            window_nm: (765.0, 785.0),
        }
    }

    fn pixel_index(&self, channel: &str) -> SuiteResult<u32> {
        channel.parse::<u32>().map_err(|_| SuiteError::Configuration {
            device: self.name.clone(),
            message: format!("spectrometer channel must be a pixel index, got '{}'", channel),
        })
    }
}

#[async_trait]
impl DeviceAdapter for FiberSpectrometer {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> DeviceClass {
        DeviceClass::Spectrometer
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

        match self.transport.query("*IDN?").await {
            Ok(idn) => {
                info!("spectrometer '{}' connected: {}", self.name, idn);
                self.state = DeviceState::Idle;
                Ok(())
            }
            Err(e) => {
                self.state = DeviceState::Error;
                let _ = self.transport.disconnect().await;
                Err(SuiteError::Connection {
                    device: self.name.clone(),
                    message: format!("no response to identification query: {}", e),
                })
            }
        }
    }

    async fn configure(&mut self, options: &ParamMap) -> SuiteResult<()> {
        for (key, value) in options {
            match key.as_str() {
                "integration_time_us" => {
                    let us = value.as_i64().filter(|us| *us >= 1000).ok_or_else(|| {
                        SuiteError::Configuration {
                            device: self.name.clone(),
                            message: "integration_time_us must be at least 1000".into(),
                        }
                    })?;
                    self.transport.send(&format!("INT {}", us)).await?;
                }
                "window_min_nm" => {
                    self.window_nm.0 =
                        value.as_f64().ok_or_else(|| SuiteError::Configuration {
                            device: self.name.clone(),
                            message: "window_min_nm must be a number".into(),
                        })?;
                    let (min, max) = self.window_nm;
                    self.transport.send(&format!("WIN {},{}", min, max)).await?;
                }
                "window_max_nm" => {
                    self.window_nm.1 =
                        value.as_f64().ok_or_else(|| SuiteError::Configuration {
                            device: self.name.clone(),
                            message: "window_max_nm must be a number".into(),
                        })?;
                    let (min, max) = self.window_nm;
                    self.transport.send(&format!("WIN {},{}", min, max)).await?;
                }
                other => {
                    return Err(SuiteError::Configuration {
                        device: self.name.clone(),
                        message: format!("unsupported option '{}' for a spectrometer", other),
                    });
                }
            }
        }
        Ok(())
    }

    async fn read(&mut self, channel: &str) -> SuiteResult<Sample> {
        let pixel = self.pixel_index(channel)?;
        let response = self.transport.query(&format!("PIX? {}", pixel)).await?;
        let value = response
            .trim()
            .parse::<f64>()
            .map_err(|_| SuiteError::Connection {
                device: self.name.clone(),
                message: format!("unparseable intensity response: '{}'", response),
            })?;
        Ok(Sample {
            channel: channel.to_string(),
            value,
            unit: self.unit.clone(),
        })
    }

    async fn disconnect(&mut self) -> SuiteResult<()> {
        self.transport.disconnect().await?;
        self.state = DeviceState::Disconnected;
        Ok(())
    }
}
