//! General-purpose DAQ box driver.
//!
//! SCPI-flavored analog input reads: `MEAS? ai0` returns one sampled value
//! on the named input. Only the sample rate is configurable; everything
//! else lives in vendor firmware.

use async_trait::async_trait;
use log::info;

use crate::core::{DeviceAdapter, DeviceClass, DeviceDescriptor, DeviceState, ParamMap, Sample};
use crate::error::{SuiteError, SuiteResult};
use crate::transport::Transport;

pub struct DaqBox {
    name: String,
    unit: String,
    state: DeviceState,
    transport: Box<dyn Transport>,
}

impl DaqBox {
    pub fn new(descriptor: &DeviceDescriptor, transport: Box<dyn Transport>) -> Self {
        Self {
            name: descriptor.name.clone(),
            unit: descriptor.unit.clone(),
            state: DeviceState::Disconnected,
            transport,
        }
    }
}

#[async_trait]
impl DeviceAdapter for DaqBox {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> DeviceClass {
        DeviceClass::Daq
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
                info!("daq '{}' connected: {}", self.name, idn);
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
                "sample_rate_hz" => {
                    let hz = value.as_f64().filter(|hz| *hz > 0.0).ok_or_else(|| {
                        SuiteError::Configuration {
                            device: self.name.clone(),
                            message: "sample_rate_hz must be positive".into(),
                        }
                    })?;
                    self.transport.send(&format!("RATE {}", hz)).await?;
                }
                other => {
                    return Err(SuiteError::Configuration {
                        device: self.name.clone(),
                        message: format!("unsupported option '{}' for a daq box", other),
                    });
                }
            }
        }
        Ok(())
    }

    async fn read(&mut self, channel: &str) -> SuiteResult<Sample> {
        if !channel.starts_with("ai") {
            return Err(SuiteError::Configuration {
                device: self.name.clone(),
                message: format!("unknown daq channel '{}'; expected ai<N>", channel),
            });
        }
        let response = self.transport.query(&format!("MEAS? {}", channel)).await?;
        let value = response
            .trim()
            .parse::<f64>()
            .map_err(|_| SuiteError::Connection {
                device: self.name.clone(),
                message: format!("unparseable measurement response: '{}'", response),
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
