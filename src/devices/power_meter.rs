//! Optical power meter driver.
//!
//! Newport 1830-C style command set: `W{nm}` sets the calibration
//! wavelength, `R{code}` the range, `D?` queries one power sample. A single
//! `read` averages a configurable number of consecutive samples into one
//! value, which is how the instrument is used in practice — single samples
//! are too noisy to log.
//!
//! Meter fault sentinels (`ERR`, `OVER`, `UNDER`) reject the whole read;
//! an overranged detector must surface as an error, not as a bogus mean.

use async_trait::async_trait;
use log::info;

use crate::core::{DeviceAdapter, DeviceClass, DeviceDescriptor, DeviceState, ParamMap, Sample};
use crate::error::{SuiteError, SuiteResult};
use crate::transport::Transport;

/// Calibration range of the stock photodetector head.
const WAVELENGTH_RANGE_NM: (f64, f64) = (400.0, 1700.0);

/// Samples averaged per read unless configured otherwise.
const DEFAULT_SAMPLES: u32 = 30;

pub struct OpticalPowerMeter {
    name: String,
    unit: String,
    state: DeviceState,
    transport: Box<dyn Transport>,
    samples: u32,
    wavelength_nm: Option<f64>,
}

impl OpticalPowerMeter {
    pub fn new(descriptor: &DeviceDescriptor, transport: Box<dyn Transport>) -> Self {
        Self {
            name: descriptor.name.clone(),
            unit: descriptor.unit.clone(),
            state: DeviceState::Disconnected,
            transport,
            samples: DEFAULT_SAMPLES,
            wavelength_nm: None,
        }
    }

    fn parse_power(&self, response: &str) -> SuiteResult<f64> {
        let trimmed = response.trim();
        if trimmed.contains("ERR") || trimmed.contains("OVER") || trimmed.contains("UNDER") {
            return Err(SuiteError::Configuration {
                device: self.name.clone(),
                message: format!("meter fault response: {}", trimmed),
            });
        }
        // Handles scientific notation like "1.234E-03"
        trimmed.parse::<f64>().map_err(|_| SuiteError::Connection {
            device: self.name.clone(),
            message: format!("unparseable power response: '{}'", trimmed),
        })
    }

    fn validate_wavelength(&self, nm: f64) -> SuiteResult<()> {
        let (min, max) = WAVELENGTH_RANGE_NM;
        if nm < min || nm > max {
            return Err(SuiteError::Configuration {
                device: self.name.clone(),
                message: format!("wavelength {} nm outside detector range {}-{} nm", nm, min, max),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceAdapter for OpticalPowerMeter {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> DeviceClass {
        DeviceClass::PowerMeter
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

        match self.transport.query("U?").await {
            Ok(units) => {
                info!("power meter '{}' connected (units code {})", self.name, units);
                self.state = DeviceState::Idle;
                Ok(())
            }
            Err(e) => {
                self.state = DeviceState::Error;
                let _ = self.transport.disconnect().await;
                Err(SuiteError::Connection {
                    device: self.name.clone(),
                    message: format!("no response to units query: {}", e),
                })
            }
        }
    }

    async fn configure(&mut self, options: &ParamMap) -> SuiteResult<()> {
        for (key, value) in options {
            match key.as_str() {
                "wavelength" => {
                    let nm = value.as_f64().ok_or_else(|| SuiteError::Configuration {
                        device: self.name.clone(),
                        message: "wavelength must be a number".into(),
                    })?;
                    self.validate_wavelength(nm)?;
                    self.transport.send(&format!("W{}", nm)).await?;
                    self.wavelength_nm = Some(nm);
                }
                "range" => {
                    let code = value.as_i64().filter(|c| (0..=8).contains(c)).ok_or_else(
                        || SuiteError::Configuration {
                            device: self.name.clone(),
                            message: format!(
                                "range code must be 0 (auto) to 8, got {:?}",
                                value
                            ),
                        },
                    )?;
                    self.transport.send(&format!("R{}", code)).await?;
                }
                "samples" => {
                    self.samples = value.as_i64().filter(|s| *s >= 1).ok_or_else(|| {
                        SuiteError::Configuration {
                            device: self.name.clone(),
                            message: "samples must be a positive integer".into(),
                        }
                    })? as u32;
                }
                other => {
                    return Err(SuiteError::Configuration {
                        device: self.name.clone(),
                        message: format!("unsupported option '{}' for a power meter", other),
                    });
                }
            }
        }
        Ok(())
    }

    async fn read(&mut self, channel: &str) -> SuiteResult<Sample> {
        if channel != "power" {
            return Err(SuiteError::Configuration {
                device: self.name.clone(),
                message: format!("unknown power meter channel '{}'", channel),
            });
        }

        let mut total = 0.0;
        for _ in 0..self.samples {
            let response = self.transport.query("D?").await?;
            total += self.parse_power(&response)?;
        }

        Ok(Sample {
            channel: channel.to_string(),
            value: total / f64::from(self.samples),
            unit: self.unit.clone(),
        })
    }

    async fn disconnect(&mut self) -> SuiteResult<()> {
        self.transport.disconnect().await?;
        self.state = DeviceState::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, TransportSettings};

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            name: "pm1".into(),
            class: DeviceClass::PowerMeter,
            transport: TransportSettings::mock(),
            unit: "W".into(),
        }
    }

    async fn connected_meter(transport: MockTransport) -> OpticalPowerMeter {
        transport.push_line("0");
        let mut meter = OpticalPowerMeter::new(&descriptor(), Box::new(transport));
        meter.connect().await.unwrap();
        meter
    }

    #[tokio::test]
    async fn read_averages_configured_sample_count() {
        let transport = MockTransport::new();
        let handle = transport.clone();
        let mut meter = connected_meter(transport).await;

        let mut options = ParamMap::new();
        options.insert("samples".into(), 3i64.into());
        meter.configure(&options).await.unwrap();

        handle.push_line("1.0E-03");
        handle.push_line("2.0E-03");
        handle.push_line("3.0E-03");
        let sample = meter.read("power").await.unwrap();

        assert!((sample.value - 2.0e-3).abs() < 1e-12);
        assert_eq!(sample.unit, "W");
        assert_eq!(handle.sent().iter().filter(|c| *c == "D?").count(), 3);
    }

    #[tokio::test]
    async fn meter_fault_rejects_the_read() {
        let transport = MockTransport::new();
        let handle = transport.clone();
        let mut meter = connected_meter(transport).await;

        let mut options = ParamMap::new();
        options.insert("samples".into(), 2i64.into());
        meter.configure(&options).await.unwrap();

        handle.push_line("1.0E-03");
        handle.push_line("OVER");
        let err = meter.read("power").await.unwrap_err();
        assert!(matches!(err, SuiteError::Configuration { .. }));
    }

    #[tokio::test]
    async fn wavelength_is_validated_and_forwarded() {
        let transport = MockTransport::new();
        let handle = transport.clone();
        let mut meter = connected_meter(transport).await;

        let mut options = ParamMap::new();
        options.insert("wavelength".into(), 780.0.into());
        meter.configure(&options).await.unwrap();
        assert!(handle.sent().contains(&"W780".to_string()));

        let mut bad = ParamMap::new();
        bad.insert("wavelength".into(), 2100.0.into());
        assert!(meter.configure(&bad).await.is_err());
    }

    #[tokio::test]
    async fn sample_timeout_propagates_as_transient() {
        let transport = MockTransport::new();
        let handle = transport.clone();
        let mut meter = connected_meter(transport).await;

        let mut options = ParamMap::new();
        options.insert("samples".into(), 2i64.into());
        meter.configure(&options).await.unwrap();

        handle.push_line("1.0E-03");
        handle.push_timeout();
        let err = meter.read("power").await.unwrap_err();
        assert!(err.is_transient());
    }
}
