//! Photon-counting card driver.
//!
//! Models a Logic16-class coincidence counter: input channels are selected
//! by bit masks (channel n encodes as 2^(n-1)), singles and one coincidence
//! group are accumulated over an integration window, and the window is read
//! out in short timeslices rather than one long gate.
//!
//! The timeslice readout exists because superconducting detectors latch: a
//! latched detector reports zero singles for the rest of the gate. A slice
//! whose singles all read zero is therefore discarded and the card buffer
//! cleared before continuing; too many consecutive latched slices escalate
//! to a read timeout so the scheduler's retry policy takes over.
//!
//! `trigger` runs one integration and returns the coincidence total; the
//! per-channel singles and the live counting time from the same integration
//! are then available through `read` ("singles:N", "elapsed").

use async_trait::async_trait;
use log::{info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

use crate::core::{DeviceAdapter, DeviceClass, DeviceDescriptor, DeviceState, ParamMap, Sample};
use crate::error::{SuiteError, SuiteResult};
use crate::transport::Transport;

const TOTAL_CHANNELS: i64 = 16;

/// Bit mask for a set of input channels; channel n encodes as 2^(n-1).
fn channel_mask(channels: &[i64]) -> i64 {
    channels.iter().map(|ch| 1 << (ch - 1)).sum()
}

fn validate_channels(device: &str, channels: &[i64]) -> SuiteResult<()> {
    if channels.is_empty() {
        return Err(SuiteError::Configuration {
            device: device.to_string(),
            message: "channel list is empty".into(),
        });
    }
    for ch in channels {
        if !(1..=TOTAL_CHANNELS).contains(ch) {
            return Err(SuiteError::Configuration {
                device: device.to_string(),
                message: format!("channel {} outside 1-{}", ch, TOTAL_CHANNELS),
            });
        }
    }
    Ok(())
}

pub struct PhotonCounter {
    name: String,
    unit: String,
    state: DeviceState,
    transport: Box<dyn Transport>,
    singles: Vec<i64>,
    integration_window: Duration,
    timeslice: Duration,
    max_latch_retries: u32,
    last_integration: HashMap<String, f64>,
}

impl PhotonCounter {
    pub fn new(descriptor: &DeviceDescriptor, transport: Box<dyn Transport>) -> Self {
        Self {
            name: descriptor.name.clone(),
            unit: descriptor.unit.clone(),
            state: DeviceState::Disconnected,
            transport,
            singles: vec![1, 2],
            integration_window: Duration::from_millis(500),
            timeslice: Duration::from_millis(100),
            max_latch_retries: 5,
            last_integration: HashMap::new(),
        }
    }

    /// Parse one timeslice line: `elapsed_s,s1,...,sN,coincidences`.
    fn parse_slice(&self, line: &str) -> SuiteResult<(f64, Vec<f64>, f64)> {
        let fields: Vec<&str> = line.split(',').collect();
        let expected = self.singles.len() + 2;
        if fields.len() != expected {
            return Err(SuiteError::Connection {
                device: self.name.clone(),
                message: format!(
                    "malformed slice '{}': expected {} fields, got {}",
                    line,
                    expected,
                    fields.len()
                ),
            });
        }

        let mut values = Vec::with_capacity(fields.len());
        for field in &fields {
            let value = field
                .trim()
                .parse::<f64>()
                .map_err(|_| SuiteError::Connection {
                    device: self.name.clone(),
                    message: format!("unparseable slice field '{}'", field),
                })?;
            values.push(value);
        }

        let elapsed = values[0];
        let coincidences = values[values.len() - 1];
        let singles = values[1..values.len() - 1].to_vec();
        Ok((elapsed, singles, coincidences))
    }

    fn ms_option(&self, value: &crate::core::ParamValue, key: &str) -> SuiteResult<Duration> {
        value
            .as_f64()
            .filter(|ms| *ms > 0.0)
            .map(Duration::from_secs_f64)
            .map(|d| d / 1000)
            .ok_or_else(|| SuiteError::Configuration {
                device: self.name.clone(),
                message: format!("{} must be a positive number of milliseconds", key),
            })
    }
}

#[async_trait]
impl DeviceAdapter for PhotonCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> DeviceClass {
        DeviceClass::Counter
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
                info!("counter '{}' connected: {}", self.name, idn);
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
                "singles" => {
                    let channels =
                        value
                            .as_i64_array()
                            .ok_or_else(|| SuiteError::Configuration {
                                device: self.name.clone(),
                                message: "singles must be a channel list".into(),
                            })?;
                    validate_channels(&self.name, channels)?;
                    self.singles = channels.to_vec();
                    let masks: Vec<String> = channels
                        .iter()
                        .map(|ch| channel_mask(&[*ch]).to_string())
                        .collect();
                    self.transport
                        .send(&format!("SGLS {}", masks.join(",")))
                        .await?;
                }
                "coincidence" => {
                    let channels =
                        value
                            .as_i64_array()
                            .ok_or_else(|| SuiteError::Configuration {
                                device: self.name.clone(),
                                message: "coincidence must be a channel list".into(),
                            })?;
                    validate_channels(&self.name, channels)?;
                    self.transport
                        .send(&format!("COIN {}", channel_mask(channels)))
                        .await?;
                }
                "coincidence_window_ns" => {
                    let ns = value.as_f64().filter(|ns| *ns > 0.0).ok_or_else(|| {
                        SuiteError::Configuration {
                            device: self.name.clone(),
                            message: "coincidence_window_ns must be positive".into(),
                        }
                    })?;
                    self.transport.send(&format!("WIND {}", ns)).await?;
                }
                "integration_window_ms" => {
                    self.integration_window = self.ms_option(value, key)?;
                }
                "timeslice_ms" => {
                    self.timeslice = self.ms_option(value, key)?;
                }
                "delay_ns" => {
                    let ns = value.as_i64().filter(|ns| *ns >= 0).ok_or_else(|| {
                        SuiteError::Configuration {
                            device: self.name.clone(),
                            message: "delay_ns must be a non-negative integer".into(),
                        }
                    })?;
                    for ch in 1..=TOTAL_CHANNELS {
                        self.transport.send(&format!("DELY {},{}", ch, ns)).await?;
                    }
                }
                "threshold" => {
                    let volts = value.as_f64().ok_or_else(|| SuiteError::Configuration {
                        device: self.name.clone(),
                        message: "threshold must be a number".into(),
                    })?;
                    for ch in 1..=TOTAL_CHANNELS {
                        self.transport
                            .send(&format!("THRE {},{}", ch, volts))
                            .await?;
                    }
                }
                "max_latch_retries" => {
                    self.max_latch_retries =
                        value.as_i64().filter(|v| *v >= 0).ok_or_else(|| {
                            SuiteError::Configuration {
                                device: self.name.clone(),
                                message: "max_latch_retries must be a non-negative integer".into(),
                            }
                        })? as u32;
                }
                other => {
                    return Err(SuiteError::Configuration {
                        device: self.name.clone(),
                        message: format!("unsupported option '{}' for a counter", other),
                    });
                }
            }
        }
        Ok(())
    }

    async fn read(&mut self, channel: &str) -> SuiteResult<Sample> {
        let value =
            self.last_integration
                .get(channel)
                .copied()
                .ok_or_else(|| SuiteError::Configuration {
                    device: self.name.clone(),
                    message: format!(
                        "channel '{}' has no completed integration; trigger the counter first",
                        channel
                    ),
                })?;
        let unit = if channel == "elapsed" {
            "s".to_string()
        } else {
            self.unit.clone()
        };
        Ok(Sample {
            channel: channel.to_string(),
            value,
            unit,
        })
    }

    async fn trigger(&mut self, params: &ParamMap) -> SuiteResult<Sample> {
        let window = match params.get("integration_window_ms") {
            Some(value) => self.ms_option(value, "integration_window_ms")?,
            None => self.integration_window,
        };

        self.transport.send("CLR").await?;

        let mut elapsed = 0.0_f64;
        let mut singles_totals = vec![0.0_f64; self.singles.len()];
        let mut coincidence_total = 0.0_f64;
        let mut consecutive_latches = 0u32;

        while elapsed < window.as_secs_f64() {
            sleep(self.timeslice).await;

            let line = self.transport.query("READ?").await?;
            let (slice_elapsed, singles, coincidences) = self.parse_slice(&line)?;

            // All singles dark in one slice means the detectors latched,
            // not that the source went away.
            if singles.iter().all(|s| *s == 0.0) {
                consecutive_latches += 1;
                if consecutive_latches > self.max_latch_retries {
                    warn!(
                        "counter '{}': {} consecutive latched slices, giving up",
                        self.name, consecutive_latches
                    );
                    return Err(SuiteError::ReadTimeout {
                        device: self.name.clone(),
                        after: window,
                    });
                }
                self.transport.send("CLR").await?;
                continue;
            }

            consecutive_latches = 0;
            for (total, slice) in singles_totals.iter_mut().zip(&singles) {
                *total += slice;
            }
            coincidence_total += coincidences;
            elapsed += slice_elapsed;
        }

        self.last_integration.clear();
        for (ch, total) in self.singles.iter().zip(&singles_totals) {
            self.last_integration
                .insert(format!("singles:{}", ch), *total);
        }
        self.last_integration
            .insert("coincidences".into(), coincidence_total);
        self.last_integration.insert("elapsed".into(), elapsed);

        info!(
            "counter '{}': {} coincidences in {:.3} s",
            self.name, coincidence_total, elapsed
        );

        Ok(Sample {
            channel: "coincidences".to_string(),
            value: coincidence_total,
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
            name: "tagger".into(),
            class: DeviceClass::Counter,
            transport: TransportSettings::mock(),
            unit: "counts".into(),
        }
    }

    async fn connected_counter(transport: MockTransport) -> PhotonCounter {
        transport.push_line("Logic16,FPGA 2.1");
        let mut counter = PhotonCounter::new(&descriptor(), Box::new(transport));
        counter.connect().await.unwrap();

        let mut options = ParamMap::new();
        options.insert("integration_window_ms".into(), 3.0.into());
        options.insert("timeslice_ms".into(), 1.0.into());
        counter.configure(&options).await.unwrap();
        counter
    }

    #[test]
    fn channel_masks_encode_as_powers_of_two() {
        assert_eq!(channel_mask(&[1]), 1);
        assert_eq!(channel_mask(&[4]), 8);
        assert_eq!(channel_mask(&[1, 2]), 3);
        assert_eq!(channel_mask(&[3, 5]), 20);
    }

    #[tokio::test]
    async fn trigger_accumulates_slices_and_caches_channels() {
        let transport = MockTransport::new();
        let handle = transport.clone();
        let mut counter = connected_counter(transport).await;

        handle.push_line("0.001,1500,1480,37");
        handle.push_line("0.001,1510,1490,41");
        handle.push_line("0.001,1490,1505,38");
        let sample = counter.trigger(&ParamMap::new()).await.unwrap();

        assert_eq!(sample.channel, "coincidences");
        assert_eq!(sample.value, 116.0);
        assert_eq!(sample.unit, "counts");

        assert_eq!(counter.read("singles:1").await.unwrap().value, 4500.0);
        assert_eq!(counter.read("singles:2").await.unwrap().value, 4475.0);
        let elapsed = counter.read("elapsed").await.unwrap();
        assert!((elapsed.value - 0.003).abs() < 1e-9);
        assert_eq!(elapsed.unit, "s");
    }

    #[tokio::test]
    async fn latched_slices_are_discarded() {
        let transport = MockTransport::new();
        let handle = transport.clone();
        let mut counter = connected_counter(transport).await;

        handle.push_line("0.001,1500,1480,37");
        handle.push_line("0.001,0,0,0"); // latch: discarded
        handle.push_line("0.001,1510,1490,41");
        handle.push_line("0.001,1490,1505,38");
        let sample = counter.trigger(&ParamMap::new()).await.unwrap();

        assert_eq!(sample.value, 116.0);
        // One extra CLR for the latched slice
        let clears = handle.sent().iter().filter(|c| *c == "CLR").count();
        assert_eq!(clears, 2);
    }

    #[tokio::test]
    async fn persistent_latching_escalates_to_timeout() {
        let transport = MockTransport::new();
        let handle = transport.clone();
        let mut counter = connected_counter(transport).await;

        let mut options = ParamMap::new();
        options.insert("max_latch_retries".into(), 2i64.into());
        counter.configure(&options).await.unwrap();

        for _ in 0..4 {
            handle.push_line("0.001,0,0,0");
        }
        let err = counter.trigger(&ParamMap::new()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn configure_sends_masks_and_window() {
        let transport = MockTransport::new();
        let handle = transport.clone();
        let mut counter = connected_counter(transport).await;

        let mut options = ParamMap::new();
        options.insert("singles".into(), vec![3i64, 5].into());
        options.insert("coincidence".into(), vec![3i64, 5].into());
        options.insert("coincidence_window_ns".into(), 1.5.into());
        counter.configure(&options).await.unwrap();

        let sent = handle.sent();
        assert!(sent.contains(&"SGLS 4,16".to_string()));
        assert!(sent.contains(&"COIN 20".to_string()));
        assert!(sent.contains(&"WIND 1.5".to_string()));
    }

    #[tokio::test]
    async fn read_before_trigger_is_rejected() {
        let transport = MockTransport::new();
        let mut counter = connected_counter(transport).await;
        let err = counter.read("coincidences").await.unwrap_err();
        assert!(matches!(err, SuiteError::Configuration { .. }));
    }

    #[tokio::test]
    async fn out_of_range_channel_is_rejected() {
        let transport = MockTransport::new();
        let mut counter = connected_counter(transport).await;
        let mut options = ParamMap::new();
        options.insert("singles".into(), vec![0i64].into());
        assert!(counter.configure(&options).await.is_err());

        let mut options = ParamMap::new();
        options.insert("singles".into(), vec![17i64].into());
        assert!(counter.configure(&options).await.is_err());
    }
}
