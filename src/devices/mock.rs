//! In-memory device simulator.
//!
//! `MockDevice` implements the full capability interface for every device
//! class without hardware, with deterministic values by default and
//! optional noise. Failure injection covers the cases the scheduler has to
//! handle: a connect refusal, N transient timeouts before success, a target
//! the stage can never reach, and a fatal disconnect after a set number of
//! operations.
//!
//! All delays use `tokio::time::sleep` so simulated motion and integration
//! never block the runtime.

use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::core::{
    DeviceAdapter, DeviceClass, DeviceDescriptor, DeviceState, ParamMap, Sample,
};
use crate::error::{SuiteError, SuiteResult};

pub struct MockDevice {
    name: String,
    class: DeviceClass,
    unit: String,
    state: DeviceState,
    position: f64,
    base_value: f64,
    noise: f64,
    op_delay: Duration,
    refuse_connect: bool,
    transient_failures: u32,
    transient_ops: Vec<u32>,
    fatal_after: Option<u32>,
    fail_disconnect: bool,
    ops: Arc<AtomicU32>,
    options: ParamMap,
    unreachable_target: bool,
    triggered: bool,
}

impl MockDevice {
    pub fn new(name: &str, class: DeviceClass) -> Self {
        let unit = match class {
            DeviceClass::Stage => "mm",
            DeviceClass::PowerMeter => "W",
            DeviceClass::Counter | DeviceClass::Spectrometer => "counts",
            DeviceClass::Daq => "V",
        };
        Self {
            name: name.to_string(),
            class,
            unit: unit.to_string(),
            state: DeviceState::Disconnected,
            position: 0.0,
            base_value: 1.0,
            noise: 0.0,
            op_delay: Duration::from_millis(1),
            refuse_connect: false,
            transient_failures: 0,
            transient_ops: Vec::new(),
            fatal_after: None,
            fail_disconnect: false,
            ops: Arc::new(AtomicU32::new(0)),
            options: ParamMap::new(),
            unreachable_target: false,
            triggered: false,
        }
    }

    pub fn for_descriptor(descriptor: &DeviceDescriptor) -> Self {
        let mut device = Self::new(&descriptor.name, descriptor.class);
        device.unit = descriptor.unit.clone();
        device
    }

    /// Base value returned by reads and triggers.
    pub fn with_value(mut self, value: f64) -> Self {
        self.base_value = value;
        self
    }

    /// Add uniform noise of the given amplitude to every value.
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude;
        self
    }

    /// Refuse the next `connect` as if the device were claimed elsewhere.
    pub fn refuse_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    /// Fail the next `n` reads/triggers with a transient timeout.
    pub fn fail_transiently(mut self, n: u32) -> Self {
        self.transient_failures = n;
        self
    }

    /// Fail specific operations (1-based) with a transient timeout; a
    /// retried attempt lands on the next operation number and succeeds.
    pub fn fail_transiently_on(mut self, ops: Vec<u32>) -> Self {
        self.transient_ops = ops;
        self
    }

    /// Make `disconnect` fail, for teardown-reporting tests.
    pub fn fail_disconnect(mut self) -> Self {
        self.fail_disconnect = true;
        self
    }

    /// Shared operation counter (moves, reads, triggers attempted so far).
    pub fn op_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.ops)
    }

    /// Simulate a stage that never settles within tolerance.
    pub fn unreachable_target(mut self) -> Self {
        self.unreachable_target = true;
        self
    }

    /// Drop the connection fatally after `n` successful operations.
    pub fn fail_after(mut self, n: u32) -> Self {
        self.fatal_after = Some(n);
        self
    }

    /// Options applied through `configure`, for test assertions.
    pub fn applied_options(&self) -> &ParamMap {
        &self.options
    }

    fn check_connected(&self) -> SuiteResult<()> {
        if self.state == DeviceState::Idle {
            Ok(())
        } else {
            Err(SuiteError::Connection {
                device: self.name.clone(),
                message: "device not connected".to_string(),
            })
        }
    }

    fn next_op(&mut self) -> SuiteResult<()> {
        self.check_connected()?;

        if let Some(limit) = self.fatal_after {
            if self.ops.load(Ordering::SeqCst) >= limit {
                self.state = DeviceState::Error;
                return Err(SuiteError::Connection {
                    device: self.name.clone(),
                    message: "device dropped the connection".to_string(),
                });
            }
        }
        let op = self.ops.fetch_add(1, Ordering::SeqCst) + 1;

        if self.transient_failures > 0 || self.transient_ops.contains(&op) {
            self.transient_failures = self.transient_failures.saturating_sub(1);
            return Err(SuiteError::ReadTimeout {
                device: self.name.clone(),
                after: self.op_delay,
            });
        }
        Ok(())
    }

    fn value(&self) -> f64 {
        if self.noise > 0.0 {
            self.base_value + rand::thread_rng().gen_range(-self.noise..self.noise)
        } else {
            self.base_value
        }
    }
}

#[async_trait]
impl DeviceAdapter for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> DeviceClass {
        self.class
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    async fn connect(&mut self) -> SuiteResult<()> {
        if self.refuse_connect {
            self.state = DeviceState::Error;
            return Err(SuiteError::Connection {
                device: self.name.clone(),
                message: "endpoint already claimed".to_string(),
            });
        }
        sleep(self.op_delay).await;
        self.state = DeviceState::Idle;
        Ok(())
    }

    async fn configure(&mut self, options: &ParamMap) -> SuiteResult<()> {
        self.check_connected()?;
        for (key, value) in options {
            self.options.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn read(&mut self, channel: &str) -> SuiteResult<Sample> {
        self.next_op()?;
        sleep(self.op_delay).await;

        let value = match (self.class, channel) {
            (DeviceClass::Stage, "position") => self.position,
            (DeviceClass::Counter, _) if !self.triggered => {
                return Err(SuiteError::Configuration {
                    device: self.name.clone(),
                    message: "no completed integration; trigger the counter first".into(),
                });
            }
            _ => self.value(),
        };

        Ok(Sample {
            channel: channel.to_string(),
            value,
            unit: self.unit.clone(),
        })
    }

    async fn move_to(&mut self, target: f64, tolerance: f64) -> SuiteResult<()> {
        if self.class != DeviceClass::Stage {
            return Err(SuiteError::UnsupportedOperation {
                device: self.name.clone(),
                operation: "move",
            });
        }
        self.next_op()?;
        sleep(self.op_delay).await;

        if self.unreachable_target {
            return Err(SuiteError::MotionTimeout {
                device: self.name.clone(),
                target,
                elapsed: self.op_delay,
            });
        }

        // Settles just inside tolerance rather than exactly on target
        self.position = target + tolerance * 0.5;
        Ok(())
    }

    async fn trigger(&mut self, _params: &ParamMap) -> SuiteResult<Sample> {
        if self.class != DeviceClass::Counter {
            return Err(SuiteError::UnsupportedOperation {
                device: self.name.clone(),
                operation: "trigger",
            });
        }
        self.next_op()?;
        sleep(self.op_delay).await;
        self.triggered = true;

        Ok(Sample {
            channel: "coincidences".to_string(),
            value: self.value(),
            unit: self.unit.clone(),
        })
    }

    async fn disconnect(&mut self) -> SuiteResult<()> {
        if self.fail_disconnect {
            return Err(SuiteError::Connection {
                device: self.name.clone(),
                message: "device refused to release the channel".to_string(),
            });
        }
        self.state = DeviceState::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stage_settles_within_tolerance() {
        let mut stage = MockDevice::new("stage1", DeviceClass::Stage);
        stage.connect().await.unwrap();
        stage.move_to(10.0, 0.1).await.unwrap();

        let sample = stage.read("position").await.unwrap();
        assert!((sample.value - 10.0).abs() <= 0.1);
        assert_eq!(sample.unit, "mm");
    }

    #[tokio::test]
    async fn transient_failures_heal_after_n_attempts() {
        let mut meter = MockDevice::new("pm1", DeviceClass::PowerMeter).fail_transiently(2);
        meter.connect().await.unwrap();

        assert!(meter.read("power").await.unwrap_err().is_transient());
        assert!(meter.read("power").await.unwrap_err().is_transient());
        assert!(meter.read("power").await.is_ok());
    }

    #[tokio::test]
    async fn fatal_after_limit_poisons_the_device() {
        let mut daq = MockDevice::new("daq1", DeviceClass::Daq).fail_after(1);
        daq.connect().await.unwrap();

        assert!(daq.read("ai0").await.is_ok());
        let err = daq.read("ai0").await.unwrap_err();
        assert!(matches!(err, SuiteError::Connection { .. }));
        assert_eq!(daq.state(), DeviceState::Error);
    }

    #[tokio::test]
    async fn non_stage_rejects_move() {
        let mut spec = MockDevice::new("spec1", DeviceClass::Spectrometer);
        spec.connect().await.unwrap();
        let err = spec.move_to(1.0, 0.1).await.unwrap_err();
        assert!(matches!(err, SuiteError::UnsupportedOperation { .. }));
    }

    #[tokio::test]
    async fn counter_requires_trigger_before_read() {
        let mut counter = MockDevice::new("tagger", DeviceClass::Counter).with_value(37.0);
        counter.connect().await.unwrap();

        assert!(counter.read("coincidences").await.is_err());
        let sample = counter.trigger(&ParamMap::new()).await.unwrap();
        assert_eq!(sample.value, 37.0);
        assert_eq!(counter.read("coincidences").await.unwrap().value, 37.0);
    }

    #[tokio::test]
    async fn configure_records_applied_options() {
        let mut meter = MockDevice::new("pm1", DeviceClass::PowerMeter);
        meter.connect().await.unwrap();

        let mut options = ParamMap::new();
        options.insert("wavelength".into(), 780.0.into());
        meter.configure(&options).await.unwrap();

        assert_eq!(
            meter.applied_options().get("wavelength").and_then(|v| v.as_f64()),
            Some(780.0)
        );
    }

    #[tokio::test]
    async fn noise_stays_within_amplitude() {
        let mut daq = MockDevice::new("daq1", DeviceClass::Daq)
            .with_value(5.0)
            .with_noise(0.25);
        daq.connect().await.unwrap();

        for _ in 0..20 {
            let sample = daq.read("ai0").await.unwrap();
            assert!((sample.value - 5.0).abs() < 0.25);
        }
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let mut stage = MockDevice::new("stage1", DeviceClass::Stage);
        stage.connect().await.unwrap();
        stage.disconnect().await.unwrap();
        stage.disconnect().await.unwrap();
        assert_eq!(stage.state(), DeviceState::Disconnected);
    }
}
