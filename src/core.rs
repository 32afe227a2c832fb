//! Core traits and data types for the acquisition suite.
//!
//! This module defines the foundational abstractions shared by every layer:
//!
//! - [`DeviceAdapter`]: the uniform capability interface wrapped around each
//!   instrument's native communication channel
//! - [`DeviceDescriptor`] / [`DeviceClass`]: how devices are declared
//! - [`SequenceStep`] / [`AcquisitionSequence`]: what a run executes
//! - [`Reading`] / [`AggregatedRecord`] / [`RunResult`]: what a run produces
//!
//! # Data Flow
//!
//! ```text
//! SessionController → AcquisitionScheduler → DeviceRegistry → adapters
//!                                   ↓
//!                        Reading → AggregatedRecord → RunEvent stream
//! ```
//!
//! # Thread Safety
//!
//! Adapters require `Send + Sync` so they can live behind the registry's
//! per-device locks, but they are not internally synchronized: a physical
//! instrument cannot process two concurrent commands, so the registry
//! serializes all access (see `registry`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{SuiteError, SuiteResult};
use crate::transport::TransportSettings;

// =============================================================================
// Device identity
// =============================================================================

/// Instrument classes the suite orchestrates.
///
/// The class determines which subset of the capability interface a device
/// supports; unsupported operations fail with
/// [`SuiteError::UnsupportedOperation`] rather than being modeled through
/// inheritance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Spectrometer,
    Stage,
    Counter,
    PowerMeter,
    Daq,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceClass::Spectrometer => "spectrometer",
            DeviceClass::Stage => "stage",
            DeviceClass::Counter => "counter",
            DeviceClass::PowerMeter => "power_meter",
            DeviceClass::Daq => "daq",
        };
        write!(f, "{}", name)
    }
}

/// Declaration of one device: logical name, class, how to reach it, and the
/// native unit its readings carry. Immutable once registered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Logical name, unique within a registry (e.g. "stage1", "pm1")
    pub name: String,
    /// Instrument class
    pub class: DeviceClass,
    /// Connection parameters, opaque to the orchestration layers
    pub transport: TransportSettings,
    /// Native unit of measure (e.g. "mm", "W", "counts")
    pub unit: String,
}

/// Adapter lifecycle state, reported through the operator surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// No live communication channel
    Disconnected,
    /// `connect` in progress
    Connecting,
    /// Connected and ready for commands
    Idle,
    /// The last operation failed; see the returned error
    Error,
}

/// Snapshot of one registered device for `status` queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub name: String,
    pub class: DeviceClass,
    pub state: DeviceState,
    pub unit: String,
}

// =============================================================================
// Option values
// =============================================================================

/// Strongly-typed value for device configuration options and trigger
/// parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
}

impl ParamValue {
    /// Extract value as f64, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(f) => Some(*f),
            ParamValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Extract value as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract value as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract value as str.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Extract value as an integer array.
    pub fn as_i64_array(&self) -> Option<&[i64]> {
        match self {
            ParamValue::IntArray(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<Vec<i64>> for ParamValue {
    fn from(value: Vec<i64>) -> Self {
        ParamValue::IntArray(value)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(value: Vec<f64>) -> Self {
        ParamValue::FloatArray(value)
    }
}

/// Device option map passed to `configure` and `trigger`.
pub type ParamMap = HashMap<String, ParamValue>;

// =============================================================================
// Capability interface
// =============================================================================

/// One raw value recovered from a device channel, before the scheduler
/// stamps it with device identity, timestamp and step index.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Channel the value came from (e.g. "power", "0", "coincidences")
    pub channel: String,
    /// Measured value, normalized to f64
    pub value: f64,
    /// Native unit of the value
    pub unit: String,
}

/// Uniform capability interface around one physical instrument.
///
/// Each device class implements the subset it supports; the default
/// implementations reject `move_to` and `trigger` so a spectrometer never
/// pretends to be a stage. All operations are inherently sequential per
/// device — callers go through the registry, which holds the per-device
/// lock across every call.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Logical device name.
    fn name(&self) -> &str;

    /// Instrument class.
    fn class(&self) -> DeviceClass;

    /// Current lifecycle state.
    fn state(&self) -> DeviceState;

    /// Native unit of measure for this device's readings.
    fn unit(&self) -> &str;

    /// Establish the communication channel.
    ///
    /// Fails with [`SuiteError::Connection`] if the device is unreachable
    /// or already claimed by another process.
    async fn connect(&mut self) -> SuiteResult<()>;

    /// Apply device-specific settings (integration time, velocity, sample
    /// rate). Options are validated against the device class; an unsupported
    /// option fails with [`SuiteError::Configuration`].
    async fn configure(&mut self, options: &ParamMap) -> SuiteResult<()>;

    /// Read a single value from a channel.
    ///
    /// Fails with [`SuiteError::ReadTimeout`] if no response arrives within
    /// the device's deadline.
    async fn read(&mut self, channel: &str) -> SuiteResult<Sample>;

    /// Move to an absolute position and block until settled within
    /// `tolerance`, or fail with [`SuiteError::MotionTimeout`]. Stages only.
    async fn move_to(&mut self, target: f64, tolerance: f64) -> SuiteResult<()> {
        let _ = (target, tolerance);
        Err(SuiteError::UnsupportedOperation {
            device: self.name().to_string(),
            operation: "move",
        })
    }

    /// Arm and execute a triggered measurement, returning the accumulated
    /// result. Counters and triggerable DAQ hardware only.
    async fn trigger(&mut self, params: &ParamMap) -> SuiteResult<Sample> {
        let _ = params;
        Err(SuiteError::UnsupportedOperation {
            device: self.name().to_string(),
            operation: "trigger",
        })
    }

    /// Release the communication channel. Idempotent: safe to call on an
    /// already-disconnected adapter.
    async fn disconnect(&mut self) -> SuiteResult<()>;

    /// Snapshot for the operator surface.
    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            name: self.name().to_string(),
            class: self.class(),
            state: self.state(),
            unit: self.unit().to_string(),
        }
    }
}

// =============================================================================
// Acquisition sequences
// =============================================================================

/// One atomic scheduled action within a sequence. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SequenceStep {
    /// Move a stage and block until settled within tolerance
    Move {
        device: String,
        target: f64,
        tolerance: f64,
    },
    /// Suspend the sequence without touching any device
    Wait {
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    /// Execute a triggered measurement and capture its reading
    Trigger {
        device: String,
        #[serde(default)]
        params: ParamMap,
    },
    /// Capture a single value from a device channel
    Read {
        device: String,
        channel: String,
        #[serde(default)]
        expected_unit: Option<String>,
    },
}

impl SequenceStep {
    /// The device a step addresses, if any.
    pub fn device(&self) -> Option<&str> {
        match self {
            SequenceStep::Move { device, .. }
            | SequenceStep::Trigger { device, .. }
            | SequenceStep::Read { device, .. } => Some(device),
            SequenceStep::Wait { .. } => None,
        }
    }

    /// Whether executing the step produces a [`Reading`].
    pub fn captures(&self) -> bool {
        matches!(
            self,
            SequenceStep::Trigger { .. } | SequenceStep::Read { .. }
        )
    }
}

/// One position in a sequence: a single step, or a group of steps issued
/// concurrently to independent devices and joined before the sequence
/// proceeds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SequenceEntry {
    Single(SequenceStep),
    Parallel(Vec<SequenceStep>),
}

/// Ordered list of steps plus a repeat count; one full experimental run.
///
/// Validated at construction so structural mistakes surface before any
/// device is touched:
/// - at least one entry, and at least one capture step
/// - `repeat_count >= 1`
/// - `Wait` only as a single entry (it must never hold a device lock)
/// - no two steps in one parallel group addressing the same device
/// - no two `Read` steps capturing the same device+channel in one repeat
///
/// Deliberately not `Deserialize`: sequences only come into existence
/// through [`AcquisitionSequence::new`] so the invariants always hold.
#[derive(Clone, Debug, Serialize)]
pub struct AcquisitionSequence {
    entries: Vec<SequenceEntry>,
    repeat_count: usize,
}

impl AcquisitionSequence {
    pub fn new(entries: Vec<SequenceEntry>, repeat_count: usize) -> SuiteResult<Self> {
        if entries.is_empty() {
            return Err(SuiteError::InvalidSequence("sequence has no steps".into()));
        }
        if repeat_count == 0 {
            return Err(SuiteError::InvalidSequence(
                "repeat count must be at least 1".into(),
            ));
        }

        let mut capture_keys: Vec<(String, String)> = Vec::new();
        let mut captures = 0usize;
        for entry in &entries {
            match entry {
                SequenceEntry::Single(step) => {
                    Self::validate_step(step, &mut capture_keys, &mut captures)?;
                }
                SequenceEntry::Parallel(steps) => {
                    if steps.is_empty() {
                        return Err(SuiteError::InvalidSequence(
                            "parallel group has no steps".into(),
                        ));
                    }
                    let mut group_devices: Vec<&str> = Vec::new();
                    for step in steps {
                        let device = step.device().ok_or_else(|| {
                            SuiteError::InvalidSequence(
                                "wait steps are not allowed inside a parallel group".into(),
                            )
                        })?;
                        if group_devices.contains(&device) {
                            return Err(SuiteError::InvalidSequence(format!(
                                "parallel group addresses device '{}' twice",
                                device
                            )));
                        }
                        group_devices.push(device);
                        Self::validate_step(step, &mut capture_keys, &mut captures)?;
                    }
                }
            }
        }

        if captures == 0 {
            return Err(SuiteError::InvalidSequence(
                "sequence captures no readings".into(),
            ));
        }

        Ok(Self {
            entries,
            repeat_count,
        })
    }

    fn validate_step(
        step: &SequenceStep,
        capture_keys: &mut Vec<(String, String)>,
        captures: &mut usize,
    ) -> SuiteResult<()> {
        match step {
            SequenceStep::Move { tolerance, .. } => {
                if *tolerance <= 0.0 {
                    return Err(SuiteError::InvalidSequence(
                        "move tolerance must be positive".into(),
                    ));
                }
            }
            SequenceStep::Read {
                device, channel, ..
            } => {
                let key = (device.clone(), channel.clone());
                if capture_keys.contains(&key) {
                    return Err(SuiteError::InvalidSequence(format!(
                        "device '{}' channel '{}' is captured more than once per repeat",
                        device, channel
                    )));
                }
                capture_keys.push(key);
                *captures += 1;
            }
            SequenceStep::Trigger { .. } => {
                *captures += 1;
            }
            SequenceStep::Wait { .. } => {}
        }
        Ok(())
    }

    pub fn entries(&self) -> &[SequenceEntry] {
        &self.entries
    }

    pub fn repeat_count(&self) -> usize {
        self.repeat_count
    }

    /// Total number of steps per repeat, counting each member of a parallel
    /// group. Step indices in [`Reading`] run over this flattened order.
    pub fn step_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| match e {
                SequenceEntry::Single(_) => 1,
                SequenceEntry::Parallel(steps) => steps.len(),
            })
            .sum()
    }

    /// Step at a flattened index, counting parallel-group members in order.
    pub fn step_at(&self, index: usize) -> Option<&SequenceStep> {
        let mut idx = 0usize;
        for entry in &self.entries {
            match entry {
                SequenceEntry::Single(step) => {
                    if idx == index {
                        return Some(step);
                    }
                    idx += 1;
                }
                SequenceEntry::Parallel(steps) => {
                    if index < idx + steps.len() {
                        return Some(&steps[index - idx]);
                    }
                    idx += steps.len();
                }
            }
        }
        None
    }

    /// Flattened indices of the steps that must produce a reading.
    pub fn capture_indices(&self) -> Vec<usize> {
        let mut indices = Vec::new();
        let mut idx = 0usize;
        for entry in &self.entries {
            match entry {
                SequenceEntry::Single(step) => {
                    if step.captures() {
                        indices.push(idx);
                    }
                    idx += 1;
                }
                SequenceEntry::Parallel(steps) => {
                    for step in steps {
                        if step.captures() {
                            indices.push(idx);
                        }
                        idx += 1;
                    }
                }
            }
        }
        indices
    }
}

// =============================================================================
// Run output
// =============================================================================

/// A single timestamped value recovered from one device channel.
/// Produced exactly once per `Read`/`Trigger` step execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Logical device name
    pub device: String,
    /// Channel identifier
    pub channel: String,
    /// Measured value
    pub value: f64,
    /// Native unit
    pub unit: String,
    /// UTC timestamp; monotonically follows the step's issue time
    pub timestamp: DateTime<Utc>,
    /// Flattened index of the producing step within the repeat
    pub step_index: usize,
}

impl Reading {
    /// Map key used in [`AggregatedRecord`]: `device/channel`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.device, self.channel)
    }
}

/// Merged set of readings produced by one fully completed repeat,
/// keyed by device+channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregatedRecord {
    /// Which repeat of the sequence produced this record (0-based)
    pub repeat_index: usize,
    /// Global record timestamp (assembly time)
    pub timestamp: DateTime<Utc>,
    /// Readings keyed by `device/channel`
    pub readings: BTreeMap<String, Reading>,
}

impl AggregatedRecord {
    /// Look up the reading for one device channel.
    pub fn reading(&self, device: &str, channel: &str) -> Option<&Reading> {
        self.readings.get(&format!("{}/{}", device, channel))
    }
}

/// Ordered records for one session run.
///
/// Invariant: `records.len() <= repeat_count`; fewer only when the run was
/// aborted, in which case the partial result is retained alongside the
/// abort reason.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub records: Vec<AggregatedRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Terminal state of a run.
#[derive(Debug)]
pub enum RunOutcome {
    /// All repeats completed
    Completed,
    /// The run stopped early; `partial` holds the readings collected in the
    /// repeat that was in flight (never promoted to a record)
    Aborted {
        error: SuiteError,
        partial: Vec<Reading>,
    },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// Everything a finished run hands back to the caller: partial or complete
/// records, plus how it ended. Disposition (retry, keep, discard) is the
/// caller's decision.
#[derive(Debug)]
pub struct RunReport {
    pub result: RunResult,
    pub outcome: RunOutcome,
}

/// Run lifecycle state machine: `Idle → Running → {Completed | Aborted}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Aborted,
}

/// Events emitted on the session's broadcast channel while a run executes.
#[derive(Clone, Debug)]
pub enum RunEvent {
    Started { run_id: Uuid, repeat_count: usize },
    Record(Arc<AggregatedRecord>),
    Finished { run_id: Uuid, summary: RunSummary },
}

/// Cloneable digest of a run's terminal state for stream consumers.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub completed: bool,
    pub records: usize,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_step(device: &str, channel: &str) -> SequenceStep {
        SequenceStep::Read {
            device: device.into(),
            channel: channel.into(),
            expected_unit: None,
        }
    }

    #[test]
    fn sequence_validation_accepts_typical_scan() {
        let seq = AcquisitionSequence::new(
            vec![
                SequenceEntry::Single(SequenceStep::Move {
                    device: "stage1".into(),
                    target: 10.0,
                    tolerance: 0.1,
                }),
                SequenceEntry::Single(read_step("spec1", "0")),
            ],
            3,
        )
        .unwrap();

        assert_eq!(seq.repeat_count(), 3);
        assert_eq!(seq.step_count(), 2);
        assert_eq!(seq.capture_indices(), vec![1]);
    }

    #[test]
    fn sequence_validation_rejects_empty_and_zero_repeats() {
        assert!(AcquisitionSequence::new(vec![], 1).is_err());
        assert!(
            AcquisitionSequence::new(vec![SequenceEntry::Single(read_step("d", "0"))], 0).is_err()
        );
    }

    #[test]
    fn sequence_validation_rejects_wait_in_parallel_group() {
        let result = AcquisitionSequence::new(
            vec![SequenceEntry::Parallel(vec![
                read_step("pm1", "power"),
                SequenceStep::Wait {
                    duration: Duration::from_millis(10),
                },
            ])],
            1,
        );
        assert!(matches!(result, Err(SuiteError::InvalidSequence(_))));
    }

    #[test]
    fn sequence_validation_rejects_duplicate_capture_key() {
        let result = AcquisitionSequence::new(
            vec![
                SequenceEntry::Single(read_step("pm1", "power")),
                SequenceEntry::Single(read_step("pm1", "power")),
            ],
            1,
        );
        assert!(matches!(result, Err(SuiteError::InvalidSequence(_))));
    }

    #[test]
    fn sequence_validation_rejects_same_device_twice_in_group() {
        let result = AcquisitionSequence::new(
            vec![SequenceEntry::Parallel(vec![
                read_step("pm1", "power"),
                read_step("pm1", "aux"),
            ])],
            1,
        );
        assert!(matches!(result, Err(SuiteError::InvalidSequence(_))));
    }

    #[test]
    fn capture_indices_cover_parallel_groups() {
        let seq = AcquisitionSequence::new(
            vec![
                SequenceEntry::Single(SequenceStep::Wait {
                    duration: Duration::from_millis(1),
                }),
                SequenceEntry::Parallel(vec![
                    read_step("pm1", "power"),
                    SequenceStep::Trigger {
                        device: "tagger".into(),
                        params: ParamMap::new(),
                    },
                ]),
                SequenceEntry::Single(read_step("daq1", "ai0")),
            ],
            2,
        )
        .unwrap();

        assert_eq!(seq.step_count(), 4);
        assert_eq!(seq.capture_indices(), vec![1, 2, 3]);
    }

    #[test]
    fn record_lookup_by_device_and_channel() {
        let reading = Reading {
            device: "pm1".into(),
            channel: "power".into(),
            value: 1.5e-3,
            unit: "W".into(),
            timestamp: Utc::now(),
            step_index: 0,
        };
        let mut readings = BTreeMap::new();
        readings.insert(reading.key(), reading.clone());
        let record = AggregatedRecord {
            repeat_index: 0,
            timestamp: Utc::now(),
            readings,
        };

        assert_eq!(record.reading("pm1", "power"), Some(&reading));
        assert!(record.reading("pm1", "aux").is_none());
    }

    #[test]
    fn param_value_conversions() {
        assert_eq!(ParamValue::from(3i64).as_f64(), Some(3.0));
        assert_eq!(ParamValue::from(2.5).as_f64(), Some(2.5));
        assert_eq!(ParamValue::from("780").as_str(), Some("780"));
        assert_eq!(
            ParamValue::from(vec![1i64, 2, 3]).as_i64_array(),
            Some(&[1i64, 2, 3][..])
        );
        assert!(ParamValue::from(true).as_f64().is_none());
    }
}
