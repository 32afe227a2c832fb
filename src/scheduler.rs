//! Acquisition scheduling.
//!
//! Executes an [`AcquisitionSequence`] against the device registry, one
//! repeat at a time. Execution is strictly sequential except for explicit
//! parallel groups, which fan out one worker per device and join before
//! the sequence proceeds.
//!
//! Failure policy: transient errors (read/motion timeouts) are retried up
//! to the configured bound with a short backoff, then escalated. Everything
//! else aborts the remaining steps and the run; the in-flight repeat's
//! readings are reported with the abort but never promoted to a record, so
//! every record in a result represents a fully completed repeat.
//!
//! Cancellation is cooperative: the flag is checked before each step is
//! issued, and an in-flight device call is never interrupted — hard stops
//! are the adapter timeout's job.

use chrono::Utc;
use futures::future::join_all;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use uuid::Uuid;

use crate::aggregator::SampleAggregator;
use crate::core::{
    AcquisitionSequence, Reading, RunEvent, RunOutcome, RunReport, RunResult, SequenceEntry,
    SequenceStep,
};
use crate::error::{SuiteError, SuiteResult};
use crate::registry::DeviceRegistry;

/// Bound on transient-failure retries for a single step.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = 1 + max_retries)
    pub max_retries: u32,
    /// Delay between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Cooperative cancellation flag, checked at step boundaries.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Executes sequences against registered devices.
pub struct AcquisitionScheduler {
    registry: Arc<DeviceRegistry>,
    retry: RetryPolicy,
    cancel: CancelFlag,
}

impl AcquisitionScheduler {
    pub fn new(registry: Arc<DeviceRegistry>, retry: RetryPolicy) -> Self {
        Self {
            registry,
            retry,
            cancel: CancelFlag::new(),
        }
    }

    /// Flag shared with callers that need to cancel the run.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Execute every repeat of the sequence, emitting one
    /// [`RunEvent::Record`] per completed repeat.
    pub async fn run(
        &self,
        run_id: Uuid,
        sequence: &AcquisitionSequence,
        events: &broadcast::Sender<RunEvent>,
    ) -> RunReport {
        let started_at = Utc::now();
        let mut records = Vec::new();
        info!(
            "run {} started: {} step(s) x {} repeat(s)",
            run_id,
            sequence.step_count(),
            sequence.repeat_count()
        );

        for repeat in 0..sequence.repeat_count() {
            let readings = match self.run_repeat(repeat, sequence).await {
                Ok(readings) => readings,
                Err((error, partial)) => {
                    let error = match error {
                        SuiteError::Cancelled => SuiteError::Cancelled,
                        other => SuiteError::RunAborted {
                            repeat,
                            source: Box::new(other),
                        },
                    };
                    warn!("run {} aborted during repeat {}: {}", run_id, repeat, error);
                    return RunReport {
                        result: RunResult {
                            run_id,
                            records,
                            started_at,
                            finished_at: Utc::now(),
                        },
                        outcome: RunOutcome::Aborted { error, partial },
                    };
                }
            };

            match SampleAggregator::assemble(sequence, repeat, &readings) {
                Ok(record) => {
                    let record = Arc::new(record);
                    let _ = events.send(RunEvent::Record(Arc::clone(&record)));
                    records.push((*record).clone());
                }
                Err(error) => {
                    warn!("run {} rejected repeat {}: {}", run_id, repeat, error);
                    return RunReport {
                        result: RunResult {
                            run_id,
                            records,
                            started_at,
                            finished_at: Utc::now(),
                        },
                        outcome: RunOutcome::Aborted {
                            error,
                            partial: readings,
                        },
                    };
                }
            }
        }

        info!("run {} completed with {} record(s)", run_id, records.len());
        RunReport {
            result: RunResult {
                run_id,
                records,
                started_at,
                finished_at: Utc::now(),
            },
            outcome: RunOutcome::Completed,
        }
    }

    /// Execute one repeat, returning its readings or the failure plus the
    /// readings collected before it.
    async fn run_repeat(
        &self,
        repeat: usize,
        sequence: &AcquisitionSequence,
    ) -> Result<Vec<Reading>, (SuiteError, Vec<Reading>)> {
        let mut readings = Vec::new();
        let mut step_index = 0usize;

        for entry in sequence.entries() {
            if self.cancel.is_cancelled() {
                info!("cancellation observed before step {} of repeat {}", step_index, repeat);
                return Err((SuiteError::Cancelled, readings));
            }

            match entry {
                SequenceEntry::Single(step) => {
                    match self.execute_step(step, step_index).await {
                        Ok(Some(reading)) => readings.push(reading),
                        Ok(None) => {}
                        Err(e) => return Err((e, readings)),
                    }
                    step_index += 1;
                }
                SequenceEntry::Parallel(steps) => {
                    let workers = steps
                        .iter()
                        .enumerate()
                        .map(|(offset, step)| self.execute_step(step, step_index + offset));
                    let results = join_all(workers).await;
                    step_index += steps.len();

                    let mut failure = None;
                    for result in results {
                        match result {
                            Ok(Some(reading)) => readings.push(reading),
                            Ok(None) => {}
                            Err(e) => {
                                failure.get_or_insert(e);
                            }
                        }
                    }
                    if let Some(e) = failure {
                        return Err((e, readings));
                    }
                }
            }
        }

        Ok(readings)
    }

    async fn execute_step(
        &self,
        step: &SequenceStep,
        step_index: usize,
    ) -> SuiteResult<Option<Reading>> {
        match step {
            SequenceStep::Wait { duration } => {
                sleep(*duration).await;
                Ok(None)
            }

            SequenceStep::Move {
                device,
                target,
                tolerance,
            } => {
                let handle = self.registry.get(device)?;
                let (target, tolerance) = (*target, *tolerance);
                self.with_retry(device, || {
                    let handle = handle.clone();
                    async move { handle.move_to(target, tolerance).await }
                })
                .await?;
                Ok(None)
            }

            SequenceStep::Read {
                device,
                channel,
                expected_unit,
            } => {
                let handle = self.registry.get(device)?;
                let sample = self
                    .with_retry(device, || {
                        let handle = handle.clone();
                        let channel = channel.clone();
                        async move { handle.read(&channel).await }
                    })
                    .await?;

                if let Some(expected) = expected_unit {
                    if &sample.unit != expected {
                        return Err(SuiteError::Configuration {
                            device: device.clone(),
                            message: format!(
                                "channel '{}' reports unit '{}', sequence expects '{}'",
                                channel, sample.unit, expected
                            ),
                        });
                    }
                }

                Ok(Some(Reading {
                    device: device.clone(),
                    channel: sample.channel,
                    value: sample.value,
                    unit: sample.unit,
                    timestamp: Utc::now(),
                    step_index,
                }))
            }

            SequenceStep::Trigger { device, params } => {
                let handle = self.registry.get(device)?;
                let sample = self
                    .with_retry(device, || {
                        let handle = handle.clone();
                        let params = params.clone();
                        async move { handle.trigger(&params).await }
                    })
                    .await?;

                Ok(Some(Reading {
                    device: device.clone(),
                    channel: sample.channel,
                    value: sample.value,
                    unit: sample.unit,
                    timestamp: Utc::now(),
                    step_index,
                }))
            }
        }
    }

    /// Retry transient failures up to the policy bound, then escalate.
    async fn with_retry<T, F, Fut>(&self, device: &str, mut op: F) -> SuiteResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = SuiteResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    warn!(
                        "'{}' transient failure, retry {}/{}: {}",
                        device, attempt, self.retry.max_retries, e
                    );
                    sleep(self.retry.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DeviceAdapter, DeviceClass, DeviceDescriptor, ParamMap};
    use crate::devices::MockDevice;
    use crate::transport::TransportSettings;

    fn descriptor(name: &str, class: DeviceClass) -> DeviceDescriptor {
        DeviceDescriptor {
            name: name.into(),
            class,
            transport: TransportSettings::mock(),
            unit: "a.u.".into(),
        }
    }

    async fn registry_with(devices: Vec<(DeviceClass, MockDevice)>) -> Arc<DeviceRegistry> {
        let registry = Arc::new(DeviceRegistry::new());
        for (class, device) in devices {
            let name = device.name().to_string();
            registry
                .register(descriptor(&name, class), Box::new(device))
                .await
                .unwrap();
        }
        registry
    }

    fn read_step(device: &str, channel: &str) -> SequenceEntry {
        SequenceEntry::Single(SequenceStep::Read {
            device: device.into(),
            channel: channel.into(),
            expected_unit: None,
        })
    }

    fn events() -> broadcast::Sender<RunEvent> {
        broadcast::channel(64).0
    }

    #[tokio::test]
    async fn successful_run_yields_one_record_per_repeat() {
        let registry = registry_with(vec![(
            DeviceClass::PowerMeter,
            MockDevice::new("pm1", DeviceClass::PowerMeter).with_value(2.5e-3),
        )])
        .await;
        let sequence =
            AcquisitionSequence::new(vec![read_step("pm1", "power")], 4).unwrap();

        let scheduler = AcquisitionScheduler::new(registry, RetryPolicy::default());
        let report = scheduler.run(Uuid::new_v4(), &sequence, &events()).await;

        assert!(report.outcome.is_completed());
        assert_eq!(report.result.records.len(), 4);
        for (i, record) in report.result.records.iter().enumerate() {
            assert_eq!(record.repeat_index, i);
            assert_eq!(record.reading("pm1", "power").map(|r| r.value), Some(2.5e-3));
        }
    }

    #[tokio::test]
    async fn transient_failure_healed_by_retry_is_invisible() {
        let registry = registry_with(vec![(
            DeviceClass::PowerMeter,
            MockDevice::new("pm1", DeviceClass::PowerMeter).fail_transiently(1),
        )])
        .await;
        let sequence = AcquisitionSequence::new(vec![read_step("pm1", "power")], 3).unwrap();

        let retry = RetryPolicy {
            max_retries: 1,
            backoff: Duration::from_millis(1),
        };
        let scheduler = AcquisitionScheduler::new(registry, retry);
        let report = scheduler.run(Uuid::new_v4(), &sequence, &events()).await;

        assert!(report.outcome.is_completed());
        assert_eq!(report.result.records.len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_escalate_with_partial_result() {
        let registry = registry_with(vec![(
            DeviceClass::PowerMeter,
            MockDevice::new("pm1", DeviceClass::PowerMeter).fail_transiently(10),
        )])
        .await;
        let sequence = AcquisitionSequence::new(vec![read_step("pm1", "power")], 3).unwrap();

        let retry = RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        };
        let scheduler = AcquisitionScheduler::new(registry, retry);
        let report = scheduler.run(Uuid::new_v4(), &sequence, &events()).await;

        match report.outcome {
            RunOutcome::Aborted { error, .. } => {
                assert!(matches!(error, SuiteError::RunAborted { repeat: 0, .. }));
                assert_eq!(error.device(), Some("pm1"));
            }
            RunOutcome::Completed => panic!("run should have aborted"),
        }
        assert!(report.result.records.is_empty());
    }

    #[tokio::test]
    async fn unknown_device_aborts_without_retry() {
        let registry = registry_with(vec![]).await;
        let sequence = AcquisitionSequence::new(vec![read_step("ghost", "x")], 2).unwrap();

        let scheduler = AcquisitionScheduler::new(registry, RetryPolicy::default());
        let report = scheduler.run(Uuid::new_v4(), &sequence, &events()).await;

        match report.outcome {
            RunOutcome::Aborted { error, .. } => {
                assert!(matches!(
                    error,
                    SuiteError::RunAborted { repeat: 0, ref source } if matches!(**source, SuiteError::UnknownDevice(_))
                ));
            }
            RunOutcome::Completed => panic!("run should have aborted"),
        }
    }

    #[tokio::test]
    async fn mid_run_disconnect_keeps_completed_records() {
        // Two reads per repeat; the device dies on the 5th operation, i.e.
        // during repeat 2 of 5.
        let registry = registry_with(vec![(
            DeviceClass::Daq,
            MockDevice::new("daq1", DeviceClass::Daq).fail_after(4),
        )])
        .await;
        let sequence = AcquisitionSequence::new(
            vec![read_step("daq1", "ai0"), read_step("daq1", "ai1")],
            5,
        )
        .unwrap();

        let scheduler = AcquisitionScheduler::new(registry, RetryPolicy::default());
        let report = scheduler.run(Uuid::new_v4(), &sequence, &events()).await;

        assert_eq!(report.result.records.len(), 2);
        match report.outcome {
            RunOutcome::Aborted { error, partial } => {
                assert!(matches!(error, SuiteError::RunAborted { repeat: 2, .. }));
                assert_eq!(error.device(), Some("daq1"));
                // The aborted repeat had produced no reading yet
                assert!(partial.is_empty());
            }
            RunOutcome::Completed => panic!("run should have aborted"),
        }
    }

    #[tokio::test]
    async fn unreachable_move_fails_after_exact_attempt_count() {
        let registry = registry_with(vec![(
            DeviceClass::Stage,
            MockDevice::new("stage1", DeviceClass::Stage).unreachable_target(),
        )])
        .await;
        let sequence = AcquisitionSequence::new(
            vec![
                SequenceEntry::Single(SequenceStep::Move {
                    device: "stage1".into(),
                    target: 10.0,
                    tolerance: 0.1,
                }),
                read_step("stage1", "position"),
            ],
            1,
        )
        .unwrap();

        let retry = RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        };
        let scheduler = AcquisitionScheduler::new(Arc::clone(&registry), retry);
        let report = scheduler.run(Uuid::new_v4(), &sequence, &events()).await;

        match report.outcome {
            RunOutcome::Aborted { error, .. } => match error {
                SuiteError::RunAborted { source, .. } => {
                    assert!(matches!(*source, SuiteError::MotionTimeout { .. }));
                }
                other => panic!("expected RunAborted, got {:?}", other),
            },
            RunOutcome::Completed => panic!("run should have aborted"),
        }
    }

    #[tokio::test]
    async fn parallel_group_collects_all_readings() {
        let registry = registry_with(vec![
            (
                DeviceClass::PowerMeter,
                MockDevice::new("pm1", DeviceClass::PowerMeter).with_value(1.0e-3),
            ),
            (
                DeviceClass::Counter,
                MockDevice::new("tagger", DeviceClass::Counter).with_value(42.0),
            ),
        ])
        .await;
        let sequence = AcquisitionSequence::new(
            vec![SequenceEntry::Parallel(vec![
                SequenceStep::Read {
                    device: "pm1".into(),
                    channel: "power".into(),
                    expected_unit: None,
                },
                SequenceStep::Trigger {
                    device: "tagger".into(),
                    params: ParamMap::new(),
                },
            ])],
            2,
        )
        .unwrap();

        let scheduler = AcquisitionScheduler::new(registry, RetryPolicy::default());
        let report = scheduler.run(Uuid::new_v4(), &sequence, &events()).await;

        assert!(report.outcome.is_completed());
        for record in &report.result.records {
            assert_eq!(record.reading("pm1", "power").map(|r| r.value), Some(1.0e-3));
            assert_eq!(
                record.reading("tagger", "coincidences").map(|r| r.value),
                Some(42.0)
            );
        }
    }

    #[tokio::test]
    async fn unit_mismatch_is_fatal() {
        let registry = Arc::new(DeviceRegistry::new());
        let descriptor = DeviceDescriptor {
            name: "pm1".into(),
            class: DeviceClass::PowerMeter,
            transport: TransportSettings::mock(),
            unit: "dBm".into(),
        };
        registry
            .register(
                descriptor.clone(),
                Box::new(MockDevice::for_descriptor(&descriptor)),
            )
            .await
            .unwrap();

        let sequence = AcquisitionSequence::new(
            vec![SequenceEntry::Single(SequenceStep::Read {
                device: "pm1".into(),
                channel: "power".into(),
                expected_unit: Some("W".into()),
            })],
            1,
        )
        .unwrap();
        let scheduler = AcquisitionScheduler::new(registry, RetryPolicy::default());
        let report = scheduler.run(Uuid::new_v4(), &sequence, &events()).await;

        match report.outcome {
            RunOutcome::Aborted { error, .. } => {
                assert!(matches!(
                    error,
                    SuiteError::RunAborted { ref source, .. } if matches!(**source, SuiteError::Configuration { .. })
                ));
            }
            RunOutcome::Completed => panic!("unit mismatch should abort"),
        }
    }

    #[tokio::test]
    async fn pre_cancelled_run_produces_no_records() {
        let registry = registry_with(vec![(
            DeviceClass::PowerMeter,
            MockDevice::new("pm1", DeviceClass::PowerMeter),
        )])
        .await;
        let sequence = AcquisitionSequence::new(vec![read_step("pm1", "power")], 5).unwrap();

        let scheduler = AcquisitionScheduler::new(registry, RetryPolicy::default());
        scheduler.cancel_flag().cancel();
        let report = scheduler.run(Uuid::new_v4(), &sequence, &events()).await;

        assert!(report.result.records.is_empty());
        match report.outcome {
            RunOutcome::Aborted { error, partial } => {
                assert!(matches!(error, SuiteError::Cancelled));
                assert!(partial.is_empty());
            }
            RunOutcome::Completed => panic!("cancelled run cannot complete"),
        }
    }

    #[tokio::test]
    async fn reading_timestamps_follow_step_issue_time() {
        let registry = registry_with(vec![(
            DeviceClass::Daq,
            MockDevice::new("daq1", DeviceClass::Daq),
        )])
        .await;
        let sequence = AcquisitionSequence::new(vec![read_step("daq1", "ai0")], 2).unwrap();

        let issued = Utc::now();
        let scheduler = AcquisitionScheduler::new(registry, RetryPolicy::default());
        let report = scheduler.run(Uuid::new_v4(), &sequence, &events()).await;

        for record in &report.result.records {
            let reading = record.reading("daq1", "ai0").unwrap();
            assert!(reading.timestamp >= issued);
        }
    }
}
