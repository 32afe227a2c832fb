//! Sample aggregation.
//!
//! Folds the ordered readings of one completed repeat into a single
//! [`AggregatedRecord`] keyed by device+channel. A capture step that
//! produced no reading means an adapter silently dropped a measurement;
//! that repeat is rejected with [`SuiteError::IncompleteRecord`] rather
//! than papered over with a missing-value default, because a silently
//! defaulted reading corrupts the scientific record.

use chrono::Utc;
use std::collections::BTreeMap;

use crate::core::{AcquisitionSequence, AggregatedRecord, Reading, SequenceStep};
use crate::error::{SuiteError, SuiteResult};

pub struct SampleAggregator;

impl SampleAggregator {
    /// Assemble one record from the readings of repeat `repeat_index`.
    pub fn assemble(
        sequence: &AcquisitionSequence,
        repeat_index: usize,
        readings: &[Reading],
    ) -> SuiteResult<AggregatedRecord> {
        for expected in sequence.capture_indices() {
            if !readings.iter().any(|r| r.step_index == expected) {
                return Err(SuiteError::IncompleteRecord {
                    repeat: repeat_index,
                    missing: describe_step(sequence, expected),
                });
            }
        }

        let mut map: BTreeMap<String, Reading> = BTreeMap::new();
        for reading in readings {
            let key = reading.key();
            if map.insert(key.clone(), reading.clone()).is_some() {
                return Err(SuiteError::Configuration {
                    device: reading.device.clone(),
                    message: format!("two readings share the record key '{}'", key),
                });
            }
        }

        Ok(AggregatedRecord {
            repeat_index,
            timestamp: Utc::now(),
            readings: map,
        })
    }
}

fn describe_step(sequence: &AcquisitionSequence, index: usize) -> String {
    match sequence.step_at(index) {
        Some(SequenceStep::Read {
            device, channel, ..
        }) => format!("read of '{}/{}' (step {})", device, channel, index),
        Some(SequenceStep::Trigger { device, .. }) => {
            format!("trigger on '{}' (step {})", device, index)
        }
        _ => format!("capture step {}", index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ParamMap, SequenceEntry};

    fn sequence() -> AcquisitionSequence {
        AcquisitionSequence::new(
            vec![
                SequenceEntry::Single(SequenceStep::Read {
                    device: "pm1".into(),
                    channel: "power".into(),
                    expected_unit: None,
                }),
                SequenceEntry::Single(SequenceStep::Trigger {
                    device: "tagger".into(),
                    params: ParamMap::new(),
                }),
            ],
            2,
        )
        .unwrap()
    }

    fn reading(device: &str, channel: &str, step_index: usize) -> Reading {
        Reading {
            device: device.into(),
            channel: channel.into(),
            value: 1.0,
            unit: "a.u.".into(),
            timestamp: Utc::now(),
            step_index,
        }
    }

    #[test]
    fn complete_repeat_assembles_one_record() {
        let readings = vec![reading("pm1", "power", 0), reading("tagger", "coincidences", 1)];
        let record = SampleAggregator::assemble(&sequence(), 0, &readings).unwrap();

        assert_eq!(record.repeat_index, 0);
        assert_eq!(record.readings.len(), 2);
        assert!(record.reading("pm1", "power").is_some());
        assert!(record.reading("tagger", "coincidences").is_some());
    }

    #[test]
    fn missing_capture_is_never_defaulted() {
        let readings = vec![reading("pm1", "power", 0)];
        let err = SampleAggregator::assemble(&sequence(), 1, &readings).unwrap_err();

        match err {
            SuiteError::IncompleteRecord { repeat, missing } => {
                assert_eq!(repeat, 1);
                assert!(missing.contains("tagger"));
            }
            other => panic!("expected IncompleteRecord, got {:?}", other),
        }
    }

    #[test]
    fn colliding_record_keys_are_rejected() {
        let readings = vec![
            reading("pm1", "power", 0),
            reading("tagger", "coincidences", 1),
            reading("pm1", "power", 1),
        ];
        let err = SampleAggregator::assemble(&sequence(), 0, &readings).unwrap_err();
        assert!(matches!(err, SuiteError::Configuration { .. }));
    }
}
