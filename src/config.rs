//! Configuration loading.
//!
//! A session is described declaratively — devices, options, sequence,
//! repeat count — and loaded from a TOML file with `PHOTON_DAQ_*`
//! environment overrides layered on top. The loaded [`Settings`] convert
//! into a validated [`SessionConfig`]; schema mistakes surface as
//! configuration errors before any device is touched.
//!
//! ```toml
//! [run]
//! repeat_count = 3
//!
//! [run.retry]
//! max_retries = 1
//! backoff = "50ms"
//!
//! [[devices]]
//! name = "stage1"
//! class = "stage"
//! unit = "mm"
//! options = { velocity = 5.0 }
//!
//! [devices.transport]
//! endpoint = "mock:"
//!
//! [[sequence]]
//! type = "move"
//! device = "stage1"
//! target = 10.0
//! tolerance = 0.1
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::core::{
    AcquisitionSequence, DeviceClass, DeviceDescriptor, ParamMap, SequenceEntry, SequenceStep,
};
use crate::error::{SuiteError, SuiteResult};
use crate::scheduler::RetryPolicy;
use crate::session::{DeviceSpec, SessionConfig};
use crate::transport::TransportSettings;

const DEFAULT_CONFIG_PATH: &str = "config/default";
const ENV_PREFIX: &str = "PHOTON_DAQ";

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub run: RunSettings,
    pub devices: Vec<DeviceSettings>,
    pub sequence: Vec<StepSettings>,
}

#[derive(Debug, Deserialize)]
pub struct RunSettings {
    #[serde(default = "default_repeat_count")]
    pub repeat_count: usize,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            repeat_count: default_repeat_count(),
            retry: RetrySettings::default(),
        }
    }
}

fn default_repeat_count() -> usize {
    1
}

#[derive(Debug, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(with = "humantime_serde", default = "default_backoff")]
    pub backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: default_backoff(),
        }
    }
}

fn default_max_retries() -> u32 {
    1
}

fn default_backoff() -> Duration {
    Duration::from_millis(50)
}

#[derive(Debug, Deserialize)]
pub struct DeviceSettings {
    pub name: String,
    pub class: DeviceClass,
    pub unit: String,
    pub transport: TransportSettings,
    #[serde(default)]
    pub options: ParamMap,
}

/// Declarative form of one sequence position. `Parallel` may not nest.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepSettings {
    Move {
        device: String,
        target: f64,
        tolerance: f64,
    },
    Wait {
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    Trigger {
        device: String,
        #[serde(default)]
        params: ParamMap,
    },
    Read {
        device: String,
        channel: String,
        #[serde(default)]
        expected_unit: Option<String>,
    },
    Parallel {
        steps: Vec<StepSettings>,
    },
}

impl StepSettings {
    fn into_step(self) -> SuiteResult<SequenceStep> {
        match self {
            StepSettings::Move {
                device,
                target,
                tolerance,
            } => Ok(SequenceStep::Move {
                device,
                target,
                tolerance,
            }),
            StepSettings::Wait { duration } => Ok(SequenceStep::Wait { duration }),
            StepSettings::Trigger { device, params } => {
                Ok(SequenceStep::Trigger { device, params })
            }
            StepSettings::Read {
                device,
                channel,
                expected_unit,
            } => Ok(SequenceStep::Read {
                device,
                channel,
                expected_unit,
            }),
            StepSettings::Parallel { .. } => Err(SuiteError::InvalidSequence(
                "parallel groups cannot nest".into(),
            )),
        }
    }

    fn into_entry(self) -> SuiteResult<SequenceEntry> {
        match self {
            StepSettings::Parallel { steps } => {
                let steps = steps
                    .into_iter()
                    .map(StepSettings::into_step)
                    .collect::<SuiteResult<Vec<_>>>()?;
                Ok(SequenceEntry::Parallel(steps))
            }
            single => Ok(SequenceEntry::Single(single.into_step()?)),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file (default `config/default.toml`) with
    /// environment overrides.
    pub fn new(path: Option<&str>) -> SuiteResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path.unwrap_or(DEFAULT_CONFIG_PATH)))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Validate and convert into a runnable session configuration.
    pub fn into_session_config(self) -> SuiteResult<SessionConfig> {
        let devices = self
            .devices
            .into_iter()
            .map(|d| DeviceSpec {
                descriptor: DeviceDescriptor {
                    name: d.name,
                    class: d.class,
                    transport: d.transport,
                    unit: d.unit,
                },
                options: d.options,
            })
            .collect();

        let entries = self
            .sequence
            .into_iter()
            .map(StepSettings::into_entry)
            .collect::<SuiteResult<Vec<_>>>()?;
        let sequence = AcquisitionSequence::new(entries, self.run.repeat_count)?;

        Ok(SessionConfig {
            devices,
            sequence,
            retry: RetryPolicy {
                max_retries: self.run.retry.max_retries,
                backoff: self.run.retry.backoff,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXAMPLE: &str = r#"
[run]
repeat_count = 3

[run.retry]
max_retries = 2
backoff = "10ms"

[[devices]]
name = "stage1"
class = "stage"
unit = "mm"
options = { velocity = 5.0 }

[devices.transport]
endpoint = "mock:"

[[devices]]
name = "spec1"
class = "spectrometer"
unit = "counts"

[devices.transport]
endpoint = "mock:"

[[sequence]]
type = "move"
device = "stage1"
target = 10.0
tolerance = 0.1

[[sequence]]
type = "wait"
duration = "5ms"

[[sequence]]
type = "read"
device = "spec1"
channel = "0"
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn load(contents: &str) -> SuiteResult<Settings> {
        let file = write_config(contents);
        Settings::new(Some(file.path().to_str().unwrap()))
    }

    #[test]
    fn example_config_round_trips() {
        let settings = load(EXAMPLE).unwrap();
        assert_eq!(settings.run.repeat_count, 3);
        assert_eq!(settings.run.retry.max_retries, 2);
        assert_eq!(settings.devices.len(), 2);
        assert_eq!(settings.devices[0].class, DeviceClass::Stage);
        assert_eq!(
            settings.devices[0].options.get("velocity").and_then(|v| v.as_f64()),
            Some(5.0)
        );

        let config = settings.into_session_config().unwrap();
        assert_eq!(config.sequence.repeat_count(), 3);
        assert_eq!(config.sequence.step_count(), 3);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.backoff, Duration::from_millis(10));
    }

    #[test]
    fn parallel_groups_parse_but_cannot_nest() {
        let parallel = r#"
[[devices]]
name = "pm1"
class = "power_meter"
unit = "W"

[devices.transport]
endpoint = "mock:"

[[sequence]]
type = "parallel"

[[sequence.steps]]
type = "read"
device = "pm1"
channel = "power"

[[sequence.steps]]
type = "trigger"
device = "tagger"
"#;
        let config = load(parallel).unwrap().into_session_config().unwrap();
        assert!(matches!(
            config.sequence.entries()[0],
            SequenceEntry::Parallel(ref steps) if steps.len() == 2
        ));

        let nested = r#"
[[devices]]
name = "pm1"
class = "power_meter"
unit = "W"

[devices.transport]
endpoint = "mock:"

[[sequence]]
type = "parallel"

[[sequence.steps]]
type = "parallel"
steps = []
"#;
        let err = load(nested).unwrap().into_session_config().unwrap_err();
        assert!(matches!(err, SuiteError::InvalidSequence(_)));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Settings::new(Some("/nonexistent/photon_daq.toml")).unwrap_err();
        assert!(matches!(err, SuiteError::Config(_)));
    }

    #[test]
    fn sequence_validation_applies_after_parsing() {
        let no_capture = r#"
[[devices]]
name = "stage1"
class = "stage"
unit = "mm"

[devices.transport]
endpoint = "mock:"

[[sequence]]
type = "move"
device = "stage1"
target = 1.0
tolerance = 0.1
"#;
        let err = load(no_capture).unwrap().into_session_config().unwrap_err();
        assert!(matches!(err, SuiteError::InvalidSequence(_)));
    }
}
