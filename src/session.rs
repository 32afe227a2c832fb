//! Session control.
//!
//! A session binds one configuration — device descriptors, per-device
//! options, an acquisition sequence, a retry policy — to one run. The
//! controller registers and configures every device up front (a registry
//! or configuration mistake aborts before acquisition starts), executes
//! the scheduler on its own task, and broadcasts [`RunEvent`]s to any
//! subscribed consumer. Storage and plotting collaborators subscribe to
//! the same stream; the core makes no assumption about them.
//!
//! A run is successful if it completed all repeats. Partially successful
//! runs return both the partial result and the abort reason; disposition
//! (retry, keep, discard) stays with the caller.

use log::{info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::{
    AcquisitionSequence, DeviceDescriptor, ParamMap, RunEvent, RunOutcome, RunReport, RunState,
    RunSummary,
};
use crate::devices::AdapterFactory;
use crate::error::{SuiteError, SuiteResult};
use crate::registry::DeviceRegistry;
use crate::scheduler::{AcquisitionScheduler, CancelFlag, RetryPolicy};

/// One device binding within a session: what to register and how to
/// configure it before the run.
#[derive(Clone, Debug)]
pub struct DeviceSpec {
    pub descriptor: DeviceDescriptor,
    pub options: ParamMap,
}

/// Everything one run needs.
#[derive(Debug)]
pub struct SessionConfig {
    pub devices: Vec<DeviceSpec>,
    pub sequence: AcquisitionSequence,
    pub retry: RetryPolicy,
}

/// Top-level orchestrator: registry + scheduler + event stream.
pub struct SessionController {
    registry: Arc<DeviceRegistry>,
    factory: AdapterFactory,
    events: broadcast::Sender<RunEvent>,
    state: Arc<Mutex<RunState>>,
    cancel: Option<CancelFlag>,
    task: Option<JoinHandle<RunReport>>,
}

impl SessionController {
    pub fn new(factory: AdapterFactory) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            registry: Arc::new(DeviceRegistry::new()),
            factory,
            events,
            state: Arc::new(Mutex::new(RunState::Idle)),
            cancel: None,
            task: None,
        }
    }

    /// Registry access for the operator surface (list, status).
    pub fn registry(&self) -> Arc<DeviceRegistry> {
        Arc::clone(&self.registry)
    }

    /// Subscribe to the run's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(state: &Arc<Mutex<RunState>>, value: RunState) {
        match state.lock() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    /// Register and configure the session's devices, then launch the run.
    ///
    /// Registry errors (duplicate or unknown names) and configuration
    /// rejections surface here, before any acquisition step is issued;
    /// devices already brought up are torn down again.
    pub async fn start(&mut self, config: SessionConfig) -> SuiteResult<Uuid> {
        if self.state() == RunState::Running {
            return Err(SuiteError::Session("a run is already in progress".into()));
        }

        if let Err(e) = self.bring_up_devices(&config.devices).await {
            self.tear_down_devices().await;
            return Err(e);
        }

        let run_id = Uuid::new_v4();
        let scheduler =
            AcquisitionScheduler::new(Arc::clone(&self.registry), config.retry.clone());
        self.cancel = Some(scheduler.cancel_flag());
        Self::set_state(&self.state, RunState::Running);

        let _ = self.events.send(RunEvent::Started {
            run_id,
            repeat_count: config.sequence.repeat_count(),
        });

        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let registry = Arc::clone(&self.registry);
        let sequence = config.sequence;

        self.task = Some(tokio::spawn(async move {
            let report = scheduler.run(run_id, &sequence, &events).await;

            if let Err(e) = registry.shutdown().await {
                warn!("device teardown after run {}: {}", run_id, e);
            }

            let summary = match &report.outcome {
                RunOutcome::Completed => {
                    Self::set_state(&state, RunState::Completed);
                    RunSummary {
                        completed: true,
                        records: report.result.records.len(),
                        error: None,
                    }
                }
                RunOutcome::Aborted { error, .. } => {
                    Self::set_state(&state, RunState::Aborted);
                    RunSummary {
                        completed: false,
                        records: report.result.records.len(),
                        error: Some(error.to_string()),
                    }
                }
            };
            let _ = events.send(RunEvent::Finished { run_id, summary });

            report
        }));

        info!("session started run {}", run_id);
        Ok(run_id)
    }

    /// Request cooperative cancellation; takes effect at the next step
    /// boundary. In-flight device calls are never interrupted.
    pub fn cancel(&self) {
        if let Some(cancel) = &self.cancel {
            info!("session cancellation requested");
            cancel.cancel();
        }
    }

    /// Wait for the running acquisition and return its report.
    pub async fn wait(&mut self) -> SuiteResult<RunReport> {
        let task = self
            .task
            .take()
            .ok_or_else(|| SuiteError::Session("no run in progress".into()))?;
        task.await
            .map_err(|e| SuiteError::Session(format!("run task failed: {}", e)))
    }

    async fn bring_up_devices(&self, devices: &[DeviceSpec]) -> SuiteResult<()> {
        for spec in devices {
            let adapter = self.factory.build(&spec.descriptor)?;
            self.registry
                .register(spec.descriptor.clone(), adapter)
                .await?;

            if !spec.options.is_empty() {
                let handle = self.registry.get(&spec.descriptor.name)?;
                handle.configure(&spec.options).await?;
            }
        }
        Ok(())
    }

    async fn tear_down_devices(&self) {
        if let Err(e) = self.registry.shutdown().await {
            warn!("device teardown after failed start: {}", e);
        }
    }
}
