//! Process-wide device registry.
//!
//! Owns every adapter's lifecycle: connect on registration, disconnect on
//! teardown. Callers never hold an adapter directly — they get a
//! [`DeviceHandle`] by logical name and every command goes through that
//! handle's per-device lock, so no two commands are ever outstanding on one
//! physical instrument.
//!
//! Two locks, two jobs: the registry-wide table lock only guards the
//! name → entry map and is never held across an `await`; the per-device
//! `tokio::sync::Mutex` is held for the full duration of each blocking
//! device call. Registration and in-flight reads therefore never race.

use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

use crate::core::{
    DeviceAdapter, DeviceClass, DeviceDescriptor, DeviceStatus, ParamMap, Sample,
};
use crate::error::{SuiteError, SuiteResult};

type SharedAdapter = Arc<AsyncMutex<Box<dyn DeviceAdapter>>>;

struct Entry {
    descriptor: DeviceDescriptor,
    adapter: SharedAdapter,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, Entry>,
    /// Registration order, for reverse-order teardown
    order: Vec<String>,
}

/// Command handle for one registered device.
///
/// Cloneable and cheap; all methods serialize on the device's lock.
#[derive(Clone)]
pub struct DeviceHandle {
    name: String,
    class: DeviceClass,
    adapter: SharedAdapter,
}

impl DeviceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub async fn configure(&self, options: &ParamMap) -> SuiteResult<()> {
        self.adapter.lock().await.configure(options).await
    }

    pub async fn read(&self, channel: &str) -> SuiteResult<Sample> {
        self.adapter.lock().await.read(channel).await
    }

    pub async fn move_to(&self, target: f64, tolerance: f64) -> SuiteResult<()> {
        self.adapter.lock().await.move_to(target, tolerance).await
    }

    pub async fn trigger(&self, params: &ParamMap) -> SuiteResult<Sample> {
        self.adapter.lock().await.trigger(params).await
    }

    pub async fn status(&self) -> DeviceStatus {
        self.adapter.lock().await.status()
    }
}

/// Table of live adapters keyed by logical device name.
#[derive(Default)]
pub struct DeviceRegistry {
    table: Mutex<Table>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, Table> {
        // A poisoned table lock means a panic mid-mutation; propagating the
        // inner state is still sound because mutations are single-step.
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a device: reserve its name, connect the adapter, publish.
    ///
    /// Fails with [`SuiteError::DuplicateDevice`] if the name is taken (the
    /// first registration stays intact), or with whatever `connect` raises —
    /// in which case the reservation is rolled back.
    pub async fn register(
        &self,
        descriptor: DeviceDescriptor,
        adapter: Box<dyn DeviceAdapter>,
    ) -> SuiteResult<()> {
        let name = descriptor.name.clone();
        let shared: SharedAdapter = Arc::new(AsyncMutex::new(adapter));

        {
            let mut table = self.lock_table();
            if table.entries.contains_key(&name) {
                return Err(SuiteError::DuplicateDevice(name));
            }
            table.entries.insert(
                name.clone(),
                Entry {
                    descriptor,
                    adapter: Arc::clone(&shared),
                },
            );
            table.order.push(name.clone());
        }

        let connected = shared.lock().await.connect().await;
        if let Err(e) = connected {
            let mut table = self.lock_table();
            table.entries.remove(&name);
            table.order.retain(|n| n != &name);
            return Err(e);
        }

        info!("registered device '{}'", name);
        Ok(())
    }

    /// Handle for issuing commands to a registered device.
    pub fn get(&self, name: &str) -> SuiteResult<DeviceHandle> {
        let table = self.lock_table();
        let entry = table
            .entries
            .get(name)
            .ok_or_else(|| SuiteError::UnknownDevice(name.to_string()))?;
        Ok(DeviceHandle {
            name: name.to_string(),
            class: entry.descriptor.class,
            adapter: Arc::clone(&entry.adapter),
        })
    }

    /// Descriptors of all registered devices, in registration order.
    pub fn list(&self) -> Vec<DeviceDescriptor> {
        let table = self.lock_table();
        table
            .order
            .iter()
            .filter_map(|name| table.entries.get(name))
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    /// Live status of one device.
    pub async fn status(&self, name: &str) -> SuiteResult<DeviceStatus> {
        let handle = self.get(name)?;
        Ok(handle.status().await)
    }

    /// Disconnect and remove one device. Idempotent: unknown names succeed.
    pub async fn unregister(&self, name: &str) -> SuiteResult<()> {
        let entry = {
            let mut table = self.lock_table();
            table.order.retain(|n| n != name);
            table.entries.remove(name)
        };

        match entry {
            Some(entry) => {
                entry.adapter.lock().await.disconnect().await?;
                info!("unregistered device '{}'", name);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Tear down all devices in reverse registration order.
    ///
    /// Individual disconnect failures are recorded and returned after the
    /// full teardown instead of aborting it.
    pub async fn shutdown(&self) -> SuiteResult<()> {
        let names: Vec<String> = {
            let table = self.lock_table();
            table.order.iter().rev().cloned().collect()
        };

        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.unregister(&name).await {
                warn!("device '{}' failed to disconnect: {}", name, e);
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SuiteError::Shutdown(failures))
        }
    }
}
