//! Device driver adapters.
//!
//! One driver per instrument class, each speaking its wire protocol through
//! the [`crate::transport::Transport`] tier:
//!
//! - [`LinearStage`] - motorized stage (ESP300-style command set)
//! - [`OpticalPowerMeter`] - averaged, wavelength-corrected power readings
//! - [`PhotonCounter`] - coincidence counting card with latch recovery
//! - [`FiberSpectrometer`] - integration-time-controlled pixel reads
//! - [`DaqBox`] - general-purpose sampled analog inputs
//! - [`MockDevice`] - in-memory simulator for every class, with scripted
//!   failure injection for tests
//!
//! [`AdapterFactory`] maps a [`DeviceDescriptor`] to a live adapter; callers
//! can override the constructor for any class to inject mocks.

use std::collections::HashMap;

use crate::core::{DeviceAdapter, DeviceClass, DeviceDescriptor};
use crate::error::{SuiteError, SuiteResult};

pub mod counter;
pub mod daq_box;
pub mod mock;
pub mod power_meter;
pub mod spectrometer;
pub mod stage;

pub use counter::PhotonCounter;
pub use daq_box::DaqBox;
pub use mock::MockDevice;
pub use power_meter::OpticalPowerMeter;
pub use spectrometer::FiberSpectrometer;
pub use stage::LinearStage;

/// Constructor for one device class.
pub type AdapterCtor =
    Box<dyn Fn(&DeviceDescriptor) -> SuiteResult<Box<dyn DeviceAdapter>> + Send + Sync>;

/// Maps device descriptors to adapter instances.
///
/// The default constructors build the in-memory simulator for `mock:*`
/// endpoints and the serial-backed driver otherwise (requiring the
/// `instrument_serial` feature). Tests replace individual constructors to
/// inject scripted mocks.
pub struct AdapterFactory {
    ctors: HashMap<DeviceClass, AdapterCtor>,
}

impl AdapterFactory {
    /// Factory with no constructors registered.
    pub fn empty() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// Factory with the stock constructor for every device class.
    pub fn new() -> Self {
        let mut factory = Self::empty();
        for class in [
            DeviceClass::Spectrometer,
            DeviceClass::Stage,
            DeviceClass::Counter,
            DeviceClass::PowerMeter,
            DeviceClass::Daq,
        ] {
            factory.register(class, Box::new(build_stock_adapter));
        }
        factory
    }

    /// Replace the constructor for one device class.
    pub fn register(&mut self, class: DeviceClass, ctor: AdapterCtor) {
        self.ctors.insert(class, ctor);
    }

    /// Build a live (not yet connected) adapter for a descriptor.
    pub fn build(&self, descriptor: &DeviceDescriptor) -> SuiteResult<Box<dyn DeviceAdapter>> {
        let ctor = self
            .ctors
            .get(&descriptor.class)
            .ok_or_else(|| SuiteError::Configuration {
                device: descriptor.name.clone(),
                message: format!("no adapter constructor for class '{}'", descriptor.class),
            })?;
        ctor(descriptor)
    }
}

impl Default for AdapterFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn build_stock_adapter(descriptor: &DeviceDescriptor) -> SuiteResult<Box<dyn DeviceAdapter>> {
    if descriptor.transport.is_mock() {
        return Ok(Box::new(MockDevice::for_descriptor(descriptor)));
    }

    #[cfg(feature = "instrument_serial")]
    {
        use crate::transport::SerialTransport;

        let transport = Box::new(SerialTransport::new(descriptor.transport.clone()));
        let adapter: Box<dyn DeviceAdapter> = match descriptor.class {
            DeviceClass::Stage => Box::new(LinearStage::new(descriptor, transport)),
            DeviceClass::PowerMeter => Box::new(OpticalPowerMeter::new(descriptor, transport)),
            DeviceClass::Counter => Box::new(PhotonCounter::new(descriptor, transport)),
            DeviceClass::Spectrometer => Box::new(FiberSpectrometer::new(descriptor, transport)),
            DeviceClass::Daq => Box::new(DaqBox::new(descriptor, transport)),
        };
        Ok(adapter)
    }

    #[cfg(not(feature = "instrument_serial"))]
    Err(SuiteError::FeatureDisabled("instrument_serial"))
}
