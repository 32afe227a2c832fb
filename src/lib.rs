//! Device orchestration and synchronized acquisition core for
//! quantum-optics experiments.
//!
//! The suite coordinates heterogeneous instruments — spectrometers,
//! motorized stages, photon-counting cards, power meters, DAQ boxes —
//! behind a uniform capability interface, executes acquisition sequences
//! across them, and assembles the readings into time-correlated records.
//!
//! Layers, bottom up: `transport` (wire I/O), `devices` (per-class
//! drivers), `registry` (lifecycle + per-device serialization),
//! `scheduler` (sequence execution, retries, cancellation), `aggregator`
//! (record assembly), `session` (run orchestration and the event stream).

pub mod aggregator;
pub mod config;
pub mod core;
pub mod devices;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod transport;
