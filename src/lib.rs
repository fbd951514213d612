//! Plant Moisture Display firmware library.
//!
//! Exposes every module for host-side integration testing and external
//! inspection. All ESP-IDF-specific code is guarded by
//! `#[cfg(target_os = "espidf")]` within each module; host builds get
//! in-memory simulation backends instead, so the complete wake cycle is
//! testable without hardware.

#![deny(unused_must_use)]

pub mod config;
pub mod cycle;
pub mod display;
pub mod net;
pub mod ota;
pub mod pins;
pub mod power;
pub mod settings;
pub mod snapshot;
pub mod telemetry;
