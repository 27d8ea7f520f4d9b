//! Hardware abstractions for beamline calibration scans.
//!
//! This crate owns the two capability traits the calibration engine drives,
//! [`Motor`] for positionable axes and [`Detector`] for triggered readouts,
//! plus simulated implementations used for offline testing.
//!
//! The engine never talks to hardware directly; it is generic over these
//! traits, so the same scan code runs against EPICS-backed devices in
//! production and against the [`sim`] devices in tests.

pub mod axis;
pub mod sim;

pub use axis::{AxisError, AxisResult, Detector, Motor};
