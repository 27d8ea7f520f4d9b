//! Capability traits for positionable axes and triggered detectors.
//!
//! Implementations wrap whatever transport the installation uses (EPICS
//! channel access, a motion controller's serial protocol, or the simulator).
//! Methods take `&self`: an implementation backed by a physically shared
//! axis must serialize access internally, since independent calibration
//! passes may hold handles to the same device.

use std::future::Future;
use thiserror::Error;

/// Error from a motor or detector operation.
///
/// The calibration engine treats these as opaque and propagates them
/// without masking: a failed physical move invalidates the rest of the
/// current sub-scan.
#[derive(Debug, Error)]
pub enum AxisError {
    /// Commanded move did not complete
    #[error("move failed: {0}")]
    Move(String),

    /// Position readback failed
    #[error("position read failed: {0}")]
    Read(String),

    /// Detector trigger or acquisition failed
    #[error("acquisition failed: {0}")]
    Acquisition(String),
}

/// Result type for axis operations
pub type AxisResult<T> = Result<T, AxisError>;

/// A positionable axis (monochromator bragg rotation, insertion-device gap).
///
/// `move_to` suspends until the motion completes; `read` returns the live
/// position, which may differ from the last demanded position (encoder
/// readback, servo dead-band).
pub trait Motor: Send + Sync {
    /// Move the axis to `position` and wait for completion.
    fn move_to(&self, position: f64) -> impl Future<Output = AxisResult<()>> + Send;

    /// Read the current axis position.
    fn read(&self) -> impl Future<Output = AxisResult<f64>> + Send;
}

/// A detector producing one scalar response per acquisition.
pub trait Detector: Send + Sync {
    /// Trigger an acquisition and wait for the resulting value.
    fn trigger_and_read(&self) -> impl Future<Output = AxisResult<f64>> + Send;
}
