//! Simulated axes and detectors for offline testing.
//!
//! [`SimMotor`] is a settling axis whose position is shared through a
//! handle, so a synthetic detector can observe where the motors are.
//! [`GaussianDiode`] reproduces the classic offline rig for gap/angle
//! lookup work: its response is a Gaussian in the gap-axis position whose
//! centre tracks a caller-supplied function of the bragg-axis position.

use crate::axis::{AxisError, AxisResult, Detector, Motor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Simulated motor with a shared position and optional settle delay.
///
/// Cloning yields another handle onto the same position, the way several
/// collaborators hold references to one physical axis.
#[derive(Debug, Clone)]
pub struct SimMotor {
    name: String,
    position: Arc<Mutex<f64>>,
    settle: Duration,
}

impl SimMotor {
    /// Create a motor at `initial` with no settle delay.
    pub fn new(name: impl Into<String>, initial: f64) -> Self {
        Self {
            name: name.into(),
            position: Arc::new(Mutex::new(initial)),
            settle: Duration::ZERO,
        }
    }

    /// Add a fixed settle delay to every move.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Current position without going through the async trait surface.
    ///
    /// Used by synthetic detectors that need to observe the axis.
    pub fn position(&self) -> f64 {
        *self.position.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Motor for SimMotor {
    async fn move_to(&self, position: f64) -> AxisResult<()> {
        if !position.is_finite() {
            return Err(AxisError::Move(format!(
                "{}: non-finite demand {position}",
                self.name
            )));
        }
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        *self.position.lock().unwrap_or_else(|e| e.into_inner()) = position;
        debug!(motor = %self.name, position, "sim move complete");
        Ok(())
    }

    async fn read(&self) -> AxisResult<f64> {
        Ok(self.position())
    }
}

/// Synthetic diode whose response is a Gaussian in the gap position.
///
/// The peak centre is `center_fn(bragg position)`, so the detector's
/// response surface follows whatever gap/angle relationship the test
/// wants to emulate. Optional seeded Gaussian noise makes the samples
/// realistic without making assertions flaky.
pub struct GaussianDiode<F> {
    gap: SimMotor,
    bragg: SimMotor,
    center_fn: F,
    amplitude: f64,
    sigma: f64,
    noise: Option<Mutex<(Normal<f64>, StdRng)>>,
}

impl<F> GaussianDiode<F>
where
    F: Fn(f64) -> f64 + Send + Sync,
{
    /// Create a noiseless diode observing the given motors.
    ///
    /// # Panics
    ///
    /// Panics if `sigma` is not strictly positive.
    pub fn new(gap: SimMotor, bragg: SimMotor, center_fn: F, amplitude: f64, sigma: f64) -> Self {
        assert!(sigma > 0.0, "sigma must be positive");
        Self {
            gap,
            bragg,
            center_fn,
            amplitude,
            sigma,
            noise: None,
        }
    }

    /// Add zero-mean Gaussian noise with the given standard deviation,
    /// seeded for reproducibility.
    ///
    /// # Panics
    ///
    /// Panics if `std_dev` is not strictly positive.
    pub fn with_noise(mut self, std_dev: f64, seed: u64) -> Self {
        assert!(std_dev > 0.0, "noise std_dev must be positive");
        let normal = Normal::new(0.0, std_dev).expect("finite positive std_dev");
        self.noise = Some(Mutex::new((normal, StdRng::seed_from_u64(seed))));
        self
    }
}

impl<F> Detector for GaussianDiode<F>
where
    F: Fn(f64) -> f64 + Send + Sync,
{
    async fn trigger_and_read(&self) -> AxisResult<f64> {
        let gap = self.gap.position();
        let center = (self.center_fn)(self.bragg.position());
        let arg = (gap - center) / self.sigma;
        let mut value = self.amplitude * (-0.5 * arg * arg).exp();
        if let Some(noise) = &self.noise {
            let (normal, rng) = &mut *noise.lock().unwrap_or_else(|e| e.into_inner());
            value += normal.sample(rng);
        }
        Ok(value)
    }
}

/// Motor wrapper that fails after a fixed number of moves.
///
/// Used to exercise fault isolation: a calibration pass driving one of
/// these dies mid-scan while its siblings keep running.
pub struct FailingMotor {
    inner: SimMotor,
    moves_before_failure: usize,
    moves: AtomicUsize,
}

impl FailingMotor {
    pub fn new(inner: SimMotor, moves_before_failure: usize) -> Self {
        Self {
            inner,
            moves_before_failure,
            moves: AtomicUsize::new(0),
        }
    }
}

impl Motor for FailingMotor {
    async fn move_to(&self, position: f64) -> AxisResult<()> {
        let n = self.moves.fetch_add(1, Ordering::SeqCst);
        if n >= self.moves_before_failure {
            return Err(AxisError::Move(format!(
                "simulated failure on move {}",
                n + 1
            )));
        }
        self.inner.move_to(position).await
    }

    async fn read(&self) -> AxisResult<f64> {
        self.inner.read().await
    }
}
