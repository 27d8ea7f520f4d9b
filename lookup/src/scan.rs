//! Adaptive lookup-table scan: one calibration pass.
//!
//! One pass walks the bragg axis through a schedule of positions and, at
//! each, sweeps the gap axis through a sub-scan window while sampling the
//! detector:
//!
//! 1. Move the bragg axis to its next scheduled position
//! 2. Derive the gap window - centred on the previous fitted peak when
//!    re-centring is enabled, otherwise starting at the live gap position
//!    plus the configured offset
//! 3. Drive the gap through the window, triggering the detector at each
//!    position
//! 4. Fit a Gaussian to the samples; the fitted centre (rebased onto the
//!    window start) is that angle's peak gap
//! 5. Repeat for the remaining bragg positions, then fit a quadratic
//!    across all (bragg, peak) pairs - the lookup-table coefficients
//!
//! A pass that fails mid-way returns the error and produces nothing: a
//! partial calibration is never handed to the store. Whether a re-centred
//! window stays inside axis soft limits is the caller's concern; the
//! controller does not clamp.

use crate::curvefit::{
    self, BoundsProvider, CurveFitter, FitError, FitModel, Gaussian,
};
use crate::record::{Measurement, Record};
use crate::table::Curve;
use beamline::{AxisError, Detector, Motor};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error during a calibration pass.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Motor or detector failure; invalidates the rest of the pass
    #[error(transparent)]
    Axis(#[from] AxisError),

    /// Fit failure with no fallback (regression fits, bad sample sets)
    #[error(transparent)]
    Fit(#[from] FitError),

    /// Window configuration produces no sample positions
    #[error("empty gap window: range {range}, step {step}")]
    EmptyWindow { range: f64, step: f64 },
}

/// Configuration for one calibration pass.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// First bragg position
    pub bragg_start: f64,
    /// Signed bragg increment per step
    pub bragg_step: f64,
    /// Number of bragg positions
    pub bragg_steps: usize,
    /// Gap position taken up before the first sub-scan
    pub initial_gap: f64,
    /// Width of each sub-scan window
    pub gap_range: f64,
    /// Gap increment within a sub-scan
    pub gap_step: f64,
    /// Centre each window on the previous fitted peak
    pub recenter: bool,
    /// Added to the live gap position when a window is not re-centred
    pub gap_offset: f64,
    /// Bounds policy for the per-step peak fit; `None` fits unconstrained
    pub peak_bounds: Option<BoundsProvider>,
    /// Detector name recorded in the resulting calibration record
    pub detector_name: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            bragg_start: 11.4,
            bragg_step: -0.3,
            bragg_steps: 5,
            initial_gap: 6.0,
            gap_range: 0.15,
            gap_step: 0.01,
            recenter: true,
            gap_offset: 0.0,
            peak_bounds: Some(curvefit::gaussian_peak_bounds),
            detector_name: "diode".to_string(),
        }
    }
}

/// Result of one pass: the per-step peak table and the fitted quadratic.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// (bragg, peak gap) pairs in acquisition order
    pub peaks: Vec<Measurement>,
    /// `[a, b, c]` with `gap = a*bragg^2 + b*bragg + c`
    pub coefficients: [f64; 3],
}

impl ScanOutcome {
    /// The fitted lookup curve.
    pub fn curve(&self) -> Curve {
        Curve::from_coefficients(self.coefficients)
    }

    /// Package the pass into a calibration record for the given target.
    pub fn into_record(
        self,
        element: &str,
        edge: &str,
        harmonic: u32,
        detector: &str,
        comment: &str,
    ) -> Record {
        Record::new(element, edge, harmonic, detector, comment, self.peaks)
    }
}

/// Controller for one calibration pass over a bragg/gap axis pair.
pub struct LookupScan<B, G, D> {
    bragg: B,
    gap: G,
    detector: D,
    config: ScanConfig,
}

impl<B: Motor, G: Motor, D: Detector> LookupScan<B, G, D> {
    pub fn new(bragg: B, gap: G, detector: D, config: ScanConfig) -> Self {
        Self {
            bragg,
            gap,
            detector,
            config,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Run the pass and return the peak table plus lookup coefficients.
    pub async fn run(&self) -> Result<ScanOutcome, ScanError> {
        let config = &self.config;
        let offsets = window_offsets(config)?;

        info!(
            bragg_start = config.bragg_start,
            bragg_step = config.bragg_step,
            steps = config.bragg_steps,
            "starting lookup scan"
        );
        self.gap.move_to(config.initial_gap).await?;

        let mut fitter =
            CurveFitter::new(Gaussian).with_transform(curvefit::normalize_to_first_x);
        if let Some(bounds) = config.peak_bounds {
            fitter = fitter.with_bounds(bounds);
        }

        let mut peaks: Vec<Measurement> = Vec::with_capacity(config.bragg_steps);
        let mut last_peak: Option<f64> = None;

        for step in 0..config.bragg_steps {
            let bragg_angle = config.bragg_start + step as f64 * config.bragg_step;
            self.bragg.move_to(bragg_angle).await?;

            let window_start = match last_peak {
                Some(peak) if config.recenter => peak - 0.5 * config.gap_range,
                _ => self.gap.read().await? + config.gap_offset,
            };
            info!(step, bragg = bragg_angle, window_start, "scanning gap window");

            let mut gaps = Vec::with_capacity(offsets.len());
            let mut values = Vec::with_capacity(offsets.len());
            for offset in &offsets {
                let position = window_start + offset;
                self.gap.move_to(position).await?;
                let value = self.detector.trigger_and_read().await?;
                debug!(gap = position, value, "sub-scan sample");
                gaps.push(position);
                values.push(value);
            }

            let peak = peak_or_fallback(fitter.fit(&gaps, &values), &gaps, &values)?;
            info!(bragg = bragg_angle, peak, "sub-scan peak located");
            peaks.push(Measurement::new(bragg_angle, peak));
            last_peak = Some(peak);
        }

        let xs: Vec<f64> = peaks.iter().map(|m| m.bragg).collect();
        let ys: Vec<f64> = peaks.iter().map(|m| m.gap).collect();
        let coeffs = curvefit::fit_polynomial(&xs, &ys, 2)?;
        let coefficients = [coeffs[0], coeffs[1], coeffs[2]];
        info!(?coefficients, "lookup scan complete");

        Ok(ScanOutcome {
            peaks,
            coefficients,
        })
    }

    /// Run the pass and package it as a record for the given target.
    pub async fn run_to_record(
        &self,
        element: &str,
        edge: &str,
        harmonic: u32,
    ) -> Result<Record, ScanError> {
        let outcome = self.run().await?;
        Ok(outcome.into_record(
            element,
            edge,
            harmonic,
            &self.config.detector_name,
            "gap scan at fitted peak response",
        ))
    }
}

/// Relative sample offsets covering `[0, gap_range]` in `gap_step`
/// increments, inclusive of the far end within float slack.
fn window_offsets(config: &ScanConfig) -> Result<Vec<f64>, ScanError> {
    if !(config.gap_range > 0.0) || !(config.gap_step > 0.0) {
        return Err(ScanError::EmptyWindow {
            range: config.gap_range,
            step: config.gap_step,
        });
    }
    let slack = config.gap_step * 1e-9;
    let mut offsets = Vec::new();
    let mut k = 0usize;
    loop {
        let offset = k as f64 * config.gap_step;
        if offset > config.gap_range + slack {
            break;
        }
        offsets.push(offset);
        k += 1;
    }
    Ok(offsets)
}

/// Peak position from a fit result, falling back to the largest sample
/// when the fit did not converge.
///
/// The fitted centre is relative to the window start (the fitter
/// normalizes x onto the first sample), so the first gap position is
/// added back. Errors other than non-convergence have no fallback.
fn peak_or_fallback(
    fit: Result<Vec<f64>, FitError>,
    gaps: &[f64],
    values: &[f64],
) -> Result<f64, ScanError> {
    match fit {
        Ok(params) => Ok(params[Gaussian::MEAN] + gaps[0]),
        Err(FitError::Convergence { reason }) => {
            warn!(%reason, "peak fit did not converge, using largest sample");
            curvefit::position_of_maximum(gaps, values).ok_or_else(|| {
                ScanError::Fit(FitError::InsufficientData {
                    got: 0,
                    params: Gaussian::PARAMS,
                })
            })
        }
        Err(error) => Err(error.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use beamline::sim::{FailingMotor, GaussianDiode, SimMotor};

    fn test_config() -> ScanConfig {
        ScanConfig {
            bragg_start: 0.0,
            bragg_step: 1.0,
            bragg_steps: 3,
            initial_gap: 10.0,
            gap_range: 10.0,
            gap_step: 1.0,
            recenter: true,
            gap_offset: 0.0,
            peak_bounds: None,
            detector_name: "sim diode".to_string(),
        }
    }

    #[tokio::test]
    async fn recentering_tracks_a_moving_peak() {
        let bragg = SimMotor::new("bragg", 0.0);
        let gap = SimMotor::new("gap", 10.0);
        // Peak gap tracks 10 + 2*bragg: 10, 12, 14 across the steps.
        let diode = GaussianDiode::new(gap.clone(), bragg.clone(), |b| 10.0 + 2.0 * b, 1.0, 2.0);

        let scan = LookupScan::new(bragg, gap, diode, test_config());
        let outcome = scan.run().await.unwrap();

        let expected = [10.0, 12.0, 14.0];
        assert_eq!(outcome.peaks.len(), 3);
        for (measurement, expected) in outcome.peaks.iter().zip(expected) {
            assert_relative_eq!(measurement.gap, expected, epsilon = 1e-4);
        }

        // The relationship is linear, so the quadratic collapses to it.
        let [a, b, c] = outcome.coefficients;
        assert_relative_eq!(a, 0.0, epsilon = 1e-4);
        assert_relative_eq!(b, 2.0, epsilon = 1e-3);
        assert_relative_eq!(c, 10.0, epsilon = 1e-3);

        // The fitted curve answers feed-forward lookups both ways.
        let curve = outcome.curve();
        assert_relative_eq!(curve.gap_for(1.5), 13.0, epsilon = 1e-2);
        assert_relative_eq!(curve.angle_for(13.0, 0.0, 2.0), 1.5, epsilon = 1e-3);
    }

    #[tokio::test]
    async fn bounded_fit_recovers_peaks_when_windows_bracket() {
        let bragg = SimMotor::new("bragg", 0.0);
        let gap = SimMotor::new("gap", 5.0);
        let diode = GaussianDiode::new(gap.clone(), bragg.clone(), |b| 10.0 + 2.0 * b, 1.0, 2.0);

        // Start the first window at gap 5 so it brackets the first peak;
        // re-centring brackets the rest.
        let config = ScanConfig {
            initial_gap: 5.0,
            peak_bounds: Some(curvefit::gaussian_peak_bounds),
            ..test_config()
        };
        let scan = LookupScan::new(bragg, gap, diode, config);
        let outcome = scan.run().await.unwrap();

        for (measurement, expected) in outcome.peaks.iter().zip([10.0, 12.0, 14.0]) {
            assert_relative_eq!(measurement.gap, expected, epsilon = 1e-4);
        }
    }

    #[tokio::test]
    async fn without_recentering_windows_follow_the_live_position() {
        let bragg = SimMotor::new("bragg", 0.0);
        let gap = SimMotor::new("gap", 10.0);
        // Windows drift with the axis: [11,21], [22,32], [33,43] with the
        // configured offset of 1. Put the peaks at their centres.
        let diode = GaussianDiode::new(gap.clone(), bragg.clone(), |b| 16.0 + 11.0 * b, 1.0, 2.0);

        let config = ScanConfig {
            recenter: false,
            gap_offset: 1.0,
            ..test_config()
        };
        let scan = LookupScan::new(bragg, gap.clone(), diode, config);
        let outcome = scan.run().await.unwrap();

        for (measurement, expected) in outcome.peaks.iter().zip([16.0, 27.0, 38.0]) {
            assert_relative_eq!(measurement.gap, expected, epsilon = 1e-4);
        }
        // The last window ended at 43; a re-centred scan would have
        // finished lower.
        assert_relative_eq!(gap.position(), 43.0, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn axis_failure_aborts_the_pass() {
        let bragg = SimMotor::new("bragg", 0.0);
        let gap = FailingMotor::new(SimMotor::new("gap", 10.0), 4);
        let observed = SimMotor::new("gap-observed", 10.0);
        let diode = GaussianDiode::new(observed, SimMotor::new("b", 0.0), |_| 12.0, 1.0, 2.0);

        let scan = LookupScan::new(bragg, gap, diode, test_config());
        assert!(matches!(scan.run().await, Err(ScanError::Axis(_))));
    }

    #[tokio::test]
    async fn degenerate_window_is_rejected() {
        let config = ScanConfig {
            gap_step: 0.0,
            ..test_config()
        };
        let bragg = SimMotor::new("bragg", 0.0);
        let gap = SimMotor::new("gap", 10.0);
        let diode = GaussianDiode::new(gap.clone(), bragg.clone(), |_| 12.0, 1.0, 2.0);

        let scan = LookupScan::new(bragg, gap, diode, config);
        assert!(matches!(
            scan.run().await,
            Err(ScanError::EmptyWindow { .. })
        ));
    }

    #[tokio::test]
    async fn run_to_record_carries_the_target_identity() {
        let bragg = SimMotor::new("bragg", 0.0);
        let gap = SimMotor::new("gap", 10.0);
        let diode = GaussianDiode::new(gap.clone(), bragg.clone(), |b| 10.0 + 2.0 * b, 1.0, 2.0);

        let scan = LookupScan::new(bragg, gap, diode, test_config());
        let record = scan.run_to_record("Fe", "K", 7).await.unwrap();

        assert_eq!(record.element, "Fe");
        assert_eq!(record.edge, "K");
        assert_eq!(record.harmonic, 7);
        assert_eq!(record.detector, "sim diode");
        assert_eq!(record.measurements.len(), 3);
    }

    #[test]
    fn window_offsets_cover_the_range_inclusively() {
        let config = test_config();
        let offsets = window_offsets(&config).unwrap();
        assert_eq!(offsets.len(), 11);
        assert_relative_eq!(offsets[0], 0.0);
        assert_relative_eq!(*offsets.last().unwrap(), 10.0);
    }

    #[test]
    fn fallback_uses_largest_sample_on_non_convergence() {
        let gaps = [10.0, 11.0, 12.0];
        let values = [0.2, 0.9, 0.3];
        let fit = Err(FitError::Convergence {
            reason: "test".to_string(),
        });
        let peak = peak_or_fallback(fit, &gaps, &values).unwrap();
        assert_relative_eq!(peak, 11.0);
    }

    #[test]
    fn fallback_does_not_mask_other_fit_errors() {
        let fit = Err(FitError::NonFinite);
        let result = peak_or_fallback(fit, &[10.0], &[0.1]);
        assert!(matches!(result, Err(ScanError::Fit(FitError::NonFinite))));
    }

    #[test]
    fn fitted_centre_is_rebased_onto_the_window() {
        let gaps = [10.0, 11.0, 12.0];
        let values = [0.2, 0.9, 0.3];
        // Fitted parameters are in window-relative coordinates.
        let peak = peak_or_fallback(Ok(vec![0.9, 1.3, 0.5]), &gaps, &values).unwrap();
        assert_relative_eq!(peak, 11.3);
    }
}
