//! ASCII lookup-table files and fitted gap/angle curves.
//!
//! Historical lookup tables are two-column whitespace-separated text
//! (bragg angle, gap), usually with a couple of header lines:
//!
//! ```text
//! Units   Deg     mm
//! 17.397  6.00900
//! 17.195  6.07499
//! ```
//!
//! [`load_ascii_table`] parses such a file into measurements; [`Curve`]
//! fits the quadratic and answers the questions a scan needs: the gap for
//! an angle, the local gradient, the angle for a gap (via bisection), and
//! a sensible sub-scan window for a new calibration seeded from an old
//! curve.

use crate::bisect;
use crate::curvefit::{self, FitError};
use crate::record::Measurement;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error from lookup-table file handling.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("failed to read lookup table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A data line that is not two floats; `line` counts from 1 and
    /// includes skipped header lines
    #[error("malformed lookup table line {line}: {content:?}")]
    Parse { line: usize, content: String },
}

/// Load a two-column ASCII lookup table.
///
/// The first `lines_to_skip` lines are headers and ignored. Every
/// remaining non-blank line must parse as `bragg gap`; anything else is a
/// [`TableError::Parse`] naming the offending line, never silently
/// dropped.
pub fn load_ascii_table(
    path: impl AsRef<Path>,
    lines_to_skip: usize,
) -> Result<Vec<Measurement>, TableError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| TableError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut measurements = Vec::new();
    for (index, line) in text.lines().enumerate().skip(lines_to_skip) {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let parsed = (
            fields.next().and_then(|f| f.parse::<f64>().ok()),
            fields.next().and_then(|f| f.parse::<f64>().ok()),
        );
        match (parsed, fields.next()) {
            ((Some(bragg), Some(gap)), None) => measurements.push(Measurement::new(bragg, gap)),
            _ => {
                return Err(TableError::Parse {
                    line: index + 1,
                    content: line.to_string(),
                })
            }
        }
    }
    Ok(measurements)
}

/// Sub-scan window over the gap axis: positions run `[start, start + range]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GapWindow {
    pub start: f64,
    pub range: f64,
}

/// A fitted quadratic gap/angle curve: `gap = a*angle^2 + b*angle + c`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Curve {
    coefficients: [f64; 3],
}

impl Curve {
    /// Fit the curve to (bragg, gap) measurements.
    ///
    /// Needs at least three points; direct least squares, no bounds.
    pub fn fit(measurements: &[Measurement]) -> Result<Self, FitError> {
        let xs: Vec<f64> = measurements.iter().map(|m| m.bragg).collect();
        let ys: Vec<f64> = measurements.iter().map(|m| m.gap).collect();
        let coeffs = curvefit::fit_polynomial(&xs, &ys, 2)?;
        Ok(Self {
            coefficients: [coeffs[0], coeffs[1], coeffs[2]],
        })
    }

    pub fn from_coefficients(coefficients: [f64; 3]) -> Self {
        Self { coefficients }
    }

    /// `[a, b, c]`, highest power first.
    pub fn coefficients(&self) -> [f64; 3] {
        self.coefficients
    }

    /// Gap at the given bragg angle.
    pub fn gap_for(&self, angle: f64) -> f64 {
        let [a, b, c] = self.coefficients;
        (a * angle + b) * angle + c
    }

    /// Local slope `d(gap)/d(angle) = 2a*angle + b`.
    pub fn gradient(&self, angle: f64) -> f64 {
        let [a, b, _] = self.coefficients;
        2.0 * a * angle + b
    }

    /// Invert the curve on `[lo, hi]` by bisection.
    ///
    /// The curve must be monotonic on the interval (true away from the
    /// parabola's vertex, where real gap/angle tables live).
    pub fn angle_for(&self, gap: f64, lo: f64, hi: f64) -> f64 {
        bisect::solve_for_y(
            gap,
            |angle| self.gap_for(angle),
            lo,
            hi,
            bisect::DEFAULT_TOLERANCE,
            bisect::DEFAULT_MAX_ITERATIONS,
        )
    }

    /// Gap window for a new scan starting at `bragg_start` and stepping
    /// by `bragg_step`.
    ///
    /// The range spans 2.5x the gap change over one bragg step so the
    /// peak cannot fall outside it, centred on the curve's prediction.
    pub fn window_for(&self, bragg_start: f64, bragg_step: f64) -> GapWindow {
        let expected = self.gap_for(bragg_start);
        let range = 2.5 * (self.gap_for(bragg_start - bragg_step) - expected).abs();
        GapWindow {
            start: expected - 0.5 * range,
            range,
        }
    }
}
