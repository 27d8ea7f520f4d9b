//! Nonlinear curve fitting over sampled detector data.
//!
//! [`CurveFitter`] is the stateless fitting primitive used throughout the
//! engine: a parametric model, an optional per-parameter bounds policy and
//! an optional domain transform, driven by Levenberg-Marquardt with a
//! numeric Jacobian. Polynomial fits go through [`fit_polynomial`], a
//! direct SVD least-squares solve that needs no iteration and no bounds.
//!
//! The fit minimises squared residuals; there is no global-optimum
//! guarantee. Fitted parameters are in the coordinates the model saw: if a
//! transform was configured, mapping parameters back to the original
//! coordinates is the caller's job (for the x-normalizing transform, add
//! the first sample's x back onto the fitted centre).

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn};
use thiserror::Error;

/// Error from a curve fit.
#[derive(Debug, Error)]
pub enum FitError {
    /// Nonlinear minimisation did not converge
    #[error("fit did not converge: {reason}")]
    Convergence { reason: String },

    /// Fewer samples than the model has parameters
    #[error("insufficient samples for a {params}-parameter fit: got {got}")]
    InsufficientData { got: usize, params: usize },

    /// x and y sample counts differ
    #[error("sample count mismatch: {xs} x values, {ys} y values")]
    LengthMismatch { xs: usize, ys: usize },

    /// Samples contain NaN or infinity
    #[error("samples contain non-finite values")]
    NonFinite,
}

/// A parametric model of one independent variable.
pub trait FitModel {
    /// Number of free parameters.
    const PARAMS: usize;

    /// Evaluate the model at `x` for the given parameter vector.
    fn eval(&self, x: f64, params: &[f64]) -> f64;

    /// Starting parameter vector derived from the samples.
    fn initial_guess(&self, xs: &[f64], ys: &[f64]) -> Vec<f64>;
}

/// Gaussian peak: `amp * exp(-(x - mean)^2 / (2 * sigma^2))`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gaussian;

impl Gaussian {
    /// Index of the amplitude parameter.
    pub const AMPLITUDE: usize = 0;
    /// Index of the peak-centre parameter.
    pub const MEAN: usize = 1;
    /// Index of the width parameter.
    pub const SIGMA: usize = 2;
}

impl FitModel for Gaussian {
    const PARAMS: usize = 3;

    fn eval(&self, x: f64, params: &[f64]) -> f64 {
        let (amp, mean, sigma) = (params[0], params[1], params[2]);
        let arg = (x - mean) / sigma;
        amp * (-0.5 * arg * arg).exp()
    }

    /// Amplitude from the largest sample, centre from its position,
    /// unit width.
    fn initial_guess(&self, xs: &[f64], ys: &[f64]) -> Vec<f64> {
        let max_y = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let centre = position_of_maximum(xs, ys).unwrap_or(0.0);
        vec![max_y, centre, 1.0]
    }
}

/// Quadratic: `a*x^2 + b*x + c`, parameters ordered `[a, b, c]`.
///
/// Linear in its parameters, so [`fit_polynomial`] is normally the better
/// tool; the model exists for callers that want the same [`CurveFitter`]
/// surface for every fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quadratic;

impl FitModel for Quadratic {
    const PARAMS: usize = 3;

    fn eval(&self, x: f64, params: &[f64]) -> f64 {
        (params[0] * x + params[1]) * x + params[2]
    }

    fn initial_guess(&self, _xs: &[f64], ys: &[f64]) -> Vec<f64> {
        let mean_y = ys.iter().sum::<f64>() / ys.len() as f64;
        vec![0.0, 0.0, mean_y]
    }
}

/// Produces per-parameter `(lower, upper)` bounds from the samples.
pub type BoundsProvider = fn(&[f64], &[f64]) -> Vec<(f64, f64)>;

/// Rewrites `(xs, ys)` before fitting.
pub type DomainTransform = fn(&[f64], &[f64]) -> (Vec<f64>, Vec<f64>);

/// Smallest width the default Gaussian bounds allow; zero would make the
/// model inevaluable after projection onto the bounds box.
const MIN_SIGMA: f64 = 1e-6;

/// Default bounds policy for Gaussian peak fits over detector data.
///
/// Amplitude is confined to `[0, max(y) + 0.1]`, the centre to a window of
/// ±10% of the x-range around the weighted centroid `Σ(x·y)/Σy`, and the
/// width to `[1e-6, 10000]`. Assumes a positive response somewhere in the
/// window; an all-zero sub-scan makes the centroid undefined.
pub fn gaussian_peak_bounds(xs: &[f64], ys: &[f64]) -> Vec<(f64, f64)> {
    let max_y = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let sum_y: f64 = ys.iter().sum();
    let weighted_centre = xs.iter().zip(ys).map(|(x, y)| x * y).sum::<f64>() / sum_y;

    let min_x = xs.iter().copied().fold(f64::INFINITY, f64::min);
    let max_x = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let centre_range = (max_x - min_x) * 0.1;

    vec![
        (0.0, max_y + 0.1),
        (weighted_centre - centre_range, weighted_centre + centre_range),
        (MIN_SIGMA, 10_000.0),
    ]
}

/// Domain transform that rebases x onto the first sample.
///
/// Fitted positions come out relative to `xs[0]`; the caller adds it back.
pub fn normalize_to_first_x(xs: &[f64], ys: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let x0 = xs.first().copied().unwrap_or(0.0);
    (xs.iter().map(|x| x - x0).collect(), ys.to_vec())
}

/// x position of the largest y sample, or `None` for empty input.
///
/// The documented fallback when a peak fit fails to converge.
pub fn position_of_maximum(xs: &[f64], ys: &[f64]) -> Option<f64> {
    ys.iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| xs[i])
}

/// Curve-fit service: model plus optional bounds policy and transform.
pub struct CurveFitter<M: FitModel> {
    model: M,
    bounds: Option<BoundsProvider>,
    transform: Option<DomainTransform>,
}

impl<M: FitModel> CurveFitter<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            bounds: None,
            transform: None,
        }
    }

    /// Constrain parameters with a bounds policy.
    ///
    /// Bounds are enforced by projection: every parameter step is clamped
    /// onto the bounds box before residuals are evaluated.
    pub fn with_bounds(mut self, provider: BoundsProvider) -> Self {
        self.bounds = Some(provider);
        self
    }

    /// Rewrite the samples before fitting.
    pub fn with_transform(mut self, transform: DomainTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Fit the model to the samples, returning the parameter vector.
    ///
    /// Parameters are in the transformed coordinates when a transform is
    /// configured. Non-convergence is an error; peak-location callers are
    /// expected to fall back to [`position_of_maximum`] rather than
    /// propagate it.
    pub fn fit(&self, xs: &[f64], ys: &[f64]) -> Result<Vec<f64>, FitError> {
        if xs.len() != ys.len() {
            return Err(FitError::LengthMismatch {
                xs: xs.len(),
                ys: ys.len(),
            });
        }
        if xs.len() < M::PARAMS {
            return Err(FitError::InsufficientData {
                got: xs.len(),
                params: M::PARAMS,
            });
        }
        if xs.iter().chain(ys).any(|v| !v.is_finite()) {
            return Err(FitError::NonFinite);
        }

        let (fx, fy) = match self.transform {
            Some(transform) => transform(xs, ys),
            None => (xs.to_vec(), ys.to_vec()),
        };

        let bounds = self.bounds.map(|provider| provider(&fx, &fy));
        let mut guess = self.model.initial_guess(&fx, &fy);
        if let Some(bounds) = &bounds {
            clamp_to_bounds(&mut guess, bounds);
        }

        let problem = LmProblem {
            model: &self.model,
            xs: &fx,
            ys: &fy,
            bounds: bounds.as_deref(),
            params: DVector::from_vec(guess),
        };
        let (problem, report) = LevenbergMarquardt::new().minimize(problem);
        if !report.termination.was_successful() {
            return Err(FitError::Convergence {
                reason: format!(
                    "{:?} (objective {:.3e})",
                    report.termination, report.objective_function
                ),
            });
        }

        let params: Vec<f64> = problem.params.iter().copied().collect();
        if params.iter().any(|p| !p.is_finite()) {
            return Err(FitError::Convergence {
                reason: "non-finite fitted parameters".to_string(),
            });
        }
        Ok(params)
    }
}

fn clamp_to_bounds(params: &mut [f64], bounds: &[(f64, f64)]) {
    for (param, &(lower, upper)) in params.iter_mut().zip(bounds) {
        // An inverted pair (possible when a provider sees pathological
        // samples) leaves the parameter unconstrained.
        if lower <= upper {
            *param = param.clamp(lower, upper);
        }
    }
}

/// Levenberg-Marquardt problem wrapping a [`FitModel`].
struct LmProblem<'a, M: FitModel> {
    model: &'a M,
    xs: &'a [f64],
    ys: &'a [f64],
    bounds: Option<&'a [(f64, f64)]>,
    params: DVector<f64>,
}

impl<M: FitModel> LeastSquaresProblem<f64, Dyn, Dyn> for LmProblem<'_, M> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &nalgebra::Vector<f64, Dyn, Self::ParameterStorage>) {
        self.params.copy_from(x);
        if let Some(bounds) = self.bounds {
            clamp_to_bounds(self.params.as_mut_slice(), bounds);
        }
    }

    fn params(&self) -> nalgebra::Vector<f64, Dyn, Self::ParameterStorage> {
        self.params.clone_owned()
    }

    fn residuals(&self) -> Option<nalgebra::Vector<f64, Dyn, Self::ResidualStorage>> {
        let params = self.params.as_slice();
        let mut residuals = DVector::zeros(self.xs.len());
        for (row, (&x, &y)) in self.xs.iter().zip(self.ys).enumerate() {
            residuals[row] = self.model.eval(x, params) - y;
        }
        Some(residuals)
    }

    /// Central-difference Jacobian; step scaled to parameter magnitude.
    fn jacobian(&self) -> Option<nalgebra::Matrix<f64, Dyn, Dyn, Self::JacobianStorage>> {
        let rows = self.xs.len();
        let cols = self.params.len();
        let mut jacobian = DMatrix::zeros(rows, cols);
        let mut perturbed = self.params.as_slice().to_vec();

        for col in 0..cols {
            let base = perturbed[col];
            let step = 1e-6 * base.abs().max(1.0);

            perturbed[col] = base + step;
            let upper: Vec<f64> = self
                .xs
                .iter()
                .map(|&x| self.model.eval(x, &perturbed))
                .collect();
            perturbed[col] = base - step;
            for (row, &x) in self.xs.iter().enumerate() {
                jacobian[(row, col)] = (upper[row] - self.model.eval(x, &perturbed)) / (2.0 * step);
            }
            perturbed[col] = base;
        }
        Some(jacobian)
    }
}

/// Direct least-squares polynomial fit of the given degree.
///
/// Coefficients come back highest power first, so a quadratic yields
/// `[a, b, c]` with `y = a*x^2 + b*x + c`. Exact on noiseless polynomial
/// samples up to floating-point error.
pub fn fit_polynomial(xs: &[f64], ys: &[f64], degree: usize) -> Result<Vec<f64>, FitError> {
    let coeffs = degree + 1;
    if xs.len() != ys.len() {
        return Err(FitError::LengthMismatch {
            xs: xs.len(),
            ys: ys.len(),
        });
    }
    if xs.len() < coeffs {
        return Err(FitError::InsufficientData {
            got: xs.len(),
            params: coeffs,
        });
    }
    if xs.iter().chain(ys).any(|v| !v.is_finite()) {
        return Err(FitError::NonFinite);
    }

    let design = DMatrix::from_fn(xs.len(), coeffs, |row, col| {
        xs[row].powi((degree - col) as i32)
    });
    let rhs = DVector::from_column_slice(ys);
    let solution = design
        .svd(true, true)
        .solve(&rhs, 1e-12)
        .map_err(|reason| FitError::Convergence {
            reason: reason.to_string(),
        })?;
    Ok(solution.iter().copied().collect())
}
