//! Interval bisection for inverting a scalar curve.
//!
//! Given a curve `y(x)` and a target y, find the x at which the curve
//! takes that value. Used to look up the bragg angle that a fitted
//! gap/angle curve maps onto a given gap.

/// Default accuracy at which the search stops.
pub const DEFAULT_TOLERANCE: f64 = 1e-6;

/// Default iteration budget.
pub const DEFAULT_MAX_ITERATIONS: usize = 20;

/// Find `x` in `[lo, hi]` such that `f(x)` is close to `target_y`.
///
/// Precondition: `f` is monotonic (either direction) on `[lo, hi]` and
/// `target_y` lies between `f(lo)` and `f(hi)`. Behaviour is undefined
/// otherwise; the bracket update has no way to notice a non-monotonic
/// curve.
///
/// Each iteration evaluates the midpoint and keeps whichever half-bracket
/// still straddles `target_y`; the best y estimate is the midpoint of the
/// bracket's y values. The search stops when `|best_y - target_y|` is
/// within `tolerance` or the iteration budget runs out, and returns the
/// midpoint of the final bracket either way. Running out of iterations
/// yields a best-effort answer, not an error, so the caller decides
/// whether the achieved precision suffices.
pub fn solve_for_y<F>(
    target_y: f64,
    f: F,
    lo: f64,
    hi: f64,
    tolerance: f64,
    max_iterations: usize,
) -> f64
where
    F: Fn(f64) -> f64,
{
    let in_range = |v: f64, a: f64, b: f64| a.min(b) < v && v < a.max(b);

    let mut lower = (lo, f(lo));
    let mut upper = (hi, f(hi));
    let mut best_y = (lower.1 + upper.1) / 2.0;

    let mut iteration = 0;
    while iteration < max_iterations && (best_y - target_y).abs() > tolerance {
        let mid_x = (lower.0 + upper.0) / 2.0;
        let mid = (mid_x, f(mid_x));

        if in_range(target_y, lower.1, mid.1) {
            upper = mid;
        } else {
            lower = mid;
        }
        best_y = (lower.1 + upper.1) / 2.0;
        iteration += 1;
    }

    (lower.0 + upper.0) / 2.0
}
