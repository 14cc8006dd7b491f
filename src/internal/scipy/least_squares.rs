//! Nonlinear least squares.
//!
//! Levenberg-Marquardt variant of `scipy.optimize.least_squares` with a
//! forward-difference Jacobian. Termination tests follow scipy's
//! `ftol` / `xtol` / `gtol` conventions.
//! License: BSD 3-Clause (SciPy Developers)

use nalgebra::{DMatrix, DVector};

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Gradient norm fell below `gtol`.
    Gtol,
    /// Relative cost reduction fell below `ftol`.
    Ftol,
    /// Relative step size fell below `xtol`.
    Xtol,
    /// Evaluation budget exhausted.
    MaxEvaluations,
    /// Damping grew without finding a descent step.
    Stalled,
}

/// Solver tolerances and budget.
#[derive(Debug, Clone)]
pub struct LeastSquaresOptions {
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
    /// Maximum number of residual evaluations (Jacobian columns included).
    pub max_nfev: usize,
    /// Relative step for the finite-difference Jacobian.
    pub diff_step: f64,
}

impl Default for LeastSquaresOptions {
    fn default() -> Self {
        Self {
            ftol: 1e-8,
            xtol: 1e-8,
            gtol: 1e-8,
            max_nfev: 2000,
            diff_step: f64::EPSILON.sqrt(),
        }
    }
}

/// Result of a least squares solve.
#[derive(Debug, Clone)]
pub struct LeastSquaresResult {
    /// Solution vector.
    pub x: DVector<f64>,
    /// `0.5 * sum(residuals^2)` at the solution.
    pub cost: f64,
    /// Number of residual evaluations.
    pub nfev: usize,
    pub status: Termination,
}

impl LeastSquaresResult {
    /// Mirrors scipy's `success` flag: true for any tolerance-based stop.
    pub fn success(&self) -> bool {
        matches!(self.status, Termination::Gtol | Termination::Ftol | Termination::Xtol)
    }
}

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e12;

/// Minimize `0.5 * ||fun(x)||^2` starting from `x0`.
pub fn least_squares<F>(fun: F, x0: &DVector<f64>, options: &LeastSquaresOptions) -> LeastSquaresResult
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let mut x = x0.clone();
    let mut r = fun(&x);
    let mut cost = 0.5 * r.norm_squared();
    let mut nfev = 1;
    let mut lambda = LAMBDA_INIT;

    loop {
        if nfev >= options.max_nfev {
            return LeastSquaresResult { x, cost, nfev, status: Termination::MaxEvaluations };
        }

        let jac = forward_difference_jacobian(&fun, &x, &r, options.diff_step);
        nfev += x.len();

        let gradient = jac.transpose() * &r;
        if gradient.amax() < options.gtol {
            return LeastSquaresResult { x, cost, nfev, status: Termination::Gtol };
        }

        let jtj = jac.transpose() * &jac;
        let mut accepted = false;

        while lambda <= LAMBDA_MAX {
            let mut damped = jtj.clone();
            for i in 0..damped.nrows() {
                damped[(i, i)] += lambda * jtj[(i, i)].max(LAMBDA_MIN);
            }

            let Some(step) = solve_normal_equations(damped, -&gradient) else {
                lambda *= 10.0;
                continue;
            };

            let x_new = &x + &step;
            let r_new = fun(&x_new);
            nfev += 1;
            let cost_new = 0.5 * r_new.norm_squared();

            if cost_new.is_finite() && cost_new < cost {
                let reduction = cost - cost_new;
                let step_small = step.norm() <= options.xtol * (options.xtol + x.norm());

                x = x_new;
                r = r_new;
                let previous = cost;
                cost = cost_new;
                lambda = (lambda / 10.0).max(LAMBDA_MIN);
                accepted = true;

                if reduction <= options.ftol * previous {
                    return LeastSquaresResult { x, cost, nfev, status: Termination::Ftol };
                }
                if step_small {
                    return LeastSquaresResult { x, cost, nfev, status: Termination::Xtol };
                }
                break;
            }

            lambda *= 10.0;
            if nfev >= options.max_nfev {
                break;
            }
        }

        if !accepted {
            let status = if nfev >= options.max_nfev {
                Termination::MaxEvaluations
            } else {
                Termination::Stalled
            };
            return LeastSquaresResult { x, cost, nfev, status };
        }
    }
}

fn forward_difference_jacobian<F>(fun: &F, x: &DVector<f64>, r: &DVector<f64>, diff_step: f64) -> DMatrix<f64>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let mut jac = DMatrix::zeros(r.len(), x.len());
    let mut shifted = x.clone();
    for j in 0..x.len() {
        let h = diff_step * x[j].abs().max(1.0);
        shifted[j] = x[j] + h;
        let r_h = fun(&shifted);
        shifted[j] = x[j];
        jac.set_column(j, &((r_h - r) / h));
    }
    jac
}

fn solve_normal_equations(a: DMatrix<f64>, b: DVector<f64>) -> Option<DVector<f64>> {
    match a.clone().cholesky() {
        Some(chol) => Some(chol.solve(&b)),
        None => a.lu().solve(&b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_least_squares_linear_fit() {
        // y = 2x + 1 sampled exactly
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();

        let result = least_squares(
            |p| DVector::from_iterator(xs.len(), xs.iter().zip(&ys).map(|(x, y)| p[0] * x + p[1] - y)),
            &DVector::from_vec(vec![0.0, 0.0]),
            &LeastSquaresOptions::default(),
        );

        assert!(result.success(), "status {:?}", result.status);
        assert_relative_eq!(result.x[0], 2.0, epsilon = 1e-5);
        assert_relative_eq!(result.x[1], 1.0, epsilon = 1e-5);
        assert!(result.cost < 1e-10);
    }

    #[test]
    fn test_least_squares_rosenbrock() {
        let result = least_squares(
            |p| DVector::from_vec(vec![10.0 * (p[1] - p[0] * p[0]), 1.0 - p[0]]),
            &DVector::from_vec(vec![-1.2, 1.0]),
            &LeastSquaresOptions::default(),
        );

        assert!(result.success(), "status {:?}", result.status);
        assert_relative_eq!(result.x[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(result.x[1], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_least_squares_already_optimal() {
        let x0 = DVector::from_vec(vec![3.0]);
        let result = least_squares(
            |p| DVector::from_vec(vec![p[0] - 3.0]),
            &x0,
            &LeastSquaresOptions::default(),
        );

        assert_eq!(result.status, Termination::Gtol);
        assert_eq!(result.x, x0);
    }

    #[test]
    fn test_least_squares_respects_budget() {
        let options = LeastSquaresOptions { max_nfev: 1, ..Default::default() };
        let result = least_squares(
            |p| DVector::from_vec(vec![p[0] - 3.0]),
            &DVector::from_vec(vec![0.0]),
            &options,
        );

        assert_eq!(result.status, Termination::MaxEvaluations);
        assert!(!result.success());
    }
}
