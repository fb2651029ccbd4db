//! Newton Solver
//!
//! Damped Newton-Raphson iteration for `F(x) = 0` with a finite-difference
//! Jacobian, least-squares steps (so redundant and under-determined systems
//! are fine), per-variable step clamping, a quadratic line search, and a
//! random kick when the iteration cycles.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{LineSearchSettings, NewtonSettings};
use crate::error::Result;

use super::line_search::QuadraticLineSearch;

/// Relative singular value cutoff of the least-squares solve
const SINGULAR_VALUE_CUTOFF: f64 = 1e-10;

/// Result of a Newton solve
#[derive(Debug, Clone, PartialEq)]
pub struct NewtonOutcome {
    /// Final iterate
    pub x: DVector<f64>,
    pub iterations: usize,
    /// Euclidean norm of `F(x)`
    pub residual_norm: f64,
    /// Whether a termination criterion was met before the iteration limit
    pub converged: bool,
    /// Number of random perturbations spent
    pub perturbations: usize,
}

/// Newton-Raphson root finder
pub struct NewtonSolver {
    settings: NewtonSettings,
    line_search: QuadraticLineSearch,
    rng: StdRng,
}

impl Default for NewtonSolver {
    fn default() -> Self {
        Self::new(NewtonSettings::default(), LineSearchSettings::default())
    }
}

impl NewtonSolver {
    /// Create a solver seeded from system entropy
    pub fn new(settings: NewtonSettings, line_search: LineSearchSettings) -> Self {
        Self {
            settings,
            line_search: QuadraticLineSearch::new(line_search),
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a deterministic perturbation sequence
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Set the maximum iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.settings.max_iterations = max_iterations;
        self
    }

    pub fn settings(&self) -> &NewtonSettings {
        &self.settings
    }

    /// Solve `f(x) = 0` from `x0`
    ///
    /// `max_step` bounds the step of each variable. Running out of
    /// iterations is not an error; callers inspect `residual_norm`.
    pub fn solve<F>(
        &mut self,
        f: F,
        x0: DVector<f64>,
        max_step: &DVector<f64>,
    ) -> Result<NewtonOutcome>
    where
        F: Fn(&DVector<f64>) -> Result<DVector<f64>>,
    {
        let x_tol = self.settings.x_tol;
        let max_iterations = self.settings.max_iterations;
        let mut budget = self.settings.perturbation_budget;
        let mut perturbations = 0;

        let mut x = x0;
        let mut history: Vec<DVector<f64>> = vec![x.clone()];
        let mut last_step = f64::INFINITY;
        let mut converged = false;
        let mut iterations = 0;

        let mut fx = f(&x)?;
        while iterations < max_iterations {
            // Check for convergence
            if fx.is_empty() || last_step <= x_tol {
                converged = true;
                break;
            }
            if let Some(f_tol) = self.settings.f_tol
                && fx.iter().all(|v| v.abs() < f_tol)
            {
                converged = true;
                break;
            }

            let b = -&fx;
            let j = central_difference_jacobian(&f, &x, self.settings.jacobian_step)?;
            let mut step = least_squares(j, &b).unwrap_or_else(|| {
                tracing::debug!(iteration = iterations, "singular linear system, zero step");
                DVector::zeros(x.len())
            });

            // Clamp so no variable moves further than its max step
            let ratio = step
                .iter()
                .zip(max_step.iter())
                .map(|(s, m)| (s / m).abs())
                .fold(0.0, f64::max);
            if ratio > 1.0 {
                step /= ratio;
            }

            let step_norm = step.norm();
            if step_norm > 0.0 && self.line_search_enabled() {
                let lambda_tolerance = x_tol / step_norm;
                let search = self.line_search.minimize(
                    |lambda| Ok(f(&(&x + &step * lambda))?.norm()),
                    b.norm(),
                    lambda_tolerance,
                )?;
                step *= search.lambda;
            }

            x += &step;
            last_step = step.norm();
            iterations += 1;

            // Escape cycles between earlier iterates
            if budget > 0
                && last_step > x_tol
                && history.iter().any(|h| (h - &x).norm() <= x_tol)
            {
                let shrink = perturbation_scale(iterations, max_iterations);
                for (xi, m) in x.iter_mut().zip(max_step.iter()) {
                    *xi += (0.5 - self.rng.r#gen::<f64>()) * m * shrink;
                }
                budget -= 1;
                perturbations += 1;
                tracing::debug!(iteration = iterations, "iterate repeated, perturbing");
            }
            history.push(x.clone());

            fx = f(&x)?;
            tracing::trace!(iteration = iterations, residual = fx.norm(), step = last_step);
        }

        if !converged {
            // final check after the last step
            converged = fx.is_empty()
                || last_step <= x_tol
                || self
                    .settings
                    .f_tol
                    .is_some_and(|f_tol| fx.iter().all(|v| v.abs() < f_tol));
        }

        Ok(NewtonOutcome {
            residual_norm: fx.norm(),
            x,
            iterations,
            converged,
            perturbations,
        })
    }

    fn line_search_enabled(&self) -> bool {
        self.line_search.iteration_budget() > 0
    }
}

/// Kick size relative to the max step, shrinking to zero at the iteration limit
fn perturbation_scale(iteration: usize, max_iterations: usize) -> f64 {
    if max_iterations == 0 {
        return 0.0;
    }
    (1.0 - iteration as f64 / max_iterations as f64).max(0.0)
}

/// Jacobian of `f` at `x` by central differences
pub fn central_difference_jacobian<F>(f: &F, x: &DVector<f64>, eps: f64) -> Result<DMatrix<f64>>
where
    F: Fn(&DVector<f64>) -> Result<DVector<f64>>,
{
    let n = x.len();
    let mut columns: Vec<DVector<f64>> = Vec::with_capacity(n);
    let mut shifted = x.clone();
    for i in 0..n {
        shifted[i] = x[i] + eps;
        let forward = f(&shifted)?;
        shifted[i] = x[i] - eps;
        let backward = f(&shifted)?;
        shifted[i] = x[i];
        columns.push((forward - backward) / (2.0 * eps));
    }
    if columns.is_empty() {
        return Ok(DMatrix::zeros(f(x)?.len(), 0));
    }
    Ok(DMatrix::from_columns(&columns))
}

/// Minimum-norm least-squares solution of `j · s = b`
fn least_squares(j: DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    if j.nrows() == 0 || j.ncols() == 0 {
        return Some(DVector::zeros(j.ncols()));
    }
    if j.iter().any(|v| !v.is_finite()) || b.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let svd = j.svd(true, true);
    let largest = svd.singular_values.iter().copied().fold(0.0, f64::max);
    let cutoff = SINGULAR_VALUE_CUTOFF * largest.max(1.0);
    let step = svd.solve(b, cutoff).ok()?;
    step.iter().all(|v| v.is_finite()).then_some(step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn seeded() -> NewtonSolver {
        NewtonSolver::default().with_seed(11)
    }

    #[test]
    fn test_linear_converges_immediately() {
        let mut solver = seeded();
        let outcome = solver
            .solve(
                |x| Ok(DVector::from_vec(vec![x[0] - 5.0])),
                DVector::from_vec(vec![0.0]),
                &DVector::from_vec(vec![10.0]),
            )
            .unwrap();
        assert!(outcome.converged);
        assert_abs_diff_eq!(outcome.x[0], 5.0, epsilon = 1e-9);
        assert!(outcome.residual_norm < 1e-6);
        assert!(outcome.iterations <= 2);
    }

    #[test]
    fn test_step_is_clamped() {
        // with a unit max step and no line search the first step is exactly 1
        let mut solver = NewtonSolver::new(
            NewtonSettings {
                max_iterations: 1,
                ..NewtonSettings::default()
            },
            LineSearchSettings {
                iterations: 0,
                stagnation_tolerance: 3,
            },
        );
        let outcome = solver
            .solve(
                |x| Ok(DVector::from_vec(vec![x[0] - 5.0])),
                DVector::from_vec(vec![0.0]),
                &DVector::from_vec(vec![1.0]),
            )
            .unwrap();
        assert_abs_diff_eq!(outcome.x[0], 1.0, epsilon = 1e-9);
        assert!(!outcome.converged);
    }

    #[test]
    fn test_nonlinear_system() {
        // circle of radius 2 intersected with the line y = x
        let mut solver = seeded();
        let outcome = solver
            .solve(
                |x| {
                    Ok(DVector::from_vec(vec![
                        x[0] * x[0] + x[1] * x[1] - 4.0,
                        x[0] - x[1],
                    ]))
                },
                DVector::from_vec(vec![1.0, 0.5]),
                &DVector::from_vec(vec![10.0, 10.0]),
            )
            .unwrap();
        assert!(outcome.converged);
        assert_abs_diff_eq!(outcome.x[0], 2.0_f64.sqrt(), epsilon = 1e-8);
        assert_abs_diff_eq!(outcome.x[1], 2.0_f64.sqrt(), epsilon = 1e-8);
    }

    #[test]
    fn test_underdetermined_takes_minimum_norm_step() {
        // one equation, two unknowns: the second variable must not move
        let mut solver = seeded();
        let outcome = solver
            .solve(
                |x| Ok(DVector::from_vec(vec![x[0] - 3.0])),
                DVector::from_vec(vec![0.0, 7.0]),
                &DVector::from_vec(vec![10.0, 10.0]),
            )
            .unwrap();
        assert!(outcome.converged);
        assert_abs_diff_eq!(outcome.x[0], 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(outcome.x[1], 7.0, epsilon = 1e-12);
    }

    #[test]
    fn test_redundant_equations() {
        let mut solver = seeded();
        let outcome = solver
            .solve(
                |x| Ok(DVector::from_vec(vec![x[0] - 1.0, 2.0 * x[0] - 2.0])),
                DVector::from_vec(vec![4.0]),
                &DVector::from_vec(vec![10.0]),
            )
            .unwrap();
        assert_abs_diff_eq!(outcome.x[0], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_inconsistent_system_reports_residual() {
        let mut solver = seeded();
        let outcome = solver
            .solve(
                |x| Ok(DVector::from_vec(vec![x[0] - 1.0, x[0] + 1.0])),
                DVector::from_vec(vec![0.5]),
                &DVector::from_vec(vec![10.0]),
            )
            .unwrap();
        assert_abs_diff_eq!(outcome.x[0], 0.0, epsilon = 1e-6);
        assert!(outcome.residual_norm > 1.0);
    }

    #[test]
    fn test_no_equations() {
        let mut solver = seeded();
        let outcome = solver
            .solve(
                |_| Ok(DVector::zeros(0)),
                DVector::from_vec(vec![1.0, 2.0]),
                &DVector::from_vec(vec![10.0, 10.0]),
            )
            .unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.iterations, 0);
    }

    #[test]
    fn test_jacobian() {
        let f = |x: &DVector<f64>| Ok(DVector::from_vec(vec![x[0] * x[1], x[1] * x[1]]));
        let j = central_difference_jacobian(&f, &DVector::from_vec(vec![2.0, 3.0]), 1e-6).unwrap();
        assert_abs_diff_eq!(j[(0, 0)], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(j[(0, 1)], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(j[(1, 0)], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(j[(1, 1)], 6.0, epsilon = 1e-6);
    }

    /// `x³ - 2x + 2` from 0 bounces between 0 and 1 without a line search
    fn cycling(budget: usize) -> NewtonSolver {
        NewtonSolver::new(
            NewtonSettings {
                x_tol: 1e-6,
                max_iterations: 20,
                perturbation_budget: budget,
                ..NewtonSettings::default()
            },
            LineSearchSettings {
                iterations: 0,
                stagnation_tolerance: 3,
            },
        )
        .with_seed(5)
    }

    fn cubic(x: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(DVector::from_vec(vec![x[0].powi(3) - 2.0 * x[0] + 2.0]))
    }

    #[test]
    fn test_cycle_without_budget_runs_out() {
        let outcome = cycling(0)
            .solve(cubic, DVector::from_vec(vec![0.0]), &DVector::from_vec(vec![10.0]))
            .unwrap();
        assert_eq!(outcome.perturbations, 0);
        assert_eq!(outcome.iterations, 20);
        assert!(!outcome.converged);
        assert!(outcome.residual_norm > 0.5);
    }

    #[test]
    fn test_cycle_is_perturbed_within_budget() {
        let outcome = cycling(1)
            .solve(cubic, DVector::from_vec(vec![0.0]), &DVector::from_vec(vec![10.0]))
            .unwrap();
        assert_eq!(outcome.perturbations, 1);

        let outcome = cycling(2)
            .solve(cubic, DVector::from_vec(vec![0.0]), &DVector::from_vec(vec![10.0]))
            .unwrap();
        assert!((1..=2).contains(&outcome.perturbations));
    }

    #[test]
    fn test_perturbation_shrinks_to_zero() {
        assert_eq!(perturbation_scale(0, 100), 1.0);
        assert_abs_diff_eq!(perturbation_scale(50, 100), 0.5, epsilon = 1e-12);
        assert!(perturbation_scale(90, 100) < perturbation_scale(10, 100));
        assert_eq!(perturbation_scale(100, 100), 0.0);
        assert_eq!(perturbation_scale(3, 0), 0.0);
    }

    #[test]
    fn test_non_finite_jacobian_takes_zero_step() {
        // sqrt is undefined just left of 0, so the difference quotient is NaN
        let mut solver = seeded();
        let outcome = solver
            .solve(
                |x| Ok(DVector::from_vec(vec![x[0].sqrt() - 1.0])),
                DVector::from_vec(vec![0.0]),
                &DVector::from_vec(vec![10.0]),
            )
            .unwrap();
        assert_eq!(outcome.x[0], 0.0);
        assert_eq!(outcome.iterations, 1);
        assert_abs_diff_eq!(outcome.residual_norm, 1.0, epsilon = 1e-12);
        assert_eq!(outcome.perturbations, 0);
    }

    #[test]
    fn test_singular_jacobian_takes_zero_step() {
        let mut solver = seeded();
        let outcome = solver
            .solve(
                |_| Ok(DVector::from_vec(vec![3.0, -4.0])),
                DVector::from_vec(vec![1.0, 2.0]),
                &DVector::from_vec(vec![10.0, 10.0]),
            )
            .unwrap();
        assert_eq!(outcome.x, DVector::from_vec(vec![1.0, 2.0]));
        assert_eq!(outcome.iterations, 1);
        assert_abs_diff_eq!(outcome.residual_norm, 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_least_squares_rejects_non_finite() {
        let j = DMatrix::from_row_slice(1, 1, &[f64::NAN]);
        assert!(least_squares(j, &DVector::from_vec(vec![1.0])).is_none());
        let j = DMatrix::from_row_slice(1, 1, &[2.0]);
        assert!(least_squares(j, &DVector::from_vec(vec![f64::INFINITY])).is_none());
    }
}
