//! Quadratic line search
//!
//! Minimizes `g(λ)` for `λ ≥ 0` by repeatedly fitting a parabola through
//! three samples and replacing the worst one with the parabola's vertex.

use crate::config::LineSearchSettings;
use crate::error::Result;

/// Best sample found by a line search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSearchResult {
    pub lambda: f64,
    pub value: f64,
    pub iterations: usize,
}

/// Three-point quadratic interpolation search
#[derive(Debug, Clone, Copy)]
pub struct QuadraticLineSearch {
    iterations: usize,
    stagnation_tolerance: usize,
}

impl Default for QuadraticLineSearch {
    fn default() -> Self {
        Self::new(LineSearchSettings::default())
    }
}

impl QuadraticLineSearch {
    pub fn new(settings: LineSearchSettings) -> Self {
        Self {
            iterations: settings.iterations,
            stagnation_tolerance: settings.stagnation_tolerance,
        }
    }

    pub fn iteration_budget(&self) -> usize {
        self.iterations
    }

    /// Minimize `g` starting from the samples λ = 0, 1, 2
    ///
    /// `g_zero` is the already known value at λ = 0. The search stops after
    /// the iteration budget, when the best value stagnates, or when the
    /// samples are closer together than `lambda_tolerance`.
    pub fn minimize<G>(
        &self,
        mut g: G,
        g_zero: f64,
        lambda_tolerance: f64,
    ) -> Result<LineSearchResult>
    where
        G: FnMut(f64) -> Result<f64>,
    {
        let mut samples = [(0.0, g_zero), (1.0, g(1.0)?), (2.0, g(2.0)?)];
        let mut best = best_sample(&samples);
        let mut unchanged = 0;
        let mut iterations = 0;

        for k in 0..self.iterations {
            samples.sort_by(|a, b| sortable(a.1).total_cmp(&sortable(b.1)));

            let lo = samples.iter().map(|s| s.0).fold(f64::INFINITY, f64::min);
            let hi = samples.iter().map(|s| s.0).fold(f64::NEG_INFINITY, f64::max);
            if hi - lo < lambda_tolerance {
                break;
            }

            let lambda = match fit_parabola(&samples) {
                Some((a, b)) => {
                    let vertex = (-b / (2.0 * a)).min(4.0 * hi);
                    if vertex < 0.0 {
                        1.0 / ((k + 1) as f64).powi(2)
                    } else {
                        vertex
                    }
                }
                None => 0.5 * (samples[0].0 + samples[1].0),
            };

            samples[2] = (lambda, g(lambda)?);
            iterations += 1;

            let candidate = best_sample(&samples);
            if sortable(candidate.1) < sortable(best.1) {
                best = candidate;
                unchanged = 0;
            } else {
                unchanged += 1;
                if unchanged > self.stagnation_tolerance {
                    break;
                }
            }
        }

        tracing::trace!(lambda = best.0, value = best.1, iterations, "line search");
        Ok(LineSearchResult {
            lambda: best.0,
            value: best.1,
            iterations,
        })
    }
}

fn sortable(value: f64) -> f64 {
    if value.is_nan() { f64::INFINITY } else { value }
}

fn best_sample(samples: &[(f64, f64); 3]) -> (f64, f64) {
    let mut best = samples[0];
    for &s in &samples[1..] {
        if sortable(s.1) < sortable(best.1) {
            best = s;
        }
    }
    best
}

/// Coefficients `(a, b)` of `a λ² + b λ + c` through the samples, when convex
fn fit_parabola(samples: &[(f64, f64); 3]) -> Option<(f64, f64)> {
    let [(x0, y0), (x1, y1), (x2, y2)] = *samples;
    if x0 == x1 || x1 == x2 || x0 == x2 {
        return None;
    }
    let f01 = (y1 - y0) / (x1 - x0);
    let f12 = (y2 - y1) / (x2 - x1);
    let a = (f12 - f01) / (x2 - x0);
    let b = f01 - a * (x0 + x1);
    if a.is_finite() && b.is_finite() && a > 0.0 {
        Some((a, b))
    } else {
        None
    }
}
