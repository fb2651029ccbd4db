//! Solver configuration
//!
//! Tolerances, iteration budgets and policies for a solve. The whole
//! configuration can be stored next to a scene as a RON file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AssemblyError, Result};

/// Settings of the Newton iteration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonSettings {
    /// Terminate once the previous step is at most this long
    pub x_tol: f64,
    /// Terminate once every residual component is below this value
    pub f_tol: Option<f64>,
    /// Maximum number of Newton iterations per solve
    pub max_iterations: usize,
    /// How many random perturbations may be spent escaping lock-ups
    pub perturbation_budget: usize,
    /// Perturbation used for the central-difference Jacobian
    pub jacobian_step: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            x_tol: 1e-9,
            f_tol: Some(1e-10),
            max_iterations: 100,
            perturbation_budget: 2,
            jacobian_step: 1e-6,
        }
    }
}

/// Settings of the quadratic line search
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineSearchSettings {
    /// Iteration budget (0 disables the line search)
    pub iterations: usize,
    /// Stop after the best sample stayed unchanged this many times
    pub stagnation_tolerance: usize,
}

impl Default for LineSearchSettings {
    fn default() -> Self {
        Self {
            iterations: 5,
            stagnation_tolerance: 3,
        }
    }
}

/// What to do with a constraint whose body no longer exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DanglingReferencePolicy {
    /// Abort the whole solve
    #[default]
    Abort,
    /// Drop the constraint and continue
    RemoveConstraint,
}

/// Minimum change before a pose is pushed back to the host
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBackTolerance {
    /// Position change (length units)
    pub position: f64,
    /// Quaternion component change
    pub rotation: f64,
}

impl Default for WriteBackTolerance {
    fn default() -> Self {
        Self {
            position: 1e-8,
            rotation: 1e-6,
        }
    }
}

/// Complete solver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub newton: NewtonSettings,
    pub line_search: LineSearchSettings,
    /// Reuse previously solved constraint prefixes
    pub use_cache: bool,
    pub dangling_references: DanglingReferencePolicy,
    pub write_back: WriteBackTolerance,
    /// Residual norm a constraint stage must reach to count as satisfied
    pub residual_tolerance: f64,
    /// Relative singular value below which a Jacobian direction counts as free
    pub dof_rank_tolerance: f64,
    /// Seed for the stagnation perturbation (random when unset)
    pub seed: Option<u64>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            newton: NewtonSettings::default(),
            line_search: LineSearchSettings::default(),
            use_cache: false,
            dangling_references: DanglingReferencePolicy::default(),
            write_back: WriteBackTolerance::default(),
            residual_tolerance: 1e-6,
            dof_rank_tolerance: 1e-6,
            seed: None,
        }
    }
}

impl SolverConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the solve cache
    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Set the policy for constraints referring to missing bodies
    pub fn with_dangling_references(mut self, policy: DanglingReferencePolicy) -> Self {
        self.dangling_references = policy;
        self
    }

    /// Set the maximum number of Newton iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.newton.max_iterations = max_iterations;
        self
    }

    /// Set the residual norm required to accept a solution
    pub fn with_residual_tolerance(mut self, tolerance: f64) -> Self {
        self.residual_tolerance = tolerance;
        self
    }

    /// Fix the random seed of the stagnation perturbation
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check that all tolerances and budgets are usable
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("newton.x_tol", self.newton.x_tol),
            ("newton.jacobian_step", self.newton.jacobian_step),
            ("residual_tolerance", self.residual_tolerance),
            ("dof_rank_tolerance", self.dof_rank_tolerance),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(AssemblyError::Config(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if let Some(f_tol) = self.newton.f_tol
            && !(f_tol.is_finite() && f_tol > 0.0)
        {
            return Err(AssemblyError::Config(format!(
                "newton.f_tol must be positive, got {f_tol}"
            )));
        }
        if self.newton.max_iterations == 0 {
            return Err(AssemblyError::Config(
                "newton.max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Parse a configuration from RON text
    pub fn from_ron_str(content: &str) -> Result<Self> {
        let config: SolverConfig =
            ron::from_str(content).map_err(|e| AssemblyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to pretty RON text
    pub fn to_ron_string(&self) -> Result<String> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| AssemblyError::Config(e.to_string()))
    }

    /// Load a configuration from a RON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| AssemblyError::Io(e.to_string()))?;
        Self::from_ron_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SolverConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.use_cache);
        assert_eq!(config.line_search.iterations, 5);
        assert_eq!(config.newton.perturbation_budget, 2);
    }

    #[test]
    fn test_ron_round_trip() {
        let config = SolverConfig::new()
            .with_cache(true)
            .with_seed(7)
            .with_dangling_references(DanglingReferencePolicy::RemoveConstraint);
        let text = config.to_ron_string().unwrap();
        let parsed = SolverConfig::from_ron_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_ron_uses_defaults() {
        let parsed = SolverConfig::from_ron_str("(use_cache: true, newton: (max_iterations: 40))")
            .unwrap();
        assert!(parsed.use_cache);
        assert_eq!(parsed.newton.max_iterations, 40);
        assert_eq!(parsed.newton.x_tol, NewtonSettings::default().x_tol);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = SolverConfig::from_ron_str("(residual_tolerance: -1.0)").unwrap_err();
        assert!(matches!(err, AssemblyError::Config(_)));
        assert!(SolverConfig::new().with_max_iterations(0).validate().is_err());
    }
}
