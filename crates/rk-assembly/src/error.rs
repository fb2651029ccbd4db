//! Solver error types

use thiserror::Error;
use uuid::Uuid;

/// Errors that abort a solve
///
/// Convergence failures are not errors: they are reported through
/// [`crate::SolveStatus::Failed`] so the host can offer remediation.
#[derive(Debug, Clone, Error)]
pub enum AssemblyError {
    // ============== Structural ==============
    #[error("Unknown constraint kind: {0}")]
    UnknownConstraintKind(String),

    #[error("Constraint {constraint} refers to body '{body}' which is no longer in the assembly")]
    DanglingReference { constraint: Uuid, body: String },

    #[error("Body not managed by this solve: {0}")]
    MissingBody(String),

    #[error("Constraint {constraint} requires a {feature} on its sub-feature")]
    MissingFeature {
        constraint: Uuid,
        feature: &'static str,
    },

    #[error("No body available to anchor the solve")]
    NoAnchor,

    // ============== Numeric domain ==============
    #[error("{function} called with invalid input {value}")]
    Domain { function: &'static str, value: f64 },

    #[error("Expected a unit vector, got norm {norm}")]
    NotUnitVector { norm: f64 },

    #[error("Rotation reconstruction failed: {0}")]
    Reconstruction(String),

    // ============== Host / configuration ==============
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Scene error: {0}")]
    Scene(String),

    #[error("File I/O error: {0}")]
    Io(String),
}

impl AssemblyError {
    /// Whether this error belongs to the structural class (bad input data)
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            AssemblyError::UnknownConstraintKind(_)
                | AssemblyError::DanglingReference { .. }
                | AssemblyError::MissingBody(_)
                | AssemblyError::MissingFeature { .. }
                | AssemblyError::NoAnchor
        )
    }

    /// Whether this error came from a numeric domain violation
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            AssemblyError::Domain { .. }
                | AssemblyError::NotUnitVector { .. }
                | AssemblyError::Reconstruction(_)
        )
    }
}

/// Result type for solver operations
pub type Result<T> = std::result::Result<T, AssemblyError>;
