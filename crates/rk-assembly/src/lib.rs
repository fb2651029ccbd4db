//! Assembly Constraint Solver
//!
//! This crate provides:
//! - Rotation algebra between azimuth/elevation/angle, axis-angle, matrices and quaternions
//! - A variable manager mapping body poses onto a flat variable vector
//! - Assembly constraints (plane, angle, axial, circular edge, spherical)
//! - A chain of immutable constraint systems stored in an arena
//! - A Newton solver with quadratic line search and cycle escape
//! - Residual degree-of-freedom analysis
//! - A solve cache that resumes from previously solved constraint prefixes

pub mod cache;
pub mod config;
pub mod constraint;
pub mod dof;
pub mod error;
pub mod numeric;
pub mod rotation;
pub mod scene;
pub mod solver;
pub mod system;
pub mod variables;

// Re-exports for convenience
pub use cache::{AnchorKey, CacheHit, SolveCache, SolvedLevel};
pub use config::{
    DanglingReferencePolicy, LineSearchSettings, NewtonSettings, SolverConfig, WriteBackTolerance,
};
pub use constraint::{
    Constraint, ConstraintKind, ConstraintRecord, DirectionMode, FeatureFrame, SubFeature,
};
pub use dof::{AxisRotation, DegreeOfFreedom, residual_freedom};
pub use error::{AssemblyError, Result};
pub use numeric::{LineSearchResult, NewtonOutcome, NewtonSolver, QuadraticLineSearch};
pub use scene::AssemblyScene;
pub use solver::{AssemblySolver, SolveReport, SolveStatus};
pub use system::{NodeId, SystemArena, SystemNode, Union};
pub use variables::{Body, Pose, PoseStore, Snapshot, VariableManager, VariableVector};
