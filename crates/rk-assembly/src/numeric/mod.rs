//! Numerical Solvers
//!
//! A damped Newton iteration for vector residuals and the one-dimensional
//! quadratic line search it uses to pick step lengths.

pub mod line_search;
pub mod newton;

pub use line_search::{LineSearchResult, QuadraticLineSearch};
pub use newton::{NewtonOutcome, NewtonSolver, central_difference_jacobian};
