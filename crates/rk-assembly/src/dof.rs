//! Degrees of Freedom
//!
//! Descriptors of the directions a body can still move in after a solve,
//! and the analysis that finds them from the numerical rank of each body's
//! block of the constraint Jacobian.

use std::f64::consts::PI;
use std::fmt;

use glam::{DMat3, DVec3};
use nalgebra::{DMatrix, DVector, Matrix3, Matrix6};
use serde::{Deserialize, Serialize};

use crate::error::{AssemblyError, Result};
use crate::numeric::central_difference_jacobian;
use crate::rotation::{
    alignment_rotation, axis_angle_from_rotation_matrix, azimuth_elevation, canonical_axis_angle,
    plane_basis, rotation_matrix,
};
use crate::system::{NodeId, SystemArena};
use crate::variables::{MAX_LINEAR_STEP, VARIABLES_PER_BODY, VariableManager, VariableVector};

/// Largest step of a rotational degree of freedom
pub const MAX_ROTATIONAL_STEP: f64 = PI / 5.0;

/// Components within this distance of ±1 count as a coordinate direction
const COORDINATE_ALIGNMENT_TOLERANCE: f64 = 1e-9;

/// Allowed drift of the rotated reference vector out of the rotation plane
const AXIS_ROTATION_TOLERANCE: f64 = 1e-7;

/// Pivot offsets shorter than this are taken as the body origin
const PIVOT_TOLERANCE: f64 = 1e-6;

const COORDINATE_NAMES: [&str; VARIABLES_PER_BODY] =
    ["x", "y", "z", "azimuth", "elevation", "angle"];

/// A direction a body is still free to move in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DegreeOfFreedom {
    /// One coordinate of the body's variables
    PlacementCoordinate { body: String, index: usize },
    /// Translation along a world direction
    LinearMotion { body: String, direction: DVec3 },
    /// Rotation about a world axis through a pivot point of the body
    AxisRotation(AxisRotation),
}

/// Rotation about a world axis
///
/// Orientations along this freedom are `R_about(axis, θ) · align`, where
/// `align` takes the body-local axis onto the world axis. θ is measured in
/// the `(x_ref, y_ref)` plane. The body turns about the line through
/// `pivot` (body-local), which stays in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisRotation {
    pub body: String,
    pub axis: DVec3,
    #[serde(default)]
    pivot: DVec3,
    align: DMat3,
    x_ref_local: DVec3,
    x_ref: DVec3,
    y_ref: DVec3,
}

impl AxisRotation {
    /// Rotation about world `axis` for a body whose local axis is `local_axis`
    pub fn new(body: impl Into<String>, axis: DVec3, local_axis: DVec3) -> Result<Self> {
        let (k, angle) = alignment_rotation(local_axis, axis)?;
        let align = rotation_matrix(k, angle);
        let (x_ref_local, y_ref_local) = plane_basis(local_axis)?;
        Ok(Self {
            body: body.into(),
            axis,
            pivot: DVec3::ZERO,
            align,
            x_ref_local,
            x_ref: align * x_ref_local,
            y_ref: align * y_ref_local,
        })
    }

    /// Turn about the line through body-local `pivot` instead of the origin
    pub fn with_pivot(mut self, pivot: DVec3) -> Self {
        self.pivot = pivot;
        self
    }

    pub fn pivot(&self) -> DVec3 {
        self.pivot
    }

    /// Angle about the axis of the body's orientation in `x`
    pub fn value(&self, vm: &VariableManager, x: &VariableVector) -> Result<f64> {
        let v = vm.rotate(&self.body, self.x_ref_local, x)?;
        let drift = v.dot(self.axis);
        if drift.abs() > AXIS_ROTATION_TOLERANCE {
            return Err(AssemblyError::Domain {
                function: "axis rotation value",
                value: drift,
            });
        }
        Ok(v.dot(self.y_ref).atan2(v.dot(self.x_ref)))
    }

    /// Set the pose in `x` to the rotation by `angle`, keeping the pivot fixed
    pub fn set_value(&self, vm: &VariableManager, x: &mut VariableVector, angle: f64) -> Result<()> {
        let pivot = vm.rotate_and_move(&self.body, self.pivot, x)?;
        let r = rotation_matrix(self.axis, angle) * self.align;
        let position = pivot - r * self.pivot;
        let (axis, angle) = axis_angle_from_rotation_matrix(&r)?;
        let (axis, angle) = canonical_axis_angle(axis, angle);
        let (azimuth, elevation) = if angle == 0.0 {
            (0.0, 0.0)
        } else {
            azimuth_elevation(axis.normalize())?
        };
        let i = vm.offset(&self.body)?;
        x[i] = position.x;
        x[i + 1] = position.y;
        x[i + 2] = position.z;
        x[i + 3] = azimuth;
        x[i + 4] = elevation;
        x[i + 5] = angle;
        Ok(())
    }
}

impl DegreeOfFreedom {
    /// Body this freedom belongs to
    pub fn body(&self) -> &str {
        match self {
            DegreeOfFreedom::PlacementCoordinate { body, .. } => body,
            DegreeOfFreedom::LinearMotion { body, .. } => body,
            DegreeOfFreedom::AxisRotation(r) => &r.body,
        }
    }

    pub fn is_rotational(&self) -> bool {
        match self {
            DegreeOfFreedom::PlacementCoordinate { index, .. } => *index > 2,
            DegreeOfFreedom::LinearMotion { .. } => false,
            DegreeOfFreedom::AxisRotation(_) => true,
        }
    }

    /// Largest sensible step when moving along this freedom
    pub fn max_step(&self) -> f64 {
        if self.is_rotational() {
            MAX_ROTATIONAL_STEP
        } else {
            MAX_LINEAR_STEP
        }
    }

    /// Current value of the freedom in `x`
    pub fn value(&self, vm: &VariableManager, x: &VariableVector) -> Result<f64> {
        match self {
            DegreeOfFreedom::PlacementCoordinate { body, index } => {
                Ok(x[vm.offset(body)? + index])
            }
            DegreeOfFreedom::LinearMotion { body, direction } => {
                Ok(vm.position(body, x)?.dot(*direction))
            }
            DegreeOfFreedom::AxisRotation(r) => r.value(vm, x),
        }
    }

    /// Move the body along this freedom so that its value becomes `value`
    pub fn set_value(&self, vm: &VariableManager, x: &mut VariableVector, value: f64) -> Result<()> {
        match self {
            DegreeOfFreedom::PlacementCoordinate { body, index } => {
                let i = vm.offset(body)? + index;
                x[i] = value;
            }
            DegreeOfFreedom::LinearMotion { body, direction } => {
                let current = vm.position(body, x)?.dot(*direction);
                let correction = *direction * (value - current);
                let i = vm.offset(body)?;
                x[i] += correction.x;
                x[i + 1] += correction.y;
                x[i + 2] += correction.z;
            }
            DegreeOfFreedom::AxisRotation(r) => r.set_value(vm, x, value)?,
        }
        Ok(())
    }
}

impl fmt::Display for DegreeOfFreedom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegreeOfFreedom::PlacementCoordinate { body, index } => {
                write!(f, "placement {body}-{}", COORDINATE_NAMES[*index])
            }
            DegreeOfFreedom::LinearMotion { body, direction } => {
                write!(f, "linear motion {body} along {direction}")
            }
            DegreeOfFreedom::AxisRotation(r) if r.pivot == DVec3::ZERO => {
                write!(f, "rotation {} about {}", r.body, r.axis)
            }
            DegreeOfFreedom::AxisRotation(r) => {
                write!(f, "rotation {} about {} through {}", r.body, r.axis, r.pivot)
            }
        }
    }
}

// ============== Residual freedom analysis ==============

/// Remaining degrees of freedom of every body at the solution `x`
///
/// Each body's freedom is analysed with all other bodies held in place.
/// A direction is free when the square root of its eigenvalue in the Gram
/// matrix `JᵀJ` of the body's Jacobian block is below `rank_tolerance`
/// relative to the largest one.
pub fn residual_freedom(
    arena: &SystemArena,
    node: NodeId,
    vm: &VariableManager,
    x: &VariableVector,
    rank_tolerance: f64,
    jacobian_step: f64,
) -> Result<Vec<DegreeOfFreedom>> {
    let f = |delta: &DVector<f64>| arena.residuals(node, vm, &vm.retract(x, delta)?);
    let jacobian = central_difference_jacobian(&f, &DVector::zeros(x.len()), jacobian_step)?;

    let mut freedom = Vec::new();
    for name in vm.body_names() {
        let offset = vm.offset(name)?;
        let block = jacobian.columns(offset, VARIABLES_PER_BODY).into_owned();
        freedom.extend(body_freedom(name, &block, vm, x, rank_tolerance)?);
    }
    Ok(freedom)
}

fn body_freedom(
    name: &str,
    block: &DMatrix<f64>,
    vm: &VariableManager,
    x: &VariableVector,
    tolerance: f64,
) -> Result<Vec<DegreeOfFreedom>> {
    let gram: Matrix6<f64> = Matrix6::from_fn(|i, j| block.column(i).dot(&block.column(j)));
    let eigen = gram.symmetric_eigen();
    let null = null_columns(eigen.eigenvalues.as_slice(), tolerance);
    if null.is_empty() {
        return Ok(Vec::new());
    }

    let translation_gram = Matrix3::from_fn(|i, j| gram[(i, j)]);
    let t_eigen = translation_gram.symmetric_eigen();
    let t_null = null_columns(t_eigen.eigenvalues.as_slice(), tolerance);
    let rotation_count = null.len().saturating_sub(t_null.len());

    let mut freedom = Vec::new();

    // ---- translations
    let column = |m: &Matrix3<f64>, c: usize| DVec3::new(m[(0, c)], m[(1, c)], m[(2, c)]);
    match t_null.len() {
        3 => freedom.extend((0..3).map(|index| placement(name, index))),
        2 => {
            // describe the plane through its single constrained direction
            let constrained = (0..3)
                .find(|c| !t_null.contains(c))
                .map(|c| column(&t_eigen.eigenvectors, c))
                .unwrap_or(DVec3::Z);
            match coordinate_index(constrained) {
                Some(i) => freedom.extend((0..3).filter(|&k| k != i).map(|k| placement(name, k))),
                None => {
                    let (u, v) = plane_basis(constrained.normalize())?;
                    for direction in [u, v] {
                        freedom.push(linear(name, direction));
                    }
                }
            }
        }
        1 => freedom.push(linear(name, column(&t_eigen.eigenvectors, t_null[0]))),
        _ => {}
    }

    // ---- rotations
    if rotation_count == 0 {
        return Ok(freedom);
    }
    let mut spread = Matrix3::<f64>::zeros();
    for &c in &null {
        let v = eigen.eigenvectors.column(c);
        let r = DVec3::new(v[3], v[4], v[5]);
        for i in 0..3 {
            for j in 0..3 {
                spread[(i, j)] += r[i] * r[j];
            }
        }
    }
    let r_eigen = spread.symmetric_eigen();
    let mut order: Vec<usize> = (0..3).collect();
    order.sort_by(|&a, &b| r_eigen.eigenvalues[b].total_cmp(&r_eigen.eigenvalues[a]));

    let free_translations: Vec<DVec3> = t_null
        .iter()
        .map(|&c| column(&t_eigen.eigenvectors, c))
        .collect();
    let rotations: Vec<(DVec3, DVec3)> = order
        .iter()
        .take(rotation_count)
        .map(|&c| {
            let axis = canonical_direction(column(&r_eigen.eigenvectors, c).normalize());
            let weight = r_eigen.eigenvalues[c];
            let pivot = pivot_offset(axis, weight, &null, &eigen.eigenvectors, &free_translations);
            (axis, pivot)
        })
        .collect();

    if rotation_count == 3 && rotations.iter().all(|(_, pivot)| *pivot == DVec3::ZERO) {
        freedom.extend((3..6).map(|index| placement(name, index)));
    } else {
        for (axis, pivot) in rotations {
            let local_axis = vm.rotate_undo(name, axis, x)?;
            let local_pivot = vm.rotate_undo(name, pivot, x)?;
            freedom.push(DegreeOfFreedom::AxisRotation(
                AxisRotation::new(name, axis, local_axis)?.with_pivot(local_pivot),
            ));
        }
    }

    Ok(freedom)
}

/// World offset from the body origin to the line a free rotation turns about
///
/// Combines the null vectors into the one whose rotational part is `axis`
/// (`weight` is the eigenvalue of `axis` in the spread of rotational parts)
/// and drops its free translations. What remains is the origin's motion
/// around the pivot line.
fn pivot_offset(
    axis: DVec3,
    weight: f64,
    null: &[usize],
    vectors: &Matrix6<f64>,
    free_translations: &[DVec3],
) -> DVec3 {
    let mut t = DVec3::ZERO;
    for &c in null {
        let v = vectors.column(c);
        let r = DVec3::new(v[3], v[4], v[5]);
        t += DVec3::new(v[0], v[1], v[2]) * (r.dot(axis) / weight);
    }
    for &e in free_translations {
        t -= e * t.dot(e);
    }
    let pivot = axis.cross(t);
    if pivot.length() < PIVOT_TOLERANCE {
        DVec3::ZERO
    } else {
        pivot
    }
}

/// Indices of the eigenvalues whose singular value counts as zero
fn null_columns(eigenvalues: &[f64], tolerance: f64) -> Vec<usize> {
    let largest = eigenvalues.iter().map(|l| l.max(0.0).sqrt()).fold(0.0, f64::max);
    let cutoff = tolerance * largest.max(1.0);
    (0..eigenvalues.len())
        .filter(|&i| eigenvalues[i].max(0.0).sqrt() <= cutoff)
        .collect()
}

fn placement(body: &str, index: usize) -> DegreeOfFreedom {
    DegreeOfFreedom::PlacementCoordinate {
        body: body.to_string(),
        index,
    }
}

fn linear(body: &str, direction: DVec3) -> DegreeOfFreedom {
    let direction = canonical_direction(direction.normalize());
    match coordinate_index(direction) {
        Some(index) => placement(body, index),
        None => DegreeOfFreedom::LinearMotion {
            body: body.to_string(),
            direction,
        },
    }
}

/// Coordinate axis a unit direction lies along
fn coordinate_index(direction: DVec3) -> Option<usize> {
    (0..3).find(|&i| (direction[i].abs() - 1.0).abs() < COORDINATE_ALIGNMENT_TOLERANCE)
}

/// Flip a direction so that its largest component is positive
fn canonical_direction(direction: DVec3) -> DVec3 {
    let abs = direction.abs();
    let i = if abs.x >= abs.y && abs.x >= abs.z {
        0
    } else if abs.y >= abs.z {
        1
    } else {
        2
    };
    if direction[i] < 0.0 { -direction } else { direction }
}
