//! Rotation Algebra
//!
//! Conversions between the rotation representations used by the solver:
//! azimuth/elevation/angle triples (the variable vector layout), axis-angle
//! pairs, rotation matrices and quaternions.

use std::f64::consts::{FRAC_PI_2, PI};

use glam::{DMat3, DQuat, DVec3};
use nalgebra::Matrix3;

use crate::error::{AssemblyError, Result};

/// Allowed overshoot of `acos`/`asin` arguments beyond [-1, 1] before the
/// call is treated as a domain error
pub const DOMAIN_TOLERANCE: f64 = 0.1;

/// Allowed deviation of an axis from unit length
pub const UNIT_TOLERANCE: f64 = 1e-6;

/// Angles within this distance of 0 or π are reconstructed with the
/// eigen-decomposition method
pub const ANGLE_PI_TOLERANCE: f64 = 1e-5;

/// Maximum Frobenius error accepted when reconstructing a rotation matrix
pub const RECONSTRUCTION_TOLERANCE: f64 = 1e-7;

/// `acos` that absorbs round-off slightly outside [-1, 1]
pub fn acos_checked(v: f64) -> Result<f64> {
    if (-1.0..=1.0).contains(&v) {
        Ok(v.acos())
    } else if v.abs() - 1.0 < DOMAIN_TOLERANCE {
        Ok(if v > 0.0 { 0.0 } else { PI })
    } else {
        Err(AssemblyError::Domain {
            function: "acos",
            value: v,
        })
    }
}

/// `asin` that absorbs round-off slightly outside [-1, 1]
pub fn asin_checked(v: f64) -> Result<f64> {
    if (-1.0..=1.0).contains(&v) {
        Ok(v.asin())
    } else if v.abs() - 1.0 < DOMAIN_TOLERANCE {
        Ok(if v > 0.0 { FRAC_PI_2 } else { -FRAC_PI_2 })
    } else {
        Err(AssemblyError::Domain {
            function: "asin",
            value: v,
        })
    }
}

/// Wrap an angle into (-π, π]
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI { wrapped + 2.0 * PI } else { wrapped }
}

/// Azimuth and elevation of a unit axis
pub fn azimuth_elevation(axis: DVec3) -> Result<(f64, f64)> {
    let norm = axis.length();
    if (norm - 1.0).abs() > UNIT_TOLERANCE {
        return Err(AssemblyError::NotUnitVector { norm });
    }
    Ok((axis.y.atan2(axis.x), asin_checked(axis.z)?))
}

/// Unit axis described by an azimuth and elevation
pub fn axis_from_azimuth_elevation(azimuth: f64, elevation: f64) -> DVec3 {
    DVec3::new(
        elevation.cos() * azimuth.cos(),
        elevation.cos() * azimuth.sin(),
        elevation.sin(),
    )
}

/// Rotation matrix for a rotation of `angle` about the unit `axis` (Rodrigues)
pub fn rotation_matrix(axis: DVec3, angle: f64) -> DMat3 {
    let (s, c) = angle.sin_cos();
    let t = 1.0 - c;
    let DVec3 { x, y, z } = axis;
    DMat3::from_cols(
        DVec3::new(c + x * x * t, y * x * t + z * s, z * x * t - y * s),
        DVec3::new(x * y * t - z * s, c + y * y * t, z * y * t + x * s),
        DVec3::new(x * z * t + y * s, y * z * t - x * s, c + z * z * t),
    )
}

/// Rotation matrix described by a variable-vector orientation triple
pub fn azimuth_elevation_rotation_matrix(azimuth: f64, elevation: f64, angle: f64) -> DMat3 {
    rotation_matrix(axis_from_azimuth_elevation(azimuth, elevation), angle)
}

/// Bring an axis-angle pair into the canonical range: angle in [0, π]
pub fn canonical_axis_angle(axis: DVec3, angle: f64) -> (DVec3, f64) {
    let wrapped = wrap_angle(angle);
    if wrapped < 0.0 {
        (-axis, -wrapped)
    } else {
        (axis, wrapped)
    }
}

/// `0.5 * (R - Rᵀ)` as a vector; equals `sin(angle) * axis`
pub fn skew_vector(r: &DMat3) -> DVec3 {
    0.5 * DVec3::new(
        entry(r, 2, 1) - entry(r, 1, 2),
        entry(r, 0, 2) - entry(r, 2, 0),
        entry(r, 1, 0) - entry(r, 0, 1),
    )
}

/// Recover axis and angle from a rotation matrix
///
/// The trace formula is used unless `sin(angle)` is close to zero, where the
/// axis is recovered from the eigenvector of the symmetric part whose
/// eigenvalue is 1.
pub fn axis_angle_from_rotation_matrix(r: &DMat3) -> Result<(DVec3, f64)> {
    let trace = entry(r, 0, 0) + entry(r, 1, 1) + entry(r, 2, 2);
    let angle = acos_checked(0.5 * (trace - 1.0))?;
    let rem = angle % PI;
    if rem.abs() > ANGLE_PI_TOLERANCE && (PI - rem).abs() > ANGLE_PI_TOLERANCE {
        let axis = skew_vector(r) / angle.sin();
        if reconstruction_error(r, axis, angle) <= RECONSTRUCTION_TOLERANCE {
            return Ok((axis, angle));
        }
        tracing::debug!(angle, "trace formula failed reconstruction, using eigen method");
    }
    axis_angle_from_eigen(r)
}

fn axis_angle_from_eigen(r: &DMat3) -> Result<(DVec3, f64)> {
    let symmetric = Matrix3::from_fn(|i, j| 0.5 * (entry(r, i, j) + entry(r, j, i)));
    let eigen = symmetric.symmetric_eigen();

    let mut index = 0;
    for i in 1..3 {
        if (eigen.eigenvalues[i] - 1.0).abs() < (eigen.eigenvalues[index] - 1.0).abs() {
            index = i;
        }
    }
    let column = eigen.eigenvectors.column(index);
    let mut axis = DVec3::new(column[0], column[1], column[2]).normalize();

    // The other two eigenvalues both equal cos(angle)
    let trace = eigen.eigenvalues.sum();
    let angle = acos_checked(0.5 * (trace - eigen.eigenvalues[index]))?;

    // Near identity the eigenvalue gap vanishes; the skew part still carries the axis
    let skew = skew_vector(r);
    if angle < FRAC_PI_2 && skew.length() > 1e-14 {
        axis = skew.normalize();
    }

    for candidate in [angle, -angle] {
        if reconstruction_error(r, axis, candidate) <= RECONSTRUCTION_TOLERANCE {
            return Ok((axis, candidate));
        }
    }
    Err(AssemblyError::Reconstruction(format!(
        "no axis/angle reproduces the matrix {:?}",
        r.to_cols_array()
    )))
}

fn reconstruction_error(r: &DMat3, axis: DVec3, angle: f64) -> f64 {
    let diff = rotation_matrix(axis, angle) - *r;
    diff.to_cols_array().iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Axis and angle (in [0, π]) of a quaternion
pub fn quaternion_to_axis_angle(q: DQuat) -> (DVec3, f64) {
    let q = if q.w < 0.0 { -q.normalize() } else { q.normalize() };
    let v = DVec3::new(q.x, q.y, q.z);
    let s = v.length();
    if s > 0.0 {
        (v / s, 2.0 * s.atan2(q.w))
    } else {
        (DVec3::X, 0.0)
    }
}

/// Two orthonormal in-plane directions for the plane with the given normal
///
/// Together with the normal they form a right-handed frame
/// `(first, second, normal)`.
pub fn plane_basis(normal: DVec3) -> Result<(DVec3, DVec3)> {
    let (azimuth, elevation) = azimuth_elevation(normal)?;
    Ok((
        axis_from_azimuth_elevation(azimuth, elevation - FRAC_PI_2),
        axis_from_azimuth_elevation(azimuth + FRAC_PI_2, 0.0),
    ))
}

/// Gram-Schmidt orthonormalization keeping the direction of `primary`
pub fn gram_schmidt(primary: DVec3, ref_a: DVec3, ref_b: DVec3) -> (DVec3, DVec3, DVec3) {
    let proj = |u: DVec3, v: DVec3| u * (v.dot(u) / u.dot(u));
    let u1 = primary;
    let u2 = ref_a - proj(u1, ref_a);
    let u3 = ref_b - proj(u1, ref_b) - proj(u2, ref_b);
    (u1.normalize(), u2.normalize(), u3.normalize())
}

/// Axis and angle of the rotation that takes unit `v` onto unit `v_ref`
pub fn alignment_rotation(v: DVec3, v_ref: DVec3) -> Result<(DVec3, f64)> {
    let c = v.cross(v_ref);
    let axis = if c.length_squared() > 0.0 {
        c.normalize()
    } else {
        plane_basis(v)?.0
    };
    Ok((axis, acos_checked(v.dot(v_ref))?))
}

#[inline]
fn entry(m: &DMat3, row: usize, col: usize) -> f64 {
    m.col(col)[row]
}
