//! Variable Manager
//!
//! Owns the flat variable vector of a solve: six values per referenced body,
//! `(x, y, z, azimuth, elevation, angle)`, and converts between that layout
//! and the host's poses.

use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;

use glam::{DMat3, DQuat, DVec3};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::config::WriteBackTolerance;
use crate::error::{AssemblyError, Result};
use crate::rotation::{
    axis_from_azimuth_elevation, azimuth_elevation, azimuth_elevation_rotation_matrix,
    quaternion_to_axis_angle,
};

/// Number of variables per body
pub const VARIABLES_PER_BODY: usize = 6;

/// Largest Newton step allowed for a position variable
pub const MAX_LINEAR_STEP: f64 = 10.0;

/// Flat vector of pose variables
pub type VariableVector = DVector<f64>;

/// Per-body copy of the variables, independent of body offsets
pub type Snapshot = BTreeMap<String, [f64; VARIABLES_PER_BODY]>;

/// Position and orientation of a rigid body
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: DVec3,
    pub rotation: DQuat,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: DVec3::ZERO,
        rotation: DQuat::IDENTITY,
    };

    pub fn new(position: DVec3, rotation: DQuat) -> Self {
        Self { position, rotation }
    }

    pub fn from_position(position: DVec3) -> Self {
        Self {
            position,
            rotation: DQuat::IDENTITY,
        }
    }

    /// Transform a point from the body frame to world coordinates
    pub fn transform_point(&self, p: DVec3) -> DVec3 {
        self.rotation * p + self.position
    }
}

/// A rigid body as seen by the solver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub name: String,
    #[serde(default)]
    pub pose: Pose,
    /// Whether the body is the preferred anchor of the solve
    #[serde(default)]
    pub fixed: bool,
}

impl Body {
    pub fn new(name: impl Into<String>, pose: Pose) -> Self {
        Self {
            name: name.into(),
            pose,
            fixed: false,
        }
    }

    pub fn fixed(name: impl Into<String>, pose: Pose) -> Self {
        Self {
            name: name.into(),
            pose,
            fixed: true,
        }
    }
}

/// The host-side store of body poses
pub trait PoseStore {
    /// Current pose of a body, `None` if the body does not exist
    fn pose(&self, name: &str) -> Option<Pose>;

    /// Whether a body is flagged as fixed
    fn is_fixed(&self, name: &str) -> bool;

    /// Replace the pose of a body
    fn set_pose(&mut self, name: &str, pose: Pose);
}

impl PoseStore for [Body] {
    fn pose(&self, name: &str) -> Option<Pose> {
        self.iter().find(|b| b.name == name).map(|b| b.pose)
    }

    fn is_fixed(&self, name: &str) -> bool {
        self.iter().any(|b| b.name == name && b.fixed)
    }

    fn set_pose(&mut self, name: &str, pose: Pose) {
        if let Some(body) = self.iter_mut().find(|b| b.name == name) {
            body.pose = pose;
        }
    }
}

impl PoseStore for Vec<Body> {
    fn pose(&self, name: &str) -> Option<Pose> {
        self.as_slice().pose(name)
    }

    fn is_fixed(&self, name: &str) -> bool {
        self.as_slice().is_fixed(name)
    }

    fn set_pose(&mut self, name: &str, pose: Pose) {
        self.as_mut_slice().set_pose(name, pose)
    }
}

/// Orientation variables `(azimuth, elevation, angle)` of a quaternion
pub fn orientation_variables(rotation: DQuat) -> Result<[f64; 3]> {
    let (axis, angle) = quaternion_to_axis_angle(rotation);
    if angle == 0.0 {
        return Ok([0.0; 3]);
    }
    let (azimuth, elevation) = azimuth_elevation(axis)?;
    Ok([azimuth, elevation, angle])
}

/// Quaternion described by orientation variables
pub fn orientation_quaternion(azimuth: f64, elevation: f64, angle: f64) -> DQuat {
    DQuat::from_axis_angle(axis_from_azimuth_elevation(azimuth, elevation), angle)
}

/// Maps body names to offsets in the variable vector
#[derive(Debug, Clone)]
pub struct VariableManager {
    /// Body names in vector order
    names: Vec<String>,
    /// Offset of each body's first variable
    index: HashMap<String, usize>,
    /// Variables at the start of the solve
    x0: VariableVector,
    /// Current variables
    x: VariableVector,
}

impl VariableManager {
    /// Build the variable vector from the current poses of `names`
    pub fn new<S, N>(store: &S, names: &[N]) -> Result<Self>
    where
        S: PoseStore + ?Sized,
        N: AsRef<str>,
    {
        let mut poses = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let pose = store
                .pose(name)
                .ok_or_else(|| AssemblyError::MissingBody(name.to_string()))?;
            poses.push((name.to_string(), pose));
        }
        Self::from_poses(poses)
    }

    /// Build the variable vector from explicit poses
    pub fn from_poses(poses: impl IntoIterator<Item = (String, Pose)>) -> Result<Self> {
        let mut names = Vec::new();
        let mut index = HashMap::new();
        let mut values = Vec::new();
        for (name, pose) in poses {
            if index.contains_key(&name) {
                continue;
            }
            index.insert(name.clone(), values.len());
            names.push(name);
            values.extend_from_slice(&pose_variables(&pose)?);
        }
        let x0 = DVector::from_vec(values);
        Ok(Self {
            names,
            index,
            x: x0.clone(),
            x0,
        })
    }

    /// Number of managed bodies
    pub fn body_count(&self) -> usize {
        self.names.len()
    }

    /// Length of the variable vector
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Body names in vector order
    pub fn body_names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Offset of a body's first variable
    pub fn offset(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| AssemblyError::MissingBody(name.to_string()))
    }

    /// Variables at the start of the solve
    pub fn x0(&self) -> &VariableVector {
        &self.x0
    }

    /// Current variables
    pub fn x(&self) -> &VariableVector {
        &self.x
    }

    /// Replace the current variables
    pub fn set_x(&mut self, x: VariableVector) {
        debug_assert_eq!(x.len(), self.x.len());
        self.x = x;
    }

    pub fn value_at(&self, name: &str, coordinate: usize) -> Result<f64> {
        Ok(self.x[self.coordinate_index(name, coordinate)?])
    }

    pub fn set_value_at(&mut self, name: &str, coordinate: usize, value: f64) -> Result<()> {
        let i = self.coordinate_index(name, coordinate)?;
        self.x[i] = value;
        Ok(())
    }

    fn coordinate_index(&self, name: &str, coordinate: usize) -> Result<usize> {
        if coordinate >= VARIABLES_PER_BODY {
            return Err(AssemblyError::Domain {
                function: "coordinate index",
                value: coordinate as f64,
            });
        }
        Ok(self.offset(name)? + coordinate)
    }

    /// Position of a body in `x`
    pub fn position(&self, name: &str, x: &VariableVector) -> Result<DVec3> {
        let i = self.offset(name)?;
        Ok(DVec3::new(x[i], x[i + 1], x[i + 2]))
    }

    /// Rotation matrix of a body in `x`
    pub fn rotation_matrix(&self, name: &str, x: &VariableVector) -> Result<DMat3> {
        let i = self.offset(name)?;
        Ok(azimuth_elevation_rotation_matrix(x[i + 3], x[i + 4], x[i + 5]))
    }

    /// Pose of a body in `x`
    pub fn pose(&self, name: &str, x: &VariableVector) -> Result<Pose> {
        let i = self.offset(name)?;
        Ok(Pose {
            position: DVec3::new(x[i], x[i + 1], x[i + 2]),
            rotation: orientation_quaternion(x[i + 3], x[i + 4], x[i + 5]),
        })
    }

    /// Rotate a body-frame direction into world coordinates
    pub fn rotate(&self, name: &str, p: DVec3, x: &VariableVector) -> Result<DVec3> {
        Ok(self.rotation_matrix(name, x)? * p)
    }

    /// Rotate a world direction into the body frame
    pub fn rotate_undo(&self, name: &str, p: DVec3, x: &VariableVector) -> Result<DVec3> {
        Ok(self.rotation_matrix(name, x)?.transpose() * p)
    }

    /// Transform a body-frame point into world coordinates
    pub fn rotate_and_move(&self, name: &str, p: DVec3, x: &VariableVector) -> Result<DVec3> {
        Ok(self.rotate(name, p, x)? + self.position(name, x)?)
    }

    /// Transform a world point into the body frame
    pub fn rotate_and_move_undo(&self, name: &str, p: DVec3, x: &VariableVector) -> Result<DVec3> {
        let v = p - self.position(name, x)?;
        self.rotate_undo(name, v, x)
    }

    /// Variable bounds: positions unbounded, orientation within [-π, π]
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        let body = [
            (f64::NEG_INFINITY, f64::INFINITY),
            (f64::NEG_INFINITY, f64::INFINITY),
            (f64::NEG_INFINITY, f64::INFINITY),
            (-PI, PI),
            (-PI, PI),
            (-PI, PI),
        ];
        body.iter().copied().cycle().take(self.len()).collect()
    }

    /// Largest step per variable: a tenth of the bounded range (π/5 for
    /// orientation), [`MAX_LINEAR_STEP`] for unbounded positions
    pub fn max_steps(&self) -> VariableVector {
        let steps: Vec<f64> = self
            .bounds()
            .into_iter()
            .map(|(lo, hi)| {
                if lo.is_finite() && hi.is_finite() {
                    (hi - lo) / 10.0
                } else {
                    MAX_LINEAR_STEP
                }
            })
            .collect();
        DVector::from_vec(steps)
    }

    /// Apply a local increment to `base`
    ///
    /// Per body the increment is `(dx, dy, dz, rx, ry, rz)`: a translation and
    /// a world-frame rotation vector applied on top of the current
    /// orientation. Unlike the azimuth/elevation variables this chart stays
    /// regular at zero rotation.
    pub fn retract(&self, base: &VariableVector, delta: &VariableVector) -> Result<VariableVector> {
        let mut x = base.clone();
        for &i in self.index.values() {
            for k in 0..3 {
                x[i + k] = base[i + k] + delta[i + k];
            }
            let rotvec = DVec3::new(delta[i + 3], delta[i + 4], delta[i + 5]);
            if rotvec == DVec3::ZERO {
                continue;
            }
            let q = DQuat::from_scaled_axis(rotvec)
                * orientation_quaternion(base[i + 3], base[i + 4], base[i + 5]);
            let orientation = orientation_variables(q)?;
            x.as_mut_slice()[i + 3..i + 6].copy_from_slice(&orientation);
        }
        Ok(x)
    }

    /// Copy of the variables keyed by body name
    pub fn snapshot(&self, x: &VariableVector) -> Snapshot {
        self.names
            .iter()
            .map(|name| {
                let i = self.index[name];
                let mut values = [0.0; VARIABLES_PER_BODY];
                values.copy_from_slice(&x.as_slice()[i..i + VARIABLES_PER_BODY]);
                (name.clone(), values)
            })
            .collect()
    }

    /// Load the variables of every managed body present in `snapshot`
    pub fn restore(&mut self, snapshot: &Snapshot) {
        for (name, values) in snapshot {
            if let Some(&i) = self.index.get(name) {
                self.x.as_mut_slice()[i..i + VARIABLES_PER_BODY].copy_from_slice(values);
            }
        }
    }

    /// Push the poses in `x` to the host, skipping negligible changes
    ///
    /// Returns the names of the bodies whose pose was updated.
    pub fn write_back<S>(
        &self,
        store: &mut S,
        x: &VariableVector,
        tolerance: WriteBackTolerance,
    ) -> Result<Vec<String>>
    where
        S: PoseStore + ?Sized,
    {
        let mut updated = Vec::new();
        for name in &self.names {
            let current = store
                .pose(name)
                .ok_or_else(|| AssemblyError::MissingBody(name.clone()))?;
            let solved = self.pose(name, x)?;

            let mut next = current;
            let mut changed = false;
            if (solved.position - current.position).length() > tolerance.position {
                next.position = solved.position;
                changed = true;
            }
            // q and -q describe the same rotation
            let rotation_change = (solved.rotation - current.rotation)
                .length()
                .min((solved.rotation + current.rotation).length());
            if rotation_change > tolerance.rotation {
                next.rotation = solved.rotation;
                changed = true;
            }
            if changed {
                store.set_pose(name, next);
                updated.push(name.clone());
            }
        }
        Ok(updated)
    }
}

fn pose_variables(pose: &Pose) -> Result<[f64; VARIABLES_PER_BODY]> {
    let [azimuth, elevation, angle] = orientation_variables(pose.rotation)?;
    Ok([
        pose.position.x,
        pose.position.y,
        pose.position.z,
        azimuth,
        elevation,
        angle,
    ])
}
