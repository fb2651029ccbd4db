//! Constraint System Chain
//!
//! Constraint equations accumulate in a chain of immutable nodes. Each node
//! points at its parent and adds its own residual equations, so the residual
//! of a node is the residual of its parent followed by its own. Nodes live in
//! a [`SystemArena`] and are addressed by [`NodeId`]; several children may
//! share a parent, which lets the solve cache branch without copying.

use std::collections::HashMap;

use glam::{DMat3, DVec3};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::constraint::{Constraint, ConstraintKind};
use crate::error::Result;
use crate::rotation::{gram_schmidt, plane_basis, skew_vector, wrap_angle};
use crate::variables::{VariableManager, VariableVector};

/// Index of a node in a [`SystemArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// In-plane reference directions captured when a union is built
///
/// Re-orthonormalized against the current axis on every evaluation, so the
/// measured in-plane components change continuously even when the axis
/// passes through a pole of the azimuth/elevation parameterization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceBasis {
    pub x_ref: DVec3,
    pub y_ref: DVec3,
}

impl ReferenceBasis {
    pub fn for_axis(axis: DVec3) -> Result<Self> {
        let (x_ref, y_ref) = plane_basis(axis)?;
        Ok(Self { x_ref, y_ref })
    }

    /// Orthonormal in-plane directions for `axis`
    pub fn frame(&self, axis: DVec3) -> (DVec3, DVec3) {
        let (_, u, v) = gram_schmidt(axis, self.x_ref, self.y_ref);
        (u, v)
    }
}

/// The equations contributed by one chain node
///
/// Points and axes are stored in the local frame of their body.
#[derive(Debug, Clone, PartialEq)]
pub enum Union {
    /// Root: pins the anchor body at its pose when the chain was started
    Fixed {
        body: String,
        position: DVec3,
        rotation: DMat3,
    },
    /// Marks bodies as free without adding equations
    AddFreeObjects,
    /// Two axes parallel (`sign` 1) or anti-parallel (`sign` -1)
    AxisAlignment {
        body1: String,
        axis1: DVec3,
        body2: String,
        axis2: DVec3,
        sign: f64,
        basis: ReferenceBasis,
    },
    /// Distance from a point on body 2 to an axis of body 1
    AxisDistance {
        body1: String,
        point1: DVec3,
        axis1: DVec3,
        body2: String,
        point2: DVec3,
        value: f64,
        basis: ReferenceBasis,
    },
    /// Signed distance of a point on body 2 from a plane of body 1
    PlaneOffset {
        body1: String,
        point1: DVec3,
        normal1: DVec3,
        body2: String,
        point2: DVec3,
        value: f64,
    },
    /// Angle between two normals
    Angle {
        body1: String,
        normal1: DVec3,
        body2: String,
        normal2: DVec3,
        value: f64,
    },
    /// Distance between two points
    Vertex {
        body1: String,
        point1: DVec3,
        body2: String,
        point2: DVec3,
        value: f64,
    },
    /// Relative twist of two bodies about a shared axis
    LockRelativeAxialRotation {
        body1: String,
        axis1: DVec3,
        reference1: DVec3,
        body2: String,
        reference2: DVec3,
        value: f64,
        basis: ReferenceBasis,
    },
}

impl Union {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Union::Fixed { .. } => "fixed",
            Union::AddFreeObjects => "add free objects",
            Union::AxisAlignment { .. } => "axis alignment",
            Union::AxisDistance { .. } => "axis distance",
            Union::PlaneOffset { .. } => "plane offset",
            Union::Angle { .. } => "angle",
            Union::Vertex { .. } => "vertex",
            Union::LockRelativeAxialRotation { .. } => "lock relative axial rotation",
        }
    }

    /// Number of residual equations
    pub fn equation_count(&self) -> usize {
        match self {
            Union::Fixed { .. } => 6,
            Union::AddFreeObjects => 0,
            Union::AxisAlignment { .. } => 2,
            Union::AxisDistance { value, .. } => {
                if *value == 0.0 {
                    2
                } else {
                    1
                }
            }
            Union::PlaneOffset { .. } => 1,
            Union::Angle { .. } => 1,
            Union::Vertex { value, .. } => {
                if *value == 0.0 {
                    3
                } else {
                    1
                }
            }
            Union::LockRelativeAxialRotation { .. } => 1,
        }
    }

    /// Append this union's residuals at `x` to `out`
    pub fn residuals(
        &self,
        vm: &VariableManager,
        x: &VariableVector,
        out: &mut Vec<f64>,
    ) -> Result<()> {
        match self {
            Union::Fixed {
                body,
                position,
                rotation,
            } => {
                let p = vm.position(body, x)? - *position;
                let w = skew_vector(&(vm.rotation_matrix(body, x)? * rotation.transpose()));
                out.extend_from_slice(&[p.x, p.y, p.z, w.x, w.y, w.z]);
            }

            Union::AddFreeObjects => {}

            Union::AxisAlignment {
                body1,
                axis1,
                body2,
                axis2,
                sign,
                basis,
            } => {
                let a1 = vm.rotate(body1, *axis1, x)?;
                let a2 = vm.rotate(body2, *axis2, x)? * *sign;
                let w = rotation_vector_between(a1, a2, basis);
                let (u, v) = basis.frame(a1);
                out.push(w.dot(u));
                out.push(w.dot(v));
            }

            Union::AxisDistance {
                body1,
                point1,
                axis1,
                body2,
                point2,
                value,
                basis,
            } => {
                let p1 = vm.rotate_and_move(body1, *point1, x)?;
                let d1 = vm.rotate(body1, *axis1, x)?;
                let p2 = vm.rotate_and_move(body2, *point2, x)?;
                let o = p2 - p1;
                let perpendicular = o - d1 * o.dot(d1);
                if *value == 0.0 {
                    let (u, v) = basis.frame(d1);
                    out.push(perpendicular.dot(u));
                    out.push(perpendicular.dot(v));
                } else {
                    out.push(perpendicular.length() - value);
                }
            }

            Union::PlaneOffset {
                body1,
                point1,
                normal1,
                body2,
                point2,
                value,
            } => {
                let p1 = vm.rotate_and_move(body1, *point1, x)?;
                let n1 = vm.rotate(body1, *normal1, x)?;
                let p2 = vm.rotate_and_move(body2, *point2, x)?;
                out.push((p2 - p1).dot(n1) - value);
            }

            Union::Angle {
                body1,
                normal1,
                body2,
                normal2,
                value,
            } => {
                let n1 = vm.rotate(body1, *normal1, x)?;
                let n2 = vm.rotate(body2, *normal2, x)?;
                out.push(angle_between(n1, n2) - value);
            }

            Union::Vertex {
                body1,
                point1,
                body2,
                point2,
                value,
            } => {
                let d = vm.rotate_and_move(body2, *point2, x)?
                    - vm.rotate_and_move(body1, *point1, x)?;
                if *value == 0.0 {
                    out.extend_from_slice(&[d.x, d.y, d.z]);
                } else {
                    out.push(d.length() - value);
                }
            }

            Union::LockRelativeAxialRotation {
                body1,
                axis1,
                reference1,
                body2,
                reference2,
                value,
                basis,
            } => {
                let a = vm.rotate(body1, *axis1, x)?;
                let (u, v) = basis.frame(a);
                let twist = |r: DVec3| r.dot(v).atan2(r.dot(u));
                let r1 = vm.rotate(body1, *reference1, x)?;
                let r2 = vm.rotate(body2, *reference2, x)?;
                out.push(wrap_angle(twist(r1) - twist(r2)) - value);
            }
        }
        Ok(())
    }
}

/// Angle between two unit vectors, accurate near 0 and π
fn angle_between(a: DVec3, b: DVec3) -> f64 {
    a.cross(b).length().atan2(a.dot(b))
}

/// Rotation vector turning `a` onto `b`
fn rotation_vector_between(a: DVec3, b: DVec3, basis: &ReferenceBasis) -> DVec3 {
    let c = a.cross(b);
    let s = c.length();
    if s > 0.0 {
        c * (s.atan2(a.dot(b)) / s)
    } else if a.dot(b) >= 0.0 {
        DVec3::ZERO
    } else {
        // anti-parallel: any in-plane axis
        basis.frame(a).0 * std::f64::consts::PI
    }
}

/// A node of the constraint system chain
#[derive(Debug, Clone)]
pub struct SystemNode {
    pub parent: Option<NodeId>,
    pub union: Union,
    /// Bodies that became free in this node
    pub bodies: Vec<String>,
    /// Number of ancestors
    pub depth: usize,
}

/// Storage for chain nodes
#[derive(Debug, Clone, Default)]
pub struct SystemArena {
    nodes: Vec<SystemNode>,
}

impl SystemArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop all nodes; previously returned ids become invalid
    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn node(&self, id: NodeId) -> &SystemNode {
        &self.nodes[id.0]
    }

    /// Start a chain pinning `anchor` at its pose in `x`
    pub fn fixed_root(
        &mut self,
        vm: &VariableManager,
        anchor: &str,
        x: &VariableVector,
    ) -> Result<NodeId> {
        let union = Union::Fixed {
            body: anchor.to_string(),
            position: vm.position(anchor, x)?,
            rotation: vm.rotation_matrix(anchor, x)?,
        };
        Ok(self.insert(None, union, vec![anchor.to_string()]))
    }

    /// Append a union below `parent`
    pub fn push(&mut self, parent: NodeId, union: Union, bodies: Vec<String>) -> NodeId {
        self.insert(Some(parent), union, bodies)
    }

    fn insert(&mut self, parent: Option<NodeId>, union: Union, bodies: Vec<String>) -> NodeId {
        let depth = parent.map_or(0, |p| self.node(p).depth + 1);
        let id = NodeId(self.nodes.len());
        self.nodes.push(SystemNode {
            parent,
            union,
            bodies,
            depth,
        });
        id
    }

    /// Copy the chain ending at `id` in `source` into this arena
    ///
    /// `mapped` translates source ids to ids of this arena. Nodes already in
    /// it are shared instead of copied, and every copied node is added to it.
    pub fn import(
        &mut self,
        source: &SystemArena,
        id: NodeId,
        mapped: &mut HashMap<NodeId, NodeId>,
    ) -> NodeId {
        if let Some(&existing) = mapped.get(&id) {
            return existing;
        }
        let node = source.node(id);
        let parent = node.parent.map(|p| self.import(source, p, mapped));
        let copy = self.insert(parent, node.union.clone(), node.bodies.clone());
        mapped.insert(id, copy);
        copy
    }

    /// Nodes from the root down to `id`
    pub fn path(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::with_capacity(self.node(id).depth + 1);
        let mut current = Some(id);
        while let Some(n) = current {
            path.push(n);
            current = self.node(n).parent;
        }
        path.reverse();
        path
    }

    /// Whether `name` is free (or anchored) in `id` or one of its ancestors
    pub fn contains_object(&self, id: NodeId, name: &str) -> bool {
        let mut current = Some(id);
        while let Some(n) = current {
            let node = self.node(n);
            if node.bodies.iter().any(|b| b == name) {
                return true;
            }
            current = node.parent;
        }
        false
    }

    /// Chain depth below the root
    pub fn number_of_parent_systems(&self, id: NodeId) -> usize {
        self.node(id).depth
    }

    /// Total number of equations of the chain ending at `id`
    pub fn equation_count(&self, id: NodeId) -> usize {
        self.path(id)
            .into_iter()
            .map(|n| self.node(n).union.equation_count())
            .sum()
    }

    /// Residual vector of the chain ending at `id`
    pub fn residuals(
        &self,
        id: NodeId,
        vm: &VariableManager,
        x: &VariableVector,
    ) -> Result<DVector<f64>> {
        let mut out = Vec::new();
        for n in self.path(id) {
            self.node(n).union.residuals(vm, x, &mut out)?;
        }
        Ok(DVector::from_vec(out))
    }

    /// Add the equations of `constraint` below `parent`
    ///
    /// Bodies not yet in the chain are introduced first. Features must be in
    /// body-local coordinates; reference bases are taken from `x`.
    pub fn add_constraint(
        &mut self,
        parent: NodeId,
        vm: &VariableManager,
        x: &VariableVector,
        constraint: &Constraint,
    ) -> Result<NodeId> {
        let mut node = parent;

        let mut new_bodies: Vec<String> = Vec::new();
        for name in constraint.referenced_bodies() {
            if !self.contains_object(node, name) && !new_bodies.iter().any(|b| b == name) {
                new_bodies.push(name.to_string());
            }
        }
        if !new_bodies.is_empty() {
            node = self.push(node, Union::AddFreeObjects, new_bodies);
        }

        for union in build_unions(constraint, vm, x)? {
            tracing::trace!(
                constraint = %constraint.id,
                union = union.name(),
                "adding union"
            );
            node = self.push(node, union, Vec::new());
        }
        Ok(node)
    }
}

/// Translate a constraint into its unions
pub fn build_unions(
    constraint: &Constraint,
    vm: &VariableManager,
    x: &VariableVector,
) -> Result<Vec<Union>> {
    let id = constraint.id;
    let (b1, b2) = (&constraint.body1, &constraint.body2);
    let (f1, f2) = (&constraint.feature1, &constraint.feature2);
    let mut unions = Vec::new();

    match constraint.kind {
        ConstraintKind::Plane { offset, direction } => {
            // against a vertex only the offset applies
            if f2.has_axis()
                && let Some(sign) = direction.sign()
            {
                let (a1, a2) = (f1.require_axis(id)?, f2.require_axis(id)?);
                unions.push(axis_alignment(vm, x, b1, a1, b2, a2, sign)?);
            }
            unions.push(Union::PlaneOffset {
                body1: b1.clone(),
                point1: f1.require_point(id)?,
                normal1: f1.require_axis(id)?,
                body2: b2.clone(),
                point2: f2.require_point(id)?,
                value: offset,
            });
        }

        ConstraintKind::AngleBetweenPlanes { angle } => {
            unions.push(Union::Angle {
                body1: b1.clone(),
                normal1: f1.require_axis(id)?,
                body2: b2.clone(),
                normal2: f2.require_axis(id)?,
                value: angle,
            });
        }

        ConstraintKind::Axial {
            direction,
            lock_rotation,
        } => {
            let (a1, a2) = (f1.require_axis(id)?, f2.require_axis(id)?);
            if let Some(sign) = direction.sign() {
                unions.push(axis_alignment(vm, x, b1, a1, b2, a2, sign)?);
            }
            let (p1, p2) = (f1.require_point(id)?, f2.require_point(id)?);
            unions.push(axis_distance(vm, x, b1, p1, a1, b2, p2)?);
            if lock_rotation {
                unions.push(lock_rotation_union(vm, x, b1, a1, b2, a2)?);
            }
        }

        ConstraintKind::CircularEdge {
            offset,
            direction,
            lock_rotation,
        } => {
            let (a1, a2) = (f1.require_axis(id)?, f2.require_axis(id)?);
            let (p1, p2) = (f1.require_point(id)?, f2.require_point(id)?);
            if let Some(sign) = direction.sign() {
                unions.push(axis_alignment(vm, x, b1, a1, b2, a2, sign)?);
            }
            unions.push(axis_distance(vm, x, b1, p1, a1, b2, p2)?);
            unions.push(Union::PlaneOffset {
                body1: b1.clone(),
                point1: p1,
                normal1: a1,
                body2: b2.clone(),
                point2: p2,
                value: offset,
            });
            if lock_rotation {
                unions.push(lock_rotation_union(vm, x, b1, a1, b2, a2)?);
            }
        }

        ConstraintKind::SphericalSurface => {
            unions.push(Union::Vertex {
                body1: b1.clone(),
                point1: f1.require_point(id)?,
                body2: b2.clone(),
                point2: f2.require_point(id)?,
                value: 0.0,
            });
        }
    }
    Ok(unions)
}

fn axis_alignment(
    vm: &VariableManager,
    x: &VariableVector,
    body1: &str,
    axis1: DVec3,
    body2: &str,
    axis2: DVec3,
    sign: f64,
) -> Result<Union> {
    Ok(Union::AxisAlignment {
        body1: body1.to_string(),
        axis1,
        body2: body2.to_string(),
        axis2,
        sign,
        basis: ReferenceBasis::for_axis(vm.rotate(body1, axis1, x)?)?,
    })
}

fn axis_distance(
    vm: &VariableManager,
    x: &VariableVector,
    body1: &str,
    point1: DVec3,
    axis1: DVec3,
    body2: &str,
    point2: DVec3,
) -> Result<Union> {
    Ok(Union::AxisDistance {
        body1: body1.to_string(),
        point1,
        axis1,
        body2: body2.to_string(),
        point2,
        value: 0.0,
        basis: ReferenceBasis::for_axis(vm.rotate(body1, axis1, x)?)?,
    })
}

/// Lock the current relative twist of the two bodies about axis 1
fn lock_rotation_union(
    vm: &VariableManager,
    x: &VariableVector,
    body1: &str,
    axis1: DVec3,
    body2: &str,
    axis2: DVec3,
) -> Result<Union> {
    let basis = ReferenceBasis::for_axis(vm.rotate(body1, axis1, x)?)?;
    let local_reference = |body: &str, axis: DVec3| -> Result<DVec3> {
        let r = vm.rotate_undo(body, basis.x_ref, x)?;
        let (_, r, _) = gram_schmidt(axis, r, axis.any_orthonormal_vector());
        Ok(r)
    };
    Ok(Union::LockRelativeAxialRotation {
        body1: body1.to_string(),
        axis1,
        reference1: local_reference(body1, axis1)?,
        body2: body2.to_string(),
        reference2: local_reference(body2, axis2)?,
        value: 0.0,
        basis,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::{DirectionMode, SubFeature};
    use crate::variables::{Body, Pose};
    use approx::assert_abs_diff_eq;
    use glam::DQuat;

    fn manager(b_pose: Pose) -> VariableManager {
        let bodies = vec![Body::fixed("a", Pose::IDENTITY), Body::new("b", b_pose)];
        VariableManager::new(&bodies, &["a", "b"]).unwrap()
    }

    #[test]
    fn test_chain_membership_and_depth() {
        let vm = manager(Pose::from_position(DVec3::new(0.0, 0.0, 2.0)));
        let x = vm.x().clone();
        let mut arena = SystemArena::new();
        let root = arena.fixed_root(&vm, "a", &x).unwrap();
        assert!(arena.contains_object(root, "a"));
        assert!(!arena.contains_object(root, "b"));

        let c = Constraint::plane(
            "a",
            SubFeature::plane(DVec3::ZERO, DVec3::Z),
            "b",
            SubFeature::plane(DVec3::ZERO, DVec3::Z),
            1.0,
            DirectionMode::Aligned,
        );
        let leaf = arena.add_constraint(root, &vm, &x, &c).unwrap();
        assert!(arena.contains_object(leaf, "b"));
        // free objects + alignment + offset
        assert_eq!(arena.number_of_parent_systems(leaf), 3);
        assert_eq!(arena.equation_count(leaf), 6 + 2 + 1);

        // root unchanged by the branch
        assert!(!arena.contains_object(root, "b"));
        let r = arena.residuals(leaf, &vm, &x).unwrap();
        assert_eq!(r.len(), 9);
        assert_abs_diff_eq!(r[8], 1.0, epsilon = 1e-12);
        for i in 0..8 {
            assert_abs_diff_eq!(r[i], 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_direction_none_adds_no_alignment() {
        let vm = manager(Pose::IDENTITY);
        let x = vm.x().clone();
        let c = Constraint::axial(
            "a",
            SubFeature::axis(DVec3::ZERO, DVec3::Z),
            "b",
            SubFeature::axis(DVec3::ZERO, DVec3::Z),
            DirectionMode::None,
            false,
        );
        let unions = build_unions(&c, &vm, &x).unwrap();
        assert_eq!(unions.len(), 1);
        assert_eq!(unions[0].name(), "axis distance");
    }

    #[test]
    fn test_plane_against_vertex_is_offset_only() {
        let vm = manager(Pose::IDENTITY);
        let x = vm.x().clone();
        let c = Constraint::plane(
            "a",
            SubFeature::plane(DVec3::ZERO, DVec3::Z),
            "b",
            SubFeature::point(DVec3::new(0.0, 0.0, 3.0)),
            0.0,
            DirectionMode::Aligned,
        );
        let unions = build_unions(&c, &vm, &x).unwrap();
        assert_eq!(unions.len(), 1);
        let mut out = Vec::new();
        unions[0].residuals(&vm, &x, &mut out).unwrap();
        assert_abs_diff_eq!(out[0], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_alignment_residual_measures_angle() {
        let tilt = 0.3;
        let vm = manager(Pose::new(DVec3::ZERO, DQuat::from_axis_angle(DVec3::X, tilt)));
        let x = vm.x().clone();
        let c = Constraint::axial(
            "a",
            SubFeature::axis(DVec3::ZERO, DVec3::Z),
            "b",
            SubFeature::axis(DVec3::ZERO, DVec3::Z),
            DirectionMode::Aligned,
            false,
        );
        let unions = build_unions(&c, &vm, &x).unwrap();
        let mut out = Vec::new();
        unions[0].residuals(&vm, &x, &mut out).unwrap();
        let norm = (out[0] * out[0] + out[1] * out[1]).sqrt();
        assert_abs_diff_eq!(norm, tilt, epsilon = 1e-12);

        // opposed mode measures against the flipped axis
        let c = Constraint::axial(
            "a",
            SubFeature::axis(DVec3::ZERO, DVec3::Z),
            "b",
            SubFeature::axis(DVec3::ZERO, DVec3::Z),
            DirectionMode::Opposed,
            false,
        );
        let unions = build_unions(&c, &vm, &x).unwrap();
        let mut out = Vec::new();
        unions[0].residuals(&vm, &x, &mut out).unwrap();
        let norm = (out[0] * out[0] + out[1] * out[1]).sqrt();
        assert_abs_diff_eq!(norm, std::f64::consts::PI - tilt, epsilon = 1e-12);
    }

    #[test]
    fn test_axis_distance_and_lock() {
        let vm = manager(Pose::from_position(DVec3::new(3.0, 4.0, 1.0)));
        let x = vm.x().clone();
        let c = Constraint::axial(
            "a",
            SubFeature::axis(DVec3::ZERO, DVec3::Z),
            "b",
            SubFeature::axis(DVec3::ZERO, DVec3::Z),
            DirectionMode::Aligned,
            true,
        );
        let unions = build_unions(&c, &vm, &x).unwrap();
        assert_eq!(unions.len(), 3);

        let mut out = Vec::new();
        unions[1].residuals(&vm, &x, &mut out).unwrap();
        let norm = (out[0] * out[0] + out[1] * out[1]).sqrt();
        assert_abs_diff_eq!(norm, 5.0, epsilon = 1e-12);

        // twist is zero where the lock was taken, and follows a spin of body b
        let mut out = Vec::new();
        unions[2].residuals(&vm, &x, &mut out).unwrap();
        assert_abs_diff_eq!(out[0], 0.0, epsilon = 1e-12);

        let mut delta = DVector::zeros(12);
        delta[11] = 0.4;
        let spun = vm.retract(&x, &delta).unwrap();
        let mut out = Vec::new();
        unions[2].residuals(&vm, &spun, &mut out).unwrap();
        assert_abs_diff_eq!(out[0].abs(), 0.4, epsilon = 1e-9);
    }

    #[test]
    fn test_nonzero_distance_unions() {
        let vm = manager(Pose::from_position(DVec3::new(3.0, 4.0, 1.0)));
        let x = vm.x().clone();

        let distance = Union::AxisDistance {
            body1: "a".into(),
            point1: DVec3::ZERO,
            axis1: DVec3::Z,
            body2: "b".into(),
            point2: DVec3::ZERO,
            value: 2.0,
            basis: ReferenceBasis::for_axis(DVec3::Z).unwrap(),
        };
        assert_eq!(distance.equation_count(), 1);
        let mut out = Vec::new();
        distance.residuals(&vm, &x, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_abs_diff_eq!(out[0], 3.0, epsilon = 1e-12);

        let vertex = Union::Vertex {
            body1: "a".into(),
            point1: DVec3::new(0.0, 0.0, 1.0),
            body2: "b".into(),
            point2: DVec3::ZERO,
            value: 1.5,
        };
        assert_eq!(vertex.equation_count(), 1);
        let mut out = Vec::new();
        vertex.residuals(&vm, &x, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_abs_diff_eq!(out[0], 3.5, epsilon = 1e-12);
    }

    #[test]
    fn test_import_copies_only_unmapped_nodes() {
        let vm = manager(Pose::from_position(DVec3::new(0.0, 0.0, 2.0)));
        let x = vm.x().clone();
        let c = Constraint::plane(
            "a",
            SubFeature::plane(DVec3::ZERO, DVec3::Z),
            "b",
            SubFeature::plane(DVec3::ZERO, DVec3::Z),
            1.0,
            DirectionMode::Aligned,
        );
        let mut scratch = SystemArena::new();
        let root = scratch.fixed_root(&vm, "a", &x).unwrap();
        let leaf = scratch.add_constraint(root, &vm, &x, &c).unwrap();

        let mut store = SystemArena::new();
        let mut mapped = HashMap::new();
        let copied = store.import(&scratch, leaf, &mut mapped);
        assert_eq!(store.len(), scratch.len());
        assert_eq!(store.equation_count(copied), scratch.equation_count(leaf));
        assert_eq!(
            store.residuals(copied, &vm, &x).unwrap(),
            scratch.residuals(leaf, &vm, &x).unwrap()
        );

        // importing again reuses the copies
        assert_eq!(store.import(&scratch, leaf, &mut mapped), copied);
        assert_eq!(store.len(), scratch.len());
    }

    #[test]
    fn test_fixed_root_residual() {
        let vm = manager(Pose::IDENTITY);
        let x = vm.x().clone();
        let mut arena = SystemArena::new();
        let root = arena.fixed_root(&vm, "a", &x).unwrap();
        assert!(arena.residuals(root, &vm, &x).unwrap().norm() < 1e-14);

        let mut delta = DVector::zeros(12);
        delta[0] = 0.5;
        delta[4] = 0.1;
        let moved = vm.retract(&x, &delta).unwrap();
        let r = arena.residuals(root, &vm, &moved).unwrap();
        assert_abs_diff_eq!(r[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(r[4], 0.1_f64.sin(), epsilon = 1e-12);
    }
}
