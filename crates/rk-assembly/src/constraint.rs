//! Assembly Constraints
//!
//! Geometric relationships between two rigid bodies. Each side of a
//! constraint refers to a body and to a sub-feature of that body, already
//! reduced to a point and/or an axis by the host's geometry fitting.

use std::f64::consts::PI;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AssemblyError, Result};

/// How two axes are to be related
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionMode {
    /// No orientation requirement
    #[default]
    None,
    /// Axes point the same way
    Aligned,
    /// Axes point in opposite directions
    Opposed,
}

impl DirectionMode {
    /// Factor applied to the second axis, `None` when unconstrained
    pub fn sign(&self) -> Option<f64> {
        match self {
            DirectionMode::None => None,
            DirectionMode::Aligned => Some(1.0),
            DirectionMode::Opposed => Some(-1.0),
        }
    }
}

/// Coordinate frame a sub-feature is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FeatureFrame {
    /// Body-local coordinates
    #[default]
    Local,
    /// World coordinates at the body's current pose
    World,
}

/// A face, edge or vertex reduced to a point and/or an axis
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SubFeature {
    #[serde(default)]
    pub point: Option<DVec3>,
    /// Direction or plane normal
    #[serde(default)]
    pub axis: Option<DVec3>,
    #[serde(default)]
    pub frame: FeatureFrame,
}

impl SubFeature {
    /// A plane through `point` with the given normal
    pub fn plane(point: DVec3, normal: DVec3) -> Self {
        Self {
            point: Some(point),
            axis: Some(normal),
            frame: FeatureFrame::Local,
        }
    }

    /// A line through `point` along `direction`
    pub fn axis(point: DVec3, direction: DVec3) -> Self {
        Self::plane(point, direction)
    }

    /// A single point (vertex or sphere center)
    pub fn point(point: DVec3) -> Self {
        Self {
            point: Some(point),
            axis: None,
            frame: FeatureFrame::Local,
        }
    }

    /// Mark the feature as given in world coordinates
    pub fn in_world(mut self) -> Self {
        self.frame = FeatureFrame::World;
        self
    }

    pub fn has_axis(&self) -> bool {
        self.axis.is_some()
    }

    /// The point, or an error naming the constraint
    pub fn require_point(&self, constraint: Uuid) -> Result<DVec3> {
        self.point.ok_or(AssemblyError::MissingFeature {
            constraint,
            feature: "point",
        })
    }

    /// The normalized axis, or an error naming the constraint
    pub fn require_axis(&self, constraint: Uuid) -> Result<DVec3> {
        let axis = self.axis.ok_or(AssemblyError::MissingFeature {
            constraint,
            feature: "axis",
        })?;
        axis.try_normalize().ok_or(AssemblyError::NotUnitVector {
            norm: axis.length(),
        })
    }
}

/// The kind of an assembly constraint with its parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// Two planes at a signed offset, optionally with aligned normals
    Plane {
        offset: f64,
        direction: DirectionMode,
    },
    /// Fixed angle (radians) between two plane normals
    AngleBetweenPlanes { angle: f64 },
    /// Coincident axes
    Axial {
        direction: DirectionMode,
        lock_rotation: bool,
    },
    /// Coincident axes plus an offset between the edge planes
    CircularEdge {
        offset: f64,
        direction: DirectionMode,
        lock_rotation: bool,
    },
    /// Coincident sphere centers
    SphericalSurface,
}

impl ConstraintKind {
    /// Persisted type name
    pub fn type_name(&self) -> &'static str {
        match self {
            ConstraintKind::Plane { .. } => "plane",
            ConstraintKind::AngleBetweenPlanes { .. } => "angle_between_planes",
            ConstraintKind::Axial { .. } => "axial",
            ConstraintKind::CircularEdge { .. } => "circularEdge",
            ConstraintKind::SphericalSurface => "sphericalSurface",
        }
    }

    /// Kind with default parameters for a persisted type name
    pub fn from_type_name(name: &str) -> Result<Self> {
        match name {
            "plane" => Ok(ConstraintKind::Plane {
                offset: 0.0,
                direction: DirectionMode::None,
            }),
            "angle_between_planes" => Ok(ConstraintKind::AngleBetweenPlanes { angle: 0.0 }),
            "axial" => Ok(ConstraintKind::Axial {
                direction: DirectionMode::None,
                lock_rotation: false,
            }),
            "circularEdge" => Ok(ConstraintKind::CircularEdge {
                offset: 0.0,
                direction: DirectionMode::None,
                lock_rotation: false,
            }),
            "sphericalSurface" => Ok(ConstraintKind::SphericalSurface),
            other => Err(AssemblyError::UnknownConstraintKind(other.to_string())),
        }
    }
}

/// A constraint between two bodies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: Uuid,
    #[serde(default)]
    pub label: String,
    pub kind: ConstraintKind,
    pub body1: String,
    pub feature1: SubFeature,
    pub body2: String,
    pub feature2: SubFeature,
}

impl Constraint {
    pub fn new(
        kind: ConstraintKind,
        body1: impl Into<String>,
        feature1: SubFeature,
        body2: impl Into<String>,
        feature2: SubFeature,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: String::new(),
            kind,
            body1: body1.into(),
            feature1,
            body2: body2.into(),
            feature2,
        }
    }

    /// Set the display label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Label for messages, falling back to the type name
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            self.kind.type_name()
        } else {
            &self.label
        }
    }

    /// Same constraint with the same parameters, ignoring the label
    pub fn same_definition(&self, other: &Constraint) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.body1 == other.body1
            && self.feature1 == other.feature1
            && self.body2 == other.body2
            && self.feature2 == other.feature2
    }

    /// Names of the two referenced bodies
    pub fn referenced_bodies(&self) -> [&str; 2] {
        [&self.body1, &self.body2]
    }

    /// Check if this constraint references a specific body
    pub fn references_body(&self, name: &str) -> bool {
        self.body1 == name || self.body2 == name
    }

    // ============== Factory Methods ==============

    /// Create a plane constraint
    pub fn plane(
        body1: impl Into<String>,
        feature1: SubFeature,
        body2: impl Into<String>,
        feature2: SubFeature,
        offset: f64,
        direction: DirectionMode,
    ) -> Self {
        Self::new(
            ConstraintKind::Plane { offset, direction },
            body1,
            feature1,
            body2,
            feature2,
        )
    }

    /// Create an angle constraint (radians)
    pub fn angle_between_planes(
        body1: impl Into<String>,
        feature1: SubFeature,
        body2: impl Into<String>,
        feature2: SubFeature,
        angle: f64,
    ) -> Self {
        Self::new(
            ConstraintKind::AngleBetweenPlanes { angle },
            body1,
            feature1,
            body2,
            feature2,
        )
    }

    /// Create an axial constraint
    pub fn axial(
        body1: impl Into<String>,
        feature1: SubFeature,
        body2: impl Into<String>,
        feature2: SubFeature,
        direction: DirectionMode,
        lock_rotation: bool,
    ) -> Self {
        Self::new(
            ConstraintKind::Axial {
                direction,
                lock_rotation,
            },
            body1,
            feature1,
            body2,
            feature2,
        )
    }

    /// Create a circular edge constraint
    pub fn circular_edge(
        body1: impl Into<String>,
        feature1: SubFeature,
        body2: impl Into<String>,
        feature2: SubFeature,
        offset: f64,
        direction: DirectionMode,
        lock_rotation: bool,
    ) -> Self {
        Self::new(
            ConstraintKind::CircularEdge {
                offset,
                direction,
                lock_rotation,
            },
            body1,
            feature1,
            body2,
            feature2,
        )
    }

    /// Create a spherical constraint
    pub fn spherical(
        body1: impl Into<String>,
        feature1: SubFeature,
        body2: impl Into<String>,
        feature2: SubFeature,
    ) -> Self {
        Self::new(
            ConstraintKind::SphericalSurface,
            body1,
            feature1,
            body2,
            feature2,
        )
    }
}

/// Raw constraint record as stored by older documents
///
/// Parameters that older documents did not write are optional; the angle is
/// stored in degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintRecord {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub object1: String,
    pub feature1: SubFeature,
    pub object2: String,
    pub feature2: SubFeature,
    #[serde(default)]
    pub offset: Option<f64>,
    #[serde(default)]
    pub angle: Option<f64>,
    #[serde(default)]
    pub direction: Option<DirectionMode>,
    #[serde(default)]
    pub lock_rotation: Option<bool>,
}

impl TryFrom<ConstraintRecord> for Constraint {
    type Error = AssemblyError;

    fn try_from(record: ConstraintRecord) -> Result<Self> {
        let offset = record.offset.unwrap_or(0.0);
        let direction = record.direction.unwrap_or_default();
        let lock_rotation = record.lock_rotation.unwrap_or(false);

        let kind = match ConstraintKind::from_type_name(&record.type_name)? {
            ConstraintKind::Plane { .. } => ConstraintKind::Plane { offset, direction },
            ConstraintKind::AngleBetweenPlanes { .. } => ConstraintKind::AngleBetweenPlanes {
                angle: record.angle.unwrap_or(0.0) * PI / 180.0,
            },
            ConstraintKind::Axial { .. } => ConstraintKind::Axial {
                direction,
                lock_rotation,
            },
            ConstraintKind::CircularEdge { .. } => ConstraintKind::CircularEdge {
                offset,
                direction,
                lock_rotation,
            },
            ConstraintKind::SphericalSurface => ConstraintKind::SphericalSurface,
        };

        Ok(Constraint {
            id: record.id.unwrap_or_else(Uuid::new_v4),
            label: record.label,
            kind,
            body1: record.object1,
            feature1: record.feature1,
            body2: record.object2,
            feature2: record.feature2,
        })
    }
}
