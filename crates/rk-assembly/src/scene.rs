//! Assembly scenes
//!
//! A named set of bodies and constraints, stored as RON. The scene is the
//! pose store a solve reads from and writes back to.

use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::SolveCache;
use crate::constraint::{Constraint, ConstraintRecord};
use crate::error::{AssemblyError, Result};
use crate::solver::{AssemblySolver, SolveReport};
use crate::variables::{Body, Pose, PoseStore};

/// Bodies and constraints of one assembly
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssemblyScene {
    pub name: String,
    #[serde(default)]
    pub bodies: Vec<Body>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl AssemblyScene {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Build a scene from raw constraint records
    pub fn from_records(
        name: impl Into<String>,
        bodies: Vec<Body>,
        records: impl IntoIterator<Item = ConstraintRecord>,
    ) -> Result<Self> {
        let constraints = records
            .into_iter()
            .map(Constraint::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: name.into(),
            bodies,
            constraints,
        })
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.bodies.push(body);
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Add a body, rejecting duplicate names
    pub fn add_body(&mut self, body: Body) -> Result<()> {
        if self.body(&body.name).is_some() {
            return Err(AssemblyError::Scene(format!(
                "body '{}' already exists",
                body.name
            )));
        }
        self.bodies.push(body);
        Ok(())
    }

    pub fn add_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    pub fn body(&self, name: &str) -> Option<&Body> {
        self.bodies.iter().find(|b| b.name == name)
    }

    /// Remove a body; constraints referring to it are kept
    pub fn remove_body(&mut self, name: &str) -> Option<Body> {
        let index = self.bodies.iter().position(|b| b.name == name)?;
        Some(self.bodies.remove(index))
    }

    pub fn constraint(&self, id: Uuid) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.id == id)
    }

    /// Remove constraints by id, returning how many were removed
    pub fn remove_constraints(&mut self, ids: &[Uuid]) -> usize {
        let before = self.constraints.len();
        self.constraints.retain(|c| !ids.contains(&c.id));
        before - self.constraints.len()
    }

    /// Solve the scene's constraints in place
    ///
    /// Constraints dropped for dangling references are removed from the
    /// scene as well.
    pub fn solve(
        &mut self,
        solver: &mut AssemblySolver,
        cache: Option<&mut SolveCache>,
    ) -> Result<SolveReport> {
        let constraints = self.constraints.clone();
        let report = solver.solve(&mut self.bodies, &constraints, cache)?;
        if !report.removed_constraints.is_empty() {
            self.remove_constraints(&report.removed_constraints);
        }
        Ok(report)
    }

    // ============== Persistence ==============

    pub fn to_ron_string(&self) -> Result<String> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| AssemblyError::Scene(e.to_string()))
    }

    pub fn from_ron_str(content: &str) -> Result<Self> {
        ron::from_str(content).map_err(|e| AssemblyError::Scene(e.to_string()))
    }

    /// Save the scene to a RON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = self.to_ron_string()?;
        std::fs::write(path, content).map_err(|e| AssemblyError::Io(e.to_string()))?;
        Ok(())
    }

    /// Load a scene from a RON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| AssemblyError::Io(e.to_string()))?;
        Self::from_ron_str(&content)
    }
}

impl PoseStore for AssemblyScene {
    fn pose(&self, name: &str) -> Option<Pose> {
        self.bodies.pose(name)
    }

    fn is_fixed(&self, name: &str) -> bool {
        self.bodies.is_fixed(name)
    }

    fn set_pose(&mut self, name: &str, pose: Pose) {
        self.bodies.set_pose(name, pose)
    }
}
