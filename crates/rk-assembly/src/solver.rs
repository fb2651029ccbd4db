//! Solve Orchestrator
//!
//! Runs one assembly solve: checks references, picks the anchor, folds the
//! constraints into the system chain one at a time (resuming from the cache
//! when possible), solves each stage, writes the poses back and reports the
//! remaining degrees of freedom.

use std::collections::HashMap;
use std::time::Instant;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{AnchorKey, SolveCache, SolvedLevel};
use crate::config::{DanglingReferencePolicy, SolverConfig};
use crate::constraint::{Constraint, FeatureFrame, SubFeature};
use crate::dof::{DegreeOfFreedom, residual_freedom};
use crate::error::{AssemblyError, Result};
use crate::numeric::NewtonSolver;
use crate::system::{NodeId, SystemArena};
use crate::variables::{PoseStore, VARIABLES_PER_BODY, VariableManager};

/// Outcome of a solve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SolveStatus {
    /// Every constraint is satisfied
    Solved,
    /// A constraint could not be satisfied; no pose was changed
    Failed {
        /// The first constraint that could not be satisfied
        constraint: Uuid,
        label: String,
        /// Residual norm reached for that stage
        residual: f64,
    },
}

/// Everything the host needs after a solve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveReport {
    pub status: SolveStatus,
    /// Body held fixed during the solve
    pub anchor: Option<String>,
    /// The anchor was chosen because no body was flagged fixed
    pub implicit_anchor: bool,
    pub degrees_of_freedom: Vec<DegreeOfFreedom>,
    /// Bodies whose pose was written back
    pub updated_bodies: Vec<String>,
    /// Constraints dropped for referring to missing bodies
    pub removed_constraints: Vec<Uuid>,
    /// Number of leading constraints taken from the cache
    pub resumed_from: usize,
    /// Newton iterations over all stages
    pub iterations: usize,
}

impl SolveReport {
    fn empty(removed_constraints: Vec<Uuid>) -> Self {
        Self {
            status: SolveStatus::Solved,
            anchor: None,
            implicit_anchor: false,
            degrees_of_freedom: Vec::new(),
            updated_bodies: Vec::new(),
            removed_constraints,
            resumed_from: 0,
            iterations: 0,
        }
    }

    pub fn is_solved(&self) -> bool {
        matches!(self.status, SolveStatus::Solved)
    }

    /// Remaining degrees of freedom of one body
    pub fn degrees_of_freedom_of<'a>(
        &'a self,
        body: &'a str,
    ) -> impl Iterator<Item = &'a DegreeOfFreedom> + 'a {
        self.degrees_of_freedom.iter().filter(move |d| d.body() == body)
    }
}

/// Result of folding the constraints into the chain
enum Fold {
    Solved {
        node: NodeId,
        levels: Vec<SolvedLevel>,
        iterations: usize,
    },
    Failed {
        status: SolveStatus,
        levels: Vec<SolvedLevel>,
        iterations: usize,
    },
}

/// Assembly constraint solver
pub struct AssemblySolver {
    config: SolverConfig,
    newton: NewtonSolver,
}

impl AssemblySolver {
    /// Create a solver, validating the configuration
    pub fn new(config: SolverConfig) -> Result<Self> {
        config.validate()?;
        let mut newton = NewtonSolver::new(config.newton, config.line_search);
        if let Some(seed) = config.seed {
            newton = newton.with_seed(seed);
        }
        Ok(Self { config, newton })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Solve `constraints` against the poses in `store`
    ///
    /// Structural and numeric domain errors abort with `Err`. A constraint
    /// that cannot be satisfied is reported through [`SolveStatus::Failed`]
    /// and leaves the store untouched. The cache is only used when enabled
    /// in the configuration.
    pub fn solve<S>(
        &mut self,
        store: &mut S,
        constraints: &[Constraint],
        mut cache: Option<&mut SolveCache>,
    ) -> Result<SolveReport>
    where
        S: PoseStore + ?Sized,
    {
        let started = Instant::now();

        let (active, removed) = self.check_references(&*store, constraints)?;
        if active.is_empty() {
            tracing::debug!("no constraints to solve");
            return Ok(SolveReport::empty(removed));
        }

        // Bodies in order of first reference
        let mut names: Vec<String> = Vec::new();
        for c in &active {
            for name in c.referenced_bodies() {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }

        let (anchor, implicit_anchor) = match names.iter().find(|n| store.is_fixed(n)) {
            Some(name) => (name.clone(), false),
            None => {
                let name = names.first().ok_or(AssemblyError::NoAnchor)?.clone();
                tracing::warn!(anchor = %name, "no body is fixed, anchoring the first referenced body");
                (name, true)
            }
        };

        let mut vm = VariableManager::new(&*store, &names)?;
        let local = active
            .iter()
            .map(|c| localize(c, &vm))
            .collect::<Result<Vec<_>>>()?;

        let anchor_key = AnchorKey {
            body: anchor.clone(),
            variables: vm
                .snapshot(vm.x0())
                .remove(&anchor)
                .unwrap_or([0.0; VARIABLES_PER_BODY]),
        };

        let use_cache = self.config.use_cache && cache.is_some();
        let retrieve_started = Instant::now();
        let hit = if use_cache {
            cache
                .as_deref()
                .and_then(|c| c.retrieve(&anchor_key, &local))
        } else {
            None
        };
        tracing::debug!(elapsed = ?retrieve_started.elapsed(), hit = hit.is_some(), "cache retrieval");

        // chains are built in a per-solve arena; the cache copies in only
        // the levels it keeps
        let mut arena = SystemArena::new();
        let mut shared = HashMap::new();
        let (start, resume_index) = match (&hit, cache.as_deref()) {
            (Some(hit), Some(c)) => {
                let mut imported = HashMap::new();
                let start = arena.import(c.arena(), hit.node, &mut imported);
                shared = imported.into_iter().map(|(cached, copy)| (copy, cached)).collect();
                vm.restore(&hit.snapshot);
                (start, hit.resume_index)
            }
            _ => (arena.fixed_root(&vm, &anchor, vm.x0())?, 0),
        };

        let fold = self.fold(&mut arena, &mut vm, &local, start, resume_index)?;

        let (node, levels, iterations) = match fold {
            Fold::Solved {
                node,
                levels,
                iterations,
            } => (node, levels, iterations),
            Fold::Failed {
                status,
                levels,
                iterations,
            } => {
                if use_cache && let Some(c) = cache.as_deref_mut() {
                    c.record(&anchor_key, &local, resume_index, &arena, &shared, levels);
                }
                return Ok(SolveReport {
                    status,
                    anchor: Some(anchor),
                    implicit_anchor,
                    degrees_of_freedom: Vec::new(),
                    updated_bodies: Vec::new(),
                    removed_constraints: removed,
                    resumed_from: resume_index,
                    iterations,
                });
            }
        };

        let write_started = Instant::now();
        let updated_bodies = vm.write_back(store, vm.x(), self.config.write_back)?;
        tracing::debug!(elapsed = ?write_started.elapsed(), updated = updated_bodies.len(), "write back");

        let degrees_of_freedom = residual_freedom(
            &arena,
            node,
            &vm,
            vm.x(),
            self.config.dof_rank_tolerance,
            self.config.newton.jacobian_step,
        )?;

        if use_cache && let Some(c) = cache.as_deref_mut() {
            let record_started = Instant::now();
            c.record(&anchor_key, &local, resume_index, &arena, &shared, levels);
            tracing::debug!(elapsed = ?record_started.elapsed(), entries = c.len(), "cache record");
        }

        tracing::info!(
            constraints = local.len(),
            bodies = vm.body_count(),
            anchor = %anchor,
            resumed_from = resume_index,
            iterations,
            degrees_of_freedom = degrees_of_freedom.len(),
            elapsed = ?started.elapsed(),
            "assembly solved"
        );

        Ok(SolveReport {
            status: SolveStatus::Solved,
            anchor: Some(anchor),
            implicit_anchor,
            degrees_of_freedom,
            updated_bodies,
            removed_constraints: removed,
            resumed_from: resume_index,
            iterations,
        })
    }

    /// Split constraints into usable ones and ids of dropped dangling ones
    fn check_references<S>(
        &self,
        store: &S,
        constraints: &[Constraint],
    ) -> Result<(Vec<Constraint>, Vec<Uuid>)>
    where
        S: PoseStore + ?Sized,
    {
        let mut active = Vec::with_capacity(constraints.len());
        let mut removed = Vec::new();
        for c in constraints {
            let missing = c
                .referenced_bodies()
                .into_iter()
                .find(|name| store.pose(name).is_none());
            match (missing, self.config.dangling_references) {
                (None, _) => active.push(c.clone()),
                (Some(body), DanglingReferencePolicy::Abort) => {
                    return Err(AssemblyError::DanglingReference {
                        constraint: c.id,
                        body: body.to_string(),
                    });
                }
                (Some(body), DanglingReferencePolicy::RemoveConstraint) => {
                    tracing::warn!(
                        constraint = %c.id,
                        label = c.display_name(),
                        body,
                        "removing constraint that refers to a missing body"
                    );
                    removed.push(c.id);
                }
            }
        }
        Ok((active, removed))
    }

    /// Add constraints from `resume_index` on, solving after each one
    fn fold(
        &mut self,
        arena: &mut SystemArena,
        vm: &mut VariableManager,
        constraints: &[Constraint],
        start: NodeId,
        resume_index: usize,
    ) -> Result<Fold> {
        let max_steps = vm.max_steps();
        let mut node = start;
        let mut levels = Vec::new();
        let mut iterations = 0;

        for (i, constraint) in constraints.iter().enumerate().skip(resume_index) {
            node = arena.add_constraint(node, vm, vm.x(), constraint)?;

            let base = vm.x().clone();
            let chain: &SystemArena = arena;
            let manager: &VariableManager = vm;
            let outcome = self.newton.solve(
                |delta: &DVector<f64>| chain.residuals(node, manager, &manager.retract(&base, delta)?),
                DVector::zeros(base.len()),
                &max_steps,
            )?;
            iterations += outcome.iterations;

            tracing::debug!(
                constraint = %constraint.id,
                label = constraint.display_name(),
                iterations = outcome.iterations,
                residual = outcome.residual_norm,
                perturbations = outcome.perturbations,
                equations = chain.equation_count(node),
                "stage solved"
            );

            if !(outcome.residual_norm <= self.config.residual_tolerance) {
                tracing::error!(
                    constraint = %constraint.id,
                    label = constraint.display_name(),
                    residual = outcome.residual_norm,
                    "constraint could not be satisfied"
                );
                return Ok(Fold::Failed {
                    status: SolveStatus::Failed {
                        constraint: constraint.id,
                        label: constraint.display_name().to_string(),
                        residual: outcome.residual_norm,
                    },
                    levels,
                    iterations,
                });
            }

            let x = vm.retract(&base, &outcome.x)?;
            vm.set_x(x);
            levels.push(SolvedLevel {
                prefix_len: i + 1,
                node,
                snapshot: vm.snapshot(vm.x()),
            });
        }

        Ok(Fold::Solved {
            node,
            levels,
            iterations,
        })
    }
}

/// Express world-frame features in their body's frame at the initial poses
fn localize(constraint: &Constraint, vm: &VariableManager) -> Result<Constraint> {
    let to_local = |body: &str, feature: &SubFeature| -> Result<SubFeature> {
        if feature.frame == FeatureFrame::Local {
            return Ok(*feature);
        }
        let x0 = vm.x0();
        Ok(SubFeature {
            point: feature
                .point
                .map(|p| vm.rotate_and_move_undo(body, p, x0))
                .transpose()?,
            axis: feature
                .axis
                .map(|a| vm.rotate_undo(body, a, x0))
                .transpose()?,
            frame: FeatureFrame::Local,
        })
    };
    let mut local = constraint.clone();
    local.feature1 = to_local(&constraint.body1, &constraint.feature1)?;
    local.feature2 = to_local(&constraint.body2, &constraint.feature2)?;
    Ok(local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::DirectionMode;
    use crate::variables::{Body, Pose};
    use approx::assert_abs_diff_eq;
    use glam::{DQuat, DVec3};

    fn solver() -> AssemblySolver {
        AssemblySolver::new(SolverConfig::new().with_seed(3)).unwrap()
    }

    fn plane_pair(offset: f64) -> Constraint {
        Constraint::plane(
            "base",
            SubFeature::plane(DVec3::ZERO, DVec3::Z),
            "lid",
            SubFeature::plane(DVec3::ZERO, DVec3::Z),
            offset,
            DirectionMode::Aligned,
        )
    }

    #[test]
    fn test_empty_constraint_list() {
        let mut bodies = vec![Body::fixed("base", Pose::IDENTITY)];
        let report = solver().solve(&mut bodies, &[], None).unwrap();
        assert!(report.is_solved());
        assert!(report.anchor.is_none());
        assert!(report.updated_bodies.is_empty());
    }

    #[test]
    fn test_plane_constraint_moves_free_body() {
        let mut bodies = vec![
            Body::fixed("base", Pose::IDENTITY),
            Body::new(
                "lid",
                Pose::new(
                    DVec3::new(1.0, 2.0, 5.0),
                    DQuat::from_axis_angle(DVec3::X, 0.2),
                ),
            ),
        ];
        let report = solver().solve(&mut bodies, &[plane_pair(2.0)], None).unwrap();
        assert!(report.is_solved());
        assert_eq!(report.anchor.as_deref(), Some("base"));
        assert!(!report.implicit_anchor);
        assert_eq!(report.updated_bodies, vec!["lid".to_string()]);
        assert_eq!(report.degrees_of_freedom_of("lid").count(), 3);

        let lid = bodies[1].pose;
        assert_abs_diff_eq!(lid.position.z, 2.0, epsilon = 1e-6);
        assert!((lid.rotation * DVec3::Z - DVec3::Z).length() < 1e-6);
        assert_eq!(bodies[0].pose, Pose::IDENTITY);
    }

    #[test]
    fn test_world_features_are_localized() {
        let lid_pose = Pose::new(
            DVec3::new(0.0, 0.0, 4.0),
            DQuat::from_axis_angle(DVec3::Y, 0.5),
        );
        let store = vec![Body::fixed("base", Pose::IDENTITY), Body::new("lid", lid_pose)];
        let vm = VariableManager::new(&store, &["base", "lid"]).unwrap();

        let c = Constraint::plane(
            "base",
            SubFeature::plane(DVec3::ZERO, DVec3::Z),
            "lid",
            SubFeature::plane(DVec3::new(0.0, 0.0, 4.0), lid_pose.rotation * DVec3::Z).in_world(),
            0.0,
            DirectionMode::Aligned,
        );
        let local = localize(&c, &vm).unwrap();
        assert_eq!(local.feature2.frame, FeatureFrame::Local);
        assert!(local.feature2.point.unwrap().length() < 1e-12);
        assert!((local.feature2.axis.unwrap() - DVec3::Z).length() < 1e-12);
        assert_eq!(local.feature1, c.feature1);
    }

    #[test]
    fn test_dangling_reference_policies() {
        let mut bodies = vec![Body::fixed("base", Pose::IDENTITY)];
        let c = plane_pair(0.0);

        let err = solver().solve(&mut bodies, &[c.clone()], None).unwrap_err();
        assert!(matches!(err, AssemblyError::DanglingReference { ref body, .. } if body == "lid"));

        let mut lenient = AssemblySolver::new(
            SolverConfig::new().with_dangling_references(DanglingReferencePolicy::RemoveConstraint),
        )
        .unwrap();
        let report = lenient.solve(&mut bodies, &[c.clone()], None).unwrap();
        assert!(report.is_solved());
        assert_eq!(report.removed_constraints, vec![c.id]);
    }

    #[test]
    fn test_failing_solves_do_not_grow_cache() {
        let mut bodies = vec![
            Body::fixed("base", Pose::IDENTITY),
            Body::new("lid", Pose::from_position(DVec3::new(0.0, 0.0, 3.0))),
        ];
        let constraints = [plane_pair(1.0), plane_pair(2.0)];
        let mut cache = SolveCache::new();
        let mut solver =
            AssemblySolver::new(SolverConfig::new().with_seed(3).with_cache(true)).unwrap();

        let report = solver.solve(&mut bodies, &constraints, Some(&mut cache)).unwrap();
        assert!(!report.is_solved());
        assert_eq!(cache.len(), 1);
        let stored = cache.arena().len();

        for _ in 0..20 {
            let report = solver.solve(&mut bodies, &constraints, Some(&mut cache)).unwrap();
            assert!(!report.is_solved());
            assert_eq!(report.resumed_from, 1);
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.arena().len(), stored);
        assert_eq!(bodies[1].pose.position, DVec3::new(0.0, 0.0, 3.0));
    }
}
