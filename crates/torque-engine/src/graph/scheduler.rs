use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, error};

use torque_core::error::{Result, TorqueError};
use torque_core::plan::WorkflowPlan;
use torque_core::types::{ErrorKind, SkipCause, StepError, StepStatus};

use crate::state::RunState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Validated, acyclic view of a plan's dependencies.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Topological order: every step appears after all of its dependencies.
    order: Vec<String>,
    deps: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    groups: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build and validate the graph for `plan`.
    ///
    /// Fails on duplicate step ids, dependencies or context bindings naming
    /// unknown steps, and cycles (including self-dependencies).
    pub fn build(plan: &WorkflowPlan) -> Result<Self> {
        let mut seen = HashSet::new();
        for step in &plan.steps {
            if !seen.insert(step.step_id.as_str()) {
                return Err(TorqueError::DuplicateStep(step.step_id.clone()));
            }
        }

        let mut deps: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = plan
            .steps
            .iter()
            .map(|s| (s.step_id.clone(), Vec::new()))
            .collect();
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for step in &plan.steps {
            let mut unique = Vec::new();
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(TorqueError::UnknownStep {
                        step: step.step_id.clone(),
                        missing: dep.clone(),
                    });
                }
                if !unique.contains(dep) {
                    unique.push(dep.clone());
                }
            }
            for upstream in step.context_bindings.keys() {
                if !seen.contains(upstream.as_str()) {
                    return Err(TorqueError::UnknownStep {
                        step: step.step_id.clone(),
                        missing: upstream.clone(),
                    });
                }
                if upstream == &step.step_id {
                    return Err(TorqueError::PlanInvalid(format!(
                        "step {} binds its own output",
                        step.step_id
                    )));
                }
            }
            for dep in &unique {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(step.step_id.clone());
                }
            }
            if let Some(group) = &step.parallel_group {
                groups
                    .entry(group.clone())
                    .or_default()
                    .push(step.step_id.clone());
            }
            deps.insert(step.step_id.clone(), unique);
        }

        let mut graph = Self {
            order: Vec::with_capacity(plan.steps.len()),
            deps,
            dependents,
            groups,
        };

        let mut marks: HashMap<String, Mark> = HashMap::new();
        let mut path: Vec<String> = Vec::new();
        let mut order = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            graph.visit(&step.step_id, &mut marks, &mut path, &mut order)?;
        }
        graph.order = order;

        debug!(
            plan_id = %plan.plan_id,
            steps = graph.order.len(),
            groups = graph.groups.len(),
            "Dependency graph built"
        );
        Ok(graph)
    }

    /// Depth-first visit; a `Visiting` node reached again is a back-edge.
    fn visit(
        &self,
        id: &str,
        marks: &mut HashMap<String, Mark>,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| p == id).unwrap_or(0);
                let mut steps: Vec<String> = path[start..].to_vec();
                steps.push(id.to_string());
                return Err(TorqueError::Cycle { steps });
            }
            None => {}
        }

        marks.insert(id.to_string(), Mark::Visiting);
        path.push(id.to_string());
        for dep in self.dependencies(id) {
            self.visit(dep, marks, path, order)?;
        }
        path.pop();
        marks.insert(id.to_string(), Mark::Done);
        order.push(id.to_string());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn dependencies(&self, step_id: &str) -> &[String] {
        self.deps.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents(&self, step_id: &str) -> &[String] {
        self.dependents.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Advisory `parallel_group` tags and their members, in plan order.
    pub fn parallel_groups(&self) -> &BTreeMap<String, Vec<String>> {
        &self.groups
    }

    /// The waves the plan forms if every step succeeds.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<String>> = Vec::new();
        for id in &self.order {
            let d = self
                .dependencies(id)
                .iter()
                .filter_map(|dep| depth.get(dep.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id, d);
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(id.clone());
        }
        levels
    }

    /// Compute the next wave.
    ///
    /// Returns every pending, not previously returned step whose dependencies
    /// are all terminal. Pending steps with a failed or skipped dependency are
    /// moved to `skipped` (transitively, in one call). While the abort flag is
    /// raised every remaining pending step is skipped instead.
    pub fn next_wave(&self, state: &mut RunState) -> Vec<String> {
        let mut wave = Vec::new();

        // Topological order lets cascades settle in a single pass.
        for id in &self.order {
            if state.status(id) != Some(StepStatus::Pending) || state.was_emitted(id) {
                continue;
            }

            let blocked = self.dependencies(id).iter().find_map(|dep| {
                match state.status(dep) {
                    Some(StepStatus::Failed) => Some((dep.clone(), "failed")),
                    Some(StepStatus::Skipped) => Some((dep.clone(), "was skipped")),
                    _ => None,
                }
            });

            if let Some((dep, verb)) = blocked {
                let root = state.cascade_root(&dep);
                let error = StepError::new(
                    ErrorKind::SkippedDueToDependency,
                    format!("dependency {} {}", dep, verb),
                );
                debug!(step_id = %id, dependency = %dep, root = %root, "Cascading skip");
                if let Err(e) = state.record_skip(
                    id,
                    SkipCause::Upstream {
                        dependency: dep,
                        root,
                    },
                    error,
                    0,
                    0,
                ) {
                    error!(step_id = %id, error = %e, "Step state transition rejected");
                }
                continue;
            }

            if let Some(trigger) = state.aborting().map(str::to_string) {
                let error = StepError::new(
                    ErrorKind::Aborted,
                    format!("run aborted after {} failed", trigger),
                );
                if let Err(e) = state.record_skip(id, SkipCause::Aborted { trigger }, error, 0, 0) {
                    error!(step_id = %id, error = %e, "Step state transition rejected");
                }
                continue;
            }

            let ready = self.dependencies(id).iter().all(|dep| {
                state
                    .status(dep)
                    .map(StepStatus::is_terminal)
                    .unwrap_or(false)
            });
            if ready {
                state.mark_emitted(id);
                wave.push(id.clone());
            }
        }

        wave
    }
}
