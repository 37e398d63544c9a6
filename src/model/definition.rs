use crate::model::step::{BranchRule, RetryPolicy, StepName};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// Error types for workflow definitions
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Workflow has no steps")]
    Empty,

    #[error("Duplicate step: {0}")]
    DuplicateStep(StepName),

    #[error("Dependency references unknown step: {dependency} (required by {step})")]
    DanglingDependency { step: StepName, dependency: StepName },

    #[error("Unknown step in {map} map: {step}")]
    UnknownStep { map: &'static str, step: StepName },

    #[error("Cycle detected in step dependency graph")]
    CycleDetected,
}

/// Immutable description of a named workflow: the steps to run, the
/// partial order between them, and the per-step retry/timeout/branch
/// configuration the coordinator applies.
///
/// A step with no entry in `dependencies` has no prerequisites. The
/// dependency map must describe a DAG over `steps`; `validate` enforces
/// this at construction time so a run can never start on a broken graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name, unique within a coordinator
    pub name: String,

    /// Optional description
    pub description: Option<String>,

    /// Steps in declaration order. When several steps are eligible at
    /// once, the coordinator picks the earliest declared one.
    pub steps: Vec<StepName>,

    /// Step -> set of steps that must have succeeded first
    pub dependencies: HashMap<StepName, HashSet<StepName>>,

    /// Per-step retry policy; steps without an entry use `RetryPolicy::default()`
    pub retry_policies: HashMap<StepName, RetryPolicy>,

    /// Per-step execution timeout; steps without an entry use the
    /// coordinator's default
    pub timeouts: HashMap<StepName, Duration>,

    /// Per-step rule applied after a final failure; absence means the
    /// failure is terminal for the run
    pub branches: HashMap<StepName, BranchRule>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        WorkflowDefinition {
            name: name.into(),
            description: None,
            steps: Vec::new(),
            dependencies: HashMap::new(),
            retry_policies: HashMap::new(),
            timeouts: HashMap::new(),
            branches: HashMap::new(),
        }
    }

    pub fn contains_step(&self, step: &StepName) -> bool {
        self.steps.contains(step)
    }

    /// Dependencies of a step; empty set if it has none
    pub fn dependencies_of(&self, step: &StepName) -> HashSet<StepName> {
        self.dependencies.get(step).cloned().unwrap_or_default()
    }

    pub fn retry_policy_for(&self, step: &StepName) -> RetryPolicy {
        self.retry_policies.get(step).cloned().unwrap_or_default()
    }

    pub fn timeout_for(&self, step: &StepName, default: Duration) -> Duration {
        self.timeouts.get(step).copied().unwrap_or(default)
    }

    pub fn branch_for(&self, step: &StepName) -> Option<&BranchRule> {
        self.branches.get(step)
    }

    /// Validate the definition: non-empty, unique step names, no dangling
    /// references, and an acyclic dependency graph.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::Empty);
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step) {
                return Err(WorkflowError::DuplicateStep(step.clone()));
            }
        }

        for (step, deps) in &self.dependencies {
            if !self.contains_step(step) {
                return Err(WorkflowError::UnknownStep {
                    map: "dependencies",
                    step: step.clone(),
                });
            }
            for dep in deps {
                if !self.contains_step(dep) {
                    return Err(WorkflowError::DanglingDependency {
                        step: step.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        for step in self.retry_policies.keys() {
            if !self.contains_step(step) {
                return Err(WorkflowError::UnknownStep {
                    map: "retry_policies",
                    step: step.clone(),
                });
            }
        }
        for step in self.timeouts.keys() {
            if !self.contains_step(step) {
                return Err(WorkflowError::UnknownStep {
                    map: "timeouts",
                    step: step.clone(),
                });
            }
        }
        for step in self.branches.keys() {
            if !self.contains_step(step) {
                return Err(WorkflowError::UnknownStep {
                    map: "branches",
                    step: step.clone(),
                });
            }
        }

        if self.has_cycle() {
            return Err(WorkflowError::CycleDetected);
        }

        Ok(())
    }

    /// Check if the dependency graph contains a cycle, using depth-first
    /// search over the dependency edges.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashSet::new();
        let mut in_stack = HashSet::new();

        for step in &self.steps {
            if !visited.contains(step) && self.has_cycle_dfs(step, &mut visited, &mut in_stack) {
                return true;
            }
        }

        false
    }

    fn has_cycle_dfs<'a>(
        &'a self,
        step: &'a StepName,
        visited: &mut HashSet<&'a StepName>,
        in_stack: &mut HashSet<&'a StepName>,
    ) -> bool {
        visited.insert(step);
        in_stack.insert(step);

        if let Some(deps) = self.dependencies.get(step) {
            for dep in deps {
                if !visited.contains(dep) {
                    if self.has_cycle_dfs(dep, visited, in_stack) {
                        return true;
                    }
                } else if in_stack.contains(dep) {
                    return true;
                }
            }
        }

        in_stack.remove(step);
        false
    }

    /// Select the next step to run: the earliest declared step that has
    /// not completed or failed and whose dependencies have all succeeded.
    pub fn next_eligible(
        &self,
        completed: &HashSet<StepName>,
        failed: &HashSet<StepName>,
    ) -> Option<&StepName> {
        self.steps.iter().find(|step| {
            !completed.contains(*step)
                && !failed.contains(*step)
                && self
                    .dependencies_of(step)
                    .iter()
                    .all(|dep| completed.contains(dep))
        })
    }

    /// True when steps remain but none can ever become eligible. With a
    /// validated (acyclic) graph this only happens when a remaining step
    /// depends on a failed one, which the coordinator reports as its own
    /// failure mode rather than a deadlock.
    pub fn is_deadlocked(
        &self,
        completed: &HashSet<StepName>,
        failed: &HashSet<StepName>,
    ) -> bool {
        let remaining: Vec<&StepName> = self
            .steps
            .iter()
            .filter(|s| !completed.contains(*s) && !failed.contains(*s))
            .collect();

        !remaining.is_empty() && self.next_eligible(completed, failed).is_none()
    }

    /// True when every declared step has succeeded
    pub fn is_complete(&self, completed: &HashSet<StepName>) -> bool {
        self.steps.iter().all(|s| completed.contains(s))
    }
}

/// Builder for workflow definitions. `build` validates, so an invalid
/// graph is rejected before it can ever reach the coordinator.
pub struct WorkflowBuilder {
    definition: WorkflowDefinition,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        WorkflowBuilder {
            definition: WorkflowDefinition::new(name),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.definition.description = Some(description.to_string());
        self
    }

    /// Add a step with no prerequisites
    pub fn step(mut self, name: impl Into<StepName>) -> Self {
        self.definition.steps.push(name.into());
        self
    }

    /// Add a step that runs only after all of `deps` have succeeded
    pub fn step_after<I, D>(mut self, name: impl Into<StepName>, deps: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<StepName>,
    {
        let name = name.into();
        let deps: HashSet<StepName> = deps.into_iter().map(Into::into).collect();
        if !deps.is_empty() {
            self.definition.dependencies.insert(name.clone(), deps);
        }
        self.definition.steps.push(name);
        self
    }

    pub fn retry(mut self, step: impl Into<StepName>, policy: RetryPolicy) -> Self {
        self.definition.retry_policies.insert(step.into(), policy);
        self
    }

    pub fn timeout(mut self, step: impl Into<StepName>, timeout: Duration) -> Self {
        self.definition.timeouts.insert(step.into(), timeout);
        self
    }

    pub fn on_failure(mut self, step: impl Into<StepName>, rule: BranchRule) -> Self {
        self.definition.branches.insert(step.into(), rule);
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition, WorkflowError> {
        self.definition.validate()?;
        Ok(self.definition)
    }
}
