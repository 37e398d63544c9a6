use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque identifier for one unit of work in a workflow.
///
/// Step names are fixed at workflow-design time (e.g. "clinical_intake",
/// "submission") and bind to a capability through the step registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct StepName(String);

impl StepName {
    pub fn new(name: impl Into<String>) -> Self {
        StepName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        StepName(s.to_string())
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        StepName(s)
    }
}

/// Retry policy applied per step by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retries after the first attempt (N retries = N+1 invocations)
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Multiplier applied per subsequent retry (exponential backoff)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, backoff_multiplier: f64) -> Self {
        RetryPolicy {
            max_retries,
            base_delay,
            backoff_multiplier,
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        RetryPolicy {
            max_retries: 0,
            base_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait before retrying after the given zero-based attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        self.base_delay.mul_f64(factor)
    }
}

/// What happens after a step's final (retries-exhausted, non-retryable)
/// failure. A step with no branch rule makes that failure terminal for
/// the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BranchRule {
    /// Park the run for human review; `resume` retries the step
    Escalate,

    /// Park the run until missing input arrives; `resume` retries the step
    WaitForInput,

    /// Hand the work item off to another workflow (e.g. denial -> appeal),
    /// as a new run linked to this one via `parent_run_id`
    RouteToWorkflow { workflow: String },
}
