use crate::engine::context::ExecutionContext;
use crate::model::StepName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Unique run identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh identifier of the form `run-{uuid}`
    pub fn generate() -> Self {
        RunId(format!("run-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        RunId(s)
    }
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet driven
    Idle,
    /// A drive loop currently owns the run
    Running,
    /// Parked awaiting external input; `resume` continues it
    WaitingForInput,
    /// Between attempts of a transiently failing step
    Retrying,
    /// All steps succeeded
    Success,
    /// A step failed terminally, or the run deadlocked or halted
    Failed,
    /// A branch rule handed the work item to a human
    Escalated,
    /// Cancelled at a step boundary
    Cancelled,
}

impl RunStatus {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// States a `resume` call may pick up from
    pub fn is_resumable(&self) -> bool {
        matches!(self, RunStatus::Escalated | RunStatus::WaitingForInput)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::WaitingForInput => "waiting_for_input",
            RunStatus::Retrying => "retrying",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Escalated => "escalated",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A single entry in a run's append-only history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Events recorded against a run as the coordinator drives it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    StepStarted {
        step: StepName,
    },
    StepSucceeded {
        step: StepName,
        attempts_used: u32,
        duration_ms: u64,
    },
    StepFailed {
        step: StepName,
        attempts_used: u32,
        error: String,
    },
    Escalated {
        step: StepName,
    },
    InputRequested {
        step: StepName,
    },
    Routed {
        step: StepName,
        workflow: String,
        child_run_id: RunId,
    },
    Resumed {
        /// Parked step whose failure was cleared for retry, if any
        step: Option<StepName>,
    },
    Cancelled {
        reason: String,
    },
    Deadlock {
        detail: String,
    },
    Halted {
        detail: String,
    },
}

/// The full persisted state of one workflow run. This is the unit the
/// state store serializes; everything needed to resume after a crash
/// lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,

    /// Name of the workflow definition driving this run
    pub workflow: String,

    /// Set when this run was spawned by a branch rule on another run
    pub parent_run_id: Option<RunId>,

    pub status: RunStatus,

    /// Work item, start inputs, and accumulated step outputs
    pub context: ExecutionContext,

    /// Successfully completed steps, in completion order, each at most once
    pub completed_steps: Vec<StepName>,

    /// Steps that failed after exhausting retries
    pub failed_steps: Vec<StepName>,

    /// Step the coordinator was executing when last persisted, if any
    pub current_step: Option<StepName>,

    /// Append-only event log. A step may appear more than once here after
    /// a crash-and-resume; `completed_steps` stays deduplicated.
    pub history: Vec<HistoryEntry>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set when the run reaches a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new(workflow: impl Into<String>, work_item_id: impl Into<String>) -> Self {
        let now = Utc::now();
        let run_id = RunId::generate();
        RunState {
            run_id: run_id.clone(),
            workflow: workflow.into(),
            parent_run_id: None,
            status: RunStatus::Idle,
            context: ExecutionContext::new(run_id, work_item_id),
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            current_step: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn work_item_id(&self) -> &str {
        &self.context.work_item_id
    }

    /// Append an event to the history and refresh `updated_at`
    pub fn record(&mut self, event: RunEvent) {
        self.history.push(HistoryEntry {
            at: Utc::now(),
            event,
        });
        self.updated_at = Utc::now();
    }

    /// Mark a step completed. Idempotent: re-execution after a crash must
    /// not duplicate the entry.
    pub fn mark_completed(&mut self, step: StepName) {
        if !self.completed_steps.contains(&step) {
            self.completed_steps.push(step);
        }
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, step: StepName) {
        if !self.failed_steps.contains(&step) {
            self.failed_steps.push(step);
        }
        self.updated_at = Utc::now();
    }

    pub fn completed_set(&self) -> HashSet<StepName> {
        self.completed_steps.iter().cloned().collect()
    }

    pub fn failed_set(&self) -> HashSet<StepName> {
        self.failed_steps.iter().cloned().collect()
    }

    /// Rebuild the completed and failed sets from history alone. A later
    /// success supersedes an earlier failure of the same step, and a
    /// resume clears the parked step's failure. Auditing tool: the result
    /// must always agree with the persisted sets.
    pub fn replayed_sets(&self) -> (HashSet<StepName>, HashSet<StepName>) {
        let mut completed = HashSet::new();
        let mut failed = HashSet::new();

        for entry in &self.history {
            match &entry.event {
                RunEvent::StepSucceeded { step, .. } => {
                    failed.remove(step);
                    completed.insert(step.clone());
                }
                RunEvent::StepFailed { step, .. } => {
                    failed.insert(step.clone());
                }
                RunEvent::Resumed { step: Some(step) } => {
                    failed.remove(step);
                }
                _ => {}
            }
        }

        (completed, failed)
    }
}
