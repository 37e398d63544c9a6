use crate::model::StepName;
use crate::state::run::RunId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Error type for context operations
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Result already recorded for step: {0}")]
    AlreadyRecorded(StepName),
}

/// Shared context for one run: the work item it operates on and the
/// outputs of every completed step, keyed by step name.
///
/// Results are write-once. A capability reads its upstream outputs
/// through `result_of`; only the coordinator records new ones, exactly
/// once per completed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: RunId,

    /// External work item this run operates on
    pub work_item_id: String,

    /// Extra inputs supplied at start, available to every step
    pub inputs: HashMap<String, serde_json::Value>,

    results: HashMap<StepName, serde_json::Value>,
}

impl ExecutionContext {
    pub fn new(run_id: RunId, work_item_id: impl Into<String>) -> Self {
        ExecutionContext {
            run_id,
            work_item_id: work_item_id.into(),
            inputs: HashMap::new(),
            results: HashMap::new(),
        }
    }

    /// Output of a previously completed step, if any
    pub fn result_of(&self, step: &StepName) -> Option<&serde_json::Value> {
        self.results.get(step)
    }

    pub fn has_result(&self, step: &StepName) -> bool {
        self.results.contains_key(step)
    }

    /// Record a step's output. Write-once: recording the same step twice
    /// is a coordinator bug, not a recoverable condition.
    pub fn record(
        &mut self,
        step: StepName,
        output: serde_json::Value,
    ) -> Result<(), ContextError> {
        if self.results.contains_key(&step) {
            return Err(ContextError::AlreadyRecorded(step));
        }
        self.results.insert(step, output);
        Ok(())
    }

    /// Build the context for a run routed off this one: same work item,
    /// the new run's id, and all accumulated results carried forward as
    /// inputs so the routed workflow can see what led to it.
    pub fn derive_for(&self, run_id: RunId) -> ExecutionContext {
        let mut inputs = self.inputs.clone();
        for (step, value) in &self.results {
            inputs.insert(step.to_string(), value.clone());
        }

        ExecutionContext {
            run_id,
            work_item_id: self.work_item_id.clone(),
            inputs,
            results: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_is_write_once() {
        let mut ctx = ExecutionContext::new(RunId::generate(), "item-1");

        ctx.record("intake".into(), json!({"ok": true})).unwrap();
        assert_eq!(ctx.result_of(&"intake".into()), Some(&json!({"ok": true})));

        let err = ctx.record("intake".into(), json!({"ok": false}));
        assert!(matches!(err, Err(ContextError::AlreadyRecorded(_))));

        // First write wins
        assert_eq!(ctx.result_of(&"intake".into()), Some(&json!({"ok": true})));
    }

    #[test]
    fn test_derive_carries_results_as_inputs() {
        let mut ctx = ExecutionContext::new(RunId::generate(), "item-1");
        ctx.inputs
            .insert("priority".to_string(), json!("urgent"));
        ctx.record("review".into(), json!({"decision": "denied"}))
            .unwrap();

        let child_id = RunId::generate();
        let derived = ctx.derive_for(child_id.clone());

        assert_eq!(derived.run_id, child_id);
        assert_eq!(derived.work_item_id, "item-1");
        assert_eq!(derived.inputs["priority"], json!("urgent"));
        assert_eq!(derived.inputs["review"], json!({"decision": "denied"}));
        assert!(!derived.has_result(&"review".into()));
    }

    #[test]
    fn test_context_serde_round_trip() {
        let mut ctx = ExecutionContext::new(RunId::from("run-1"), "item-1");
        ctx.record("intake".into(), json!(42)).unwrap();

        let json = serde_json::to_string(&ctx).unwrap();
        let back: ExecutionContext = serde_json::from_str(&json).unwrap();

        assert_eq!(back.work_item_id, "item-1");
        assert_eq!(back.result_of(&"intake".into()), Some(&json!(42)));
    }
}
