//! Caseflow Workflow Coordination Engine
//!
//! A supervisor-style coordination engine that drives a work item through a
//! named, dependency-ordered workflow of steps. Each step is backed by a
//! registered capability; the coordinator executes one step at a time per
//! run, applies per-step retry policies with exponential backoff and
//! timeouts, and persists the full run state after every step so a crashed
//! process never loses more than the in-flight step.
//!
//! # Features
//!
//! - DAG workflows: dependency-ordered steps, validated acyclic at build time
//! - Fault tolerance: per-step retries, timeouts, crash-resumable run state
//! - Branching on failure: escalate to a human, park for missing input, or
//!   route the work item to another workflow (e.g. denial -> appeal)
//! - Versioned persistence: optimistic concurrency enforcing a single writer
//!   per run, with in-memory and checksummed file-backed stores
//!
//! # Getting Started
//!
//! ```rust,no_run
//! use caseflow::{Capability, CapabilityError, Coordinator, ExecutionContext};
//! use caseflow::{MemoryStore, StepRegistry, WorkflowBuilder};
//! use async_trait::async_trait;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! struct Intake;
//!
//! #[async_trait]
//! impl Capability for Intake {
//!     async fn invoke(
//!         &self,
//!         ctx: &ExecutionContext,
//!     ) -> Result<serde_json::Value, CapabilityError> {
//!         Ok(serde_json::json!({"work_item": ctx.work_item_id}))
//!     }
//! }
//!
//! tokio::runtime::Runtime::new().unwrap().block_on(async {
//!     let mut registry = StepRegistry::new();
//!     registry.register("intake", Arc::new(Intake));
//!     registry.register("review", Arc::new(Intake));
//!
//!     let workflow = WorkflowBuilder::new("standard")
//!         .step("intake")
//!         .step_after("review", ["intake"])
//!         .build()
//!         .unwrap();
//!
//!     let coordinator = Coordinator::new(Arc::new(registry), Arc::new(MemoryStore::new()));
//!     coordinator.register_workflow(workflow).await.unwrap();
//!
//!     let run_id = coordinator
//!         .start("case-123", "standard", HashMap::new())
//!         .await
//!         .unwrap();
//!     coordinator.join(&run_id).await.unwrap();
//!
//!     let state = coordinator.status(&run_id).await.unwrap();
//!     println!("Run {run_id} finished as {}", state.status);
//! });
//! ```

/// Core model types: step names, retry policies, workflow definitions
pub mod model;

/// Run state and persistence
pub mod state;

/// Execution engine: registry, executor, coordinator
pub mod engine;

// Re-export important types
pub use engine::{
    Capability, CapabilityError, Coordinator, ExecutionContext, StepExecutor, StepOutcome,
    StepRegistry, StepStatus,
};
pub use model::{BranchRule, RetryPolicy, StepName, WorkflowBuilder, WorkflowDefinition};
pub use state::{
    FileStore, HistoryEntry, MemoryStore, RunEvent, RunId, RunState, RunStatus, StateStore,
};

/// Error types from across the engine
pub mod error {
    pub use crate::engine::context::ContextError;
    pub use crate::engine::coordinator::CoordinatorError;
    pub use crate::engine::executor::ExecutorError;
    pub use crate::engine::registry::RegistryError;
    pub use crate::model::WorkflowError;
    pub use crate::state::StoreError;
}

/// Create a new workflow definition builder
pub fn create_workflow(name: &str) -> WorkflowBuilder {
    WorkflowBuilder::new(name)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_workflow() {
        let workflow = create_workflow("standard")
            .step("intake")
            .step_after("review", ["intake"])
            .build()
            .unwrap();

        assert_eq!(workflow.name, "standard");
        assert_eq!(workflow.steps.len(), 2);
    }
}
