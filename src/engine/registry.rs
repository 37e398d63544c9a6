use crate::engine::context::ExecutionContext;
use crate::model::StepName;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error type for registry lookups
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("No capability registered for step: {0}")]
    UnknownStep(StepName),
}

/// Failure reported by a capability. `retryable` decides whether the
/// executor may try again or must give up immediately.
#[derive(Debug, Clone)]
pub struct CapabilityError {
    pub retryable: bool,
    pub message: String,
}

impl CapabilityError {
    /// A transient fault: the executor may retry under the step's policy
    pub fn retryable(message: impl Into<String>) -> Self {
        CapabilityError {
            retryable: true,
            message: message.into(),
        }
    }

    /// A permanent fault: no amount of retrying will help
    pub fn fatal(message: impl Into<String>) -> Self {
        CapabilityError {
            retryable: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.retryable { "retryable" } else { "fatal" };
        write!(f, "{kind} capability error: {}", self.message)
    }
}

impl std::error::Error for CapabilityError {}

/// The unit of work behind a step name.
///
/// Implementations must be idempotent per `(run_id, step)`: after a
/// crash the coordinator re-executes the in-flight step from scratch,
/// so running twice with the same context must be safe.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<serde_json::Value, CapabilityError>;
}

/// Maps step names to the capabilities that execute them. Populated at
/// startup; an explicit instance, never a global.
#[derive(Default)]
pub struct StepRegistry {
    capabilities: HashMap<StepName, Arc<dyn Capability>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        StepRegistry {
            capabilities: HashMap::new(),
        }
    }

    /// Register a capability for a step name, replacing any previous one
    pub fn register(&mut self, step: impl Into<StepName>, capability: Arc<dyn Capability>) {
        self.capabilities.insert(step.into(), capability);
    }

    pub fn lookup(&self, step: &StepName) -> Result<Arc<dyn Capability>, RegistryError> {
        self.capabilities
            .get(step)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownStep(step.clone()))
    }

    pub fn contains(&self, step: &StepName) -> bool {
        self.capabilities.contains_key(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::run::RunId;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Capability for Echo {
        async fn invoke(
            &self,
            ctx: &ExecutionContext,
        ) -> Result<serde_json::Value, CapabilityError> {
            Ok(json!({"work_item": ctx.work_item_id}))
        }
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let mut registry = StepRegistry::new();
        registry.register("echo", Arc::new(Echo));

        let capability = registry.lookup(&"echo".into()).unwrap();
        let ctx = ExecutionContext::new(RunId::generate(), "item-1");
        let output = capability.invoke(&ctx).await.unwrap();

        assert_eq!(output, json!({"work_item": "item-1"}));
    }

    #[test]
    fn test_unknown_step() {
        let registry = StepRegistry::new();
        let err = registry.lookup(&"missing".into());
        assert!(matches!(err, Err(RegistryError::UnknownStep(_))));
    }

    #[test]
    fn test_error_classification() {
        assert!(CapabilityError::retryable("timeout").retryable);
        assert!(!CapabilityError::fatal("bad input").retryable);
    }
}
