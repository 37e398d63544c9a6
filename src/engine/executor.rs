use crate::engine::context::ExecutionContext;
use crate::engine::registry::{RegistryError, StepRegistry};
use crate::model::{RetryPolicy, StepName};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};

/// Error type for the step executor
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Final disposition of a step after the executor has applied the full
/// retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failure,
}

/// What happened when a step was driven to completion: its output on
/// success, the last error on failure, and how much work it took.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: StepName,
    pub status: StepStatus,
    pub output: serde_json::Value,
    pub error_detail: Option<String>,
    /// Invocations actually made, including the successful one
    pub attempts_used: u32,
    /// Wall time across all attempts and backoff sleeps
    pub duration_ms: u64,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

/// Drives a single step through its retry policy. Each attempt runs
/// under a timeout; an elapsed timeout counts as a retryable failure and
/// the abandoned future is dropped. The executor never touches the state
/// store; persistence is the coordinator's job.
pub struct StepExecutor {
    registry: Arc<StepRegistry>,
}

impl StepExecutor {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        StepExecutor { registry }
    }

    pub async fn execute(
        &self,
        step: &StepName,
        ctx: &ExecutionContext,
        policy: &RetryPolicy,
        step_timeout: Duration,
    ) -> Result<StepOutcome, ExecutorError> {
        self.execute_observed(step, ctx, policy, step_timeout, |_| {})
            .await
    }

    /// Like `execute`, but calls `on_retry` with the failed attempt number
    /// before each backoff sleep. The coordinator uses this to surface a
    /// live `Retrying` status without persisting it.
    pub async fn execute_observed<F>(
        &self,
        step: &StepName,
        ctx: &ExecutionContext,
        policy: &RetryPolicy,
        step_timeout: Duration,
        mut on_retry: F,
    ) -> Result<StepOutcome, ExecutorError>
    where
        F: FnMut(u32) + Send,
    {
        let capability = self.registry.lookup(step)?;
        let started = Instant::now();
        let mut last_error = String::new();

        for attempt in 0..=policy.max_retries {
            log::debug!(
                "Executing step {step} for run {} (attempt {})",
                ctx.run_id,
                attempt + 1
            );

            match timeout(step_timeout, capability.invoke(ctx)).await {
                Ok(Ok(output)) => {
                    return Ok(StepOutcome {
                        step: step.clone(),
                        status: StepStatus::Success,
                        output,
                        error_detail: None,
                        attempts_used: attempt + 1,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Ok(Err(e)) if !e.retryable => {
                    log::error!("Step {step} failed fatally for run {}: {}", ctx.run_id, e.message);
                    return Ok(StepOutcome {
                        step: step.clone(),
                        status: StepStatus::Failure,
                        output: serde_json::Value::Null,
                        error_detail: Some(e.message),
                        attempts_used: attempt + 1,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Ok(Err(e)) => {
                    last_error = e.message;
                }
                Err(_) => {
                    last_error = format!("step timed out after {}ms", step_timeout.as_millis());
                }
            }

            if attempt < policy.max_retries {
                on_retry(attempt + 1);
                let delay = policy.delay_for(attempt);
                log::warn!(
                    "Step {step} attempt {} failed for run {} ({last_error}), retrying in {:?}",
                    attempt + 1,
                    ctx.run_id,
                    delay
                );
                sleep(delay).await;
            }
        }

        log::error!(
            "Step {step} exhausted {} attempts for run {}: {last_error}",
            policy.max_retries + 1,
            ctx.run_id
        );

        Ok(StepOutcome {
            step: step.clone(),
            status: StepStatus::Failure,
            output: serde_json::Value::Null,
            error_detail: Some(last_error),
            attempts_used: policy.max_retries + 1,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}
