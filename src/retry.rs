use std::fmt;
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RetryPolicy;
use crate::error::{ErrorClass, PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Extract,
    Transform,
    Persist,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage result together with the number of attempts it took.
#[derive(Debug)]
pub struct Completed<T> {
    pub value: T,
    pub attempts: u32,
}

/// Terminal failure of a stage.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub attempts: u32,
    pub error: PipelineError,
}

impl StageFailure {
    pub fn aborts_run(&self) -> bool {
        self.error.class() == ErrorClass::Abort
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed after {} attempt(s): {}", self.stage, self.attempts, self.error)
    }
}

/// Attempts allowed for an error of `class` under `policy`.
fn budget(class: ErrorClass, policy: &RetryPolicy) -> u32 {
    match class {
        ErrorClass::Transient => policy.maximum_attempts,
        ErrorClass::Malformed => policy.maximum_attempts.min(2),
        ErrorClass::Configuration | ErrorClass::Abort => 1,
    }
}

/// Run `op` until it succeeds or its error class exhausts the attempt budget.
///
/// Each attempt is bounded by the policy's start-to-close timeout; an expired
/// attempt counts as a transient failure. Cancellation is checked before
/// every attempt and while backing off.
pub async fn run_stage<T, F, Fut>(
    stage: Stage,
    instruction: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> std::result::Result<Completed<T>, StageFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let timeout = policy.start_to_close_timeout();
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(StageFailure {
                stage,
                attempts: attempt,
                error: PipelineError::Cancelled,
            });
        }
        attempt += 1;
        info!(%stage, instruction, attempt, "Stage started");

        let outcome = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(timeout)),
        };

        let error = match outcome {
            Ok(value) => {
                info!(%stage, instruction, attempt, "Stage was successful");
                return Ok(Completed {
                    value,
                    attempts: attempt,
                });
            }
            Err(e) => e,
        };

        let allowed = budget(error.class(), policy);
        if attempt >= allowed {
            error!(%stage, instruction, attempt, %error, "Stage failed");
            return Err(StageFailure {
                stage,
                attempts: attempt,
                error,
            });
        }

        let backoff = policy.backoff(attempt + 1);
        warn!(
            "{} failed for {} (attempt {}/{}), retrying in {:.1}s: {}",
            stage,
            instruction,
            attempt,
            allowed,
            backoff.as_secs_f64(),
            error
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(StageFailure {
                    stage,
                    attempts: attempt,
                    error: PipelineError::Cancelled,
                });
            }
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}
