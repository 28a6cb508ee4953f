//! Step execution: try, catch, finally and the deferred teardown

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{operation, RunnerError};
use crate::cleanup::Cleaner;
use crate::config::TimeoutKind;
use crate::context::TestContext;
use crate::model::{self, Step};
use crate::report::{Phase, StepReport};

/// Work left for a finished step, run when the test tears down
pub(crate) struct StepTeardown {
    name: String,
    cleaner: Arc<Cleaner>,
    cleanup: Vec<model::Operation>,
    ctx: TestContext,
}

impl StepTeardown {
    /// Delete the step's resources, newest first, then run its cleanup list
    ///
    /// Returns `None` when there was nothing to do.
    pub(crate) async fn run(self) -> Option<(StepReport, Vec<String>)> {
        if self.cleaner.is_empty() && self.cleanup.is_empty() {
            return None;
        }
        let mut report = StepReport::start(format!("cleanup ({})", self.name));
        let mut errors: Vec<String> = self
            .cleaner
            .run(Some(&mut report))
            .await
            .into_iter()
            .map(|e| e.to_string())
            .collect();

        let cancel = CancellationToken::new();
        for (index, op) in self.cleanup.iter().enumerate() {
            if let Err(e) =
                operation::run(op, Phase::Cleanup, index, &self.ctx, None, &cancel, &mut report)
                    .await
            {
                errors.push(e.to_string());
            }
        }
        if let Some(first) = errors.first() {
            report.fail(first.clone());
        }
        report.finish();
        Some((report, errors))
    }
}

/// Reject operations a phase does not accept
fn validate(ops: &[model::Operation], phase: Phase) -> Result<(), RunnerError> {
    match ops.iter().find(|op| !op.action.allowed_outside_try()) {
        Some(op) => Err(RunnerError::NotAllowed {
            operation: op.operation_type(),
            phase,
        }),
        None => Ok(()),
    }
}

/// Validate the non-try phases of a step
pub(crate) fn validate_step(step: &Step) -> Result<(), RunnerError> {
    validate(&step.catch, Phase::Catch)?;
    validate(&step.finally, Phase::Finally)?;
    validate(&step.cleanup, Phase::Cleanup)
}

/// Validate test-level catch handlers
pub(crate) fn validate_catch(ops: &[model::Operation]) -> Result<(), RunnerError> {
    validate(ops, Phase::Catch)
}

fn step_context(step: &Step, ctx: &TestContext) -> Result<TestContext, RunnerError> {
    validate_step(step)?;
    Ok(ctx
        .clone()
        .with_timeouts(&step.timeouts)
        .with_skip_delete(step.skip_delete)
        .with_deletion_propagation(step.deletion_propagation_policy)
        .with_cluster(step.cluster.as_deref())
        .with_templating(step.template)
        .with_catch(&step.catch)
        .with_declared_bindings(&step.bindings)?)
}

/// Run one step
///
/// The teardown is returned even when the step failed so resources it
/// created are still removed.
#[instrument(skip_all, fields(step = %step.display_name(index)))]
pub(crate) async fn run(
    step: &Step,
    index: usize,
    ctx: &TestContext,
    cancel: &CancellationToken,
) -> (StepReport, Option<StepTeardown>) {
    let name = step.display_name(index);
    let mut report = StepReport::start(&name);

    let ctx = match step_context(step, ctx) {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!(error = %e, "Invalid step");
            report.fail(e.to_string());
            report.finish();
            return (report, None);
        }
    };

    let cleaner = Arc::new(Cleaner::new(
        ctx.timeout(TimeoutKind::Cleanup, None),
        ctx.delay_before_cleanup(),
        ctx.deletion_propagation(),
    ));
    let registry = if ctx.skip_delete() { None } else { Some(&cleaner) };

    info!("Running step");
    let mut scope = ctx.clone();
    for (i, op) in step.try_ops.iter().enumerate() {
        if cancel.is_cancelled() {
            report.fail("cancelled");
            break;
        }
        match operation::run(op, Phase::Try, i, &scope, registry, cancel, &mut report).await {
            Ok(outputs) => {
                for (output, value) in outputs {
                    match scope.clone().with_binding(&output, value) {
                        Ok(next) => scope = next,
                        Err(e) => {
                            report.fail(e.to_string());
                            break;
                        }
                    }
                }
                if report.failed() && !op.continue_on_error {
                    break;
                }
            }
            Err(e) => {
                report.fail(e.to_string());
                if !op.continue_on_error {
                    break;
                }
                debug!(operation = i + 1, "Continuing after failure");
            }
        }
    }

    // Catch and finally are not bound to the run token.
    let handlers = CancellationToken::new();
    if report.failed() {
        for (i, op) in scope.catch().iter().enumerate() {
            if let Err(e) = operation::run(op, Phase::Catch, i, &scope, None, &handlers, &mut report).await {
                report.fail(e.to_string());
            }
        }
    }
    for (i, op) in step.finally.iter().enumerate() {
        if let Err(e) = operation::run(op, Phase::Finally, i, &scope, None, &handlers, &mut report).await {
            report.fail(e.to_string());
        }
    }

    report.finish();
    if report.failed() {
        warn!(error = report.error.as_deref().unwrap_or_default(), "Step failed");
    } else {
        info!("Step passed");
    }

    let teardown = StepTeardown {
        name,
        cleaner,
        cleanup: step.cleanup.clone(),
        ctx: scope,
    };
    (report, Some(teardown))
}
