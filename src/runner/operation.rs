//! Turning declared operations into executors and running them

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::RunnerError;
use crate::cleanup::Cleaner;
use crate::config::TimeoutKind;
use crate::context::TestContext;
use crate::model::{self, Action};
use crate::operations::{self, Outputs, Target};
use crate::report::{OperationReport, Phase, StepReport};

type Executors = Vec<Box<dyn operations::Operation>>;

fn target(
    ctx: &TestContext,
    kind: TimeoutKind,
    timeout: Option<Duration>,
    template: Option<bool>,
) -> Result<Target, RunnerError> {
    let mut target = Target::new(ctx.client()?, ctx.timeout(kind, timeout))
        .templating(template.unwrap_or(ctx.templating()))
        .poll_interval(ctx.poll_interval());
    if let Some(ns) = ctx.namespace() {
        target = target.namespace(ns);
    }
    Ok(target)
}

/// Executors for one declared operation
///
/// File sources expand to one executor per document, in file order.
fn build(
    op: &model::Operation,
    ctx: &TestContext,
    cleaner: Option<&Arc<Cleaner>>,
) -> Result<Executors, RunnerError> {
    let base_path = ctx.base_path();
    let mut executors: Executors = Vec::new();

    match &op.action {
        Action::Apply(a) => {
            let target = target(ctx, TimeoutKind::Apply, op.timeout, a.template)?;
            for doc in a.documents(base_path)? {
                executors.push(Box::new(
                    operations::Apply::new(target.clone(), doc)
                        .cleaner(cleaner.cloned())
                        .should_fail(a.should_fail)
                        .dry_run(a.dry_run),
                ));
            }
        }
        Action::Create(a) => {
            let target = target(ctx, TimeoutKind::Apply, op.timeout, a.template)?;
            for doc in a.documents(base_path)? {
                executors.push(Box::new(
                    operations::Create::new(target.clone(), doc)
                        .cleaner(cleaner.cloned())
                        .should_fail(a.should_fail)
                        .dry_run(a.dry_run),
                ));
            }
        }
        Action::Update(a) => {
            let target = target(ctx, TimeoutKind::Apply, op.timeout, a.template)?;
            for doc in a.documents(base_path)? {
                executors.push(Box::new(operations::Update::new(target.clone(), doc)));
            }
        }
        Action::Patch(a) => {
            let target = target(ctx, TimeoutKind::Apply, op.timeout, a.template)?;
            for doc in a.documents(base_path)? {
                executors.push(Box::new(operations::Patch::new(target.clone(), doc)));
            }
        }
        Action::Delete(d) => {
            let target = target(ctx, TimeoutKind::Delete, op.timeout, d.template)?;
            let propagation = d
                .deletion_propagation_policy
                .unwrap_or(ctx.deletion_propagation());
            for doc in d.documents(base_path)? {
                executors.push(Box::new(operations::Delete::new(
                    target.clone(),
                    doc,
                    propagation,
                )));
            }
        }
        Action::Assert(a) => {
            let target = target(ctx, TimeoutKind::Assert, op.timeout, a.template)?;
            for doc in a.documents(base_path)? {
                executors.push(Box::new(operations::Assert::new(target.clone(), doc)));
            }
        }
        Action::Error(a) => {
            let target = target(ctx, TimeoutKind::Error, op.timeout, a.template)?;
            for doc in a.documents(base_path)? {
                executors.push(Box::new(operations::Error::new(target.clone(), doc)));
            }
        }
        Action::Command(c) => {
            let command = operations::Command::new(
                &c.entrypoint,
                c.args.clone(),
                ctx.timeout(TimeoutKind::Exec, op.timeout),
            );
            executors.push(Box::new(
                command
                    .env(c.env.clone())
                    .work_dir(work_dir(ctx, c.work_dir.as_deref()))
                    .namespace(ctx.namespace().map(str::to_string))
                    .check(c.check.clone())
                    .outputs(c.outputs.clone()),
            ));
        }
        Action::Script(s) => {
            let script =
                operations::Command::script(&s.content, ctx.timeout(TimeoutKind::Exec, op.timeout));
            executors.push(Box::new(
                script
                    .env(s.env.clone())
                    .work_dir(work_dir(ctx, s.work_dir.as_deref()))
                    .namespace(ctx.namespace().map(str::to_string))
                    .check(s.check.clone())
                    .outputs(s.outputs.clone()),
            ));
        }
        Action::Sleep(s) => executors.push(Box::new(operations::Sleep::new(s.duration))),
        Action::Get(g) => {
            let target = target(ctx, TimeoutKind::Exec, op.timeout, None)?;
            executors.push(Box::new(operations::Get::new(
                target,
                g.reference.template()?,
                g.format,
            )));
        }
        Action::Events(e) => {
            let target = target(ctx, TimeoutKind::Exec, op.timeout, None)?;
            executors.push(Box::new(operations::Events::new(
                target,
                e.reference().template()?,
            )));
        }
        Action::Wait(w) => {
            let target = target(ctx, TimeoutKind::Assert, op.timeout, None)?;
            executors.push(Box::new(operations::Wait::new(
                target,
                w.reference.template()?,
                w.wait_for.clone(),
            )));
        }
    }
    Ok(executors)
}

/// Working directory of a process, relative paths resolved against the test
fn work_dir(ctx: &TestContext, dir: Option<&std::path::Path>) -> Option<std::path::PathBuf> {
    match (dir, ctx.base_path()) {
        (Some(dir), Some(base)) if dir.is_relative() => Some(base.join(dir)),
        (Some(dir), _) => Some(dir.to_path_buf()),
        (None, base) => base.map(std::path::Path::to_path_buf),
    }
}

/// Run one declared operation and record it in `report`
///
/// Returns the bindings the operation produced.
pub(crate) async fn run(
    op: &model::Operation,
    phase: Phase,
    index: usize,
    ctx: &TestContext,
    cleaner: Option<&Arc<Cleaner>>,
    cancel: &CancellationToken,
    report: &mut StepReport,
) -> Result<Outputs, RunnerError> {
    let name = format!("{}-{}", op.operation_type(), index + 1);
    let record = OperationReport::start(&name, op.operation_type(), phase);
    let result = execute(op, ctx, cleaner, cancel).await;
    match &result {
        Ok(_) => debug!(operation = %name, phase = %phase, "Operation passed"),
        Err(e) => warn!(operation = %name, phase = %phase, error = %e, "Operation failed"),
    }
    report.add(record.finish(result.as_ref().err().map(ToString::to_string)));
    result
}

async fn execute(
    op: &model::Operation,
    ctx: &TestContext,
    cleaner: Option<&Arc<Cleaner>>,
    cancel: &CancellationToken,
) -> Result<Outputs, RunnerError> {
    let ctx = ctx
        .clone()
        .with_cluster(op.cluster.as_deref())
        .with_declared_bindings(&op.bindings)?;
    let executors = build(op, &ctx, cleaner)?;

    let mut bindings = ctx.bindings().clone();
    let mut outputs = Outputs::new();
    for executor in &executors {
        for (name, value) in executor.exec(&bindings, cancel).await? {
            bindings = bindings.register(&name, value.clone())?;
            outputs.push((name, value));
        }
    }
    Ok(outputs)
}
