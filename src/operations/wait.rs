use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Operation, OperationError, Outputs, Target};
use crate::bindings::Bindings;
use crate::client::read_candidates;
use crate::eventually::{eventually, Progress};
use crate::matching;
use crate::model::WaitFor;
use crate::resource;

/// Poll the referenced objects until all of them reach a state
///
/// Waiting for deletion succeeds once nothing is left. The other states need
/// at least one object and every object to satisfy them.
pub struct Wait {
    target: Target,
    template: Value,
    wait_for: WaitFor,
}

impl Wait {
    pub fn new(target: Target, template: Value, wait_for: WaitFor) -> Self {
        Self {
            target,
            template,
            wait_for,
        }
    }
}

fn has_condition(obj: &Value, name: &str, value: &str) -> bool {
    obj.pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(name)
                    && c.get("status")
                        .and_then(Value::as_str)
                        .is_some_and(|s| s.eq_ignore_ascii_case(value))
            })
        })
}

/// Where `candidates` stand against `wait_for`
fn progress(wait_for: &WaitFor, candidates: &[Value]) -> Progress<()> {
    let pending: Vec<String> = match wait_for {
        WaitFor::Deletion {} => candidates
            .iter()
            .map(|c| format!("{} still exists", resource::describe(c)))
            .collect(),
        _ if candidates.is_empty() => vec!["no matching resource found".to_string()],
        WaitFor::Condition { name, value } => candidates
            .iter()
            .filter(|c| !has_condition(c, name, value))
            .map(|c| format!("{}: condition {name} is not {value}", resource::describe(c)))
            .collect(),
        WaitFor::Match(expected) => candidates
            .iter()
            .filter_map(|c| {
                matching::match_value(expected, c)
                    .err()
                    .map(|e| format!("{}: {e}", resource::describe(c)))
            })
            .collect(),
    };
    if pending.is_empty() {
        Progress::Ready(())
    } else {
        Progress::Pending(pending)
    }
}

#[async_trait]
impl Operation for Wait {
    async fn exec(
        &self,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<Outputs, OperationError> {
        let template = self.target.prepare(&self.template, bindings).await?;
        let wait_for = match &self.wait_for {
            WaitFor::Match(expected) if self.target.templating => {
                WaitFor::Match(bindings.resolve_value(expected)?)
            }
            other => other.clone(),
        };
        let description = resource::describe(&template);
        let client = self.target.client.as_ref();
        let template_ref = &template;
        let wait_ref = &wait_for;

        eventually(move || async move {
            let candidates = read_candidates(client, template_ref).await?;
            Ok::<_, OperationError>(progress(wait_ref, &candidates))
        })
        .timeout(self.target.timeout)
        .interval(self.target.poll_interval)
        .cancel_on(cancel.clone())
        .await_condition()
        .await
        .map_err(|e| OperationError::from_poll("wait", &description, "condition not reached", e))?;

        info!(resource = %description, "Wait condition reached");
        Ok(Outputs::new())
    }
}
