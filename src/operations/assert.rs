use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Operation, OperationError, Outputs, Target};
use crate::bindings::Bindings;
use crate::client::read_candidates;
use crate::eventually::{eventually, Progress};
use crate::matching;
use crate::resource;

/// Wait until at least one candidate matches the expected template
pub struct Assert {
    target: Target,
    expected: Value,
}

impl Assert {
    pub fn new(target: Target, expected: Value) -> Self {
        Self { target, expected }
    }
}

#[async_trait]
impl Operation for Assert {
    async fn exec(
        &self,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<Outputs, OperationError> {
        let expected = self.target.prepare(&self.expected, bindings).await?;
        let resource = resource::describe(&expected);
        let client = self.target.client.as_ref();
        let template = &expected;

        eventually(move || async move {
            let candidates = read_candidates(client, template).await?;
            if candidates.is_empty() {
                return Ok(Progress::pending("no matching resource found"));
            }
            let mut details = Vec::with_capacity(candidates.len());
            for candidate in &candidates {
                match matching::match_value(template, candidate) {
                    Ok(()) => return Ok(Progress::Ready(())),
                    Err(e) => details.push(format!("{}: {e}", resource::describe(candidate))),
                }
            }
            Ok::<_, OperationError>(Progress::Pending(details))
        })
        .timeout(self.target.timeout)
        .interval(self.target.poll_interval)
        .cancel_on(cancel.clone())
        .await_condition()
        .await
        .map_err(|e| OperationError::from_poll("assert", &resource, "no candidate matched", e))?;

        info!(resource = %resource, "Assertion passed");
        Ok(Outputs::new())
    }
}

/// Wait until no candidate matches the forbidden template
///
/// A match observed during the window is not fatal on its own: the loop
/// keeps polling and fails only when the deadline passes with a match still
/// present at the last check.
pub struct Error {
    target: Target,
    forbidden: Value,
}

impl Error {
    pub fn new(target: Target, forbidden: Value) -> Self {
        Self { target, forbidden }
    }
}

#[async_trait]
impl Operation for Error {
    async fn exec(
        &self,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<Outputs, OperationError> {
        let forbidden = self.target.prepare(&self.forbidden, bindings).await?;
        let resource = resource::describe(&forbidden);
        let client = self.target.client.as_ref();
        let template = &forbidden;

        eventually(move || async move {
            let offending: Vec<String> = read_candidates(client, template)
                .await?
                .iter()
                .filter(|candidate| matching::matches(template, candidate))
                .map(|candidate| format!("{} matches the forbidden shape", resource::describe(candidate)))
                .collect();
            if offending.is_empty() {
                Ok(Progress::Ready(()))
            } else {
                debug!(count = offending.len(), "Forbidden resource still present");
                Ok::<_, OperationError>(Progress::Pending(offending))
            }
        })
        .timeout(self.target.timeout)
        .interval(self.target.poll_interval)
        .cancel_on(cancel.clone())
        .await_condition()
        .await
        .map_err(|e| {
            OperationError::from_poll("error", &resource, "matching resource still present", e)
        })?;

        info!(resource = %resource, "No forbidden resource present");
        Ok(Outputs::new())
    }
}
