use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Operation, OperationError, Outputs};
use crate::bindings::Bindings;
use crate::eventually::sleep_or_cancel;
use crate::wait::WaitError;

/// Pause for a fixed duration
pub struct Sleep {
    duration: Duration,
}

impl Sleep {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl Operation for Sleep {
    async fn exec(
        &self,
        _bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<Outputs, OperationError> {
        debug!(duration = ?self.duration, "Sleeping");
        let started = tokio::time::Instant::now();
        if sleep_or_cancel(self.duration, cancel).await {
            Ok(Outputs::new())
        } else {
            Err(OperationError::DeadlineExceeded(
                WaitError::new("sleep", "-", self.duration, started.elapsed())
                    .with_state("cancelled"),
            ))
        }
    }
}
