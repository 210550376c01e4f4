use crate::job_store::JobStore;
use crate::notifications::{DeliveryPipeline, NotificationStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context provided to job templates during execution.
///
/// Contains references to shared resources and a cancellation token that is
/// cancelled on timeout or scheduler shutdown.
#[derive(Clone)]
pub struct JobContext {
    /// Token to check for cancellation/shutdown requests.
    pub cancellation_token: CancellationToken,

    /// Definition being executed. Empty outside of an execution.
    pub job_id: String,

    pub execution_id: Option<i64>,

    /// Job definitions and execution history.
    pub job_store: Arc<dyn JobStore>,

    /// Preferences, overrides, queue and delivery log.
    pub notification_store: Arc<dyn NotificationStore>,

    pub delivery: Arc<DeliveryPipeline>,
}

impl JobContext {
    pub fn new(
        cancellation_token: CancellationToken,
        job_store: Arc<dyn JobStore>,
        notification_store: Arc<dyn NotificationStore>,
        delivery: Arc<DeliveryPipeline>,
    ) -> Self {
        Self {
            cancellation_token,
            job_id: String::new(),
            execution_id: None,
            job_store,
            notification_store,
            delivery,
        }
    }

    /// A copy of this context bound to one execution.
    pub fn for_execution(
        &self,
        cancellation_token: CancellationToken,
        job_id: &str,
        execution_id: i64,
    ) -> Self {
        Self {
            cancellation_token,
            job_id: job_id.to_string(),
            execution_id: Some(execution_id),
            ..self.clone()
        }
    }

    /// Check if cancellation has been requested.
    ///
    /// Templates should check this during long-running operations and
    /// return early with `JobError::Cancelled` if true.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
