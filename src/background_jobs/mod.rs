//! Background job scheduling and execution system.
//!
//! Job definitions are persisted in the job store and bound to an executable
//! template by type key. The scheduler evaluates due definitions on a fixed
//! tick and runs them on blocking threads; delivery workers, queue
//! reconciliation and history cleanup are the built-in templates.

mod context;
mod handle;
mod job;
mod parameters;
mod registry;
mod schedule;
mod scheduler;
pub mod templates;
#[cfg(test)]
pub(crate) mod test_support;

pub use context::JobContext;
pub use handle::{CreateJobRequest, SchedulerCommand, SchedulerHandle, UpdateJobRequest};
pub use job::{JobError, JobResult, JobResultStatus, JobTemplate, ShutdownBehavior, ValidationError};
pub use parameters::{ParamKind, ParameterSchema, ParameterSpec};
pub use registry::{JobTemplateRegistry, TemplateInfo};
pub use schedule::{resolve_timezone, JobSchedule};
pub use scheduler::{create_scheduler, UnifiedScheduler};
