//! Job orchestration: the global pipeline pool, the job queue, and the
//! dispatcher that ties sessions to running pipelines.
//!
//! - [`PipelinePool`]: semaphore bounding how many pipelines run at once.
//! - [`JobQueue`]: submit/revoke contract, with [`LocalJobQueue`] running jobs
//!   as tokio tasks.
//! - [`TaskDispatcher`]: one job per session, timeout-only retries, cancellation.

pub mod dispatcher;
pub mod job_queue;
pub mod pool;

pub use dispatcher::{CancelOutcome, DispatchError, DispatchSettings, TaskDispatcher, retry_delay};
pub use job_queue::{Job, JobHandle, JobQueue, LocalJobQueue};
pub use pool::{PipelinePool, PoolError, PoolPermit};
