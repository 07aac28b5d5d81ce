//! assay-services: execution backends, job stores and the schedulers that
//! drive job descriptors to completion.

pub mod backend;
pub mod backoff;
pub mod content_store;
pub mod job_store;
pub mod queue;
pub mod response;
pub mod runner;
pub mod sqlite_store;

pub use backend::{Backend, BackendError, JobHandle, JobResult, JobSpec, PollStatus};
pub use job_store::{JobRecord, JobStore, MemoryJobStore, StoreError};
pub use queue::{QueueError, QueueSettings, RetryQueue};
pub use sqlite_store::SqliteJobStore;
pub use runner::{RunError, RunSummary, Runner};
