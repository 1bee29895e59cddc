//! Job processing: planning, per-batch retry, merge, and the thread pool
//! that drives it from the work queue.

pub mod layout;
pub mod pool;
pub mod processor;
pub mod retry;

pub use layout::JobLayout;
pub use pool::WorkerPool;
pub use processor::{JobOutcome, JobProcessor, SkipReason};
pub use retry::{RetryPolicy, MAX_RETRIES};
