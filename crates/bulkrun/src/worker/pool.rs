use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};

use crate::queue::{QueueError, WorkQueue};
use crate::worker::processor::{JobOutcome, JobProcessor};

/// Pause after a broker error before the next dequeue.
const BROKER_ERROR_BACKOFF: Duration = Duration::from_secs(2);
/// Lower bound on that pause so a zero dequeue timeout cannot spin.
const MIN_BROKER_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Worker threads pulling from one shared queue. Each thread handles one
/// job at a time and checks the shutdown flag between dequeues.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn start(
        processor: Arc<JobProcessor>,
        queue: Arc<dyn WorkQueue>,
        worker_count: usize,
        dequeue_timeout: Duration,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let processor = Arc::clone(&processor);
            let queue = Arc::clone(&queue);
            let shutdown_flag = Arc::clone(&shutdown);

            let handle = thread::spawn(move || {
                run_worker(worker_id, processor, queue, shutdown_flag, dequeue_timeout);
            });

            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Self { workers, shutdown }
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// The flag [`WorkerPool::shutdown`] sets, for signal handlers.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Blocks until every worker has stopped. Workers finish the job they
    /// are on before they notice the shutdown flag.
    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }
}

fn run_worker(
    worker_id: usize,
    processor: Arc<JobProcessor>,
    queue: Arc<dyn WorkQueue>,
    shutdown: Arc<AtomicBool>,
    dequeue_timeout: Duration,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match queue.dequeue(dequeue_timeout) {
            Ok(Some(descriptor)) => {
                debug!("Worker {} processing job {}", worker_id, descriptor.job_id);
                match processor.process(&descriptor) {
                    JobOutcome::Finished(_) => {
                        info!("Worker {} finished job {}", worker_id, descriptor.job_id)
                    }
                    JobOutcome::Failed(reason) => {
                        error!("Worker {} failed job {}: {}", worker_id, descriptor.job_id, reason)
                    }
                    JobOutcome::Skipped(reason) => {
                        debug!("Worker {} skipped job {}: {:?}", worker_id, descriptor.job_id, reason)
                    }
                }
            }
            Ok(None) => continue,
            Err(QueueError::Closed) => {
                debug!("Worker {} queue closed", worker_id);
                break;
            }
            Err(e) => {
                error!("Worker {} dequeue failed: {}", worker_id, e);
                thread::sleep(broker_error_backoff(dequeue_timeout));
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

fn broker_error_backoff(dequeue_timeout: Duration) -> Duration {
    BROKER_ERROR_BACKOFF
        .min(dequeue_timeout)
        .max(MIN_BROKER_ERROR_BACKOFF)
}
