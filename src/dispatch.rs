//! Dispatch loop: the single consumer of the job queue.
//!
//! Runs on its own named thread. Each popped job is handed to the worker
//! pool and the thread blocks (only itself) until the result arrives or the
//! job timeout expires. Whatever happens, the job's callback is invoked
//! exactly once and the loop moves on to the next job.

use crate::config::DispatchConfig;
use crate::queue::{Job, JobQueue, Outcome, ReplyFn};
use crate::worker::{WorkerError, WorkerPool};
use crossbeam_channel::RecvTimeoutError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Detail sent when a job exceeds the job timeout.
pub const TIMED_OUT: &str = "Timed out";
/// Detail sent for any unexpected failure. The cause is only logged.
pub const INTERNAL_ERROR: &str = "Internal server error";
/// Detail sent for jobs still queued when the server stops.
pub const SHUTTING_DOWN: &str = "Server is shutting down";

#[derive(Debug, Clone, Copy)]
struct Timing {
    job_timeout: Duration,
    poll_interval: Duration,
    shutdown_timeout: Duration,
}

/// Handle to the running dispatch thread.
pub struct Dispatcher {
    queue: Arc<JobQueue>,
    pool: Arc<WorkerPool>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl Dispatcher {
    /// Spawn the `dispatch-loop` thread.
    pub fn start(
        queue: Arc<JobQueue>,
        pool: Arc<WorkerPool>,
        config: &DispatchConfig,
    ) -> std::io::Result<Self> {
        let timing = Timing {
            job_timeout: config.job_timeout(),
            poll_interval: config.poll_interval(),
            shutdown_timeout: config.shutdown_timeout(),
        };
        let stop = Arc::new(AtomicBool::new(false));

        let loop_queue = Arc::clone(&queue);
        let loop_pool = Arc::clone(&pool);
        let loop_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("dispatch-loop".to_string())
            .spawn(move || run(&loop_queue, &loop_pool, &loop_stop, timing))?;

        Ok(Self {
            queue,
            pool,
            stop,
            handle: Some(handle),
            shutdown_timeout: timing.shutdown_timeout,
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and drain the worker pool.
    ///
    /// The queue is closed first, the job being processed finishes (or times
    /// out), jobs still queued complete with [`SHUTTING_DOWN`], and finally
    /// in-flight worker computations get up to the shutdown timeout.
    /// Returns `true` when the pool drained in time.
    pub fn shutdown(mut self) -> bool {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        self.queue.close();
        self.stop.store(true, Ordering::SeqCst);
        if handle.join().is_err() {
            tracing::error!("dispatch_loop_panicked");
        }
        self.pool.shutdown(self.shutdown_timeout)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn run(queue: &JobQueue, pool: &WorkerPool, stop: &AtomicBool, timing: Timing) {
    tracing::info!(
        job_timeout_ms = timing.job_timeout.as_millis(),
        poll_interval_ms = timing.poll_interval.as_millis(),
        "dispatch_loop_started"
    );

    while !stop.load(Ordering::SeqCst) {
        if let Some(job) = queue.pop_timeout(timing.poll_interval) {
            process(job, pool, timing.job_timeout);
        }
    }

    let mut abandoned = 0usize;
    while let Some(job) = queue.try_pop() {
        abandoned += 1;
        let (id, _, reply) = job.into_parts();
        deliver(id, reply, Outcome::failure(SHUTTING_DOWN));
    }
    tracing::info!(abandoned, "dispatch_loop_stopped");
}

fn process(job: Job, pool: &WorkerPool, job_timeout: Duration) {
    let (id, payload, reply) = job.into_parts();
    tracing::info!(job_id = %id, mode = payload.mode(), "job_received");

    let started = Instant::now();
    let submission = pool.submit(payload);

    let outcome = match submission.recv_timeout(job_timeout) {
        Ok(Ok(outcome)) => {
            tracing::info!(
                job_id = %id,
                elapsed_ms = started.elapsed().as_millis(),
                failure = outcome.is_failure(),
                "job_completed"
            );
            outcome
        }
        Ok(Err(WorkerError::ShuttingDown)) => {
            tracing::warn!(job_id = %id, "job_rejected_pool_shutting_down");
            Outcome::failure(SHUTTING_DOWN)
        }
        Ok(Err(e)) => {
            tracing::error!(job_id = %id, error = %e, "job_failed");
            Outcome::failure(INTERNAL_ERROR)
        }
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!(
                job_id = %id,
                timeout_ms = job_timeout.as_millis(),
                "job_timed_out"
            );
            Outcome::failure(TIMED_OUT)
        }
        Err(RecvTimeoutError::Disconnected) => {
            tracing::error!(job_id = %id, error = "result channel closed", "job_failed");
            Outcome::failure(INTERNAL_ERROR)
        }
    };

    deliver(id, reply, outcome);
}

/// Invoke the job callback, containing any panic it raises.
fn deliver(id: Uuid, reply: ReplyFn, outcome: Outcome) {
    if panic::catch_unwind(AssertUnwindSafe(|| reply(outcome))).is_err() {
        tracing::error!(job_id = %id, "job_callback_panicked");
    }
}
