//! Gateway shared by every connection task.
//!
//! Owns the admission limiters and a handle to the job queue. Built once by
//! the server wiring and passed to the router as `Extension<Arc<Gateway>>`;
//! there is no process-global state.

use crate::config::Config;
use crate::queue::{Job, JobPayload, JobQueue, Outcome, QueueError};
use crate::throttle::{ThrottleError, Throttler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::wire::DiagnosticResponse;

pub struct Gateway {
    config: Config,
    messages: Throttler,
    connections: Throttler,
    queue: Arc<JobQueue>,
    active_connections: AtomicUsize,
    start_time: Instant,
}

impl Gateway {
    /// Build the gateway from configuration around an existing queue.
    pub fn new(config: Config, queue: Arc<JobQueue>) -> Result<Self, ThrottleError> {
        let messages = Throttler::from_config(&config.throttle.messages, &config.throttle)?;
        let connections = Throttler::from_config(&config.throttle.connections, &config.throttle)?;
        Ok(Self {
            config,
            messages,
            connections,
            queue,
            active_connections: AtomicUsize::new(0),
            start_time: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Global connect-rate check, charged once per connection attempt.
    pub fn admit_connection(&self) -> bool {
        self.connections.admit(None)
    }

    /// Per-client message-rate check.
    pub fn admit_message(&self, client: &str) -> bool {
        self.messages.admit(Some(client))
    }

    /// Enqueue a job and return its correlation id. Never blocks.
    pub fn submit(
        &self,
        payload: JobPayload,
        reply: impl FnOnce(Outcome) + Send + 'static,
    ) -> Result<Uuid, QueueError> {
        let job = Job::new(payload, reply);
        let id = job.id();
        self.queue.push(job)?;
        Ok(id)
    }

    /// Count a connection as open until the returned guard is dropped.
    pub fn open_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            gateway: Arc::clone(self),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Clients currently remembered by the message limiter.
    pub fn tracked_clients(&self) -> usize {
        self.messages.tracked_clients()
    }

    pub fn diagnostic(&self) -> DiagnosticResponse {
        DiagnosticResponse {
            alive: true,
            queue_len: self.queue.len(),
            ws_clients: self.active_connections(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Keeps a connection counted in [`Gateway::active_connections`].
pub struct ConnectionGuard {
    gateway: Arc<Gateway>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.gateway
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}
