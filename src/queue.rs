//! Job model and the FIFO queue between connection tasks and the dispatch loop.
//!
//! Connection tasks push [`Job`]s without blocking; exactly one dispatch
//! thread pops them. The queue is an unbounded crossbeam channel, so push
//! order is processing order and an idle consumer sleeps on the channel
//! instead of spinning.

use crossbeam_channel as channel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Axis-aligned face rectangle in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub top_left: (i32, i32),
    pub bottom_right: (i32, i32),
}

impl FaceRect {
    /// Build from a `[x1, y1, x2, y2]` location.
    pub fn from_location([x1, y1, x2, y2]: [i32; 4]) -> Self {
        Self {
            top_left: (x1, y1),
            bottom_right: (x2, y2),
        }
    }
}

/// Typed result of processing one job.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Identification {
        faces: Vec<FaceRect>,
    },
    Verification {
        is_match: bool,
        confidence: f64,
        faces: Vec<FaceRect>,
    },
    Failure {
        detail: String,
    },
}

impl Outcome {
    pub fn failure(detail: impl Into<String>) -> Self {
        Outcome::Failure {
            detail: detail.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure { .. })
    }
}

/// Images carried by a job. A second image selects comparison semantics.
#[derive(Clone, PartialEq, Eq)]
pub struct JobPayload {
    pub primary_image: Vec<u8>,
    pub secondary_image: Option<Vec<u8>>,
}

impl JobPayload {
    pub fn identify(image: Vec<u8>) -> Self {
        Self {
            primary_image: image,
            secondary_image: None,
        }
    }

    pub fn verify(first: Vec<u8>, second: Vec<u8>) -> Self {
        Self {
            primary_image: first,
            secondary_image: Some(second),
        }
    }

    pub fn is_verification(&self) -> bool {
        self.secondary_image.is_some()
    }

    pub fn mode(&self) -> &'static str {
        if self.is_verification() {
            "verification"
        } else {
            "identification"
        }
    }
}

impl fmt::Debug for JobPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobPayload")
            .field("primary_image_len", &self.primary_image.len())
            .field(
                "secondary_image_len",
                &self.secondary_image.as_ref().map(Vec::len),
            )
            .finish()
    }
}

/// Completion callback. Runs on the dispatch thread.
pub type ReplyFn = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// A queued unit of work.
pub struct Job {
    id: Uuid,
    payload: JobPayload,
    reply: ReplyFn,
}

impl Job {
    /// Create a job with a fresh correlation id.
    pub fn new(payload: JobPayload, reply: impl FnOnce(Outcome) + Send + 'static) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            reply: Box::new(reply),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    /// Split into parts so the payload can move to a worker while the
    /// callback stays with the dispatcher.
    pub fn into_parts(self) -> (Uuid, JobPayload, ReplyFn) {
        (self.id, self.payload, self.reply)
    }

    /// Deliver the outcome. Consumes the job, so it runs at most once.
    pub fn complete(self, outcome: Outcome) {
        (self.reply)(outcome);
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// Queue refused the job.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue was closed for shutdown. The rejected job is handed back.
    #[error("Job queue is closed")]
    Closed(Job),
}

/// Unbounded multi-producer, single-consumer FIFO of pending jobs.
pub struct JobQueue {
    tx: channel::Sender<Job>,
    rx: channel::Receiver<Job>,
    closed: AtomicBool,
}

impl JobQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            closed: AtomicBool::new(false),
        }
    }

    /// Append a job. Never blocks.
    pub fn push(&self, job: Job) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed(job));
        }
        // Both channel ends live as long as the queue, so send cannot fail.
        self.tx
            .send(job)
            .map_err(|channel::SendError(job)| QueueError::Closed(job))
    }

    /// Take the oldest job if there is one.
    pub fn try_pop(&self) -> Option<Job> {
        self.rx.try_recv().ok()
    }

    /// Take the oldest job, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Job> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Number of jobs waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Stop accepting jobs. Jobs already queued stay poppable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
