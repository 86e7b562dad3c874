//! # Facegate
//!
//! Admission-controlled face identification and verification service.
//!
//! Clients send binary frames over a WebSocket. Each identify or verify
//! request becomes a job on a FIFO queue; a single dispatch thread feeds the
//! jobs to a worker pool with a per-job timeout and routes every result back
//! to the connection that asked for it.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! WebSocket frame
//!     ↓
//! [Wire codec]         → (MessageType, fields)        protocol::wire
//!     ↓
//! [Throttler]          → admitted / throttled         throttle
//!     ↓
//! [JobQueue]           → Job { id, payload, reply }   queue
//!     ↓
//! [Dispatcher thread]  → submit + bounded wait        dispatch
//!     ↓
//! [WorkerPool]         → analyze() on a FaceEngine    worker
//!     ↓
//! reply callback       → connection outbox → frame    protocol::rest::handlers::ws
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `config` | Layered configuration (TOML + env) |
//! | `throttle` | Sliding-window rate limiting |
//! | `queue` | Job model and FIFO queue |
//! | `worker` | Face engine boundary and worker pool |
//! | `dispatch` | Background dispatch loop |
//! | `protocol` | Frame codec, gateway, HTTP/WebSocket server |

// Configuration system
pub mod config;

// Admission control
pub mod throttle;

// Job pipeline
pub mod dispatch;
pub mod queue;
pub mod worker;

// Network protocol (server side)
pub mod protocol;

pub use config::Config;
pub use dispatch::Dispatcher;
pub use protocol::Gateway;
pub use queue::{FaceRect, Job, JobPayload, JobQueue, Outcome};
pub use throttle::Throttler;
pub use worker::{FaceEngine, ProcessEngine, UnconfiguredEngine, WorkerPool};
