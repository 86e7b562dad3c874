//! Facegate Protocol
//!
//! Client-server communication: binary frame codec, shared gateway state,
//! HTTP/WebSocket routing.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                     Facegate Protocol                       |
//! +-------------------------------------------------------------+
//! |  HTTP Endpoints:                                            |
//! |    - /health: health check with queue statistics            |
//! |    - /live: liveness probe                                  |
//! |    - /api/v1/core/ws (and /ws): binary WebSocket            |
//! +-------------------------------------------------------------+
//! |  Frame: 1-byte message type + MessagePack map payload       |
//! |  Transport: WebSocket binary messages                       |
//! +-------------------------------------------------------------+
//! ```
//!
//! # Module Structure
//!
//! - `wire` - Message types, request/response bodies, frame codec
//! - `error` - Codec error type
//! - `handler` - Gateway shared by all connections
//! - `rest` - Router, HTTP server and endpoint handlers

pub mod error;
pub mod handler;
pub mod rest;
pub mod wire;

pub use error::CodecError;
pub use handler::{ConnectionGuard, Gateway};
pub use wire::{DiagnosticResponse, JobResponse, MessageType};

/// Close code sent when the global connect rate is exceeded ("try again later").
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Close reason sent alongside [`CLOSE_TRY_AGAIN_LATER`].
pub const CLOSE_TRY_AGAIN_LATER_REASON: &str = "too many connections, try again later.";
