//! HTTP Handlers
//!
//! Endpoint handlers grouped by concern.

pub mod admin;
pub mod ws;
