//! # Sluice Core
//!
//! Host-side collaborators for the Sluice interception pipeline.
//!
//! This crate provides the abstractions the interceptor plugs into:
//! - Error types
//! - Middleware trait and the `Next` handler chain
//! - The live response transport (`ResponseSink`, `LiveResponse`)
//! - Response builder helpers

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod middleware;
pub mod response;
pub mod sink;

pub use error::{Error, Result};
pub use middleware::{handler_fn, Body, Middleware, Next};
pub use response::ResponseBuilder;
pub use sink::{write_response, LiveResponse, ResponseSink, SharedResponse};

// Re-export commonly used HTTP types
pub use bytes::Bytes;
pub use http::{Method, Request, Response, StatusCode};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::middleware::{Body, Middleware, Next};
    pub use crate::response::ResponseBuilder;
    pub use crate::sink::{LiveResponse, ResponseSink, SharedResponse};
}
