//! Live response transport
//!
//! [`ResponseSink`] is the mutable, servlet-style view of an outgoing
//! response that handler chains and interceptors write into. A sink may
//! *commit*: once committed, the status line and headers are locked in
//! and only body writes are still accepted.
//!
//! [`LiveResponse`] is the in-memory transport that is finally converted
//! into an [`http::Response`]. [`SharedResponse`] lets several owners
//! (the dispatcher, the script, the handler chain) reach the same live
//! response.

use crate::middleware::Body;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, SET_COOKIE};
use http::{HeaderMap, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// A mutable response transport
pub trait ResponseSink: Send {
    /// Current status code
    fn status(&self) -> StatusCode;

    /// Set the status code and an optional reason phrase
    fn set_status(&mut self, status: StatusCode, reason: Option<&str>);

    /// Signal a hard failure to the transport
    ///
    /// This commits the response with the given status.
    fn send_error(&mut self, status: StatusCode, message: Option<&str>) -> Result<()>;

    /// Snapshot of the current headers
    fn headers(&self) -> HeaderMap;

    /// Replace all values of a header
    fn set_header(&mut self, name: HeaderName, value: HeaderValue);

    /// Append a value to a header
    fn append_header(&mut self, name: HeaderName, value: HeaderValue);

    /// Remove all values of a header
    fn remove_header(&mut self, name: &HeaderName);

    /// Write body bytes
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Flush written data, committing the response
    fn flush(&mut self) -> Result<()>;

    /// Discard the body written so far, keeping status and headers
    fn reset_buffer(&mut self) -> Result<()>;

    /// Discard status, headers and body
    fn reset(&mut self) -> Result<()>;

    /// Whether the status line and headers have been sent
    fn is_committed(&self) -> bool;

    /// Add a `Set-Cookie` header
    fn add_cookie(&mut self, cookie: HeaderValue) {
        self.append_header(SET_COOKIE, cookie);
    }

    /// Set the `Content-Type` header
    fn set_content_type(&mut self, content_type: HeaderValue) {
        self.set_header(CONTENT_TYPE, content_type);
    }

    /// The `Content-Type` header, if set and valid UTF-8
    fn content_type(&self) -> Option<String> {
        self.headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Write UTF-8 text
    fn print(&mut self, text: &str) -> Result<()> {
        self.write(text.as_bytes())
    }
}

/// Copy a complete response into a sink
///
/// Status and headers go through the sink's own mutators, so sinks that
/// defer status (such as a capturing buffer) keep doing so.
pub async fn write_response(sink: &mut dyn ResponseSink, response: Response<Body>) -> Result<()> {
    let (parts, body) = response.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| Error::Internal(format!("Failed to read response body: {e:?}")))?
        .to_bytes();

    sink.set_status(parts.status, parts.status.canonical_reason());

    let mut last: Option<HeaderName> = None;
    for (name, value) in parts.headers {
        match name {
            Some(name) => {
                sink.set_header(name.clone(), value);
                last = Some(name);
            }
            None => {
                if let Some(name) = &last {
                    sink.append_header(name.clone(), value);
                }
            }
        }
    }

    sink.write(&bytes)
}

/// In-memory response transport
#[derive(Debug)]
pub struct LiveResponse {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    body: BytesMut,
    committed: bool,
    error_sent: Option<(StatusCode, Option<String>)>,
}

impl LiveResponse {
    /// Create an empty `200 OK` response
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            committed: false,
            error_sent: None,
        }
    }

    /// Reason phrase set alongside the status, if any
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Body written so far
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The error signalled through [`ResponseSink::send_error`], if any
    pub fn error_sent(&self) -> Option<(StatusCode, Option<&str>)> {
        self.error_sent
            .as_ref()
            .map(|(status, message)| (*status, message.as_deref()))
    }

    /// Convert into an HTTP response
    pub fn into_response(self) -> Result<Response<Body>> {
        let mut response = Response::builder().status(self.status);
        if let Some(headers) = response.headers_mut() {
            *headers = self.headers;
        }
        Ok(response.body(Full::new(self.body.freeze()))?)
    }

    fn guard_uncommitted(&self, what: &str) -> bool {
        if self.committed {
            trace!(operation = what, "Ignoring mutation of committed response");
            false
        } else {
            true
        }
    }
}

impl Default for LiveResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseSink for LiveResponse {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn set_status(&mut self, status: StatusCode, reason: Option<&str>) {
        if self.guard_uncommitted("set_status") {
            self.status = status;
            self.reason = reason.map(str::to_string);
        }
    }

    fn send_error(&mut self, status: StatusCode, message: Option<&str>) -> Result<()> {
        if self.committed {
            return Err(Error::Committed);
        }
        self.status = status;
        self.reason = message.map(str::to_string);
        self.body.clear();
        if let Some(message) = message {
            self.headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            self.body.extend_from_slice(message.as_bytes());
        }
        self.error_sent = Some((status, message.map(str::to_string)));
        self.committed = true;
        Ok(())
    }

    fn headers(&self) -> HeaderMap {
        self.headers.clone()
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        if self.guard_uncommitted("set_header") {
            self.headers.insert(name, value);
        }
    }

    fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        if self.guard_uncommitted("append_header") {
            self.headers.append(name, value);
        }
    }

    fn remove_header(&mut self, name: &HeaderName) {
        if self.guard_uncommitted("remove_header") {
            self.headers.remove(name);
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        // Output after an error was sent is dropped, like a servlet container does.
        if self.error_sent.is_none() {
            self.body.extend_from_slice(bytes);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.committed = true;
        Ok(())
    }

    fn reset_buffer(&mut self) -> Result<()> {
        if self.committed {
            return Err(Error::Committed);
        }
        self.body.clear();
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        if self.committed {
            return Err(Error::Committed);
        }
        *self = Self::new();
        Ok(())
    }

    fn is_committed(&self) -> bool {
        self.committed
    }
}

/// A [`LiveResponse`] reachable from several owners
#[derive(Clone, Default)]
pub struct SharedResponse {
    inner: Arc<Mutex<LiveResponse>>,
}

impl SharedResponse {
    /// Create a new shared `200 OK` response
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a closure against the underlying response
    pub fn with<R>(&self, f: impl FnOnce(&LiveResponse) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Body written so far
    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(self.inner.lock().body())
    }

    /// Take the response out, leaving an empty one behind, and convert it
    pub fn take_response(&self) -> Result<Response<Body>> {
        let live = std::mem::take(&mut *self.inner.lock());
        live.into_response()
    }
}

impl fmt::Debug for SharedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self.inner.lock();
        f.debug_struct("SharedResponse")
            .field("status", &live.status)
            .field("committed", &live.committed)
            .field("body_len", &live.body.len())
            .finish()
    }
}

impl ResponseSink for SharedResponse {
    fn status(&self) -> StatusCode {
        self.inner.lock().status()
    }

    fn set_status(&mut self, status: StatusCode, reason: Option<&str>) {
        self.inner.lock().set_status(status, reason);
    }

    fn send_error(&mut self, status: StatusCode, message: Option<&str>) -> Result<()> {
        self.inner.lock().send_error(status, message)
    }

    fn headers(&self) -> HeaderMap {
        self.inner.lock().headers()
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.inner.lock().set_header(name, value);
    }

    fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.inner.lock().append_header(name, value);
    }

    fn remove_header(&mut self, name: &HeaderName) {
        self.inner.lock().remove_header(name);
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.lock().write(bytes)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.lock().flush()
    }

    fn reset_buffer(&mut self) -> Result<()> {
        self.inner.lock().reset_buffer()
    }

    fn reset(&mut self) -> Result<()> {
        self.inner.lock().reset()
    }

    fn is_committed(&self) -> bool {
        self.inner.lock().is_committed()
    }
}
