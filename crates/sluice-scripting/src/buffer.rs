//! Deferred-commit response buffering
//!
//! A [`ResponseBuffer`] wraps a live [`ResponseSink`] and keeps the status
//! and body in memory while buffering is on, so the interceptor can inspect
//! or replace what the handler chain produced before the client sees it.
//!
//! Headers are not deferred: they are forwarded to the live response
//! immediately and read back from it. Status and body are deferred, and
//! `flush` is suppressed while buffering because committing would lock in
//! the status line prematurely. A `Content-Length` forwarded by the chain
//! describes the body it wrote, not the released one, so it is dropped on
//! release and the transport frames the final body itself.

use bytes::BytesMut;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use http::{HeaderMap, StatusCode};
use sluice_core::{ResponseSink, Result};
use std::{fmt, io};
use tracing::{debug, trace};

/// Response wrapper that captures status and body until released
pub struct ResponseBuffer<S: ResponseSink> {
    inner: S,
    buffering: bool,
    status: StatusCode,
    status_message: String,
    body: BytesMut,
}

impl<S: ResponseSink> ResponseBuffer<S> {
    /// Wrap a live response; buffering starts enabled
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffering: true,
            status: StatusCode::OK,
            status_message: String::new(),
            body: BytesMut::new(),
        }
    }

    /// Whether writes are currently captured
    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    /// Switch capturing on or off
    ///
    /// Turning buffering off replays the captured status and body to the
    /// live response; later writes go straight through. Turning it off again
    /// is a no-op. Turning it back on is ignored once the live response has
    /// been committed, and otherwise starts a fresh capture.
    pub fn set_buffering(&mut self, active: bool) -> Result<()> {
        match (self.buffering, active) {
            (true, false) => {
                self.buffering = false;
                self.replay()
            }
            (false, true) => {
                if self.inner.is_committed() {
                    debug!("Response already committed, buffering stays off");
                } else {
                    self.buffering = true;
                    self.body.clear();
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Stop buffering and commit the live response
    pub fn release(&mut self) -> Result<()> {
        self.set_buffering(false)?;
        self.flush()
    }

    fn replay(&mut self) -> Result<()> {
        trace!(
            status = self.status.as_u16(),
            body_len = self.body.len(),
            "Releasing captured response"
        );
        let message = (!self.status_message.is_empty()).then_some(self.status_message.as_str());
        self.inner.set_status(self.status, message);
        self.inner.remove_header(&CONTENT_LENGTH);
        self.inner.write(&self.body)
    }

    /// Captured status code
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Captured status message (empty when none was set)
    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    /// Captured body decoded as UTF-8; empty when nothing was written
    pub fn body(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Replace the captured body wholesale
    ///
    /// After release the live body is reset and rewritten, which fails if the
    /// live response has already been committed.
    pub fn set_body(&mut self, content: &str) -> Result<()> {
        if !self.buffering {
            self.inner.reset_buffer()?;
        }
        self.body.clear();
        self.write_bytes(content.as_bytes())
    }

    /// Write bytes: captured while buffering, forwarded otherwise
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buffering {
            self.body.extend_from_slice(bytes);
            Ok(())
        } else {
            self.inner.write(bytes)
        }
    }
}

impl<S: ResponseSink> ResponseSink for ResponseBuffer<S> {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn set_status(&mut self, status: StatusCode, reason: Option<&str>) {
        self.status = status;
        self.status_message = reason.unwrap_or_default().to_string();
        if !self.buffering {
            self.inner.set_status(status, reason);
        }
    }

    fn send_error(&mut self, status: StatusCode, message: Option<&str>) -> Result<()> {
        // The error path always reaches the transport; the local copy keeps
        // `status()` consistent for callers inspecting the capture.
        self.status = status;
        if let Some(message) = message {
            self.status_message = message.to_string();
        }
        self.inner.send_error(status, message)
    }

    fn headers(&self) -> HeaderMap {
        self.inner.headers()
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.inner.set_header(name, value);
    }

    fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.inner.append_header(name, value);
    }

    fn remove_header(&mut self, name: &HeaderName) {
        self.inner.remove_header(name);
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_bytes(bytes)
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffering {
            trace!("Flush suppressed while buffering");
            Ok(())
        } else {
            self.inner.flush()
        }
    }

    fn reset_buffer(&mut self) -> Result<()> {
        if self.buffering {
            self.body.clear();
            Ok(())
        } else {
            self.inner.reset_buffer()
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.body.clear();
        self.status = StatusCode::OK;
        self.status_message.clear();
        self.inner.reset()
    }

    fn is_committed(&self) -> bool {
        self.inner.is_committed()
    }
}

impl<S: ResponseSink> io::Write for ResponseBuffer<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        ResponseSink::flush(self).map_err(io::Error::other)
    }
}

impl<S: ResponseSink> fmt::Write for ResponseBuffer<S> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

impl<S: ResponseSink> fmt::Debug for ResponseBuffer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBuffer")
            .field("buffering", &self.buffering)
            .field("status", &self.status)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::SharedResponse;
    use std::io::Write as _;

    fn buffer() -> (SharedResponse, ResponseBuffer<SharedResponse>) {
        let live = SharedResponse::new();
        (live.clone(), ResponseBuffer::new(live))
    }

    #[test]
    fn test_byte_and_char_writes_share_one_capture() {
        let (live, mut buf) = buffer();
        buf.write_all(b"caf").unwrap();
        fmt::Write::write_fmt(&mut buf, format_args!("\u{e9} {}", 42)).unwrap();
        buf.print(" ok").unwrap();

        assert_eq!(buf.body(), "caf\u{e9} 42 ok");
        assert!(live.body().is_empty());
    }

    #[test]
    fn test_empty_body_is_empty_string() {
        let (_, buf) = buffer();
        assert_eq!(buf.body(), "");
    }

    #[test]
    fn test_status_is_deferred_until_release() {
        let (live, mut buf) = buffer();
        buf.set_status(StatusCode::CREATED, Some("made"));
        buf.set_status(StatusCode::ACCEPTED, None);
        assert_eq!(buf.status(), StatusCode::ACCEPTED);
        assert_eq!(live.status(), StatusCode::OK);

        buf.print("queued").unwrap();
        buf.release().unwrap();

        assert_eq!(live.status(), StatusCode::ACCEPTED);
        assert_eq!(&live.body()[..], b"queued");
        assert!(live.is_committed());
    }

    #[test]
    fn test_headers_pass_through_immediately() {
        let (live, mut buf) = buffer();
        buf.set_header(
            HeaderName::from_static("x-trace"),
            HeaderValue::from_static("abc"),
        );
        buf.add_cookie(HeaderValue::from_static("sid=1"));

        assert_eq!(live.headers().get("x-trace").unwrap(), "abc");
        assert_eq!(buf.headers().get("set-cookie").unwrap(), "sid=1");
    }

    #[test]
    fn test_flush_suppressed_while_buffering() {
        let (live, mut buf) = buffer();
        buf.print("x").unwrap();
        ResponseSink::flush(&mut buf).unwrap();
        assert!(!live.is_committed());
        assert!(live.body().is_empty());
    }

    #[test]
    fn test_release_twice_forwards_once() {
        let (live, mut buf) = buffer();
        buf.print("once").unwrap();
        buf.set_buffering(false).unwrap();
        buf.set_buffering(false).unwrap();
        assert_eq!(&live.body()[..], b"once");
    }

    #[test]
    fn test_writes_after_release_go_live() {
        let (live, mut buf) = buffer();
        buf.print("a").unwrap();
        buf.set_buffering(false).unwrap();
        buf.print("b").unwrap();
        assert_eq!(&live.body()[..], b"ab");
        assert_eq!(buf.body(), "a");
    }

    #[test]
    fn test_set_body_replaces_capture() {
        let (live, mut buf) = buffer();
        buf.print("hello").unwrap();
        buf.set_body("HELLO").unwrap();
        assert_eq!(buf.body(), "HELLO");
        buf.release().unwrap();
        assert_eq!(&live.body()[..], b"HELLO");
    }

    #[test]
    fn test_set_body_after_release_rewrites_live_body() {
        let (live, mut buf) = buffer();
        buf.print("old").unwrap();
        buf.set_buffering(false).unwrap();
        buf.set_body("new").unwrap();
        assert_eq!(&live.body()[..], b"new");

        ResponseSink::flush(&mut buf).unwrap();
        assert!(buf.set_body("late").is_err());
    }

    #[test]
    fn test_release_drops_stale_content_length() {
        let (live, mut buf) = buffer();
        buf.set_header(CONTENT_LENGTH, HeaderValue::from_static("5"));
        buf.print("hello").unwrap();
        assert_eq!(live.headers().get(CONTENT_LENGTH).unwrap(), "5");

        buf.set_body("HELLO WORLD").unwrap();
        buf.release().unwrap();

        assert!(live.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(&live.body()[..], b"HELLO WORLD");
    }

    #[test]
    fn test_send_error_updates_status_and_reaches_transport() {
        let (live, mut buf) = buffer();
        buf.send_error(StatusCode::NOT_FOUND, Some("gone")).unwrap();

        assert_eq!(buf.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            live.with(|r| r.error_sent().map(|(s, _)| s)),
            Some(StatusCode::NOT_FOUND)
        );
    }

    #[test]
    fn test_buffering_cannot_restart_after_commit() {
        let (live, mut buf) = buffer();
        buf.release().unwrap();
        buf.set_buffering(true).unwrap();
        assert!(!buf.is_buffering());

        buf.print("direct").unwrap();
        assert_eq!(&live.body()[..], b"direct");
    }
}
