//! Response builder and utilities

use crate::middleware::Body;
use crate::{Error, Result};
use bytes::Bytes;
use http::{header, Response, StatusCode};
use http_body_util::Full;
use serde::Serialize;

/// Response builder for convenient response construction
#[derive(Debug)]
pub struct ResponseBuilder {
    status: StatusCode,
    headers: Vec<(header::HeaderName, String)>,
}

impl ResponseBuilder {
    /// Create a new response builder
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    /// Set a header
    pub fn header(mut self, name: header::HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Build response with empty body
    pub fn build(self) -> Result<Response<Body>> {
        self.body_with(None, Bytes::new())
    }

    /// Build response with text body
    pub fn text(self, body: impl Into<String>) -> Result<Response<Body>> {
        self.body_with(Some("text/plain; charset=utf-8"), Bytes::from(body.into()))
    }

    /// Build response with JSON body
    pub fn json_body<T: Serialize>(self, body: &T) -> Result<Response<Body>> {
        let json = serde_json::to_string(body)?;
        self.body_with(Some("application/json"), Bytes::from(json))
    }

    fn body_with(self, content_type: Option<&str>, body: Bytes) -> Result<Response<Body>> {
        let mut response = Response::builder().status(self.status);

        if let Some(content_type) = content_type {
            response = response.header(header::CONTENT_TYPE, content_type);
        }

        for (name, value) in self.headers {
            response = response.header(name, value);
        }

        Ok(response.body(Full::new(body))?)
    }
}

/// Convenience functions for common responses
pub mod responses {
    use super::*;

    /// 200 OK
    pub fn ok() -> ResponseBuilder {
        ResponseBuilder::new(StatusCode::OK)
    }

    /// Plain-text response for an error that escaped the pipeline
    pub fn from_error(err: &Error) -> Result<Response<Body>> {
        ResponseBuilder::new(err.to_status_code()).text(err.to_string())
    }
}
