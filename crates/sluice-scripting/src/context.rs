//! Per-request interception context

use crate::bridge::ChainBridge;
use crate::engine::EngineHandle;
use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, Version};
use once_cell::sync::OnceCell;
use sluice_core::SharedResponse;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Normalized request view exposed to scripts
///
/// Scripts may edit the view; the edits are applied to the request that is
/// handed to the handler chain.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestView {
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// HTTP version
    pub version: String,
    /// Request headers; repeated headers are joined with `, `
    pub headers: BTreeMap<String, String>,
    /// Decoded query parameters; the last value wins for repeated names
    ///
    /// Repeated values of a parameter survive as long as it is not edited.
    pub query: BTreeMap<String, String>,
    /// Request body
    pub body: Bytes,
    original_query: Option<String>,
}

impl RequestView {
    /// Create from request parts and the collected body
    pub fn from_parts(parts: &Parts, body: Bytes) -> Self {
        Self::build(&parts.method, &parts.uri, parts.version, &parts.headers, body)
    }

    /// Create from a request whose body has already been collected
    pub fn from_request(req: &Request<Bytes>) -> Self {
        Self::build(
            req.method(),
            req.uri(),
            req.version(),
            req.headers(),
            req.body().clone(),
        )
    }

    fn build(
        method: &Method,
        uri: &Uri,
        version: Version,
        header_map: &HeaderMap,
        body: Bytes,
    ) -> Self {
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in header_map {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        let original_query = uri.query().map(str::to_string);

        Self {
            method: method.to_string(),
            path: uri.path().to_string(),
            version: format!("{:?}", version),
            headers,
            query: parse_query(original_query.as_deref()),
            body,
            original_query,
        }
    }

    /// Full request target (path plus query string)
    pub fn uri(&self) -> String {
        match self.query_string() {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// Query string as it will be sent to the handler chain
    ///
    /// The original string is kept verbatim unless the parameters were edited.
    /// Otherwise untouched parameters keep their original pairs and order,
    /// edited ones collapse to their single new value, and added ones follow.
    pub fn query_string(&self) -> Option<String> {
        let original = parse_query(self.original_query.as_deref());
        if original == self.query {
            return self.original_query.clone();
        }
        if self.query.is_empty() {
            return None;
        }

        let mut serializer = form_urlencoded::Serializer::new(String::new());
        let mut written = BTreeSet::new();
        let pairs = self
            .original_query
            .as_deref()
            .map(|q| form_urlencoded::parse(q.as_bytes()))
            .into_iter()
            .flatten();
        for (name, value) in pairs {
            let Some(current) = self.query.get(name.as_ref()) else {
                continue;
            };
            if original.get(name.as_ref()) == Some(current) {
                serializer.append_pair(&name, &value);
            } else if written.insert(name.clone().into_owned()) {
                serializer.append_pair(&name, current);
            }
        }
        for (name, value) in &self.query {
            if !original.contains_key(name) {
                serializer.append_pair(name, value);
            }
        }
        Some(serializer.finish())
    }

    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Set a header, replacing existing values
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Remove a header
    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(&name.to_ascii_lowercase())
    }

    /// Query parameter by name
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Get body as string
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Set body from string
    pub fn set_body_string(&mut self, body: impl Into<String>) {
        self.body = Bytes::from(body.into());
    }

    /// Set body from JSON
    pub fn set_body_json(&mut self, value: &serde_json::Value) {
        if let Ok(json) = serde_json::to_vec(value) {
            self.body = Bytes::from(json);
        }
    }

    /// Apply the view back onto an HTTP request
    ///
    /// Method, target, headers and body are overwritten from the view. The
    /// `Content-Length` header follows the body when the body was edited.
    pub fn apply_to_request(&self, req: &mut Request<Bytes>) -> Result<(), String> {
        let method =
            Method::from_str(&self.method).map_err(|e| format!("Invalid method: {}", e))?;
        let uri = rebuild_uri(req.uri(), &self.uri())?;

        let original = req.headers();
        let mut headers = HeaderMap::new();
        for (key, value) in &self.headers {
            let name = HeaderName::from_str(key)
                .map_err(|e| format!("Invalid header name '{}': {}", key, e))?;
            // Untouched repeated headers keep their separate values.
            if joined_value(original, &name).as_deref() == Some(value.as_str()) {
                for original_value in original.get_all(&name) {
                    headers.append(name.clone(), original_value.clone());
                }
                continue;
            }
            let value = HeaderValue::from_str(value)
                .map_err(|e| format!("Invalid header value for '{}': {}", key, e))?;
            headers.insert(name, value);
        }

        if req.body() != &self.body {
            *req.body_mut() = self.body.clone();
            if headers.contains_key(CONTENT_LENGTH) {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
            }
        }

        *req.method_mut() = method;
        *req.uri_mut() = uri;
        *req.headers_mut() = headers;

        Ok(())
    }
}

fn joined_value(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let values: Vec<String> = headers
        .get_all(name)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .collect();
    (!values.is_empty()).then(|| values.join(", "))
}

fn parse_query(query: Option<&str>) -> BTreeMap<String, String> {
    query
        .map(|q| {
            form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

fn rebuild_uri(current: &Uri, target: &str) -> Result<Uri, String> {
    let mut parts = current.clone().into_parts();
    parts.path_and_query = Some(
        target
            .parse()
            .map_err(|e| format!("Invalid request target '{}': {}", target, e))?,
    );
    Uri::from_parts(parts).map_err(|e| format!("Invalid URI: {}", e))
}

/// Outcome of one intercepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterceptOutcome {
    /// The script produced the response
    EngineHandled,
    /// The handler chain produced the response without the script
    Delegated,
    /// The script produced the response from captured chain output
    EngineHandledViaCapture,
    /// A diagnostic page was rendered
    Error,
}

impl fmt::Display for InterceptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EngineHandled => write!(f, "engine_handled"),
            Self::Delegated => write!(f, "delegated"),
            Self::EngineHandledViaCapture => write!(f, "engine_handled_via_capture"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Everything one script invocation can reach for its request
///
/// The context pins the engine handle chosen for the request, so a rebuild
/// finishing mid-request does not change which engine serves it. The outcome
/// is settled exactly once.
#[derive(Debug)]
pub struct InterceptionContext {
    original: RequestView,
    handle: Arc<EngineHandle>,
    bridge: Arc<ChainBridge>,
    outcome: OnceCell<InterceptOutcome>,
}

impl InterceptionContext {
    /// Bind a request's bridge to the engine handle serving it
    pub fn new(bridge: Arc<ChainBridge>, handle: Arc<EngineHandle>) -> Self {
        let original = bridge.request().lock().clone();
        Self {
            original,
            handle,
            bridge,
            outcome: OnceCell::new(),
        }
    }

    /// The engine handle serving this request
    pub fn handle(&self) -> &Arc<EngineHandle> {
        &self.handle
    }

    /// The request view as it arrived, before any script edits
    pub fn original_request(&self) -> &RequestView {
        &self.original
    }

    /// The chain bridge for this request
    pub fn bridge(&self) -> &Arc<ChainBridge> {
        &self.bridge
    }

    /// The live response for this request
    pub fn response(&self) -> &SharedResponse {
        self.bridge.response()
    }

    /// Snapshot of the request view as currently edited
    pub fn request(&self) -> RequestView {
        self.bridge.request().lock().clone()
    }

    /// Generation of the engine handle serving this request
    pub fn generation(&self) -> u64 {
        self.handle.generation()
    }

    /// The settled outcome, if any
    pub fn outcome(&self) -> Option<InterceptOutcome> {
        self.outcome.get().copied()
    }

    /// Record the outcome; returns `false` if one was already settled
    pub fn settle(&self, outcome: InterceptOutcome) -> bool {
        self.outcome.set(outcome).is_ok()
    }
}
