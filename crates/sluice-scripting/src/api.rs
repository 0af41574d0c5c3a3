//! Types and functions registered with the Rhai engine
//!
//! Scripts receive three values per request: `req` (the editable request
//! view), `res` (the live response) and `chain` (the handler-chain bridge).
//! Capturing the chain yields a `Buffer` wrapping the captured response.

use crate::bridge::{ChainBridge, ChainState};
use crate::buffer::ResponseBuffer;
use crate::context::RequestView;
use crate::error::ScriptError;
use base64::{engine::general_purpose, Engine as _};
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Map, Position};
use sluice_core::{ResponseSink, SharedResponse};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub(crate) type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// Structured control-flow signals thrown through the script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// The script has no route for this request
    Unhandled,
    /// The handler chain was invoked a second time
    ChainReused,
}

impl Signal {
    fn name(&self) -> &'static str {
        match self {
            Self::Unhandled => "unhandled request",
            Self::ChainReused => "handler chain already invoked",
        }
    }
}

fn throw(value: Dynamic) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(value, Position::NONE))
}

fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    throw(Dynamic::from(message.into()))
}

/// Convert a host-side failure into something a script can catch
pub(crate) fn to_rhai(err: ScriptError) -> Box<EvalAltResult> {
    match err {
        ScriptError::Unhandled => throw(Dynamic::from(Signal::Unhandled)),
        ScriptError::ChainAlreadyInvoked => throw(Dynamic::from(Signal::ChainReused)),
        other => runtime_error(other.to_string()),
    }
}

fn core_error(err: sluice_core::Error) -> Box<EvalAltResult> {
    runtime_error(err.to_string())
}

fn status_code(code: i64) -> RhaiResult<StatusCode> {
    u16::try_from(code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| runtime_error(format!("invalid status code {}", code)))
}

fn header_pair(name: &str, value: &str) -> RhaiResult<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| runtime_error(format!("invalid header name '{}': {}", name, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| runtime_error(format!("invalid header value for '{}': {}", name, e)))?;
    Ok((name, value))
}

fn header_value(sink: &dyn ResponseSink, name: &str) -> Dynamic {
    sink.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map_or(Dynamic::UNIT, |v| Dynamic::from(v.to_string()))
}

fn string_map<'a>(entries: impl Iterator<Item = (&'a String, &'a String)>) -> Map {
    entries
        .map(|(k, v)| (k.as_str().into(), Dynamic::from(v.clone())))
        .collect()
}

/// Parse JSON into a script value; invalid input throws `#{type, message}`
pub(crate) fn parse_json(text: &str) -> RhaiResult<Dynamic> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| {
        let mut failure = Map::new();
        failure.insert("type".into(), Dynamic::from("invalid_json".to_string()));
        failure.insert("message".into(), Dynamic::from(e.to_string()));
        throw(Dynamic::from(failure))
    })?;
    rhai::serde::to_dynamic(value)
}

fn to_json(value: Dynamic) -> RhaiResult<String> {
    let json: serde_json::Value = rhai::serde::from_dynamic(&value)?;
    Ok(json.to_string())
}

fn format_json(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| text.to_string())
}

/// Request view handle passed to scripts as `req`
#[derive(Debug, Clone)]
pub(crate) struct ScriptRequest {
    view: Arc<Mutex<RequestView>>,
}

impl ScriptRequest {
    pub(crate) fn new(view: Arc<Mutex<RequestView>>) -> Self {
        Self { view }
    }

    fn method(&mut self) -> ImmutableString {
        self.view.lock().method.as_str().into()
    }

    fn set_method(&mut self, method: ImmutableString) {
        self.view.lock().method = method.to_ascii_uppercase();
    }

    fn path(&mut self) -> ImmutableString {
        self.view.lock().path.as_str().into()
    }

    fn set_path(&mut self, path: ImmutableString) {
        self.view.lock().path = path.to_string();
    }

    fn uri(&mut self) -> String {
        self.view.lock().uri()
    }

    fn query_string(&mut self) -> String {
        self.view.lock().query_string().unwrap_or_default()
    }

    fn version(&mut self) -> String {
        self.view.lock().version.clone()
    }

    fn body(&mut self) -> ImmutableString {
        self.view.lock().body_string().into()
    }

    fn set_body(&mut self, body: ImmutableString) {
        self.view.lock().set_body_string(body.as_str());
    }

    fn headers(&mut self) -> Map {
        string_map(self.view.lock().headers.iter())
    }

    fn params(&mut self) -> Map {
        string_map(self.view.lock().query.iter())
    }

    fn header(&mut self, name: &str) -> Dynamic {
        self.view
            .lock()
            .header(name)
            .map_or(Dynamic::UNIT, |v| Dynamic::from(v.to_string()))
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.view.lock().set_header(name, value);
    }

    fn remove_header(&mut self, name: &str) {
        self.view.lock().remove_header(name);
    }

    fn param(&mut self, name: &str) -> Dynamic {
        self.view
            .lock()
            .param(name)
            .map_or(Dynamic::UNIT, |v| Dynamic::from(v.to_string()))
    }

    fn set_param(&mut self, name: &str, value: &str) {
        self.view
            .lock()
            .query
            .insert(name.to_string(), value.to_string());
    }

    fn remove_param(&mut self, name: &str) {
        self.view.lock().query.remove(name);
    }

    fn json(&mut self) -> RhaiResult<Dynamic> {
        let body = self.view.lock().body_string();
        parse_json(&body)
    }

    fn set_json(&mut self, value: Dynamic) -> RhaiResult<()> {
        let json: serde_json::Value = rhai::serde::from_dynamic(&value)?;
        self.view.lock().set_body_json(&json);
        Ok(())
    }
}

/// Live response handle passed to scripts as `res`
#[derive(Debug, Clone)]
pub(crate) struct ScriptResponse {
    bridge: Arc<ChainBridge>,
}

impl ScriptResponse {
    pub(crate) fn new(bridge: Arc<ChainBridge>) -> Self {
        Self { bridge }
    }

    fn sink(&self) -> RhaiResult<SharedResponse> {
        if self.bridge.state() == ChainState::Ran {
            return Err(runtime_error(
                "response was already produced by the handler chain",
            ));
        }
        Ok(self.bridge.response().clone())
    }

    fn status(&mut self) -> i64 {
        i64::from(self.bridge.response().status().as_u16())
    }

    fn set_status(&mut self, code: i64) -> RhaiResult<()> {
        let status = status_code(code)?;
        self.sink()?.set_status(status, None);
        Ok(())
    }

    fn header(&mut self, name: &str) -> Dynamic {
        header_value(self.bridge.response(), name)
    }

    fn set_header(&mut self, name: &str, value: &str) -> RhaiResult<()> {
        let (name, value) = header_pair(name, value)?;
        self.sink()?.set_header(name, value);
        Ok(())
    }

    fn add_header(&mut self, name: &str, value: &str) -> RhaiResult<()> {
        let (name, value) = header_pair(name, value)?;
        self.sink()?.append_header(name, value);
        Ok(())
    }

    fn add_cookie(&mut self, cookie: &str) -> RhaiResult<()> {
        let (_, value) = header_pair("set-cookie", cookie)?;
        self.sink()?.add_cookie(value);
        Ok(())
    }

    fn content_type(&mut self) -> ImmutableString {
        self.bridge
            .response()
            .content_type()
            .unwrap_or_default()
            .into()
    }

    fn set_content_type(&mut self, content_type: ImmutableString) -> RhaiResult<()> {
        self.set_header("content-type", &content_type)
    }

    fn write(&mut self, text: &str) -> RhaiResult<()> {
        self.sink()?.print(text).map_err(core_error)
    }

    fn send_error(&mut self, code: i64) -> RhaiResult<()> {
        let status = status_code(code)?;
        self.sink()?.send_error(status, None).map_err(core_error)
    }

    fn send_error_with(&mut self, code: i64, message: &str) -> RhaiResult<()> {
        let status = status_code(code)?;
        self.sink()?
            .send_error(status, Some(message))
            .map_err(core_error)
    }

    fn flush(&mut self) -> RhaiResult<()> {
        self.sink()?.flush().map_err(core_error)
    }

    fn committed(&mut self) -> bool {
        self.bridge.response().is_committed()
    }
}

/// Handler-chain handle passed to scripts as `chain`
#[derive(Debug, Clone)]
pub(crate) struct ScriptChain {
    bridge: Arc<ChainBridge>,
}

impl ScriptChain {
    pub(crate) fn new(bridge: Arc<ChainBridge>) -> Self {
        Self { bridge }
    }

    fn run(&mut self) -> RhaiResult<()> {
        self.bridge.run_chain().map_err(to_rhai)
    }

    fn capture(&mut self) -> RhaiResult<ScriptBuffer> {
        self.bridge
            .capture_chain()
            .map(ScriptBuffer::new)
            .map_err(to_rhai)
    }

    fn forward_with(&mut self, capture: Option<bool>) -> RhaiResult<Dynamic> {
        match self.bridge.forward(capture).map_err(to_rhai)? {
            Some(buffer) => Ok(Dynamic::from(ScriptBuffer::new(buffer))),
            None => Ok(Dynamic::UNIT),
        }
    }

    fn forward(&mut self) -> RhaiResult<Dynamic> {
        self.forward_with(None)
    }

    fn forward_capture(&mut self, capture: bool) -> RhaiResult<Dynamic> {
        self.forward_with(Some(capture))
    }

    fn used(&mut self) -> bool {
        self.bridge.is_used()
    }
}

/// Captured chain output passed back to scripts as `Buffer`
#[derive(Debug, Clone)]
pub(crate) struct ScriptBuffer {
    inner: Arc<Mutex<ResponseBuffer<SharedResponse>>>,
}

impl ScriptBuffer {
    fn new(buffer: ResponseBuffer<SharedResponse>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(buffer)),
        }
    }

    fn status(&mut self) -> i64 {
        i64::from(self.inner.lock().status().as_u16())
    }

    fn set_status(&mut self, code: i64) -> RhaiResult<()> {
        let status = status_code(code)?;
        self.inner.lock().set_status(status, None);
        Ok(())
    }

    fn status_message(&mut self) -> String {
        self.inner.lock().status_message().to_string()
    }

    fn body(&mut self) -> ImmutableString {
        self.inner.lock().body().into()
    }

    fn set_body(&mut self, body: ImmutableString) -> RhaiResult<()> {
        self.inner.lock().set_body(&body).map_err(core_error)
    }

    fn header(&mut self, name: &str) -> Dynamic {
        header_value(&*self.inner.lock(), name)
    }

    fn set_header(&mut self, name: &str, value: &str) -> RhaiResult<()> {
        let (name, value) = header_pair(name, value)?;
        self.inner.lock().set_header(name, value);
        Ok(())
    }

    fn content_type(&mut self) -> ImmutableString {
        self.inner.lock().content_type().unwrap_or_default().into()
    }

    fn set_content_type(&mut self, content_type: ImmutableString) -> RhaiResult<()> {
        self.set_header("content-type", &content_type)
    }

    fn buffering(&mut self) -> bool {
        self.inner.lock().is_buffering()
    }

    fn set_buffering(&mut self, active: bool) -> RhaiResult<()> {
        self.inner.lock().set_buffering(active).map_err(core_error)
    }

    fn write(&mut self, text: &str) -> RhaiResult<()> {
        self.inner.lock().print(text).map_err(core_error)
    }

    fn send_error(&mut self, code: i64) -> RhaiResult<()> {
        let status = status_code(code)?;
        self.inner
            .lock()
            .send_error(status, None)
            .map_err(core_error)
    }

    fn flush(&mut self) -> RhaiResult<()> {
        self.inner.lock().flush().map_err(core_error)
    }

    fn release(&mut self) -> RhaiResult<()> {
        self.inner.lock().release().map_err(core_error)
    }

    fn json(&mut self) -> RhaiResult<Dynamic> {
        let body = self.inner.lock().body();
        parse_json(&body)
    }

    fn set_json(&mut self, value: Dynamic) -> RhaiResult<()> {
        let body = to_json(value)?;
        self.set_body(body.into())
    }
}

/// Register every script-facing type and function
pub(crate) fn register(engine: &mut Engine) {
    engine
        .register_type_with_name::<Signal>("Signal")
        .register_fn("to_string", |signal: &mut Signal| signal.name().to_string());

    engine
        .register_type_with_name::<ScriptRequest>("Request")
        .register_get_set("method", ScriptRequest::method, ScriptRequest::set_method)
        .register_get_set("path", ScriptRequest::path, ScriptRequest::set_path)
        .register_get_set("body", ScriptRequest::body, ScriptRequest::set_body)
        .register_get("uri", ScriptRequest::uri)
        .register_get("query_string", ScriptRequest::query_string)
        .register_get("version", ScriptRequest::version)
        .register_get("headers", ScriptRequest::headers)
        .register_get("params", ScriptRequest::params)
        .register_fn("header", ScriptRequest::header)
        .register_fn("set_header", ScriptRequest::set_header)
        .register_fn("remove_header", ScriptRequest::remove_header)
        .register_fn("param", ScriptRequest::param)
        .register_fn("set_param", ScriptRequest::set_param)
        .register_fn("remove_param", ScriptRequest::remove_param)
        .register_fn("json", ScriptRequest::json)
        .register_fn("set_json", ScriptRequest::set_json);

    engine
        .register_type_with_name::<ScriptResponse>("Response")
        .register_get_set("status", ScriptResponse::status, ScriptResponse::set_status)
        .register_get_set(
            "content_type",
            ScriptResponse::content_type,
            ScriptResponse::set_content_type,
        )
        .register_get("committed", ScriptResponse::committed)
        .register_fn("header", ScriptResponse::header)
        .register_fn("set_header", ScriptResponse::set_header)
        .register_fn("add_header", ScriptResponse::add_header)
        .register_fn("add_cookie", ScriptResponse::add_cookie)
        .register_fn("write", ScriptResponse::write)
        .register_fn("send_error", ScriptResponse::send_error)
        .register_fn("send_error", ScriptResponse::send_error_with)
        .register_fn("flush", ScriptResponse::flush);

    engine
        .register_type_with_name::<ScriptChain>("Chain")
        .register_get("used", ScriptChain::used)
        .register_fn("run", ScriptChain::run)
        .register_fn("capture", ScriptChain::capture)
        .register_fn("forward", ScriptChain::forward)
        .register_fn("forward", ScriptChain::forward_capture);

    engine
        .register_type_with_name::<ScriptBuffer>("Buffer")
        .register_get_set("status", ScriptBuffer::status, ScriptBuffer::set_status)
        .register_get_set("body", ScriptBuffer::body, ScriptBuffer::set_body)
        .register_get_set(
            "buffering",
            ScriptBuffer::buffering,
            ScriptBuffer::set_buffering,
        )
        .register_get_set(
            "content_type",
            ScriptBuffer::content_type,
            ScriptBuffer::set_content_type,
        )
        .register_get("status_message", ScriptBuffer::status_message)
        .register_fn("header", ScriptBuffer::header)
        .register_fn("set_header", ScriptBuffer::set_header)
        .register_fn("write", ScriptBuffer::write)
        .register_fn("send_error", ScriptBuffer::send_error)
        .register_fn("flush", ScriptBuffer::flush)
        .register_fn("release", ScriptBuffer::release)
        .register_fn("json", ScriptBuffer::json)
        .register_fn("set_json", ScriptBuffer::set_json);

    engine.register_fn("unhandled", || -> RhaiResult<()> {
        Err(throw(Dynamic::from(Signal::Unhandled)))
    });

    engine
        .register_fn("parse_json", parse_json)
        .register_fn("to_json", to_json)
        .register_fn("format_json", format_json);

    engine.register_fn("base64_encode", |s: &str| -> String {
        general_purpose::STANDARD.encode(s.as_bytes())
    });

    engine.register_fn("base64_decode", |s: &str| -> String {
        general_purpose::STANDARD
            .decode(s.as_bytes())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_default()
    });

    engine.register_fn("unix_time", || -> i64 { chrono::Utc::now().timestamp() });

    engine.register_fn("uuid", || -> String { uuid::Uuid::new_v4().to_string() });

    // Logging (for debugging scripts)
    engine.register_fn("log_debug", |msg: &str| {
        debug!(script_log = msg);
    });

    engine.register_fn("log_info", |msg: &str| {
        info!(script_log = msg);
    });

    engine.register_fn("log_warn", |msg: &str| {
        warn!(script_log = msg);
    });

    engine.register_fn("log_error", |msg: &str| {
        error!(script_log = msg);
    });
}

/// The signal carried by a thrown value, if it is one
pub(crate) fn signal_of(value: &Dynamic) -> Option<Signal> {
    value.clone().try_cast::<Signal>()
}

/// Describe a thrown value for diagnostics
///
/// Maps thrown as `#{type, message}` read as `type: message`.
pub(crate) fn describe_thrown(value: &Dynamic) -> String {
    if let Some(map) = value.read_lock::<Map>() {
        if let Some(message) = map.get("message") {
            return match map.get("type") {
                Some(kind) => format!("{}: {}", kind, message),
                None => message.to_string(),
            };
        }
    }
    value.to_string()
}

/// Write an entry function's return value to the live response
///
/// A returned buffer is released. A string or a `#{status, headers, body}`
/// map is written when the handler chain has not been used and nothing
/// has been committed yet.
pub(crate) fn write_return_value(value: Dynamic, bridge: &ChainBridge) -> Result<(), ScriptError> {
    if let Some(buffer) = value.clone().try_cast::<ScriptBuffer>() {
        return buffer
            .inner
            .lock()
            .release()
            .map_err(|e| ScriptError::chain(e.to_string()));
    }
    if value.is_unit() {
        return Ok(());
    }
    if bridge.is_used() {
        debug!(
            value_type = value.type_name(),
            "Ignoring return value, response came from the handler chain"
        );
        return Ok(());
    }

    let mut sink = bridge.response().clone();
    if sink.is_committed() {
        warn!(
            value_type = value.type_name(),
            "Ignoring return value, response already committed"
        );
        return Ok(());
    }

    let write = |sink: &mut SharedResponse, text: &str| {
        sink.print(text)
            .map_err(|e| ScriptError::runtime(e.to_string()))
    };

    if value.is_string() {
        let text = value.into_string().map_err(ScriptError::type_error)?;
        return write(&mut sink, &text);
    }

    let Some(map) = value.clone().try_cast::<Map>() else {
        debug!(value_type = value.type_name(), "Ignoring script return value");
        return Ok(());
    };

    if let Some(status) = map.get("status") {
        let code = status
            .as_int()
            .map_err(|t| ScriptError::type_error(format!("status must be an integer, got {}", t)))?;
        let status = status_code(code).map_err(|e| ScriptError::type_error(e.to_string()))?;
        sink.set_status(status, None);
    }

    if let Some(headers) = map.get("headers").and_then(|h| h.clone().try_cast::<Map>()) {
        for (name, value) in headers {
            let values = match value.clone().try_cast::<rhai::Array>() {
                Some(values) => values,
                None => vec![value],
            };
            for value in values {
                let (name, value) = header_pair(&name, &value.to_string())
                    .map_err(|e| ScriptError::type_error(e.to_string()))?;
                sink.append_header(name, value);
            }
        }
    }

    match map.get("body") {
        Some(body) if body.is_array() => {
            for part in body.clone().cast::<rhai::Array>() {
                write(&mut sink, &part.to_string())?;
            }
        }
        Some(body) if !body.is_unit() => write(&mut sink, &body.to_string())?,
        _ => {}
    }

    Ok(())
}
