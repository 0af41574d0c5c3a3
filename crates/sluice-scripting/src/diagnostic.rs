//! HTML diagnostic page for script failures

use crate::error::{InterceptError, ScriptError};
use askama::Template;
use http::header::HeaderValue;
use http::StatusCode;
use sluice_core::ResponseSink;

#[derive(Template)]
#[template(path = "diagnostic.html")]
struct DiagnosticPage<'a> {
    title: &'a str,
    kind: &'a str,
    location: String,
    details: Vec<String>,
    stack: &'a [String],
}

fn script_error(err: &InterceptError) -> Option<&ScriptError> {
    match err {
        InterceptError::EngineInit(e) | InterceptError::ScriptExecution(e) => Some(e),
        _ => None,
    }
}

fn kind(err: &InterceptError) -> &'static str {
    match err {
        InterceptError::EngineInit(_) => "Engine initialization failure",
        InterceptError::UnhandledRequest => "Unhandled request",
        InterceptError::ScriptExecution(ScriptError::CompilationError { .. }) => {
            "Script compilation failure"
        }
        InterceptError::ScriptExecution(_) => "Script execution failure",
        InterceptError::DoubleInvocation => "Handler chain invoked twice",
        InterceptError::DiagnosticRender { .. } => "Diagnostic render failure",
    }
}

fn details(err: &ScriptError) -> Vec<String> {
    match err {
        ScriptError::CompilationError {
            line: Some(line),
            column: Some(column),
            ..
        } => vec![format!("line {}, column {}", line, column)],
        ScriptError::ModuleNotFound { searched, .. } => searched
            .iter()
            .map(|root| format!("searched {}", root.display()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Render the diagnostic page for a failure
pub fn render_page(err: &InterceptError) -> Result<String, askama::Error> {
    let script = script_error(err);
    let title = match script {
        Some(e) => e.message(),
        None => err.to_string(),
    };
    let location = match script.and_then(ScriptError::location) {
        Some((Some(file), line)) => format!("{} line {}", file, line),
        Some((None, line)) => format!("line {}", line),
        None => String::new(),
    };

    DiagnosticPage {
        title: &title,
        kind: kind(err),
        location,
        details: script.map(details).unwrap_or_default(),
        stack: script.map(ScriptError::stack).unwrap_or_default(),
    }
    .render()
}

/// Replace whatever the response holds with the diagnostic page
///
/// Fails with [`InterceptError::DiagnosticRender`] when the page cannot be
/// rendered or the response was already committed.
pub fn write_page(sink: &mut dyn ResponseSink, err: &InterceptError) -> Result<(), InterceptError> {
    let render_failure = |message: String| InterceptError::DiagnosticRender {
        message,
        cause: err.to_string(),
    };

    let page = render_page(err).map_err(|e| render_failure(e.to_string()))?;
    sink.reset().map_err(|e| render_failure(e.to_string()))?;
    sink.set_status(StatusCode::INTERNAL_SERVER_ERROR, None);
    sink.set_content_type(HeaderValue::from_static("text/html; charset=utf-8"));
    sink.print(&page).map_err(|e| render_failure(e.to_string()))?;
    sink.flush().map_err(|e| render_failure(e.to_string()))
}
