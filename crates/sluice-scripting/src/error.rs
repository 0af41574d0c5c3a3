//! Script execution and interception error types

use std::fmt;
use std::path::PathBuf;

/// Script execution result type
pub type Result<T> = std::result::Result<T, ScriptError>;

/// Script execution error
#[derive(Debug, Clone)]
pub enum ScriptError {
    /// Script compilation/parsing error
    CompilationError {
        /// Error message
        message: String,
        /// Script file the error was found in
        script: Option<String>,
        /// Line number if available
        line: Option<usize>,
        /// Column number if available
        column: Option<usize>,
    },

    /// Script runtime error
    RuntimeError {
        /// Error message
        message: String,
        /// Script file where the error occurred
        script: Option<String>,
        /// Script line where error occurred
        line: Option<usize>,
        /// Script call stack, innermost frame first
        stack: Vec<String>,
    },

    /// The script declined the request
    Unhandled,

    /// The handler chain was invoked more than once for one request
    ChainAlreadyInvoked,

    /// The handler chain failed while the script was running it
    Chain {
        /// Error message
        message: String,
    },

    /// No module root contains the requested module
    ModuleNotFound {
        /// Module identifier
        module: String,
        /// Roots that were searched
        searched: Vec<PathBuf>,
    },

    /// The entry module does not define the entry function
    FunctionNotFound {
        /// Module identifier
        module: String,
        /// Function name
        function: String,
    },

    /// Invalid script source or engine home
    InvalidSource {
        /// Error message
        message: String,
    },

    /// Script execution panic
    Panic {
        /// Panic message
        message: String,
    },

    /// Type conversion error
    TypeError {
        /// Error message
        message: String,
    },
}

impl ScriptError {
    /// Create a compilation error
    pub fn compilation<S: Into<String>>(message: S) -> Self {
        Self::CompilationError {
            message: message.into(),
            script: None,
            line: None,
            column: None,
        }
    }

    /// Create a runtime error
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::RuntimeError {
            message: message.into(),
            script: None,
            line: None,
            stack: Vec::new(),
        }
    }

    /// Create a handler chain error
    pub fn chain<S: Into<String>>(message: S) -> Self {
        Self::Chain {
            message: message.into(),
        }
    }

    /// Create an invalid source error
    pub fn invalid_source<S: Into<String>>(message: S) -> Self {
        Self::InvalidSource {
            message: message.into(),
        }
    }

    /// Create a panic error
    pub fn panic<S: Into<String>>(message: S) -> Self {
        Self::Panic {
            message: message.into(),
        }
    }

    /// Create a type error
    pub fn type_error<S: Into<String>>(message: S) -> Self {
        Self::TypeError {
            message: message.into(),
        }
    }

    /// Whether this is the script's "no route for this request" signal
    pub fn is_unhandled(&self) -> bool {
        matches!(self, Self::Unhandled)
    }

    /// The bare failure message, without location decoration
    pub fn message(&self) -> String {
        match self {
            Self::CompilationError { message, .. }
            | Self::RuntimeError { message, .. }
            | Self::Chain { message }
            | Self::InvalidSource { message }
            | Self::Panic { message }
            | Self::TypeError { message } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Script file and line the error points at, if known
    pub fn location(&self) -> Option<(Option<&str>, usize)> {
        match self {
            Self::CompilationError {
                script,
                line: Some(line),
                ..
            }
            | Self::RuntimeError {
                script,
                line: Some(line),
                ..
            } => Some((script.as_deref(), *line)),
            _ => None,
        }
    }

    /// Script call stack, innermost frame first
    pub fn stack(&self) -> &[String] {
        match self {
            Self::RuntimeError { stack, .. } => stack,
            _ => &[],
        }
    }
}

fn write_location(
    f: &mut fmt::Formatter<'_>,
    script: &Option<String>,
    line: &Option<usize>,
) -> fmt::Result {
    if let Some(script) = script {
        write!(f, " in {}", script)?;
    }
    if let Some(line) = line {
        write!(f, " at line {}", line)?;
    }
    Ok(())
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CompilationError {
                message,
                script,
                line,
                column,
            } => {
                write!(f, "Script compilation error: {}", message)?;
                write_location(f, script, line)?;
                if let (Some(_), Some(col)) = (line, column) {
                    write!(f, ", column {}", col)?;
                }
                Ok(())
            }
            Self::RuntimeError {
                message,
                script,
                line,
                ..
            } => {
                write!(f, "Script runtime error: {}", message)?;
                write_location(f, script, line)
            }
            Self::Unhandled => write!(f, "Unhandled request"),
            Self::ChainAlreadyInvoked => {
                write!(f, "Handler chain already invoked for this request")
            }
            Self::Chain { message } => write!(f, "Handler chain error: {}", message),
            Self::ModuleNotFound { module, searched } => {
                write!(f, "Script module '{}' not found in {:?}", module, searched)
            }
            Self::FunctionNotFound { module, function } => {
                write!(
                    f,
                    "Script module '{}' does not define function '{}'",
                    module, function
                )
            }
            Self::InvalidSource { message } => {
                write!(f, "Invalid script source: {}", message)
            }
            Self::Panic { message } => write!(f, "Script panic: {}", message),
            Self::TypeError { message } => write!(f, "Script type error: {}", message),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Interception failure taxonomy
#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    /// The engine could not be constructed
    #[error("Engine initialization failed: {0}")]
    EngineInit(ScriptError),

    /// The script declined the request
    #[error("Unhandled request")]
    UnhandledRequest,

    /// Any other failure raised while invoking the script
    #[error("{0}")]
    ScriptExecution(ScriptError),

    /// The handler chain was invoked twice for one request
    #[error("Handler chain invoked more than once for one request")]
    DoubleInvocation,

    /// The diagnostic page itself could not be produced
    #[error("Failed to render diagnostic page for '{cause}': {message}")]
    DiagnosticRender {
        /// Why rendering failed
        message: String,
        /// The failure that was being reported
        cause: String,
    },
}

impl From<ScriptError> for InterceptError {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::Unhandled => Self::UnhandledRequest,
            ScriptError::ChainAlreadyInvoked => Self::DoubleInvocation,
            other => Self::ScriptExecution(other),
        }
    }
}

impl From<InterceptError> for sluice_core::Error {
    fn from(err: InterceptError) -> Self {
        sluice_core::Error::Processing(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_display_includes_location() {
        let err = ScriptError::RuntimeError {
            message: "boom".to_string(),
            script: Some("app/config.rhai".to_string()),
            line: Some(12),
            stack: vec!["app".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Script runtime error: boom in app/config.rhai at line 12"
        );
        assert_eq!(err.location(), Some((Some("app/config.rhai"), 12)));
        assert_eq!(err.message(), "boom");
    }

    #[test]
    fn test_classification() {
        assert!(matches!(
            InterceptError::from(ScriptError::Unhandled),
            InterceptError::UnhandledRequest
        ));
        assert!(matches!(
            InterceptError::from(ScriptError::ChainAlreadyInvoked),
            InterceptError::DoubleInvocation
        ));
        assert!(matches!(
            InterceptError::from(ScriptError::runtime("boom")),
            InterceptError::ScriptExecution(ScriptError::RuntimeError { .. })
        ));
    }
}
