//! # Sluice Scripting
//!
//! Hot-reloadable script interception in front of a handler chain.
//!
//! Each request is handed to an entry function in a Rhai script. The script
//! can answer the request itself, run the downstream chain and rewrite its
//! captured output, or decline the request with `unhandled()`.
//!
//! ## Features
//!
//! - Module search path with per-engine AST caching
//! - Reload on change of a watched file or directory, without blocking
//!   in-flight requests
//! - Failed reloads keep the previous engine serving
//! - Capturing response buffer for rewriting downstream output
//! - HTML diagnostic page for script failures
//!
//! ## Example
//!
//! ```no_run
//! use sluice_scripting::prelude::*;
//! use std::sync::Arc;
//!
//! let config = InterceptConfig::new("/srv/app/scripts");
//! let manager = Arc::new(EngineLifecycleManager::with_rhai(config));
//! manager.start();
//! let dispatcher = InterceptDispatcher::new(manager);
//! # let _ = dispatcher;
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod api;
pub mod bridge;
pub mod buffer;
pub mod config;
pub mod context;
pub mod diagnostic;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod rhai_engine;

pub use bridge::{chain_fn, ChainBridge, ChainState, HandlerChain};
pub use buffer::ResponseBuffer;
pub use config::{ConfigFormat, EngineSettings, InterceptConfig};
pub use context::{InterceptOutcome, InterceptionContext, RequestView};
pub use dispatcher::{DispatchSnapshot, DispatchStats, InterceptDispatcher};
pub use engine::{
    CacheStats, EngineFactory, EngineHandle, ModificationMarker, ScriptEngine, ScriptLanguage,
    WatchedPath,
};
pub use error::{InterceptError, Result, ScriptError};
pub use lifecycle::{
    EngineLifecycleManager, LifecycleEvent, LifecycleEventKind, RebuildOutcome,
};
pub use rhai_engine::{RhaiEngine, RhaiEngineFactory};

/// Prelude with commonly used types
pub mod prelude {
    pub use crate::bridge::{chain_fn, HandlerChain};
    pub use crate::config::InterceptConfig;
    pub use crate::context::InterceptOutcome;
    pub use crate::dispatcher::InterceptDispatcher;
    pub use crate::error::{InterceptError, Result, ScriptError};
    pub use crate::lifecycle::EngineLifecycleManager;
}
