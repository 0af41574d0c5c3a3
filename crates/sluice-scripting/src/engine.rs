//! Script engine trait and engine handles

use crate::config::EngineSettings;
use crate::context::InterceptionContext;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Supported scripting languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    /// Rhai scripting language
    Rhai,
}

impl ScriptLanguage {
    /// Get file extension for this language
    pub fn extension(&self) -> &str {
        match self {
            Self::Rhai => "rhai",
        }
    }

    /// Detect language from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "rhai" => Some(Self::Rhai),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rhai => write!(f, "rhai"),
        }
    }
}

/// Script engine trait
///
/// One instance holds a loaded scripting runtime. Invocation is synchronous:
/// the dispatcher runs it on a blocking thread so the script may call back
/// into the async handler chain.
pub trait ScriptEngine: Send + Sync + fmt::Debug {
    /// Get the language this engine supports
    fn language(&self) -> ScriptLanguage;

    /// Compile/prepare a module ahead of the first invocation
    fn prepare(&self, module: &str) -> Result<()> {
        let _ = module;
        Ok(())
    }

    /// Invoke `function` from `module` for one request
    ///
    /// Returning `ScriptError::Unhandled` declines the request.
    fn invoke(&self, module: &str, function: &str, ctx: &InterceptionContext) -> Result<()>;

    /// Get cache statistics (compiled scripts, hit rate, etc.)
    fn cache_stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Builds engine instances from resolved settings
pub trait EngineFactory: Send + Sync + fmt::Debug {
    /// Construct a fully loaded engine
    fn build(&self, settings: &EngineSettings) -> Result<Arc<dyn ScriptEngine>>;
}

/// Cache statistics for script engines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of compiled scripts in cache
    pub cached_scripts: usize,
    /// Cache hits
    pub hits: u64,
    /// Cache misses
    pub misses: u64,
}

impl CacheStats {
    /// Get cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Last-modification marker of a watched path
///
/// Markers are compared for equality only: a rollback to an older time is a
/// change like any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModificationMarker(SystemTime);

impl ModificationMarker {
    /// Read the current marker, `None` when the path cannot be inspected
    pub fn read(path: &Path) -> Option<Self> {
        fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .map(Self)
    }
}

/// A resolved watched path with the marker observed before construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedPath {
    path: PathBuf,
    marker: ModificationMarker,
}

impl WatchedPath {
    /// Pair a path with its observed marker
    pub fn new(path: PathBuf, marker: ModificationMarker) -> Self {
        Self { path, marker }
    }

    /// Read the marker of `path` now
    pub fn observe(path: PathBuf) -> Option<Self> {
        let marker = ModificationMarker::read(&path)?;
        Some(Self { path, marker })
    }

    /// The watched path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored marker
    pub fn marker(&self) -> ModificationMarker {
        self.marker
    }

    /// Whether a fresh read differs from the stored marker
    ///
    /// A path that can no longer be read is not treated as a change.
    pub fn has_changed(&self) -> bool {
        ModificationMarker::read(&self.path).map_or(false, |current| current != self.marker)
    }
}

/// One loaded engine plus its staleness metadata
///
/// Handles are immutable. A rebuild produces a new handle; requests already
/// holding the old one finish against it.
pub struct EngineHandle {
    generation: u64,
    engine: Arc<dyn ScriptEngine>,
    module: String,
    function: String,
    watched: Option<WatchedPath>,
    created_at: DateTime<Utc>,
}

impl EngineHandle {
    /// Wrap a constructed engine
    pub fn new(
        generation: u64,
        engine: Arc<dyn ScriptEngine>,
        module: impl Into<String>,
        function: impl Into<String>,
        watched: Option<WatchedPath>,
    ) -> Self {
        Self {
            generation,
            engine,
            module: module.into(),
            function: function.into(),
            watched,
            created_at: Utc::now(),
        }
    }

    /// Construction sequence number, unique per manager
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The engine instance
    pub fn engine(&self) -> &Arc<dyn ScriptEngine> {
        &self.engine
    }

    /// Entry module identifier
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Entry function identifier
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Watched path and marker, when reload detection is active
    pub fn watched(&self) -> Option<&WatchedPath> {
        self.watched.as_ref()
    }

    /// When the handle was constructed
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the watched path changed since this handle was built
    pub fn is_stale(&self) -> bool {
        self.watched.as_ref().map_or(false, WatchedPath::has_changed)
    }

    /// Invoke the entry function for one request
    pub fn invoke(&self, ctx: &InterceptionContext) -> Result<()> {
        self.engine.invoke(&self.module, &self.function, ctx)
    }

    /// Cache statistics of the engine
    pub fn cache_stats(&self) -> CacheStats {
        self.engine.cache_stats()
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("generation", &self.generation)
            .field("language", &self.engine.language())
            .field("module", &self.module)
            .field("function", &self.function)
            .field("watched", &self.watched.as_ref().map(WatchedPath::path))
            .field("created_at", &self.created_at)
            .finish()
    }
}
