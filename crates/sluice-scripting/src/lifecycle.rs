//! Engine lifecycle: lazy construction, staleness checks and rebuilds
//!
//! The manager owns the current [`EngineHandle`] behind an [`ArcSwapOption`],
//! so readers never block and never observe a half-built handle. Rebuilds
//! are serialized by a mutex that is only ever `try_lock`ed on the request
//! path: the request that wins performs the rebuild, everyone else keeps
//! serving from the handle they already read.

use crate::config::InterceptConfig;
use crate::engine::{EngineFactory, EngineHandle, ModificationMarker, WatchedPath};
use crate::error::{InterceptError, ScriptError};
use crate::rhai_engine::RhaiEngineFactory;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Lifecycle transition published to subscribers
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    /// What happened
    pub kind: LifecycleEventKind,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}

/// Kind of lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEventKind {
    /// The first handle was constructed
    Constructed {
        /// Generation of the new handle
        generation: u64,
    },
    /// A stale handle was replaced
    Rebuilt {
        /// Generation of the replaced handle
        previous: u64,
        /// Generation of the new handle
        generation: u64,
    },
    /// Construction failed
    InitFailed {
        /// Generation still serving, if any
        serving: Option<u64>,
        /// Failure message
        error: String,
    },
}

/// Result of one staleness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// No handle yet, or the watched path is unchanged
    Unchanged,
    /// Reload checks are off (production mode or nothing to watch)
    Disabled,
    /// Another request is rebuilding; the current handle keeps serving
    Busy,
    /// A rebuild already failed for this marker; waiting for a new deployment
    Suppressed,
    /// The handle was replaced
    Rebuilt {
        /// Generation of the replaced handle
        previous: u64,
        /// Generation of the new handle
        generation: u64,
    },
    /// The rebuild failed; the previous handle keeps serving
    Failed,
}

/// Remembered construction failure
#[derive(Debug)]
struct FailedInit {
    watched: Option<PathBuf>,
    marker: Option<ModificationMarker>,
    error: ScriptError,
}

impl FailedInit {
    /// Whether the watched path changed since the failure
    fn retry_due(&self) -> bool {
        match &self.watched {
            Some(path) => ModificationMarker::read(path) != self.marker,
            None => false,
        }
    }
}

/// Owns the engine handle shared by all dispatchers of one interceptor
pub struct EngineLifecycleManager {
    config: InterceptConfig,
    factory: Arc<dyn EngineFactory>,
    current: ArcSwapOption<EngineHandle>,
    failed: ArcSwapOption<FailedInit>,
    rebuild_lock: Mutex<()>,
    generation: AtomicU64,
    events: broadcast::Sender<LifecycleEvent>,
}

impl EngineLifecycleManager {
    /// Create a manager building engines with `factory`
    pub fn new(config: InterceptConfig, factory: Arc<dyn EngineFactory>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            factory,
            current: ArcSwapOption::empty(),
            failed: ArcSwapOption::empty(),
            rebuild_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            events,
        }
    }

    /// Create a manager for Rhai scripts
    pub fn with_rhai(config: InterceptConfig) -> Self {
        Self::new(config, Arc::new(RhaiEngineFactory))
    }

    /// The configuration this manager was created with
    pub fn config(&self) -> &InterceptConfig {
        &self.config
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Construct the first handle now when `loadOnStartup` is set
    ///
    /// A failure is logged and leaves interception disabled; it never aborts
    /// startup.
    pub fn start(&self) {
        if !self.config.load_on_startup {
            debug!(interceptor = %self.config.name, "Deferring engine construction to first request");
            return;
        }
        if let Err(e) = self.current_handle() {
            warn!(interceptor = %self.config.name, error = %e, "Engine not available at startup");
        }
    }

    /// Whether interception is currently disabled
    ///
    /// True only after construction failed with no handle ever built, and
    /// the watched path has not changed since.
    pub fn is_disabled(&self) -> bool {
        if self.current.load().is_some() {
            return false;
        }
        match self.failed.load().as_deref() {
            Some(failed) => !failed.retry_due(),
            None => false,
        }
    }

    /// The handle currently serving, if one was ever built
    pub fn peek(&self) -> Option<Arc<EngineHandle>> {
        self.current.load_full()
    }

    /// The READY handle, constructing it first when there is none
    pub fn current_handle(&self) -> Result<Arc<EngineHandle>, InterceptError> {
        match self.current.load_full() {
            Some(handle) => Ok(handle),
            None => self.construct(),
        }
    }

    fn construct(&self) -> Result<Arc<EngineHandle>, InterceptError> {
        // Requests arriving before the first handle exists have nothing to
        // serve from, so they wait here instead of racing.
        let _guard = self.rebuild_lock.lock();
        if let Some(handle) = self.current.load_full() {
            return Ok(handle);
        }
        if let Some(failed) = self.failed.load_full() {
            if !failed.retry_due() {
                return Err(InterceptError::EngineInit(failed.error.clone()));
            }
            info!(interceptor = %self.config.name, "Watched path changed since failed start, retrying");
        }

        match self.build_handle() {
            Ok(handle) => {
                info!(
                    interceptor = %self.config.name,
                    generation = handle.generation(),
                    module = handle.module(),
                    "Script engine constructed"
                );
                self.current.store(Some(Arc::clone(&handle)));
                self.failed.store(None);
                self.emit(LifecycleEventKind::Constructed {
                    generation: handle.generation(),
                });
                Ok(handle)
            }
            Err(failure) => {
                error!(
                    interceptor = %self.config.name,
                    error = %failure.error,
                    "Script engine failed to initialize; interception disabled"
                );
                let err = failure.error.clone();
                self.record_failure(failure, None);
                Err(InterceptError::EngineInit(err))
            }
        }
    }

    /// Rebuild the engine when the watched path changed
    pub fn check_and_maybe_rebuild(&self) -> RebuildOutcome {
        if !self.config.reload_enabled() {
            return RebuildOutcome::Disabled;
        }
        let Some(current) = self.current.load_full() else {
            return RebuildOutcome::Unchanged;
        };
        if current.watched().is_none() {
            return RebuildOutcome::Disabled;
        }
        if !current.is_stale() {
            return RebuildOutcome::Unchanged;
        }

        let Some(_guard) = self.rebuild_lock.try_lock() else {
            debug!(generation = current.generation(), "Rebuild in progress, serving current engine");
            return RebuildOutcome::Busy;
        };

        // Another request may have swapped the handle while we checked.
        let Some(current) = self.current.load_full() else {
            return RebuildOutcome::Unchanged;
        };
        if !current.is_stale() {
            return RebuildOutcome::Unchanged;
        }
        if let Some(failed) = self.failed.load_full() {
            if !failed.retry_due() {
                return RebuildOutcome::Suppressed;
            }
        }

        info!(
            generation = current.generation(),
            path = ?current.watched().map(WatchedPath::path),
            "Watched path changed, rebuilding script engine"
        );
        self.rebuild(&current)
    }

    fn rebuild(&self, previous: &EngineHandle) -> RebuildOutcome {
        match self.build_handle() {
            Ok(handle) => {
                let generation = handle.generation();
                self.current.store(Some(handle));
                self.failed.store(None);
                info!(
                    previous = previous.generation(),
                    generation, "Script engine rebuilt, cached scripts invalidated"
                );
                self.emit(LifecycleEventKind::Rebuilt {
                    previous: previous.generation(),
                    generation,
                });
                RebuildOutcome::Rebuilt {
                    previous: previous.generation(),
                    generation,
                }
            }
            Err(failure) => {
                error!(
                    generation = previous.generation(),
                    error = %failure.error,
                    "Script engine rebuild failed; previous engine keeps serving"
                );
                self.record_failure(failure, Some(previous.generation()));
                RebuildOutcome::Failed
            }
        }
    }

    fn build_handle(&self) -> Result<Arc<EngineHandle>, FailedInit> {
        let settings = self.config.engine_settings().map_err(|error| {
            let watched = self.fallback_watch_target();
            FailedInit {
                marker: watched.as_deref().and_then(ModificationMarker::read),
                watched,
                error,
            }
        })?;

        // The marker is read before loading so changes made during
        // construction are seen by the next check.
        let watched_path = self.config.resolve_watched_path(&settings.home);
        let watched = watched_path.clone().and_then(WatchedPath::observe);

        let engine = self.factory.build(&settings).map_err(|error| FailedInit {
            watched: watched_path.clone(),
            marker: watched.as_ref().map(WatchedPath::marker),
            error,
        })?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(EngineHandle::new(
            generation,
            engine,
            settings.module,
            settings.function,
            watched,
        )))
    }

    fn fallback_watch_target(&self) -> Option<PathBuf> {
        let target = match &self.config.watched_path {
            Some(path) => path.clone(),
            None => self.config.home.as_ref()?.parent()?.to_path_buf(),
        };
        Some(target.canonicalize().unwrap_or(target))
    }

    fn record_failure(&self, failure: FailedInit, serving: Option<u64>) {
        self.emit(LifecycleEventKind::InitFailed {
            serving,
            error: failure.error.to_string(),
        });
        self.failed.store(Some(Arc::new(failure)));
    }

    fn emit(&self, kind: LifecycleEventKind) {
        // No subscribers is fine.
        let _ = self.events.send(LifecycleEvent {
            kind,
            timestamp: Utc::now(),
        });
    }
}

impl fmt::Debug for EngineLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineLifecycleManager")
            .field("interceptor", &self.config.name)
            .field("current", &self.current.load().as_deref().map(EngineHandle::generation))
            .field("failed", &self.failed.load().is_some())
            .finish()
    }
}
