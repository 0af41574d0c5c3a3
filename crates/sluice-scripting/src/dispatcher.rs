//! Request interception in front of a handler chain
//!
//! [`InterceptDispatcher`] hands each request to the current engine handle.
//! The script may produce the response itself, wrap the chain's output, or
//! decline the request; declined requests and requests arriving while the
//! engine is unavailable go to the chain untouched. Script failures are
//! answered with a diagnostic page.

use crate::bridge::{ChainBridge, ChainState, HandlerChain};
use crate::context::{InterceptOutcome, InterceptionContext};
use crate::diagnostic;
use crate::error::{InterceptError, ScriptError};
use crate::lifecycle::EngineLifecycleManager;
use async_trait::async_trait;
use http::{Request, Response};
use http_body_util::BodyExt;
use serde::Serialize;
use sluice_core::{Body, Error, Middleware, Next, ResponseSink, Result, SharedResponse};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{debug, error, trace, warn};

type Invocation = (
    Option<Arc<InterceptionContext>>,
    std::result::Result<(), InterceptError>,
);

/// Per-outcome request counters
#[derive(Debug, Default)]
pub struct DispatchStats {
    engine_handled: AtomicU64,
    captured: AtomicU64,
    delegated: AtomicU64,
    passthrough: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    /// Responses produced by the script
    pub engine_handled: u64,
    /// Responses produced by the script from captured chain output
    pub captured: u64,
    /// Requests handed to the chain, passthrough included
    pub delegated: u64,
    /// Requests handed to the chain because no engine was available
    pub passthrough: u64,
    /// Requests answered with a diagnostic page
    pub errors: u64,
}

impl DispatchStats {
    fn record(&self, outcome: InterceptOutcome) {
        let counter = match outcome {
            InterceptOutcome::EngineHandled => &self.engine_handled,
            InterceptOutcome::EngineHandledViaCapture => &self.captured,
            InterceptOutcome::Delegated => &self.delegated,
            InterceptOutcome::Error => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of the counters
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            engine_handled: self.engine_handled.load(Ordering::Relaxed),
            captured: self.captured.load(Ordering::Relaxed),
            delegated: self.delegated.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Interceptor sitting in front of a handler chain
#[derive(Clone)]
pub struct InterceptDispatcher {
    manager: Arc<EngineLifecycleManager>,
    stats: Arc<DispatchStats>,
}

impl InterceptDispatcher {
    /// Create a dispatcher over a lifecycle manager
    pub fn new(manager: Arc<EngineLifecycleManager>) -> Self {
        Self {
            manager,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// The lifecycle manager owning the engine handles
    pub fn manager(&self) -> &Arc<EngineLifecycleManager> {
        &self.manager
    }

    /// Snapshot of the outcome counters
    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }

    /// Intercept one request
    ///
    /// Returns the finished response with the outcome that produced it. An
    /// error is returned only when the chain itself failed during delegation
    /// or a failure could not be reported through the diagnostic page.
    pub async fn dispatch(
        &self,
        req: Request<Body>,
        chain: Arc<dyn HandlerChain>,
    ) -> Result<(Response<Body>, InterceptOutcome)> {
        let response = SharedResponse::new();

        if self.manager.is_disabled() {
            trace!(uri = %req.uri(), "Interception disabled, passing request through");
            let mut sink = response.clone();
            chain.handle(req, &mut sink).await?;
            self.stats.passthrough.fetch_add(1, Ordering::Relaxed);
            self.stats.record(InterceptOutcome::Delegated);
            return Ok((response.take_response()?, InterceptOutcome::Delegated));
        }

        let start = Instant::now();
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| Error::InvalidRequest(format!("Failed to read request body: {e:?}")))?
            .to_bytes();
        let bridge = Arc::new(
            ChainBridge::new(
                Request::from_parts(parts, body),
                chain,
                response.clone(),
                Handle::current(),
            )
            .with_capture_param(self.manager.config().capture_param.clone()),
        );

        let (ctx, result) = self.invoke(Arc::clone(&bridge)).await;
        let outcome = self.settle(result, &bridge).await?;
        self.stats.record(outcome);
        if let Some(ctx) = &ctx {
            ctx.settle(outcome);
        }

        debug!(
            interceptor = %self.manager.config().name,
            outcome = %outcome,
            generation = ?ctx.as_ref().map(|ctx| ctx.generation()),
            elapsed_us = start.elapsed().as_micros(),
            "Request intercepted"
        );
        Ok((response.take_response()?, outcome))
    }

    async fn invoke(&self, bridge: Arc<ChainBridge>) -> Invocation {
        let manager = Arc::clone(&self.manager);
        let task = tokio::task::spawn_blocking(move || -> Invocation {
            manager.check_and_maybe_rebuild();
            let handle = match manager.current_handle() {
                Ok(handle) => handle,
                Err(e) => return (None, Err(e)),
            };
            let ctx = Arc::new(InterceptionContext::new(bridge, handle));
            let result = ctx.handle().invoke(&ctx).map_err(InterceptError::from);
            (Some(ctx), result)
        });

        match task.await {
            Ok(invocation) => invocation,
            Err(e) => (
                None,
                Err(InterceptError::ScriptExecution(ScriptError::panic(e.to_string()))),
            ),
        }
    }

    async fn settle(
        &self,
        result: std::result::Result<(), InterceptError>,
        bridge: &ChainBridge,
    ) -> Result<InterceptOutcome> {
        match result {
            Ok(()) if bridge.was_reused() => self.fail(InterceptError::DoubleInvocation, bridge),
            Ok(()) => {
                trace!("Script produced the response");
                Ok(match bridge.state() {
                    ChainState::Captured => InterceptOutcome::EngineHandledViaCapture,
                    _ => InterceptOutcome::EngineHandled,
                })
            }
            Err(InterceptError::UnhandledRequest) => {
                if bridge.is_used() || bridge.response().is_committed() {
                    let err = ScriptError::runtime(
                        "unhandled() raised after the response was already produced",
                    );
                    return self.fail(InterceptError::ScriptExecution(err), bridge);
                }
                debug!("Script declined request, delegating to handler chain");
                let mut sink = bridge.response().clone();
                sink.reset()?;
                bridge.delegate().await?;
                Ok(InterceptOutcome::Delegated)
            }
            Err(InterceptError::EngineInit(e)) => {
                warn!(
                    interceptor = %self.manager.config().name,
                    error = %e,
                    "Script engine unavailable, passing request through"
                );
                bridge.delegate().await?;
                self.stats.passthrough.fetch_add(1, Ordering::Relaxed);
                Ok(InterceptOutcome::Delegated)
            }
            Err(err) => self.fail(err, bridge),
        }
    }

    fn fail(&self, err: InterceptError, bridge: &ChainBridge) -> Result<InterceptOutcome> {
        self.report(&err);
        let mut sink = bridge.response().clone();
        diagnostic::write_page(&mut sink, &err).map_err(|render_err| {
            error!(cause = %err, error = %render_err, "Diagnostic page could not be written");
            Error::from(render_err)
        })?;
        Ok(InterceptOutcome::Error)
    }

    fn report(&self, err: &InterceptError) {
        let name = &self.manager.config().name;
        let script = match err {
            InterceptError::ScriptExecution(e) => e,
            other => {
                error!(interceptor = %name, error = %other, "Interception failed");
                return;
            }
        };

        match script.location() {
            Some((source, line)) => error!(
                interceptor = %name,
                source = source.unwrap_or("<unknown>"),
                line,
                error = %script.message(),
                "Script failed"
            ),
            None => error!(interceptor = %name, error = %script, "Script failed"),
        }
        if self.manager.config().verbose {
            for frame in script.stack() {
                debug!(frame = %frame, "Script stack");
            }
        }
    }
}

impl fmt::Debug for InterceptDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptDispatcher")
            .field("interceptor", &self.manager.config().name)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

#[async_trait]
impl Middleware for InterceptDispatcher {
    async fn call(&self, req: Request<Body>, next: Next) -> Result<Response<Body>> {
        let (response, _) = self.dispatch(req, Arc::new(next)).await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::chain_fn;
    use crate::config::{EngineSettings, InterceptConfig};
    use crate::engine::{EngineFactory, ScriptEngine, ScriptLanguage};
    use bytes::Bytes;
    use http::header::HeaderValue;
    use http::StatusCode;
    use http_body_util::Full;
    use std::sync::atomic::AtomicUsize;

    type Behavior = dyn Fn(&InterceptionContext) -> crate::Result<()> + Send + Sync;

    struct StubEngine {
        behavior: Arc<Behavior>,
    }

    impl fmt::Debug for StubEngine {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("StubEngine")
        }
    }

    impl ScriptEngine for StubEngine {
        fn language(&self) -> ScriptLanguage {
            ScriptLanguage::Rhai
        }

        fn invoke(&self, _: &str, _: &str, ctx: &InterceptionContext) -> crate::Result<()> {
            (self.behavior)(ctx)
        }
    }

    struct StubFactory {
        behavior: Arc<Behavior>,
        fail: bool,
    }

    impl fmt::Debug for StubFactory {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("StubFactory").field("fail", &self.fail).finish()
        }
    }

    impl EngineFactory for StubFactory {
        fn build(&self, _: &EngineSettings) -> crate::Result<Arc<dyn ScriptEngine>> {
            if self.fail {
                return Err(ScriptError::compilation("unexpected end of input"));
            }
            Ok(Arc::new(StubEngine {
                behavior: Arc::clone(&self.behavior),
            }))
        }
    }

    fn dispatcher<F>(behavior: F) -> (tempfile::TempDir, InterceptDispatcher)
    where
        F: Fn(&InterceptionContext) -> crate::Result<()> + Send + Sync + 'static,
    {
        build(behavior, false)
    }

    fn build<F>(behavior: F, fail: bool) -> (tempfile::TempDir, InterceptDispatcher)
    where
        F: Fn(&InterceptionContext) -> crate::Result<()> + Send + Sync + 'static,
    {
        let dir = tempfile::tempdir().unwrap();
        let config = InterceptConfig::new(dir.path()).production();
        let factory = Arc::new(StubFactory {
            behavior: Arc::new(behavior),
            fail,
        });
        let manager = Arc::new(EngineLifecycleManager::new(config, factory));
        (dir, InterceptDispatcher::new(manager))
    }

    fn counting_chain(calls: Arc<AtomicUsize>) -> Arc<dyn HandlerChain> {
        Arc::new(chain_fn(move |req: Request<Body>, res: &mut dyn ResponseSink| {
            calls.fetch_add(1, Ordering::SeqCst);
            res.set_status(StatusCode::OK, None);
            res.set_content_type(HeaderValue::from_static("text/plain"));
            res.print("chain:")?;
            res.print(req.uri().path())
        }))
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn body_of(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_script_response_is_returned() {
        let (_dir, dispatcher) = dispatcher(|ctx| {
            let mut res = ctx.response().clone();
            res.set_status(StatusCode::CREATED, None);
            res.print("from script").map_err(|e| ScriptError::runtime(e.to_string()))
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let (response, outcome) = dispatcher
            .dispatch(request("/"), counting_chain(calls.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, InterceptOutcome::EngineHandled);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_of(response).await, "from script");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_capture_is_reported_as_capture() {
        let (_dir, dispatcher) = dispatcher(|ctx| {
            let mut buffer = ctx.bridge().capture_chain()?;
            let upper = buffer.body().to_uppercase();
            buffer.set_body(&upper).map_err(|e| ScriptError::runtime(e.to_string()))?;
            buffer.release().map_err(|e| ScriptError::runtime(e.to_string()))
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let (response, outcome) = dispatcher
            .dispatch(request("/hello"), counting_chain(calls.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, InterceptOutcome::EngineHandledViaCapture);
        assert_eq!(body_of(response).await, "CHAIN:/HELLO");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().captured, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unhandled_delegates_and_discards_script_headers() {
        let (_dir, dispatcher) = dispatcher(|ctx| {
            let mut res = ctx.response().clone();
            res.set_header(
                http::header::HeaderName::from_static("x-script"),
                HeaderValue::from_static("1"),
            );
            Err(ScriptError::Unhandled)
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let (response, outcome) = dispatcher
            .dispatch(request("/static/app.css"), counting_chain(calls.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, InterceptOutcome::Delegated);
        assert!(response.headers().get("x-script").is_none());
        assert_eq!(body_of(response).await, "chain:/static/app.css");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unhandled_after_chain_ran_is_an_error() {
        let (_dir, dispatcher) = dispatcher(|ctx| {
            ctx.bridge().run_chain()?;
            Err(ScriptError::Unhandled)
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let (response, outcome) = dispatcher
            .dispatch(request("/"), counting_chain(calls.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, InterceptOutcome::Error);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_script_failure_renders_diagnostic() {
        let (_dir, dispatcher) = dispatcher(|_| {
            Err(ScriptError::RuntimeError {
                message: "boom".to_string(),
                script: Some("config.rhai".to_string()),
                line: Some(3),
                stack: Vec::new(),
            })
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let (response, outcome) = dispatcher
            .dispatch(request("/"), counting_chain(calls.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, InterceptOutcome::Error);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_of(response).await;
        assert!(body.contains("boom"));
        assert!(body.contains("config.rhai line 3"));
        assert_eq!(dispatcher.stats().errors, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_caught_double_invocation_still_fails() {
        let (_dir, dispatcher) = dispatcher(|ctx| {
            ctx.bridge().run_chain()?;
            let _ = ctx.bridge().run_chain();
            Ok(())
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let (response, outcome) = dispatcher
            .dispatch(request("/"), counting_chain(calls.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, InterceptOutcome::Error);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_of(response).await.contains("more than once"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_construction_passes_through() {
        let (_dir, dispatcher) = build(|_| Ok(()), true);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let (response, outcome) = dispatcher
                .dispatch(request("/a"), counting_chain(calls.clone()))
                .await
                .unwrap();
            assert_eq!(outcome, InterceptOutcome::Delegated);
            assert_eq!(body_of(response).await, "chain:/a");
        }

        assert!(dispatcher.manager().is_disabled());
        let stats = dispatcher.stats();
        assert_eq!(stats.passthrough, 2);
        assert_eq!(stats.delegated, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_after_release_is_a_processing_error() {
        let (_dir, dispatcher) = dispatcher(|ctx| {
            let mut buffer = ctx.bridge().capture_chain()?;
            buffer.release().map_err(|e| ScriptError::runtime(e.to_string()))?;
            Err(ScriptError::runtime("late boom"))
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let err = dispatcher
            .dispatch(request("/"), counting_chain(calls.clone()))
            .await
            .unwrap_err();

        match err {
            Error::Processing(message) => {
                assert!(message.contains("late boom"));
                assert!(message.contains("Response already committed"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().errors, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_context_carries_serving_handle() {
        let (_dir, dispatcher) = dispatcher(|ctx| {
            ctx.bridge().request().lock().path = "/edited".to_string();
            assert_eq!(ctx.original_request().path, "/orig");
            assert_eq!(ctx.generation(), 1);
            assert_eq!(ctx.outcome(), None);
            ctx.bridge().run_chain()
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let (response, outcome) = dispatcher
            .dispatch(request("/orig"), counting_chain(calls.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, InterceptOutcome::EngineHandled);
        assert_eq!(body_of(response).await, "chain:/edited");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unhandled_with_invalid_edits_delegates_original_request() {
        let (_dir, dispatcher) = dispatcher(|ctx| {
            let mut view = ctx.bridge().request().lock();
            view.path = "/elsewhere".to_string();
            view.set_header("x-bad", "line\nbreak");
            Err(ScriptError::Unhandled)
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let (response, outcome) = dispatcher
            .dispatch(request("/assets/app.js"), counting_chain(calls.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, InterceptOutcome::Delegated);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "chain:/assets/app.js");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_script_renders_diagnostic() {
        let (_dir, dispatcher) = dispatcher(|_| panic!("script host panicked"));
        let calls = Arc::new(AtomicUsize::new(0));

        let (response, outcome) = dispatcher
            .dispatch(request("/"), counting_chain(calls))
            .await
            .unwrap();

        assert_eq!(outcome, InterceptOutcome::Error);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
