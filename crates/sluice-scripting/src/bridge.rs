//! Host callbacks available to a running script
//!
//! A [`ChainBridge`] is bound to one request's handler-chain continuation.
//! The script either runs the chain against the live response or captures
//! its output in a [`ResponseBuffer`]; either way the chain runs at most once.

use crate::buffer::ResponseBuffer;
use crate::context::RequestView;
use crate::error::{Result, ScriptError};
use async_trait::async_trait;
use bytes::Bytes;
use http::Request;
use http_body_util::Full;
use parking_lot::Mutex;
use sluice_core::{write_response, Body, Next, ResponseSink, SharedResponse};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

/// The handler chain an interceptor sits in front of
#[async_trait]
pub trait HandlerChain: Send + Sync + fmt::Debug {
    /// Handle `req`, writing the result into `res`
    async fn handle(&self, req: Request<Body>, res: &mut dyn ResponseSink) -> sluice_core::Result<()>;
}

#[async_trait]
impl HandlerChain for Next {
    async fn handle(&self, req: Request<Body>, res: &mut dyn ResponseSink) -> sluice_core::Result<()> {
        let response = self.clone().run(req).await?;
        write_response(res, response).await
    }
}

/// A handler chain backed by a closure writing straight into the sink
pub struct FnChain<F> {
    f: F,
}

/// Create a handler chain from a closure
pub fn chain_fn<F>(f: F) -> FnChain<F>
where
    F: Fn(Request<Body>, &mut dyn ResponseSink) -> sluice_core::Result<()> + Send + Sync + 'static,
{
    FnChain { f }
}

#[async_trait]
impl<F> HandlerChain for FnChain<F>
where
    F: Fn(Request<Body>, &mut dyn ResponseSink) -> sluice_core::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, req: Request<Body>, res: &mut dyn ResponseSink) -> sluice_core::Result<()> {
        (self.f)(req, res)
    }
}

impl<F> fmt::Debug for FnChain<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnChain").finish_non_exhaustive()
    }
}

/// What happened to the bridged chain so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// The chain has not been invoked
    Pending,
    /// The chain ran against the live response
    Ran,
    /// The chain ran against a capturing buffer
    Captured,
}

struct PendingChain {
    request: Request<Bytes>,
    chain: Arc<dyn HandlerChain>,
}

/// One request's handler-chain continuation
pub struct ChainBridge {
    pending: Mutex<Option<PendingChain>>,
    state: Mutex<ChainState>,
    reused: AtomicBool,
    request: Arc<Mutex<RequestView>>,
    response: SharedResponse,
    runtime: Handle,
    capture_param: String,
}

impl ChainBridge {
    /// Bind a chain to a request and its live response
    ///
    /// `runtime` drives the async chain when the script calls in from a
    /// blocking thread.
    pub fn new(
        request: Request<Bytes>,
        chain: Arc<dyn HandlerChain>,
        response: SharedResponse,
        runtime: Handle,
    ) -> Self {
        let view = RequestView::from_request(&request);
        Self {
            pending: Mutex::new(Some(PendingChain { request, chain })),
            state: Mutex::new(ChainState::Pending),
            reused: AtomicBool::new(false),
            request: Arc::new(Mutex::new(view)),
            response,
            runtime,
            capture_param: "capture".to_string(),
        }
    }

    /// Query parameter that opts a request out of capture in [`forward`](Self::forward)
    pub fn with_capture_param(mut self, name: impl Into<String>) -> Self {
        self.capture_param = name.into();
        self
    }

    /// The editable request view
    pub fn request(&self) -> &Arc<Mutex<RequestView>> {
        &self.request
    }

    /// The live response
    pub fn response(&self) -> &SharedResponse {
        &self.response
    }

    /// Current chain state
    pub fn state(&self) -> ChainState {
        *self.state.lock()
    }

    /// Whether the chain has been invoked in any way
    pub fn is_used(&self) -> bool {
        self.state() != ChainState::Pending
    }

    /// Whether a second invocation was attempted, even if the script caught it
    pub fn was_reused(&self) -> bool {
        self.reused.load(Ordering::SeqCst)
    }

    fn take(&self, next: ChainState) -> Result<(Request<Body>, Arc<dyn HandlerChain>)> {
        let (mut request, chain) = self.take_pending(next)?;
        self.request
            .lock()
            .apply_to_request(&mut request)
            .map_err(ScriptError::type_error)?;
        Ok((request.map(Full::new), chain))
    }

    fn take_pending(&self, next: ChainState) -> Result<(Request<Bytes>, Arc<dyn HandlerChain>)> {
        let Some(PendingChain { request, chain }) = self.pending.lock().take() else {
            self.reused.store(true, Ordering::SeqCst);
            return Err(ScriptError::ChainAlreadyInvoked);
        };
        *self.state.lock() = next;
        Ok((request, chain))
    }

    /// Run the chain against the live response, unmodified
    pub async fn run_chain_async(&self) -> Result<()> {
        let (request, chain) = self.take(ChainState::Ran)?;
        trace!(uri = %request.uri(), "Running handler chain");
        let mut sink = self.response.clone();
        chain
            .handle(request, &mut sink)
            .await
            .map_err(|e| ScriptError::chain(e.to_string()))
    }

    /// Run the chain against a capturing buffer and return the buffer
    ///
    /// Nothing is committed until the caller releases the buffer.
    pub async fn capture_chain_async(&self) -> Result<ResponseBuffer<SharedResponse>> {
        let (request, chain) = self.take(ChainState::Captured)?;
        trace!(uri = %request.uri(), "Capturing handler chain");
        let mut buffer = ResponseBuffer::new(self.response.clone());
        chain
            .handle(request, &mut buffer)
            .await
            .map_err(|e| ScriptError::chain(e.to_string()))?;
        Ok(buffer)
    }

    /// Blocking form of [`run_chain_async`](Self::run_chain_async)
    ///
    /// Must not be called from inside an async task.
    pub fn run_chain(&self) -> Result<()> {
        self.runtime.block_on(self.run_chain_async())
    }

    /// Blocking form of [`capture_chain_async`](Self::capture_chain_async)
    ///
    /// Must not be called from inside an async task.
    pub fn capture_chain(&self) -> Result<ResponseBuffer<SharedResponse>> {
        self.runtime.block_on(self.capture_chain_async())
    }

    /// Capture unless the caller or the request opted out
    ///
    /// Returns `None` when the chain ran directly.
    pub fn forward(&self, capture: Option<bool>) -> Result<Option<ResponseBuffer<SharedResponse>>> {
        if self.capture_requested(capture) {
            self.capture_chain().map(Some)
        } else {
            self.run_chain().map(|()| None)
        }
    }

    /// Whether [`forward`](Self::forward) would capture
    pub fn capture_requested(&self, capture: Option<bool>) -> bool {
        if let Some(capture) = capture {
            return capture;
        }
        let view = self.request.lock();
        match view.param(&self.capture_param) {
            Some(value) => {
                let opted_out = matches!(
                    value.to_ascii_lowercase().as_str(),
                    "false" | "no" | "none"
                );
                if opted_out {
                    debug!(param = %self.capture_param, "Capture disabled by request");
                }
                !opted_out
            }
            None => true,
        }
    }

    /// Hand the request to the chain on the dispatcher's behalf
    ///
    /// Script edits that no longer form a valid request are dropped and the
    /// request goes to the chain as it arrived.
    pub(crate) async fn delegate(&self) -> sluice_core::Result<()> {
        let (mut request, chain) = self
            .take_pending(ChainState::Ran)
            .map_err(|e| sluice_core::Error::Internal(e.to_string()))?;
        if let Err(e) = self.request.lock().apply_to_request(&mut request) {
            warn!(error = %e, "Discarding invalid request edits before delegating");
        }
        let mut sink = self.response.clone();
        chain.handle(request.map(Full::new), &mut sink).await
    }
}

impl fmt::Debug for ChainBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainBridge")
            .field("state", &self.state())
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}
