//! Exactly-once completion of an asynchronous exchange.
//!
//! The handler's result and the container's timeout or error callbacks race
//! to finish the same exchange. Each of them first moves the state from
//! `OPEN` to `STARTED`; only the winner renders. The render itself runs
//! under a guard that completes the exchange and moves the state to
//! `COMPLETED` when it goes out of scope, so a failing or panicking renderer
//! still leaves the exchange completed.

use crate::context::RequestContext;
use crate::host::{AsyncExchange, ExchangeListener, HostError};
use crate::mapper::reply::{Completion, Reply};
use crate::mapper::response::ReturnTypeMapperTable;
use crate::status::{DispatchError, Failure, panic_message};
use std::fmt::{Debug, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::runtime::Handle;

const OPEN: u8 = 0;
const STARTED: u8 = 1;
const COMPLETED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Open,
    Started,
    Completed,
}

impl CompletionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            OPEN => CompletionState::Open,
            STARTED => CompletionState::Started,
            _ => CompletionState::Completed,
        }
    }
}

struct Inner {
    state: AtomicU8,
    ctx: RequestContext,
    renderers: Arc<ReturnTypeMapperTable>,
    workers: Handle,
    timeout_ms: u64,
}

/// Finishes one request. Clones share the same state.
#[derive(Clone)]
pub struct CompletionHandler {
    inner: Arc<Inner>,
}

struct CompleteGuard<'a> {
    inner: &'a Inner,
}

impl Drop for CompleteGuard<'_> {
    fn drop(&mut self) {
        self.inner.ctx.exchange().complete();
        self.inner.state.store(COMPLETED, Ordering::Release);
        log::trace!("{}: exchange completed", self.inner.ctx.id());
    }
}

impl CompletionHandler {
    pub fn new(
        ctx: RequestContext,
        renderers: Arc<ReturnTypeMapperTable>,
        workers: Handle,
        timeout_ms: u64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(OPEN),
                ctx,
                renderers,
                workers,
                timeout_ms,
            }),
        }
    }

    pub fn state(&self) -> CompletionState {
        CompletionState::from_raw(self.inner.state.load(Ordering::Acquire))
    }

    pub fn context(&self) -> &RequestContext {
        &self.inner.ctx
    }

    /// `true` for the one caller that wins the right to render.
    fn start(&self, event: &str) -> bool {
        match self
            .inner
            .state
            .compare_exchange(OPEN, STARTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => {
                self.cant(event, current);
                false
            }
        }
    }

    fn cant(&self, event: &str, current: u8) {
        log::debug!(
            "{}: ignoring {} in state {:?}",
            self.inner.ctx.id(),
            event,
            CompletionState::from_raw(current)
        );
    }

    /// Renders a successful result unless the exchange has already been
    /// claimed by a timeout or error.
    pub fn on_success(&self, reply: Reply) {
        if self.start("success") {
            self.render(Completion::Success(reply));
        }
    }

    /// Renders a failure with any execution wrappers removed.
    pub fn on_failure(&self, failure: Failure) {
        if self.start("failure") {
            self.render(Completion::Failure(failure.unwrap_execution()));
        }
    }

    fn render(&self, completion: Completion) {
        let inner = &*self.inner;
        let _guard = CompleteGuard { inner };
        let rendered = std::panic::catch_unwind(AssertUnwindSafe(|| {
            inner.renderers.render(&completion, &inner.ctx)
        }));
        match rendered {
            Ok(Ok(())) => {
                log::trace!("{}: rendered {}", inner.ctx.id(), completion.type_name());
            }
            Ok(Err(e)) => {
                log::error!(
                    "{}: rendering {} failed: {}",
                    inner.ctx,
                    completion.type_name(),
                    e
                );
            }
            Err(payload) => {
                log::error!(
                    "{}: renderer for {} panicked: {}",
                    inner.ctx,
                    completion.type_name(),
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    /// Renders a container-raised failure on the worker pool.
    fn render_on_workers(&self, failure: Failure) {
        let handler = self.clone();
        self.inner.workers.spawn(async move {
            handler.render(Completion::Failure(failure));
        });
    }
}

impl ExchangeListener for CompletionHandler {
    fn on_start_async(&self, _exchange: &dyn AsyncExchange) {
        log::trace!("{}: async exchange started", self.inner.ctx.id());
    }

    fn on_complete(&self, _exchange: &dyn AsyncExchange) {
        log::trace!("{}: container reported completion", self.inner.ctx.id());
    }

    fn on_error(&self, _exchange: &dyn AsyncExchange, error: HostError) {
        if self.start("container error") {
            log::warn!("{}: container error: {}", self.inner.ctx, error);
            self.render_on_workers(DispatchError::exchange(error.to_string()).into());
        }
    }

    fn on_timeout(&self, _exchange: &dyn AsyncExchange) {
        if self.start("timeout") {
            log::warn!(
                "{}: no result within {} ms",
                self.inner.ctx,
                self.inner.timeout_ms
            );
            self.render_on_workers(DispatchError::timeout(self.inner.timeout_ms).into());
        }
    }
}

impl Debug for CompletionHandler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandler")
            .field("request", &self.inner.ctx.id())
            .field("state", &self.state())
            .finish()
    }
}
