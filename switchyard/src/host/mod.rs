//! The surface the framework needs from whatever server it runs inside.
//!
//! A host hands the dispatcher a request and a response, starts an
//! asynchronous exchange for them, and later receives exactly one
//! `complete()` call. Hosts are free to run their own threads; the traits are
//! `Send + Sync` and use interior mutability on the response side.

#[cfg(feature = "hyper")]
pub mod hyper;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Body exceeds limit of {limit} bytes")]
    BodyTooLarge { limit: u64 },

    #[error("Body has already been consumed")]
    BodyConsumed,

    #[error("I/O failure: {message}")]
    Io { message: String },

    #[error("Exchange already completed")]
    Completed,
}

impl HostError {
    #[inline]
    pub(crate) const fn body_too_large(limit: u64) -> Self {
        Self::BodyTooLarge { limit }
    }

    #[inline]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }
}

/// Read side of an HTTP request.
#[async_trait]
pub trait HostRequest: Send + Sync {
    fn method(&self) -> &str;

    /// Request path as received, without the query string.
    fn request_uri(&self) -> &str;

    fn query_string(&self) -> Option<&str>;

    /// Prefix under which the application is mounted. Empty when mounted at
    /// the root.
    fn context_path(&self) -> &str {
        ""
    }

    fn header(&self, name: &str) -> Option<String>;

    fn headers(&self, name: &str) -> Vec<String>;

    /// First value of a query parameter.
    fn parameter(&self, name: &str) -> Option<String> {
        self.parameter_values(name).into_iter().next()
    }

    fn parameter_values(&self, name: &str) -> Vec<String>;

    fn cookie(&self, name: &str) -> Option<String>;

    fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|value| value.trim().parse().ok())
    }

    fn content_type(&self) -> Option<String> {
        self.header("content-type")
    }

    /// Charset named by the content type, if any.
    fn character_encoding(&self) -> Option<String> {
        self.content_type().and_then(|content_type| {
            content_type
                .split(';')
                .map(str::trim)
                .find_map(|part| part.strip_prefix("charset="))
                .map(|charset| charset.trim_matches('"').to_string())
        })
    }

    fn attribute(&self, name: &str) -> Option<String>;

    /// Reads the whole body. Fails with [`HostError::BodyTooLarge`] once more
    /// than `limit` bytes arrive.
    async fn read_body(&self, limit: Option<u64>) -> Result<Bytes, HostError>;
}

/// Write side of an HTTP response. Writes are buffered by the host until the
/// exchange completes.
pub trait HostResponse: Send + Sync {
    fn set_status(&self, status: u16);

    fn status(&self) -> u16;

    fn set_content_type(&self, content_type: &str);

    fn set_header(&self, name: &str, value: &str);

    fn add_header(&self, name: &str, value: &str);

    fn add_cookie(&self, name: &str, value: &str) {
        self.add_header("set-cookie", &format!("{}={}", name, value));
    }

    fn redirect(&self, location: &str) {
        self.set_status(302);
        self.set_header("location", location);
    }

    fn write(&self, body: &[u8]);
}

/// Container callbacks for an asynchronous exchange.
pub trait ExchangeListener: Send + Sync {
    fn on_start_async(&self, _exchange: &dyn AsyncExchange) {}

    fn on_complete(&self, _exchange: &dyn AsyncExchange) {}

    fn on_error(&self, exchange: &dyn AsyncExchange, error: HostError);

    fn on_timeout(&self, exchange: &dyn AsyncExchange);
}

/// A request/response pair whose completion has been deferred.
pub trait AsyncExchange: Send + Sync {
    fn request(&self) -> Arc<dyn HostRequest>;

    fn response(&self) -> Arc<dyn HostResponse>;

    /// Arms the container timer. Zero disables it.
    fn set_timeout(&self, millis: u64);

    fn add_listener(&self, listener: Arc<dyn ExchangeListener>);

    /// Hands the exchange back to the container for another path.
    fn dispatch(&self, path: &str);

    /// Finishes the exchange. Only the first call has any effect.
    fn complete(&self);
}

pub trait Container: Send + Sync {
    fn start_async(
        &self,
        request: Arc<dyn HostRequest>,
        response: Arc<dyn HostResponse>,
    ) -> Arc<dyn AsyncExchange>;
}

#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Listener bookkeeping and the completed latch shared by the bundled
/// exchanges.
pub(crate) struct ExchangeCore {
    listeners: Mutex<Vec<Arc<dyn ExchangeListener>>>,
    completed: AtomicBool,
    completions: AtomicUsize,
    timer: Mutex<Option<JoinHandle<()>>>,
    done: watch::Sender<bool>,
    dispatched: Mutex<Vec<String>>,
}

impl ExchangeCore {
    pub(crate) fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            listeners: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
            completions: AtomicUsize::new(0),
            timer: Mutex::new(None),
            done,
            dispatched: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_listener(&self, exchange: &dyn AsyncExchange, listener: Arc<dyn ExchangeListener>) {
        listener.on_start_async(exchange);
        lock(&self.listeners).push(listener);
    }

    fn snapshot(&self) -> Vec<Arc<dyn ExchangeListener>> {
        lock(&self.listeners).clone()
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn completions(&self) -> usize {
        self.completions.load(Ordering::Acquire)
    }

    pub(crate) fn arm_timer(&self, timer: JoinHandle<()>) {
        if let Some(previous) = lock(&self.timer).replace(timer) {
            previous.abort();
        }
    }

    pub(crate) fn disarm_timer(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
    }

    pub(crate) fn fire_timeout(&self, exchange: &dyn AsyncExchange) {
        if self.is_completed() {
            return;
        }
        log::debug!("Exchange timed out, notifying listeners");
        for listener in self.snapshot() {
            listener.on_timeout(exchange);
        }
    }

    pub(crate) fn fire_error(&self, exchange: &dyn AsyncExchange, message: &str) {
        if self.is_completed() {
            return;
        }
        for listener in self.snapshot() {
            listener.on_error(exchange, HostError::io(message));
        }
    }

    pub(crate) fn record_dispatch(&self, path: &str) {
        lock(&self.dispatched).push(path.to_string());
    }

    pub(crate) fn dispatched(&self) -> Vec<String> {
        lock(&self.dispatched).clone()
    }

    /// Returns `true` for the call that actually completed the exchange.
    pub(crate) fn complete(&self, exchange: &dyn AsyncExchange) -> bool {
        self.completions.fetch_add(1, Ordering::AcqRel);
        if self.completed.swap(true, Ordering::AcqRel) {
            log::warn!("complete() called on an exchange that is already complete");
            return false;
        }
        self.disarm_timer();
        for listener in self.snapshot() {
            listener.on_complete(exchange);
        }
        // Listeners usually hold the exchange; dropping them breaks the cycle.
        lock(&self.listeners).clear();
        self.done.send_replace(true);
        true
    }

    pub(crate) async fn wait(&self) {
        let mut done = self.done.subscribe();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }
}
