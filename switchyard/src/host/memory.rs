//! An in-process host. Requests are built by hand and responses are captured
//! in memory, which makes it the container used by the test suites and by
//! embedders that already own their transport.

use crate::config::DEFAULT_MAX_BODY_SIZE;
use crate::context::RequestContext;
use crate::host::{
    AsyncExchange, Container, ExchangeCore, ExchangeListener, HostError, HostRequest,
    HostResponse, lock,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

pub struct MemoryRequest {
    method: String,
    uri: String,
    query: Option<String>,
    context_path: String,
    headers: Vec<(String, String)>,
    attributes: HashMap<String, String>,
    body: Bytes,
    body_reads: AtomicUsize,
}

impl MemoryRequest {
    pub fn builder(method: impl Into<String>, uri: impl AsRef<str>) -> MemoryRequestBuilder {
        MemoryRequestBuilder::new(method, uri)
    }

    pub fn get(uri: impl AsRef<str>) -> MemoryRequestBuilder {
        Self::builder("GET", uri)
    }

    pub fn post(uri: impl AsRef<str>) -> MemoryRequestBuilder {
        Self::builder("POST", uri)
    }

    pub fn put(uri: impl AsRef<str>) -> MemoryRequestBuilder {
        Self::builder("PUT", uri)
    }

    pub fn delete(uri: impl AsRef<str>) -> MemoryRequestBuilder {
        Self::builder("DELETE", uri)
    }

    /// How many times the body has been handed out.
    pub fn body_reads(&self) -> usize {
        self.body_reads.load(Ordering::Acquire)
    }
}

pub struct MemoryRequestBuilder {
    request: MemoryRequest,
}

impl MemoryRequestBuilder {
    pub fn new(method: impl Into<String>, uri: impl AsRef<str>) -> Self {
        let (path, query) = match uri.as_ref().split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (uri.as_ref().to_string(), None),
        };
        Self {
            request: MemoryRequest {
                method: method.into(),
                uri: path,
                query,
                context_path: String::new(),
                headers: Vec::new(),
                attributes: HashMap::new(),
                body: Bytes::new(),
                body_reads: AtomicUsize::new(0),
            },
        }
    }

    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.request
            .headers
            .push((name.as_ref().to_ascii_lowercase(), value.into()));
        self
    }

    pub fn context_path(mut self, context_path: impl Into<String>) -> Self {
        self.request.context_path = context_path.into();
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.attributes.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.request.body = body.into();
        self
    }

    /// Sets an `application/x-www-form-urlencoded` body.
    pub fn form(self, body: impl Into<String>) -> Self {
        self.header("content-type", "application/x-www-form-urlencoded")
            .body(body.into())
    }

    pub fn json(self, body: &serde_json::Value) -> Self {
        self.header("content-type", "application/json")
            .body(body.to_string())
    }

    pub fn build(self) -> MemoryRequest {
        self.request
    }
}

#[async_trait]
impl HostRequest for MemoryRequest {
    fn method(&self) -> &str {
        &self.method
    }

    fn request_uri(&self) -> &str {
        &self.uri
    }

    fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    fn context_path(&self) -> &str {
        &self.context_path
    }

    fn header(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(header, _)| *header == name)
            .map(|(_, value)| value.clone())
    }

    fn headers(&self, name: &str) -> Vec<String> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .filter(|(header, _)| *header == name)
            .map(|(_, value)| value.clone())
            .collect()
    }

    fn parameter_values(&self, name: &str) -> Vec<String> {
        match &self.query {
            None => Vec::new(),
            Some(query) => url::form_urlencoded::parse(query.as_bytes())
                .filter(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
                .collect(),
        }
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.headers("cookie").iter().find_map(|header| {
            header
                .split(';')
                .filter_map(|pair| pair.trim().split_once('='))
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        })
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.body.len() as u64)
    }

    fn attribute(&self, name: &str) -> Option<String> {
        self.attributes.get(name).cloned()
    }

    async fn read_body(&self, limit: Option<u64>) -> Result<Bytes, HostError> {
        if let Some(limit) = limit {
            if self.body.len() as u64 > limit {
                return Err(HostError::body_too_large(limit));
            }
        }
        self.body_reads.fetch_add(1, Ordering::AcqRel);
        Ok(self.body.clone())
    }
}

struct ResponseState {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

pub struct MemoryResponse {
    state: Mutex<ResponseState>,
}

impl MemoryResponse {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ResponseState {
                status: 200,
                headers: Vec::new(),
                body: Vec::new(),
            }),
        }
    }

    pub fn header(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        lock(&self.state)
            .headers
            .iter()
            .find(|(header, _)| *header == name)
            .map(|(_, value)| value.clone())
    }

    pub fn content_type(&self) -> Option<String> {
        self.header("content-type")
    }

    pub fn body(&self) -> Vec<u8> {
        lock(&self.state).body.clone()
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&lock(&self.state).body).into_owned()
    }

    pub fn body_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&lock(&self.state).body)
    }
}

impl Default for MemoryResponse {
    fn default() -> Self {
        MemoryResponse::new()
    }
}

impl HostResponse for MemoryResponse {
    fn set_status(&self, status: u16) {
        lock(&self.state).status = status;
    }

    fn status(&self) -> u16 {
        lock(&self.state).status
    }

    fn set_content_type(&self, content_type: &str) {
        self.set_header("content-type", content_type);
    }

    fn set_header(&self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        let mut state = lock(&self.state);
        state.headers.retain(|(header, _)| *header != name);
        state.headers.push((name, value.to_string()));
    }

    fn add_header(&self, name: &str, value: &str) {
        lock(&self.state)
            .headers
            .push((name.to_ascii_lowercase(), value.to_string()));
    }

    fn write(&self, body: &[u8]) {
        lock(&self.state).body.extend_from_slice(body);
    }
}

pub struct MemoryExchange {
    me: Weak<MemoryExchange>,
    request: Arc<dyn HostRequest>,
    response: Arc<dyn HostResponse>,
    core: ExchangeCore,
}

impl MemoryExchange {
    pub fn new(request: Arc<dyn HostRequest>, response: Arc<dyn HostResponse>) -> Arc<Self> {
        Arc::new_cyclic(|me| MemoryExchange {
            me: me.clone(),
            request,
            response,
            core: ExchangeCore::new(),
        })
    }

    /// Starts an exchange for `request` with a fresh captured response.
    pub fn start(request: MemoryRequest) -> (Arc<MemoryExchange>, Arc<MemoryResponse>) {
        let response = Arc::new(MemoryResponse::new());
        let exchange = MemoryExchange::new(Arc::new(request), response.clone());
        (exchange, response)
    }

    /// Fires the container timeout right away.
    pub fn expire(&self) {
        self.core.fire_timeout(self);
    }

    /// Reports a container error to the listeners.
    pub fn fail(&self, message: &str) {
        self.core.fire_error(self, message);
    }

    pub fn is_completed(&self) -> bool {
        self.core.is_completed()
    }

    /// Number of `complete()` calls received, including ignored repeats.
    pub fn completions(&self) -> usize {
        self.core.completions()
    }

    pub fn dispatched(&self) -> Vec<String> {
        self.core.dispatched()
    }

    /// Resolves once the exchange has completed.
    pub async fn wait(&self) {
        self.core.wait().await
    }
}

impl AsyncExchange for MemoryExchange {
    fn request(&self) -> Arc<dyn HostRequest> {
        self.request.clone()
    }

    fn response(&self) -> Arc<dyn HostResponse> {
        self.response.clone()
    }

    fn set_timeout(&self, millis: u64) {
        if millis == 0 {
            self.core.disarm_timer();
            return;
        }
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!("No runtime available, exchange timeout of {} ms ignored", millis);
                return;
            }
        };
        let me = self.me.clone();
        let timer = handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            if let Some(exchange) = me.upgrade() {
                exchange.expire();
            }
        });
        self.core.arm_timer(timer);
    }

    fn add_listener(&self, listener: Arc<dyn ExchangeListener>) {
        self.core.add_listener(self, listener);
    }

    fn dispatch(&self, path: &str) {
        log::debug!("Exchange dispatched to {}", path);
        self.core.record_dispatch(path);
    }

    fn complete(&self) {
        self.core.complete(self);
    }
}

/// Starts [`MemoryExchange`]s for arbitrary request and response handles.
#[derive(Default)]
pub struct MemoryContainer;

impl Container for MemoryContainer {
    fn start_async(
        &self,
        request: Arc<dyn HostRequest>,
        response: Arc<dyn HostResponse>,
    ) -> Arc<dyn AsyncExchange> {
        MemoryExchange::new(request, response)
    }
}

/// Builds a request context around `request` with the default body limit.
pub fn context_for(request: MemoryRequest) -> RequestContext {
    let (exchange, _) = MemoryExchange::start(request);
    RequestContext::new(exchange, Some(DEFAULT_MAX_BODY_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        timeouts: AtomicUsize,
        errors: AtomicUsize,
        completes: AtomicUsize,
    }

    impl ExchangeListener for Counting {
        fn on_complete(&self, _exchange: &dyn AsyncExchange) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _exchange: &dyn AsyncExchange, _error: HostError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_timeout(&self, _exchange: &dyn AsyncExchange) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn query_and_cookie_lookup() {
        let request = MemoryRequest::get("/search?q=rust&tag=a&tag=b&empty=")
            .header("Cookie", "theme=dark; lang=en")
            .build();
        assert_eq!(request.request_uri(), "/search");
        assert_eq!(request.parameter("q").as_deref(), Some("rust"));
        assert_eq!(request.parameter_values("tag"), vec!["a", "b"]);
        assert_eq!(request.parameter("empty").as_deref(), Some(""));
        assert_eq!(request.parameter("missing"), None);
        assert_eq!(request.cookie("lang").as_deref(), Some("en"));
        assert_eq!(request.cookie("nope"), None);
    }

    #[tokio::test]
    async fn body_respects_limit() {
        let request = MemoryRequest::post("/upload").body("0123456789").build();
        assert!(matches!(
            request.read_body(Some(4)).await,
            Err(HostError::BodyTooLarge { limit: 4 })
        ));
        assert_eq!(request.read_body(None).await.unwrap(), Bytes::from("0123456789"));
        assert_eq!(request.body_reads(), 1);
    }

    #[tokio::test]
    async fn timer_notifies_listeners_until_completed() {
        let (exchange, _) = MemoryExchange::start(MemoryRequest::get("/slow").build());
        let listener = Arc::new(Counting::default());
        exchange.add_listener(listener.clone());
        exchange.set_timeout(10);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 1);

        exchange.complete();
        exchange.complete();
        exchange.expire();
        exchange.fail("late");
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(listener.errors.load(Ordering::SeqCst), 0);
        assert_eq!(listener.completes.load(Ordering::SeqCst), 1);
        assert_eq!(exchange.completions(), 2);
        exchange.wait().await;
    }

    #[tokio::test]
    async fn completing_disarms_timer() {
        let (exchange, _) = MemoryExchange::start(MemoryRequest::get("/fast").build());
        let listener = Arc::new(Counting::default());
        exchange.add_listener(listener.clone());
        exchange.set_timeout(20);
        exchange.complete();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 0);
        assert!(exchange.is_completed());
    }
}
