//! Hosting on a hyper 1.x server. Each request becomes an exchange whose
//! response is buffered and turned into a `hyper::Response` once the
//! exchange completes.

use crate::dispatcher::Dispatcher;
use crate::host::{
    AsyncExchange, Container, ExchangeCore, ExchangeListener, HostError, HostRequest,
    HostResponse, lock,
};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpListener;

type BoxError = Box<dyn Error + Send + Sync>;

pub struct HyperRequest<B = Incoming> {
    parts: Parts,
    context_path: String,
    attributes: HashMap<String, String>,
    body: Mutex<Option<B>>,
}

impl<B> HyperRequest<B> {
    pub fn new(request: Request<B>) -> Self {
        let (parts, body) = request.into_parts();
        Self {
            parts,
            context_path: String::new(),
            attributes: HashMap::new(),
            body: Mutex::new(Some(body)),
        }
    }

    pub fn with_context_path(mut self, context_path: impl Into<String>) -> Self {
        self.context_path = context_path.into();
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl<B> HostRequest for HyperRequest<B>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    fn method(&self) -> &str {
        self.parts.method.as_str()
    }

    fn request_uri(&self) -> &str {
        self.parts.uri.path()
    }

    fn query_string(&self) -> Option<&str> {
        self.parts.uri.query()
    }

    fn context_path(&self) -> &str {
        &self.context_path
    }

    fn header(&self, name: &str) -> Option<String> {
        self.parts
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    fn headers(&self, name: &str) -> Vec<String> {
        self.parts
            .headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect()
    }

    fn parameter_values(&self, name: &str) -> Vec<String> {
        match self.parts.uri.query() {
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

    fn attribute(&self, name: &str) -> Option<String> {
        self.attributes.get(name).cloned()
    }

    async fn read_body(&self, limit: Option<u64>) -> Result<Bytes, HostError> {
        let body = lock(&self.body).take().ok_or(HostError::BodyConsumed)?;
        let collected = match limit {
            Some(limit) => {
                let ceiling = usize::try_from(limit).unwrap_or(usize::MAX);
                Limited::new(body, ceiling).collect().await.map_err(|e| {
                    if e.downcast_ref::<LengthLimitError>().is_some() {
                        HostError::body_too_large(limit)
                    } else {
                        HostError::io(e.to_string())
                    }
                })?
            }
            None => body.collect().await.map_err(|e| {
                let e: BoxError = e.into();
                HostError::io(e.to_string())
            })?,
        };
        Ok(collected.to_bytes())
    }
}

struct ResponseState {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// Buffers everything written until the exchange completes.
pub struct HyperResponse {
    state: Mutex<ResponseState>,
}

impl HyperResponse {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ResponseState {
                status: 200,
                headers: Vec::new(),
                body: Vec::new(),
            }),
        }
    }

    /// Drains the buffered response into a hyper response. Headers hyper
    /// rejects are dropped with a warning.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let mut state = lock(&self.state);
        let mut response = Response::new(Full::new(Bytes::from(std::mem::take(&mut state.body))));
        *response.status_mut() =
            StatusCode::from_u16(state.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        for (name, value) in state.headers.drain(..) {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().append(name, value);
                }
                _ => log::warn!("Dropping invalid response header '{}'", name),
            }
        }
        response
    }
}

impl Default for HyperResponse {
    fn default() -> Self {
        HyperResponse::new()
    }
}

impl HostResponse for HyperResponse {
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

pub struct HyperExchange {
    me: Weak<HyperExchange>,
    request: Arc<dyn HostRequest>,
    response: Arc<dyn HostResponse>,
    core: ExchangeCore,
}

impl HyperExchange {
    pub fn new(request: Arc<dyn HostRequest>, response: Arc<dyn HostResponse>) -> Arc<Self> {
        Arc::new_cyclic(|me| HyperExchange {
            me: me.clone(),
            request,
            response,
            core: ExchangeCore::new(),
        })
    }

    pub fn is_completed(&self) -> bool {
        self.core.is_completed()
    }

    pub async fn wait(&self) {
        self.core.wait().await
    }
}

impl AsyncExchange for HyperExchange {
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
        let me = self.me.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            if let Some(exchange) = me.upgrade() {
                exchange.core.fire_timeout(exchange.as_ref());
            }
        });
        self.core.arm_timer(timer);
    }

    fn add_listener(&self, listener: Arc<dyn ExchangeListener>) {
        self.core.add_listener(self, listener);
    }

    fn dispatch(&self, path: &str) {
        log::warn!("Forwarding to {} is not supported by the hyper host", path);
        self.core.record_dispatch(path);
    }

    fn complete(&self) {
        self.core.complete(self);
    }
}

#[derive(Default)]
pub struct HyperContainer;

impl Container for HyperContainer {
    fn start_async(
        &self,
        request: Arc<dyn HostRequest>,
        response: Arc<dyn HostResponse>,
    ) -> Arc<dyn AsyncExchange> {
        HyperExchange::new(request, response)
    }
}

/// Runs one hyper request through the dispatcher and waits for completion.
pub async fn serve<B>(dispatcher: &Dispatcher, request: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    let response = Arc::new(HyperResponse::new());
    let exchange = HyperExchange::new(Arc::new(HyperRequest::new(request)), response.clone());
    dispatcher.service(exchange.clone());
    exchange.wait().await;
    response.to_response()
}

/// Accepts HTTP/1 connections on `addr` until the listener fails.
pub async fn listen(dispatcher: Arc<Dispatcher>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("Listening on http://{}", addr);
    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request: Request<Incoming>| {
                let dispatcher = dispatcher.clone();
                async move { Ok::<_, Infallible>(serve(&dispatcher, request).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                log::warn!("Connection from {} failed: {}", peer, e);
            }
        });
    }
}
