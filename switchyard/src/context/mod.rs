pub mod attachments;

pub use attachments::Attachments;

use crate::host::{AsyncExchange, HostError, HostRequest, HostResponse, lock};
use crate::router::invokable::Invokable;
use crate::router::path::PathVariables;
use crate::status::DispatchError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Everything the pipeline knows about one in-flight request.
///
/// Cloning is cheap and every clone shares the property bag and body buffer.
/// A handler parameter of type `RequestContext` receives such a clone.
#[derive(Clone)]
pub struct RequestContext {
    id: Uuid,
    exchange: Arc<dyn AsyncExchange>,
    request: Arc<dyn HostRequest>,
    response: Arc<dyn HostResponse>,
    invokable: Option<Arc<Invokable>>,
    path_variables: Arc<PathVariables>,
    properties: Arc<Mutex<Attachments>>,
    body: Arc<OnceCell<Bytes>>,
    max_body_size: Option<u64>,
    method: String,
    display: String,
    created_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(exchange: Arc<dyn AsyncExchange>, max_body_size: Option<u64>) -> Self {
        let request = exchange.request();
        let response = exchange.response();
        let method = request.method().to_string();
        let display = match request.query_string() {
            Some(query) if !query.is_empty() => {
                format!("{} {}?{}", method, request.request_uri(), query)
            }
            _ => format!("{} {}", method, request.request_uri()),
        };
        Self {
            id: Uuid::new_v4(),
            exchange,
            request,
            response,
            invokable: None,
            path_variables: Arc::new(PathVariables::new()),
            properties: Arc::new(Mutex::new(Attachments::new())),
            body: Arc::new(OnceCell::new()),
            max_body_size,
            method,
            display,
            created_at: Utc::now(),
        }
    }

    /// Binds the route that matched and the variables its matcher extracted.
    pub(crate) fn matched(mut self, invokable: Arc<Invokable>, variables: PathVariables) -> Self {
        self.invokable = Some(invokable);
        self.with_variables(variables)
    }

    pub(crate) fn with_variables(mut self, variables: PathVariables) -> Self {
        self.path_variables = Arc::new(variables);
        self
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }

    pub fn exchange(&self) -> &Arc<dyn AsyncExchange> {
        &self.exchange
    }

    pub fn request(&self) -> &Arc<dyn HostRequest> {
        &self.request
    }

    pub fn response(&self) -> &Arc<dyn HostResponse> {
        &self.response
    }

    pub fn invokable(&self) -> Option<&Arc<Invokable>> {
        self.invokable.as_ref()
    }

    pub fn path_variables(&self) -> &PathVariables {
        &self.path_variables
    }

    pub fn path_variable(&self, name: &str) -> Option<&str> {
        self.path_variables.get(name).map(String::as_str)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Request URI with the context path stripped. The query string is never
    /// part of it.
    pub fn path_within_application(&self) -> String {
        let uri = self.request.request_uri();
        let uri = uri.split_once('?').map_or(uri, |(path, _)| path);
        let context_path = self.request.context_path().trim_end_matches('/');
        let path = if context_path.is_empty() {
            uri
        } else {
            match uri.strip_prefix(context_path) {
                Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
                _ => uri,
            }
        };
        if path.is_empty() {
            "/".to_string()
        } else {
            path.to_string()
        }
    }

    pub fn set_property<K>(&self, name: impl AsRef<str>, value: K)
    where
        K: Send + Sync + 'static,
    {
        lock(&self.properties).add(name, value);
    }

    pub fn property<K>(&self, name: impl AsRef<str>) -> Option<K>
    where
        K: Clone + Send + Sync + 'static,
    {
        lock(&self.properties).get::<K>(name).cloned()
    }

    /// Runs `f` with exclusive access to the property bag.
    pub fn with_properties<R>(&self, f: impl FnOnce(&mut Attachments) -> R) -> R {
        f(&mut lock(&self.properties))
    }

    /// The request body, read from the host at most once per request.
    pub async fn body(&self) -> Result<Bytes, DispatchError> {
        if let (Some(limit), Some(length)) = (self.max_body_size, self.request.content_length()) {
            if length > limit {
                return Err(DispatchError::body_too_large(limit));
            }
        }
        let body = self
            .body
            .get_or_try_init(|| async {
                log::trace!("{}: buffering request body", self.id);
                self.request
                    .read_body(self.max_body_size)
                    .await
                    .map_err(|e| match e {
                        HostError::BodyTooLarge { limit } => DispatchError::body_too_large(limit),
                        other => DispatchError::body(other.to_string()),
                    })
            })
            .await?;
        Ok(body.clone())
    }
}

impl Debug for RequestContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("request", &self.display)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl std::fmt::Display for RequestContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.id, self.display)
    }
}
