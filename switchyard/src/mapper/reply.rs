use crate::component::TypeKey;
use crate::status::Failure;
use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;

type JsonView = fn(&(dyn Any + Send + Sync)) -> Option<serde_json::Value>;

fn json_view<T>(value: &(dyn Any + Send + Sync)) -> Option<serde_json::Value>
where
    T: Serialize + 'static,
{
    value
        .downcast_ref::<T>()
        .and_then(|value| serde_json::to_value(value).ok())
}

/// A handler's successful result, type-erased but still aware of its concrete
/// type so a renderer can be chosen for it.
pub struct Reply {
    value: Box<dyn Any + Send + Sync>,
    key: TypeKey,
    json: Option<JsonView>,
}

impl Reply {
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            value: Box::new(value),
            key: TypeKey::of::<T>(),
            json: None,
        }
    }

    /// A value the catch-all renderer writes as JSON.
    pub fn json<T>(value: T) -> Self
    where
        T: Serialize + Any + Send + Sync,
    {
        Self {
            value: Box::new(value),
            key: TypeKey::of::<T>(),
            json: Some(json_view::<T> as JsonView),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(text.into())
    }

    /// Renders as `204 No Content` by default.
    pub fn empty() -> Self {
        Self::new(())
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn is<T: Any>(&self) -> bool {
        self.key.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn downcast<T: Any>(self) -> Result<T, Reply> {
        if !self.is::<T>() {
            return Err(self);
        }
        let Reply { value, key, json } = self;
        match value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Reply { value, key, json }),
        }
    }

    pub fn to_json(&self) -> Option<serde_json::Value> {
        self.json.and_then(|view| view(&*self.value))
    }
}

impl Debug for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply").field("type", &self.key).finish()
    }
}

/// What a handler hands back: a value now, or work that produces one later.
pub enum Returned {
    Value(Reply),
    /// Awaited on the worker pool.
    Deferred(BoxFuture<'static, Result<Reply, Failure>>),
    /// Run in place on the worker thread that invoked the handler.
    Callable(Box<dyn FnOnce() -> Result<Reply, Failure> + Send>),
}

impl Returned {
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<Reply, Failure>> + Send + 'static,
    {
        Returned::Deferred(future.boxed())
    }

    pub fn callable<F>(callable: F) -> Self
    where
        F: FnOnce() -> Result<Reply, Failure> + Send + 'static,
    {
        Returned::Callable(Box::new(callable))
    }
}

impl From<Reply> for Returned {
    fn from(reply: Reply) -> Self {
        Returned::Value(reply)
    }
}

impl From<Entity> for Returned {
    fn from(entity: Entity) -> Self {
        Returned::Value(Reply::new(entity))
    }
}

impl Debug for Returned {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Returned::Value(reply) => f.debug_tuple("Value").field(reply).finish(),
            Returned::Deferred(_) => f.write_str("Deferred"),
            Returned::Callable(_) => f.write_str("Callable"),
        }
    }
}

/// A fully described response: status, headers and body.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    status: u16,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    body: Bytes,
}

impl Entity {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            content_type: None,
            body: Bytes::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn created() -> Self {
        Self::new(201)
    }

    pub fn no_content() -> Self {
        Self::new(204)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.content_type = Some("text/plain; charset=UTF-8".to_string());
        self.body = Bytes::from(text.into());
        self
    }

    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.content_type = Some("application/json".to_string());
        self.body = Bytes::from(value.to_string());
        self
    }

    pub fn bytes(mut self, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.content_type = Some(content_type.into());
        self.body = body.into();
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// A failure that carries the exact response to send.
#[derive(Debug, Clone)]
pub struct EntityError {
    entity: Entity,
}

impl EntityError {
    pub fn new(entity: Entity) -> Self {
        Self { entity }
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }
}

impl Display for EntityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Request rejected with status {}", self.entity.status)
    }
}

impl Error for EntityError {}

/// The outcome handed to the return-type mapper table.
#[derive(Debug)]
pub enum Completion {
    Success(Reply),
    Failure(Failure),
}

impl Completion {
    /// Concrete runtime type of the value or error.
    pub fn value_type(&self) -> TypeId {
        match self {
            Completion::Success(reply) => reply.key().id(),
            Completion::Failure(failure) => failure.error_type(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Completion::Success(reply) => reply.key().name(),
            Completion::Failure(failure) => failure.type_name(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Completion::Failure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Order {
        id: u32,
    }

    #[test]
    fn json_reply_exposes_value() {
        let reply = Reply::json(Order { id: 9 });
        assert!(reply.is::<Order>());
        assert_eq!(reply.to_json(), Some(json!({ "id": 9 })));
        assert!(Reply::text("plain").to_json().is_none());
    }

    #[test]
    fn downcast_returns_reply_on_mismatch() {
        let reply = Reply::new(5u8);
        let reply = reply.downcast::<u16>().unwrap_err();
        assert_eq!(reply.downcast::<u8>().unwrap(), 5);
    }

    #[test]
    fn completion_reports_concrete_type() {
        let completion = Completion::Success(Reply::text("x"));
        assert_eq!(completion.value_type(), TypeId::of::<String>());
        let completion = Completion::Failure(Failure::from(EntityError::new(Entity::new(409))));
        assert_eq!(completion.value_type(), TypeId::of::<EntityError>());
        assert!(completion.is_failure());
    }
}
