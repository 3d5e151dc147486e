use std::any::{Any, TypeId};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use thiserror::Error;

/// Request-time failures raised by the dispatch pipeline itself.
///
/// Each variant maps onto an HTTP status when rendered by the default failure
/// renderer; see [`DispatchError::status`].
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No route matches {method} {path}")]
    NotFound { method: String, path: String },

    #[error("Request body exceeds the configured limit of {limit} bytes")]
    BodyTooLarge { limit: u64 },

    #[error("Missing required parameter #{index} ({type_name})")]
    MissingParameter {
        index: usize,
        type_name: &'static str,
    },

    #[error("Could not convert '{name}': {message}")]
    Conversion { name: String, message: String },

    #[error("Could not read request body: {message}")]
    Body { message: String },

    #[error("Request did not complete within {millis} ms")]
    Timeout { millis: u64 },

    #[error("Filter '{filter}' rejected the request: {message}")]
    Filter {
        filter: &'static str,
        message: String,
    },

    #[error("Handler panicked: {message}")]
    Panic { message: String },

    #[error("Exchange failed: {message}")]
    Exchange { message: String },

    #[error("Controller '{type_name}' could not be downcast for invocation")]
    Target { type_name: &'static str },
}

impl DispatchError {
    #[inline]
    pub(crate) fn not_found(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self::NotFound {
            method: method.into(),
            path: path.into(),
        }
    }

    #[inline]
    pub(crate) const fn body_too_large(limit: u64) -> Self {
        Self::BodyTooLarge { limit }
    }

    #[inline]
    pub(crate) const fn missing_parameter(index: usize, type_name: &'static str) -> Self {
        Self::MissingParameter { index, type_name }
    }

    #[inline]
    pub fn conversion(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conversion {
            name: name.into(),
            message: message.into(),
        }
    }

    #[inline]
    pub(crate) fn body(message: impl Into<String>) -> Self {
        Self::Body {
            message: message.into(),
        }
    }

    #[inline]
    pub(crate) const fn timeout(millis: u64) -> Self {
        Self::Timeout { millis }
    }

    #[inline]
    pub fn filter(filter: &'static str, message: impl Into<String>) -> Self {
        Self::Filter {
            filter,
            message: message.into(),
        }
    }

    #[inline]
    pub(crate) fn panic(message: impl Into<String>) -> Self {
        Self::Panic {
            message: message.into(),
        }
    }

    #[inline]
    pub(crate) fn exchange(message: impl Into<String>) -> Self {
        Self::Exchange {
            message: message.into(),
        }
    }

    #[inline]
    pub(crate) const fn target(type_name: &'static str) -> Self {
        Self::Target { type_name }
    }

    /// HTTP status the default failure renderer uses for this error.
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::NotFound { .. } => 404,
            DispatchError::BodyTooLarge { .. } => 413,
            DispatchError::MissingParameter { .. } | DispatchError::Conversion { .. } => 400,
            DispatchError::Body { .. } => 400,
            DispatchError::Filter { .. } => 403,
            DispatchError::Timeout { .. } => 503,
            DispatchError::Panic { .. }
            | DispatchError::Exchange { .. }
            | DispatchError::Target { .. } => 500,
        }
    }
}

trait ErasedError: Error + Send + Sync + 'static {
    fn as_any(&self) -> &(dyn Any + Send + Sync);
    fn as_error(&self) -> &(dyn Error + Send + Sync + 'static);
}

impl<E> ErasedError for E
where
    E: Error + Send + Sync + 'static,
{
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn as_error(&self) -> &(dyn Error + Send + Sync + 'static) {
        self
    }
}

/// A type-erased handler failure.
///
/// `Failure` remembers the concrete type of the error it was built from, so
/// the return-type mapper table can select a renderer by that type. Any
/// `std::error::Error` converts into it with `?`.
#[derive(Clone)]
pub struct Failure {
    type_id: TypeId,
    type_name: &'static str,
    inner: Arc<dyn ErasedError>,
}

impl Failure {
    pub fn new<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            inner: Arc::new(error),
        }
    }

    /// Builds a failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(MessageError(message.into()))
    }

    /// The `TypeId` of the wrapped error's concrete type.
    pub fn error_type(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }

    pub fn as_error(&self) -> &(dyn Error + Send + Sync + 'static) {
        self.inner.as_error()
    }

    /// Strips any number of [`ExecutionError`] layers and returns the
    /// failure that was raised inside the deferred computation.
    pub fn unwrap_execution(self) -> Failure {
        let cause = self
            .downcast_ref::<ExecutionError>()
            .map(|execution| execution.cause().clone());
        match cause {
            Some(cause) => cause.unwrap_execution(),
            None => self,
        }
    }
}

impl<E> From<E> for Failure
where
    E: Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Failure::new(error)
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self.inner.as_error(), f)
    }
}

impl Debug for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Failure")
            .field("type", &self.type_name)
            .field("error", &self.inner.as_error())
            .finish()
    }
}

#[derive(Error, Debug)]
#[error("{0}")]
pub struct MessageError(String);

/// Wraps a failure raised by a deferred or callable result.
#[derive(Debug)]
pub struct ExecutionError {
    cause: Failure,
}

impl ExecutionError {
    pub fn new(cause: Failure) -> Self {
        Self { cause }
    }

    pub fn cause(&self) -> &Failure {
        &self.cause
    }
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Deferred execution failed: {}", self.cause)
    }
}

impl Error for ExecutionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.cause.as_error())
    }
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("card declined")]
    struct CardDeclined;

    #[test]
    fn failure_remembers_concrete_type() {
        let failure = Failure::from(CardDeclined);
        assert!(failure.is::<CardDeclined>());
        assert!(!failure.is::<DispatchError>());
        assert!(failure.downcast_ref::<CardDeclined>().is_some());
        assert_eq!(failure.to_string(), "card declined");
    }

    #[test]
    fn unwrap_execution_strips_every_layer() {
        let inner = Failure::from(CardDeclined);
        let wrapped = Failure::from(ExecutionError::new(Failure::from(ExecutionError::new(inner))));
        assert!(wrapped.is::<ExecutionError>());
        let unwrapped = wrapped.unwrap_execution();
        assert!(unwrapped.is::<CardDeclined>());
    }

    #[test]
    fn dispatch_errors_map_to_statuses() {
        assert_eq!(DispatchError::not_found("GET", "/x").status(), 404);
        assert_eq!(DispatchError::body_too_large(10).status(), 413);
        assert_eq!(DispatchError::missing_parameter(0, "i32").status(), 400);
        assert_eq!(DispatchError::timeout(5).status(), 503);
        assert_eq!(DispatchError::panic("boom").status(), 500);
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
