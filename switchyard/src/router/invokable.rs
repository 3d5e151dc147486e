use crate::component::TypeKey;
use crate::mapper::argument::{Arguments, Parameter};
use crate::mapper::reply::Returned;
use crate::router::filter::Filter;
use crate::router::path::PathMatcher;
use crate::router::route::Handler;
use crate::status::Failure;
use futures_util::future::BoxFuture;
use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// A route bound to live instances: controller, matcher and filters resolved
/// from the component table. Immutable once built.
pub struct Invokable {
    name: String,
    pattern: String,
    methods: Vec<String>,
    controller_key: TypeKey,
    controller: Arc<dyn Any + Send + Sync>,
    matcher_key: TypeKey,
    matcher: Arc<dyn PathMatcher>,
    filters: Vec<(TypeKey, Arc<dyn Filter>)>,
    parameters: Vec<Parameter>,
    handler: Handler,
}

impl Invokable {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        pattern: String,
        methods: Vec<String>,
        controller: (TypeKey, Arc<dyn Any + Send + Sync>),
        matcher: (TypeKey, Arc<dyn PathMatcher>),
        filters: Vec<(TypeKey, Arc<dyn Filter>)>,
        parameters: Vec<Parameter>,
        handler: Handler,
    ) -> Self {
        Self {
            name,
            pattern,
            methods,
            controller_key: controller.0,
            controller: controller.1,
            matcher_key: matcher.0,
            matcher: matcher.1,
            filters,
            parameters,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn controller_type(&self) -> TypeKey {
        self.controller_key
    }

    pub fn controller(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.controller
    }

    pub fn matcher_type(&self) -> TypeKey {
        self.matcher_key
    }

    pub fn matcher(&self) -> &Arc<dyn PathMatcher> {
        &self.matcher
    }

    pub fn filters(&self) -> &[(TypeKey, Arc<dyn Filter>)] {
        &self.filters
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub(crate) fn call(&self, arguments: Arguments) -> BoxFuture<'static, Result<Returned, Failure>> {
        (self.handler)(self.controller.clone(), arguments)
    }
}

impl Debug for Invokable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invokable")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("methods", &self.methods)
            .field("controller", &self.controller_key)
            .field("matcher", &self.matcher_key)
            .field(
                "filters",
                &self.filters.iter().map(|(key, _)| *key).collect::<Vec<_>>(),
            )
            .field("parameters", &self.parameters.len())
            .finish()
    }
}
