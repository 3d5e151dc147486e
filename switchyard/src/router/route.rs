use crate::component::{ComponentTable, Injectable, TypeKey};
use crate::mapper::argument::{Annotation, Arguments, Parameter};
use crate::mapper::reply::Returned;
use crate::router::filter::Filter;
use crate::router::path::{GlobPathMatcher, PathMatcher};
use crate::status::{DispatchError, Failure};
use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture};
use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// A route's handler with the controller type erased. The first argument is
/// the controller instance.
pub type Handler = Arc<
    dyn Fn(Arc<dyn Any + Send + Sync>, Arguments) -> BoxFuture<'static, Result<Returned, Failure>>
        + Send
        + Sync,
>;

/// A matcher type named by a route.
#[derive(Clone, Copy)]
pub struct MatcherRef {
    key: TypeKey,
    create: fn(&ComponentTable) -> Arc<dyn PathMatcher>,
}

fn create_matcher<M>(table: &ComponentTable) -> Arc<dyn PathMatcher>
where
    M: PathMatcher + Default,
{
    match table.get::<M>() {
        Some(matcher) => matcher as Arc<dyn PathMatcher>,
        None => Arc::new(M::default()),
    }
}

impl MatcherRef {
    /// Uses the component table's `M` when there is one, a default `M`
    /// otherwise.
    pub fn of<M: PathMatcher + Default>() -> Self {
        Self {
            key: TypeKey::of::<M>(),
            create: create_matcher::<M>,
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub(crate) fn create(&self, table: &ComponentTable) -> Arc<dyn PathMatcher> {
        (self.create)(table)
    }
}

/// A filter type named by a route.
#[derive(Clone, Copy)]
pub struct FilterRef {
    key: TypeKey,
    create: fn(&ComponentTable) -> Option<Arc<dyn Filter>>,
}

fn create_filter<F: Filter>(table: &ComponentTable) -> Option<Arc<dyn Filter>> {
    table.get::<F>().map(|filter| filter as Arc<dyn Filter>)
}

impl FilterRef {
    pub fn of<F: Filter>() -> Self {
        Self {
            key: TypeKey::of::<F>(),
            create: create_filter::<F>,
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub(crate) fn create(&self, table: &ComponentTable) -> Option<Arc<dyn Filter>> {
        (self.create)(table)
    }
}

/// Everything a controller declares about one route.
pub struct RouteDefinition {
    name: String,
    pattern: String,
    methods: Vec<String>,
    matcher: MatcherRef,
    filters: Vec<FilterRef>,
    parameters: Vec<Parameter>,
    handler: Handler,
}

impl RouteDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn matcher(&self) -> &MatcherRef {
        &self.matcher
    }

    pub fn filters(&self) -> &[FilterRef] {
        &self.filters
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl Debug for RouteDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteDefinition")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("methods", &self.methods)
            .field("matcher", &self.matcher.key)
            .field("filters", &self.filters.iter().map(|f| f.key).collect::<Vec<_>>())
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// Route declarations of controller `C`, in declaration order.
pub struct Routes<C> {
    routes: Vec<RouteDefinition>,
    _marker: PhantomData<fn() -> C>,
}

impl<C> Routes<C>
where
    C: Controller,
{
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Starts a route accepting the given methods.
    pub fn route(self, pattern: &str, methods: &[&str]) -> RouteBuilder<C> {
        RouteBuilder {
            routes: self,
            name: None,
            pattern: pattern.to_string(),
            methods: methods.iter().map(|method| method.to_ascii_uppercase()).collect(),
            matcher: MatcherRef::of::<GlobPathMatcher>(),
            filters: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn get(self, pattern: &str) -> RouteBuilder<C> {
        self.route(pattern, &["GET"])
    }

    pub fn post(self, pattern: &str) -> RouteBuilder<C> {
        self.route(pattern, &["POST"])
    }

    pub fn put(self, pattern: &str) -> RouteBuilder<C> {
        self.route(pattern, &["PUT"])
    }

    pub fn delete(self, pattern: &str) -> RouteBuilder<C> {
        self.route(pattern, &["DELETE"])
    }

    pub fn patch(self, pattern: &str) -> RouteBuilder<C> {
        self.route(pattern, &["PATCH"])
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn into_definitions(self) -> Vec<RouteDefinition> {
        self.routes
    }
}

impl<C: Controller> Default for Routes<C> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RouteBuilder<C> {
    routes: Routes<C>,
    name: Option<String>,
    pattern: String,
    methods: Vec<String>,
    matcher: MatcherRef,
    filters: Vec<FilterRef>,
    parameters: Vec<Parameter>,
}

impl<C> RouteBuilder<C>
where
    C: Controller,
{
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn method(mut self, method: &str) -> Self {
        let method = method.to_ascii_uppercase();
        if !self.methods.contains(&method) {
            self.methods.push(method);
        }
        self
    }

    /// Defaults to [`GlobPathMatcher`].
    pub fn matcher<M: PathMatcher + Default>(mut self) -> Self {
        self.matcher = MatcherRef::of::<M>();
        self
    }

    /// Filters run in the order they are added.
    pub fn filter<F: Filter>(mut self) -> Self {
        self.filters.push(FilterRef::of::<F>());
        self
    }

    /// Declares the next parameter with the source it is read from.
    pub fn param<T: Any>(mut self, annotation: Annotation) -> Self {
        self.parameters.push(Parameter::of::<T>(Some(annotation)));
        self
    }

    /// Declares the next parameter by type alone.
    pub fn arg<T: Any>(mut self) -> Self {
        self.parameters.push(Parameter::of::<T>(None));
        self
    }

    /// Finishes the route. Parameters reach the handler in declaration
    /// order through [`Arguments`].
    pub fn handler<H, Fut, R>(self, handler: H) -> Routes<C>
    where
        H: Fn(Arc<C>, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Failure>> + Send + 'static,
        R: Into<Returned> + 'static,
    {
        let erased: Handler = Arc::new(
            move |target: Arc<dyn Any + Send + Sync>,
                  arguments: Arguments|
                  -> BoxFuture<'static, Result<Returned, Failure>> {
                match target.downcast::<C>() {
                    Ok(controller) => handler(controller, arguments)
                        .map(|result| result.map(Into::into))
                        .boxed(),
                    Err(_) => {
                        let failure = Failure::from(DispatchError::target(std::any::type_name::<C>()));
                        future::ready(Err(failure)).boxed()
                    }
                }
            },
        );
        let RouteBuilder {
            mut routes,
            name,
            pattern,
            methods,
            matcher,
            filters,
            parameters,
        } = self;
        let name = name.unwrap_or_else(|| format!("{} {}", methods.join(","), pattern));
        routes.routes.push(RouteDefinition {
            name,
            pattern,
            methods,
            matcher,
            filters,
            parameters,
            handler: erased,
        });
        routes
    }
}

/// A component that declares routes.
pub trait Controller: Injectable {
    fn routes(routes: Routes<Self>) -> Routes<Self>;
}

/// A controller's routes plus the means to fetch its instance from the
/// component table.
pub struct ControllerDefinition {
    key: TypeKey,
    routes: Vec<RouteDefinition>,
    resolve: fn(&ComponentTable) -> Option<Arc<dyn Any + Send + Sync>>,
}

fn resolve_controller<C: Controller>(table: &ComponentTable) -> Option<Arc<dyn Any + Send + Sync>> {
    table
        .get::<C>()
        .map(|controller| controller as Arc<dyn Any + Send + Sync>)
}

impl ControllerDefinition {
    pub fn of<C: Controller>() -> Self {
        Self {
            key: TypeKey::of::<C>(),
            routes: C::routes(Routes::new()).into_definitions(),
            resolve: resolve_controller::<C>,
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn type_name(&self) -> &'static str {
        self.key.name()
    }

    pub fn routes(&self) -> &[RouteDefinition] {
        &self.routes
    }

    pub(crate) fn resolve(&self, table: &ComponentTable) -> Option<Arc<dyn Any + Send + Sync>> {
        (self.resolve)(table)
    }
}

impl Debug for ControllerDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerDefinition")
            .field("type", &self.key)
            .field("routes", &self.routes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, ComponentDefinition, Dependencies};
    use crate::mapper::reply::Reply;
    use crate::router::path::RegexPathMatcher;

    struct Greeter;

    impl Component for Greeter {}

    impl Injectable for Greeter {
        fn definition() -> ComponentDefinition {
            ComponentDefinition::of(|_deps: &Dependencies<'_>| Ok(Greeter)).build()
        }
    }

    impl Controller for Greeter {
        fn routes(routes: Routes<Self>) -> Routes<Self> {
            routes
                .get("/hello/{name}")
                .param::<String>(Annotation::path("name").required())
                .handler(|_this, mut args| async move {
                    let name: String = args.require(0)?;
                    Ok::<_, Failure>(Reply::text(format!("hello {}", name)))
                })
                .route("^/raw/.*$", &["get", "head"])
                .name("raw")
                .method("GET")
                .matcher::<RegexPathMatcher>()
                .handler(|_this, _args| async { Ok(Reply::empty()) })
        }
    }

    #[test]
    fn routes_keep_declaration_order() {
        let definition = ControllerDefinition::of::<Greeter>();
        let routes = definition.routes();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].name(), "GET /hello/{name}");
        assert!(routes[0].matcher().key().is::<GlobPathMatcher>());
        assert!(routes[0].parameters()[0].is_required());
        assert_eq!(routes[1].name(), "raw");
        assert_eq!(routes[1].methods(), ["GET".to_string(), "HEAD".to_string()]);
        assert!(routes[1].matcher().key().is::<RegexPathMatcher>());
    }

    #[tokio::test]
    async fn handler_rejects_foreign_target() {
        let definition = ControllerDefinition::of::<Greeter>();
        let handler = definition.routes()[1].handler().clone();
        let failure = handler(Arc::new(5u32), Arguments::new(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(
            failure.downcast_ref::<DispatchError>(),
            Some(DispatchError::Target { .. })
        ));

        let returned = handler(Arc::new(Greeter), Arguments::new(Vec::new()))
            .await
            .unwrap();
        assert!(matches!(returned, Returned::Value(reply) if reply.is::<()>()));
    }
}
