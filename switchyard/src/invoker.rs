use crate::context::RequestContext;
use crate::mapper::argument::{ArgumentMapperTable, Arguments};
use crate::mapper::reply::{Reply, Returned};
use crate::router::RouteTable;
use crate::status::{DispatchError, ExecutionError, Failure, panic_message};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Runs one request from path matching to the handler's final value.
pub struct ControllerInvoker {
    routes: Arc<RouteTable>,
    arguments: Arc<ArgumentMapperTable>,
}

impl ControllerInvoker {
    pub fn new(routes: Arc<RouteTable>, arguments: Arc<ArgumentMapperTable>) -> Self {
        Self { routes, arguments }
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// # Behavior
    /// 1. Candidates are the routes registered for the request method; the
    ///    first whose matcher accepts the path wins.
    /// 2. The route's filters run in order; the first error aborts.
    /// 3. Parameters are resolved left to right. A required parameter that
    ///    resolves to nothing fails with `400`.
    /// 4. The handler runs; a panic becomes a failure.
    /// 5. Deferred results are awaited and callables run here, on the worker.
    pub async fn invoke(&self, ctx: RequestContext) -> Result<Reply, Failure> {
        let path = ctx.path_within_application();
        let candidates = self.routes.routes_by_method(ctx.method());
        if candidates.is_empty() {
            log::debug!("{}: no routes for method {}", ctx.id(), ctx.method());
            return Err(DispatchError::not_found(ctx.method(), path).into());
        }

        let Some((invokable, variables)) = candidates.iter().find_map(|candidate| {
            candidate
                .matcher()
                .matches(&ctx, candidate.pattern(), &path)
                .map(|variables| (candidate.clone(), variables))
        }) else {
            log::debug!("{}: no route matches {}", ctx.id(), path);
            return Err(DispatchError::not_found(ctx.method(), path).into());
        };
        log::trace!("{}: matched route '{}'", ctx.id(), invokable.name());
        let ctx = ctx.matched(invokable.clone(), variables);

        for (key, filter) in invokable.filters() {
            if let Err(e) = filter.filter(&ctx).await {
                log::debug!("{}: filter {} rejected the request: {}", ctx.id(), key, e);
                return Err(e);
            }
        }

        let mut values = Vec::with_capacity(invokable.parameters().len());
        for (index, parameter) in invokable.parameters().iter().enumerate() {
            let value = self.arguments.resolve(&ctx, parameter).await?;
            if value.is_none() && parameter.is_required() {
                return Err(DispatchError::missing_parameter(index, parameter.key().name()).into());
            }
            values.push(value);
        }

        let returned = match AssertUnwindSafe(invokable.call(Arguments::new(values)))
            .catch_unwind()
            .await
        {
            Ok(returned) => returned?,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("{}: handler '{}' panicked: {}", ctx, invokable.name(), message);
                return Err(DispatchError::panic(message).into());
            }
        };
        unwrap_returned(returned).await
    }
}

async fn unwrap_returned(returned: Returned) -> Result<Reply, Failure> {
    match returned {
        Returned::Value(reply) => Ok(reply),
        Returned::Deferred(future) => match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result.map_err(execution),
            Err(payload) => Err(execution(DispatchError::panic(panic_message(payload.as_ref())).into())),
        },
        Returned::Callable(callable) => match std::panic::catch_unwind(AssertUnwindSafe(callable)) {
            Ok(result) => result.map_err(execution),
            Err(payload) => Err(execution(DispatchError::panic(panic_message(payload.as_ref())).into())),
        },
    }
}

fn execution(cause: Failure) -> Failure {
    ExecutionError::new(cause).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, ComponentDefinition, ComponentTable, Dependencies, Injectable};
    use crate::host::HostRequest;
    use crate::mapper::argument::{Annotation, ArgumentMapper, erase_argument_mapper};
    use crate::host::memory::{MemoryRequest, context_for};
    use async_trait::async_trait;
    use crate::router::{Controller, ControllerDefinition, Routes};

    struct Shop;

    impl Component for Shop {}

    impl Injectable for Shop {
        fn definition() -> ComponentDefinition {
            ComponentDefinition::of(|_deps: &Dependencies<'_>| Ok(Shop)).build()
        }
    }

    impl Controller for Shop {
        fn routes(routes: Routes<Self>) -> Routes<Self> {
            routes
                .get("/items/{id}")
                .param::<i64>(Annotation::path("id").required())
                .handler(|_this, mut args| async move {
                    let id: i64 = args.require(0)?;
                    Ok::<_, Failure>(Reply::new(id))
                })
                .get("/items/**")
                .handler(|_this, _args| async { Ok(Reply::text("fallback")) })
                .get("/later")
                .handler(|_this, _args| async {
                    Ok(Returned::deferred(async { Ok(Reply::text("deferred")) }))
                })
                .get("/inline")
                .handler(|_this, _args| async {
                    Ok(Returned::callable(|| Err(Failure::msg("inline failed"))))
                })
                .get("/panic")
                .handler(|_this, _args| async {
                    if true {
                        panic!("handler exploded");
                    }
                    Ok(Reply::empty())
                })
                .get("/search")
                .param::<String>(Annotation::query("q").required())
                .handler(|_this, mut args| async move {
                    Ok::<_, Failure>(Reply::new(args.require::<String>(0)?))
                })
        }
    }

    fn invoker() -> ControllerInvoker {
        let components = ComponentTable::builder().instance(Arc::new(Shop)).build().unwrap();
        let definition = ControllerDefinition::of::<Shop>();
        let routes = RouteTable::build(&[&definition], &components);
        ControllerInvoker::new(Arc::new(routes), Arc::new(ArgumentMapperTable::new(Vec::new())))
    }

    struct Tenant(String);

    struct TenantMapper;

    #[async_trait]
    impl ArgumentMapper for TenantMapper {
        type Output = Tenant;

        async fn map(&self, ctx: &RequestContext, _annotation: Option<&Annotation>) -> Result<Option<Tenant>, Failure> {
            let name = ctx.request().header("x-tenant").unwrap_or_else(|| "public".to_string());
            ctx.set_property("tenant", name.clone());
            Ok(Some(Tenant(name)))
        }
    }

    struct Scope(String);

    struct ScopeMapper;

    #[async_trait]
    impl ArgumentMapper for ScopeMapper {
        type Output = Scope;

        async fn map(&self, ctx: &RequestContext, _annotation: Option<&Annotation>) -> Result<Option<Scope>, Failure> {
            Ok(ctx.property::<String>("tenant").map(|tenant| Scope(format!("scope:{}", tenant))))
        }
    }

    struct Scoped;

    impl Component for Scoped {}

    impl Injectable for Scoped {
        fn definition() -> ComponentDefinition {
            ComponentDefinition::of(|_deps: &Dependencies<'_>| Ok(Scoped)).build()
        }
    }

    impl Controller for Scoped {
        fn routes(routes: Routes<Self>) -> Routes<Self> {
            routes
                .get("/scoped")
                .arg::<Tenant>()
                .arg::<Scope>()
                .handler(|_this, mut args| async move {
                    let tenant: Tenant = args.require(0)?;
                    let scope: Option<Scope> = args.take(1);
                    let scope = scope.map(|scope| scope.0).unwrap_or_default();
                    Ok::<_, Failure>(Reply::text(format!("{} {}", tenant.0, scope)))
                })
        }
    }

    fn status(failure: &Failure) -> Option<u16> {
        failure.downcast_ref::<DispatchError>().map(DispatchError::status)
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let invoker = invoker();
        let reply = invoker.invoke(context_for(MemoryRequest::get("/items/12").build())).await.unwrap();
        assert_eq!(reply.downcast_ref::<i64>(), Some(&12));
        let reply = invoker
            .invoke(context_for(MemoryRequest::get("/items/12/reviews").build()))
            .await
            .unwrap();
        assert_eq!(reply.downcast_ref::<String>().map(String::as_str), Some("fallback"));
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let invoker = invoker();
        let failure = invoker.invoke(context_for(MemoryRequest::get("/nope").build())).await.unwrap_err();
        assert_eq!(status(&failure), Some(404));
        let failure = invoker
            .invoke(context_for(MemoryRequest::delete("/items/1").build()))
            .await
            .unwrap_err();
        assert_eq!(status(&failure), Some(404));
    }

    #[tokio::test]
    async fn bad_or_missing_parameters_are_client_errors() {
        let invoker = invoker();
        let failure = invoker.invoke(context_for(MemoryRequest::get("/items/x").build())).await.unwrap_err();
        assert_eq!(status(&failure), Some(400));
        let failure = invoker.invoke(context_for(MemoryRequest::get("/search").build())).await.unwrap_err();
        assert!(matches!(
            failure.downcast_ref::<DispatchError>(),
            Some(DispatchError::MissingParameter { index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn deferred_and_callable_results_are_unwrapped() {
        let invoker = invoker();
        let reply = invoker.invoke(context_for(MemoryRequest::get("/later").build())).await.unwrap();
        assert_eq!(reply.downcast_ref::<String>().map(String::as_str), Some("deferred"));

        let failure = invoker.invoke(context_for(MemoryRequest::get("/inline").build())).await.unwrap_err();
        assert!(failure.is::<ExecutionError>());
        assert_eq!(failure.unwrap_execution().to_string(), "inline failed");
    }

    #[tokio::test]
    async fn handler_panic_becomes_failure() {
        let invoker = invoker();
        let failure = invoker.invoke(context_for(MemoryRequest::get("/panic").build())).await.unwrap_err();
        assert_eq!(status(&failure), Some(500));
        assert!(failure.to_string().contains("handler exploded"));
    }

    #[tokio::test]
    async fn later_mappers_see_properties_set_by_earlier_ones() {
        let components = ComponentTable::builder().instance(Arc::new(Scoped)).build().unwrap();
        let definition = ControllerDefinition::of::<Scoped>();
        let routes = RouteTable::build(&[&definition], &components);
        let arguments = ArgumentMapperTable::new(vec![
            erase_argument_mapper(Arc::new(ScopeMapper)),
            erase_argument_mapper(Arc::new(TenantMapper)),
        ]);
        let invoker = ControllerInvoker::new(Arc::new(routes), Arc::new(arguments));

        let ctx = context_for(MemoryRequest::get("/scoped").header("X-Tenant", "acme").build());
        let reply = invoker.invoke(ctx.clone()).await.unwrap();
        assert_eq!(reply.downcast_ref::<String>().map(String::as_str), Some("acme scope:acme"));
        assert_eq!(ctx.property::<String>("tenant").as_deref(), Some("acme"));
    }
}
