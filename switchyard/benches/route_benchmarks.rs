use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use switchyard::component::{Component, ComponentDefinition, ComponentTable, Dependencies, Injectable};
use switchyard::host::memory::{MemoryRequest, context_for};
use switchyard::mapper::{Annotation, ArgumentMapperTable};
use switchyard::router::path::{GlobPathMatcher, PathMatcher, RegexPathMatcher};
use switchyard::router::{Controller, ControllerDefinition, RouteTable, Routes};
use switchyard::{ControllerInvoker, Failure, Reply};

// Route lookup and full invocation, to watch the cost of a linear scan as
// controllers grow.

const ROUTES: usize = 64;

struct Wide;

impl Component for Wide {}

impl Injectable for Wide {
    fn definition() -> ComponentDefinition {
        ComponentDefinition::of(|_deps: &Dependencies<'_>| Ok(Wide)).build()
    }
}

impl Controller for Wide {
    fn routes(mut routes: Routes<Self>) -> Routes<Self> {
        for i in 0..ROUTES {
            routes = routes
                .get(&format!("/bench/{}/items/{{id}}", i))
                .param::<i64>(Annotation::path("id").required())
                .handler(|_this, mut args| async move {
                    let id: i64 = args.require(0)?;
                    Ok::<_, Failure>(Reply::new(id))
                });
        }
        routes
    }
}

fn bench_matchers(c: &mut Criterion) {
    let ctx = context_for(MemoryRequest::get("/bench/7/items/42").build());
    let glob = GlobPathMatcher;
    let regex = RegexPathMatcher;

    c.bench_function("glob_literal", |b| {
        b.iter(|| glob.matches(&ctx, black_box("/bench/7/items/42"), black_box("/bench/7/items/42")))
    });
    c.bench_function("glob_variable", |b| {
        b.iter(|| glob.matches(&ctx, black_box("/bench/{n}/items/{id:\\d+}"), black_box("/bench/7/items/42")))
    });
    c.bench_function("glob_double_star", |b| {
        b.iter(|| glob.matches(&ctx, black_box("/bench/**/{id}"), black_box("/bench/7/items/42")))
    });
    c.bench_function("regex_named_groups", |b| {
        b.iter(|| {
            regex.matches(
                &ctx,
                black_box("/bench/(?P<n>\\d+)/items/(?P<id>\\d+)"),
                black_box("/bench/7/items/42"),
            )
        })
    });
}

fn bench_invoke(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let components = ComponentTable::builder().instance(Arc::new(Wide)).build().unwrap();
    let definition = ControllerDefinition::of::<Wide>();
    let routes = RouteTable::build(&[&definition], &components);
    let invoker = ControllerInvoker::new(Arc::new(routes), Arc::new(ArgumentMapperTable::new(Vec::new())));

    c.bench_function("invoke_first_route", |b| {
        b.iter(|| {
            let ctx = context_for(MemoryRequest::get("/bench/0/items/42").build());
            runtime.block_on(invoker.invoke(ctx)).unwrap()
        })
    });
    c.bench_function("invoke_last_route", |b| {
        let path = format!("/bench/{}/items/42", ROUTES - 1);
        b.iter(|| {
            let ctx = context_for(MemoryRequest::get(&path).build());
            runtime.block_on(invoker.invoke(ctx)).unwrap()
        })
    });
    c.bench_function("invoke_not_found", |b| {
        b.iter(|| {
            let ctx = context_for(MemoryRequest::get("/elsewhere").build());
            runtime.block_on(invoker.invoke(ctx)).is_err()
        })
    });
}

criterion_group!(benches, bench_matchers, bench_invoke);
criterion_main!(benches);
