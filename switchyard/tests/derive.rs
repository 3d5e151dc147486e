use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use switchyard::component::{Catalog, Component, Injectable, TypeKey};
use switchyard::config::DispatcherConfig;
use switchyard::host::HostRequest;
use switchyard::host::memory::{MemoryExchange, MemoryRequest};
use switchyard::mapper::{Annotation, ArgumentMapper};
use switchyard::router::{Controller, Routes};
use switchyard::{Dispatcher, Failure, Reply, RequestContext};
use tokio::runtime::Handle;

trait Greeter: Send + Sync {
    fn greet(&self, name: &str, locale: &Locale) -> String;
}

#[derive(switchyard::Component)]
#[component(provides(dyn Greeter))]
struct PoliteGreeter;

impl Greeter for PoliteGreeter {
    fn greet(&self, name: &str, locale: &Locale) -> String {
        match locale.0.as_str() {
            "fr" => format!("Bonjour, {}", name),
            _ => format!("Hello, {}", name),
        }
    }
}

#[derive(switchyard::Component)]
#[component(lifecycle)]
struct Counter {
    starts: AtomicUsize,
    hits: AtomicUsize,
}

impl Component for Counter {
    fn initialize(&self) -> Result<(), Failure> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Locale(String);

#[derive(switchyard::Component)]
#[component(argument_mapper)]
struct LocaleMapper;

#[async_trait]
impl ArgumentMapper for LocaleMapper {
    type Output = Locale;

    async fn map(&self, ctx: &RequestContext, _annotation: Option<&Annotation>) -> Result<Option<Locale>, Failure> {
        let language = ctx
            .request()
            .header("accept-language")
            .unwrap_or_else(|| "en".to_string());
        Ok(Some(Locale(language)))
    }
}

#[derive(switchyard::Component)]
#[component(controller)]
struct GreetingController {
    greeter: Arc<dyn Greeter>,
    counter: Option<Arc<Counter>>,
    audit: Option<Arc<MissingAudit>>,
}

struct MissingAudit;

impl Controller for GreetingController {
    fn routes(routes: Routes<Self>) -> Routes<Self> {
        routes
            .get("/greet/{name}")
            .param::<String>(Annotation::path("name").required())
            .arg::<Locale>()
            .handler(|this, mut args| async move {
                let name: String = args.require(0)?;
                let locale: Locale = args.require(1)?;
                if let Some(counter) = &this.counter {
                    counter.hits.fetch_add(1, Ordering::SeqCst);
                }
                Ok::<_, Failure>(Reply::text(this.greeter.greet(&name, &locale)))
            })
            .get("/audited")
            .handler(|this, _args| async move { Ok(Reply::json(this.audit.is_some())) })
    }
}

fn dispatcher() -> Dispatcher {
    let config = DispatcherConfig::builder()
        .boot_namespace(module_path!())
        .async_timeout_ms(1_000)
        .build();
    Dispatcher::boot_on(&Catalog::discover(), config, Handle::current()).unwrap()
}

#[test]
fn derived_definitions_declare_dependencies() {
    let definition = GreetingController::definition();
    let dependencies = definition.dependencies();
    assert_eq!(dependencies.len(), 3);
    assert_eq!(dependencies[0].key(), TypeKey::of::<dyn Greeter>());
    assert!(dependencies[0].is_required());
    assert!(!dependencies[1].is_required());

    assert!(PoliteGreeter::definition().provides(&TypeKey::of::<dyn Greeter>()));
    assert!(Counter::definition().dependencies().is_empty());
}

#[test]
fn discover_collects_derived_types() {
    let catalog = Catalog::discover();
    let components = catalog.components_in(module_path!());
    assert_eq!(components.len(), 4);
    assert_eq!(catalog.controllers_in(module_path!()).len(), 1);
    assert_eq!(catalog.argument_mappers_in(module_path!()).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn derived_components_serve_requests() {
    let dispatcher = dispatcher();
    let counter = dispatcher.components().get::<Counter>().unwrap();
    assert_eq!(counter.starts.load(Ordering::SeqCst), 1);

    let (exchange, response) = MemoryExchange::start(
        MemoryRequest::get("/greet/Ann")
            .header("Accept-Language", "fr")
            .build(),
    );
    dispatcher.service(exchange.clone());
    exchange.wait().await;
    assert_eq!(response.body_string(), "Bonjour, Ann");
    assert_eq!(counter.hits.load(Ordering::SeqCst), 1);

    let (exchange, response) = MemoryExchange::start(MemoryRequest::get("/audited").build());
    dispatcher.service(exchange.clone());
    exchange.wait().await;
    assert_eq!(response.body_string(), "false");
}
