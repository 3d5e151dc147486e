use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use switchyard::component::Catalog;
use switchyard::config::{Config, DefaultConfigProvider, DispatcherConfig, FileConfigProvider};
use switchyard::host::HostRequest;
use switchyard::mapper::{Annotation, Entity, EntityError, MultiMap, Returned};
use switchyard::router::{Controller, Filter, Routes};
use switchyard::{Component, Dispatcher, Failure, Reply, RequestContext, logger};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Note {
    id: u64,
    text: String,
}

#[derive(Component)]
struct NoteStore {
    next: AtomicU64,
    notes: dashmap::DashMap<u64, Note>,
}

impl NoteStore {
    fn add(&self, text: String) -> Note {
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let note = Note { id, text };
        self.notes.insert(id, note.clone());
        note
    }
}

#[derive(Component)]
struct ApiKey;

#[async_trait]
impl Filter for ApiKey {
    async fn filter(&self, ctx: &RequestContext) -> Result<(), Failure> {
        match ctx.request().header("x-api-key").as_deref() {
            Some("letmein") => Ok(()),
            _ => Err(EntityError::new(Entity::new(401).text("api key required")).into()),
        }
    }
}

#[derive(Component)]
#[component(controller)]
struct NoteController {
    store: Arc<NoteStore>,
}

impl Controller for NoteController {
    fn routes(routes: Routes<Self>) -> Routes<Self> {
        routes
            .get("/notes/{id:\\d+}")
            .param::<i64>(Annotation::path("id").required())
            .handler(|this, mut args| async move {
                let id: i64 = args.require(0)?;
                let found = u64::try_from(id)
                    .ok()
                    .and_then(|id| this.store.notes.get(&id).map(|note| note.value().clone()));
                match found {
                    Some(note) => Ok::<_, Failure>(Reply::json(note)),
                    None => Err(Failure::from(EntityError::new(Entity::new(404).text("no such note")))),
                }
            })
            .post("/notes")
            .filter::<ApiKey>()
            .param::<MultiMap>(Annotation::body())
            .handler(|this, mut args| async move {
                let form: MultiMap = args.take(0).unwrap_or_default();
                let text = form.get("text").and_then(|values| values.first()).cloned().unwrap_or_default();
                let note = this.store.add(text);
                Ok::<_, Failure>(Entity::created().json(&serde_json::json!({ "id": note.id })))
            })
            .get("/notes/slow")
            .handler(|_this, _args| async {
                Ok(Returned::deferred(async {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    Ok(Reply::text("took a while"))
                }))
            })
            .post("/echo")
            .param::<Bytes>(Annotation::body())
            .handler(|_this, mut args| async move {
                let body: Bytes = args.take(0).unwrap_or_default();
                Ok::<_, Failure>(Reply::new(body))
            })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    logger::init();

    let config: DispatcherConfig = match std::env::var("SWITCHYARD_CONFIG_DIR") {
        Ok(base_path) => Config::new(FileConfigProvider {
            base_path,
            config_name: "switchyard.json".to_string(),
        })?
        .into_inner(),
        Err(_) => Config::new(DefaultConfigProvider)?.into_inner(),
    };
    let config = DispatcherConfig {
        boot_namespace: module_path!().to_string(),
        ..config
    };
    let dispatcher = Arc::new(Dispatcher::boot(&Catalog::discover(), config)?);

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    println!("Available endpoints:");
    println!("  curl http://{}/notes/1", addr);
    println!("  curl -H 'x-api-key: letmein' -d 'text=hello' http://{}/notes", addr);
    println!("  curl http://{}/notes/slow", addr);
    println!("  curl -d 'ping' http://{}/echo", addr);
    switchyard::host::hyper::listen(dispatcher, addr).await?;
    Ok(())
}
