use crate::cache::{Cache, new_map};
use crate::component::TypeKey;
use crate::context::RequestContext;
use crate::host::HostResponse;
use crate::mapper::body;
use crate::mapper::reply::{Completion, Entity, EntityError};
use crate::status::{DispatchError, Failure};
use bytes::Bytes;
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use std::any::{Any, TypeId};
use std::convert::Infallible;
use std::sync::Arc;

/// Writes one kind of result into the response.
///
/// `Target` selects what the mapper handles:
/// * a concrete value or error type matches that exact runtime type,
/// * [`Failure`] matches every failure,
/// * [`Completion`] matches everything and acts as a catch-all.
pub trait ReturnTypeMapper: Send + Sync + 'static {
    type Target: Any;

    fn render(&self, target: &Self::Target, ctx: &RequestContext) -> Result<(), Failure>;
}

/// What a registered mapper claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKey {
    Exact(TypeKey),
    AnyFailure,
    Any,
}

impl ReturnKey {
    pub fn of<T: Any>() -> Self {
        let id = TypeId::of::<T>();
        if id == TypeId::of::<Completion>() {
            ReturnKey::Any
        } else if id == TypeId::of::<Failure>() {
            ReturnKey::AnyFailure
        } else {
            ReturnKey::Exact(TypeKey::of::<T>())
        }
    }

    /// Whether a completion of this runtime type can be handed to the mapper.
    pub fn accepts(&self, completion: &Completion) -> bool {
        match self {
            ReturnKey::Any => true,
            ReturnKey::AnyFailure => completion.is_failure(),
            ReturnKey::Exact(key) => key.id() == completion.value_type(),
        }
    }

    /// Exact types sort before any-failure, which sorts before any.
    fn rank(&self) -> u8 {
        match self {
            ReturnKey::Exact(_) => 0,
            ReturnKey::AnyFailure => 1,
            ReturnKey::Any => 2,
        }
    }
}

/// Object-safe view of a [`ReturnTypeMapper`].
pub trait DynReturnTypeMapper: Send + Sync {
    fn key(&self) -> ReturnKey;

    fn mapper_type(&self) -> &'static str;

    fn render(&self, completion: &Completion, ctx: &RequestContext) -> Result<(), Failure>;
}

fn target<T: Any>(completion: &Completion) -> Option<&T> {
    if let Some(whole) = (completion as &dyn Any).downcast_ref::<T>() {
        return Some(whole);
    }
    match completion {
        Completion::Success(reply) => reply.downcast_ref::<T>(),
        Completion::Failure(failure) => (failure as &dyn Any)
            .downcast_ref::<T>()
            .or_else(|| failure.downcast_ref::<T>()),
    }
}

struct ReturnTypeMapperAdapter<M> {
    mapper: Arc<M>,
}

impl<M> DynReturnTypeMapper for ReturnTypeMapperAdapter<M>
where
    M: ReturnTypeMapper,
{
    fn key(&self) -> ReturnKey {
        ReturnKey::of::<M::Target>()
    }

    fn mapper_type(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    fn render(&self, completion: &Completion, ctx: &RequestContext) -> Result<(), Failure> {
        match target::<M::Target>(completion) {
            Some(target) => self.mapper.render(target, ctx),
            None => Err(Failure::msg(format!(
                "{} cannot render a {}",
                self.mapper_type(),
                completion.type_name()
            ))),
        }
    }
}

pub fn erase_return_mapper<M: ReturnTypeMapper>(mapper: Arc<M>) -> Arc<dyn DynReturnTypeMapper> {
    Arc::new(ReturnTypeMapperAdapter { mapper })
}

type ResolvedKey = (TypeId, bool);

struct ResolvedMappers {
    map: DashMap<ResolvedKey, Arc<dyn DynReturnTypeMapper>, FnvBuildHasher>,
}

impl Cache<ResolvedKey, dyn DynReturnTypeMapper> for ResolvedMappers {
    fn inner(&self) -> &DashMap<ResolvedKey, Arc<dyn DynReturnTypeMapper>, FnvBuildHasher> {
        &self.map
    }

    fn cache_id(&self) -> &'static str {
        "ReturnTypeMapperTable"
    }
}

/// Renderers in registration order, with the first match per runtime type
/// remembered for the life of the table.
pub struct ReturnTypeMapperTable {
    mappers: Vec<Arc<dyn DynReturnTypeMapper>>,
    resolved: ResolvedMappers,
    fallback: Arc<dyn DynReturnTypeMapper>,
}

impl ReturnTypeMapperTable {
    /// User mappers first, exact types ahead of catch-alls and otherwise in
    /// the order given. Each default is appended only when no user mapper
    /// already claims its key.
    pub fn new(user_mappers: Vec<Arc<dyn DynReturnTypeMapper>>, default_encoding: &str) -> Self {
        let fallback = erase_return_mapper(Arc::new(ObjectRenderer::new(default_encoding)));
        let defaults = [
            erase_return_mapper(Arc::new(EntityRenderer)),
            erase_return_mapper(Arc::new(EntityErrorRenderer)),
            erase_return_mapper(Arc::new(FailureRenderer)),
            fallback.clone(),
        ];
        let mut mappers = user_mappers;
        mappers.sort_by_key(|mapper| mapper.key().rank());
        let user_count = mappers.len();
        for default in defaults {
            if mappers.iter().any(|mapper| mapper.key() == default.key()) {
                log::debug!("Default {} replaced by a user mapper", default.mapper_type());
                continue;
            }
            mappers.push(default);
        }
        log::info!(
            "Return-type mapper table built with {} user mappers, {} total",
            user_count,
            mappers.len()
        );
        Self {
            mappers,
            resolved: ResolvedMappers { map: new_map() },
            fallback,
        }
    }

    pub fn mappers(&self) -> &[Arc<dyn DynReturnTypeMapper>] {
        &self.mappers
    }

    /// Never fails: when nothing claims the type the catch-all renderer is
    /// used.
    pub fn mapper_for(&self, completion: &Completion) -> Arc<dyn DynReturnTypeMapper> {
        let key = (completion.value_type(), completion.is_failure());
        let resolved = self.resolved.get_or_resolve::<_, Infallible>(key, || {
            let mapper = self
                .mappers
                .iter()
                .find(|mapper| mapper.key().accepts(completion))
                .cloned()
                .unwrap_or_else(|| self.fallback.clone());
            log::debug!("{} resolved to {}", completion.type_name(), mapper.mapper_type());
            Ok(mapper)
        });
        match resolved {
            Ok(mapper) => mapper,
            Err(never) => match never {},
        }
    }

    pub fn render(&self, completion: &Completion, ctx: &RequestContext) -> Result<(), Failure> {
        self.mapper_for(completion).render(completion, ctx)
    }

    pub fn resolved_len(&self) -> usize {
        self.resolved.len()
    }
}

/// Writes every part of an [`Entity`].
pub fn write_entity(response: &dyn HostResponse, entity: &Entity) {
    response.set_status(entity.status());
    for (name, value) in entity.headers() {
        response.add_header(name, value);
    }
    if let Some(content_type) = entity.content_type() {
        response.set_content_type(content_type);
    }
    if !entity.body().is_empty() {
        response.write(entity.body());
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ if status >= 500 => "Server Error",
        _ => "Client Error",
    }
}

fn write_error(response: &dyn HostResponse, status: u16, message: &str) {
    let body = serde_json::json!({
        "status": status,
        "error": reason(status),
        "message": message,
    });
    response.set_status(status);
    response.set_content_type("application/json");
    response.write(body.to_string().as_bytes());
}

fn render_failure(failure: &Failure, ctx: &RequestContext) {
    if let Some(rejected) = failure.downcast_ref::<EntityError>() {
        write_entity(ctx.response().as_ref(), rejected.entity());
        return;
    }
    let status = failure
        .downcast_ref::<DispatchError>()
        .map_or(500, DispatchError::status);
    if status >= 500 {
        log::error!("{}: request failed: {}", ctx, failure);
    } else {
        log::debug!("{}: request rejected with {}: {}", ctx, status, failure);
    }
    write_error(ctx.response().as_ref(), status, &failure.to_string());
}

struct EntityRenderer;

impl ReturnTypeMapper for EntityRenderer {
    type Target = Entity;

    fn render(&self, entity: &Entity, ctx: &RequestContext) -> Result<(), Failure> {
        write_entity(ctx.response().as_ref(), entity);
        Ok(())
    }
}

struct EntityErrorRenderer;

impl ReturnTypeMapper for EntityErrorRenderer {
    type Target = EntityError;

    fn render(&self, error: &EntityError, ctx: &RequestContext) -> Result<(), Failure> {
        write_entity(ctx.response().as_ref(), error.entity());
        Ok(())
    }
}

struct FailureRenderer;

impl ReturnTypeMapper for FailureRenderer {
    type Target = Failure;

    fn render(&self, failure: &Failure, ctx: &RequestContext) -> Result<(), Failure> {
        render_failure(failure, ctx);
        Ok(())
    }
}

/// Catch-all: picks a representation from the value's runtime type.
struct ObjectRenderer {
    encoding: String,
}

impl ObjectRenderer {
    fn new(encoding: &str) -> Self {
        Self {
            encoding: encoding.to_string(),
        }
    }

    fn text(&self, response: &dyn HostResponse, text: &str) {
        response.set_content_type(&format!("text/plain; charset={}", self.encoding));
        response.write(&body::encode(text, &self.encoding));
    }
}

impl ReturnTypeMapper for ObjectRenderer {
    type Target = Completion;

    fn render(&self, completion: &Completion, ctx: &RequestContext) -> Result<(), Failure> {
        let reply = match completion {
            Completion::Success(reply) => reply,
            Completion::Failure(failure) => {
                render_failure(failure, ctx);
                return Ok(());
            }
        };
        let response = ctx.response().as_ref();
        if let Some(text) = reply.downcast_ref::<String>() {
            self.text(response, text);
        } else if let Some(text) = reply.downcast_ref::<&'static str>() {
            self.text(response, text);
        } else if reply.is::<()>() {
            response.set_status(204);
        } else if let Some(bytes) = reply.downcast_ref::<Bytes>() {
            response.set_content_type("application/octet-stream");
            response.write(bytes);
        } else if let Some(bytes) = reply.downcast_ref::<Vec<u8>>() {
            response.set_content_type("application/octet-stream");
            response.write(bytes);
        } else if let Some(entity) = reply.downcast_ref::<Entity>() {
            write_entity(response, entity);
        } else if let Some(json) = reply
            .to_json()
            .or_else(|| reply.downcast_ref::<serde_json::Value>().cloned())
        {
            response.set_content_type("application/json");
            response.write(json.to_string().as_bytes());
        } else {
            log::warn!(
                "{}: no renderer for result type {}",
                ctx,
                reply.key()
            );
            write_error(
                response,
                500,
                &format!("No renderer for result type {}", reply.key()),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{MemoryExchange, MemoryRequest, MemoryResponse};
    use crate::mapper::reply::Reply;
    use serde::Serialize;
    use serde_json::json;
    use thiserror::Error;

    #[derive(Error, Debug)]
    #[error("quota exhausted")]
    struct QuotaExhausted;

    struct QuotaRenderer;

    impl ReturnTypeMapper for QuotaRenderer {
        type Target = QuotaExhausted;

        fn render(&self, _error: &QuotaExhausted, ctx: &RequestContext) -> Result<(), Failure> {
            ctx.response().set_status(429);
            Ok(())
        }
    }

    struct Shouting;

    impl ReturnTypeMapper for Shouting {
        type Target = String;

        fn render(&self, text: &String, ctx: &RequestContext) -> Result<(), Failure> {
            ctx.response().write(text.to_uppercase().as_bytes());
            Ok(())
        }
    }

    fn context() -> (RequestContext, Arc<MemoryResponse>) {
        let (exchange, response) = MemoryExchange::start(MemoryRequest::get("/").build());
        (RequestContext::new(exchange, None), response)
    }

    fn render(table: &ReturnTypeMapperTable, completion: Completion) -> Arc<MemoryResponse> {
        let (ctx, response) = context();
        table.render(&completion, &ctx).unwrap();
        response
    }

    #[test]
    fn user_mapper_claims_its_type() {
        let table = ReturnTypeMapperTable::new(vec![erase_return_mapper(Arc::new(Shouting))], "UTF-8");
        let response = render(&table, Completion::Success(Reply::text("hi")));
        assert_eq!(response.body_string(), "HI");
        let response = render(&table, Completion::Success(Reply::new(Entity::created())));
        assert_eq!(response.status(), 201);
    }

    #[test]
    fn failures_resolve_by_concrete_type() {
        let table = ReturnTypeMapperTable::new(vec![erase_return_mapper(Arc::new(QuotaRenderer))], "UTF-8");
        let response = render(&table, Completion::Failure(Failure::from(QuotaExhausted)));
        assert_eq!(response.status(), 429);

        let response = render(&table, Completion::Failure(DispatchError::not_found("GET", "/x").into()));
        assert_eq!(response.status(), 404);
        let body = response.body_json().unwrap();
        assert_eq!(body["error"], "Not Found");

        let rejected = EntityError::new(Entity::new(409).text("taken"));
        let response = render(&table, Completion::Failure(rejected.into()));
        assert_eq!(response.status(), 409);
        assert_eq!(response.body_string(), "taken");
    }

    #[test]
    fn resolution_is_cached_per_runtime_type() {
        let table = ReturnTypeMapperTable::new(Vec::new(), "UTF-8");
        let first = table.mapper_for(&Completion::Success(Reply::text("a")));
        let second = table.mapper_for(&Completion::Success(Reply::text("b")));
        assert!(Arc::ptr_eq(&first, &second));
        table.mapper_for(&Completion::Failure(Failure::msg("x")));
        assert_eq!(table.resolved_len(), 2);
    }

    #[test]
    fn user_catch_all_replaces_object_renderer() {
        struct Silent;
        impl ReturnTypeMapper for Silent {
            type Target = Completion;
            fn render(&self, _completion: &Completion, ctx: &RequestContext) -> Result<(), Failure> {
                ctx.response().set_status(299);
                Ok(())
            }
        }
        let table = ReturnTypeMapperTable::new(vec![erase_return_mapper(Arc::new(Silent))], "UTF-8");
        assert_eq!(table.mappers().len(), 4);
        let response = render(&table, Completion::Success(Reply::new(7u8)));
        assert_eq!(response.status(), 299);
    }

    #[test]
    fn exact_user_mappers_outrank_user_catch_alls() {
        struct Everything;
        impl ReturnTypeMapper for Everything {
            type Target = Completion;
            fn render(&self, _completion: &Completion, ctx: &RequestContext) -> Result<(), Failure> {
                ctx.response().set_status(299);
                Ok(())
            }
        }
        let table = ReturnTypeMapperTable::new(
            vec![
                erase_return_mapper(Arc::new(Everything)),
                erase_return_mapper(Arc::new(QuotaRenderer)),
                erase_return_mapper(Arc::new(Shouting)),
            ],
            "UTF-8",
        );
        assert_eq!(table.mappers()[0].key(), ReturnKey::Exact(TypeKey::of::<QuotaExhausted>()));
        assert_eq!(table.mappers()[1].key(), ReturnKey::Exact(TypeKey::of::<String>()));

        let response = render(&table, Completion::Success(Reply::text("hi")));
        assert_eq!(response.body_string(), "HI");
        let response = render(&table, Completion::Failure(Failure::from(QuotaExhausted)));
        assert_eq!(response.status(), 429);
        let response = render(&table, Completion::Success(Reply::new(7u8)));
        assert_eq!(response.status(), 299);
    }

    #[test]
    fn object_renderer_picks_representation() {
        #[derive(Serialize)]
        struct Order {
            id: u32,
        }

        let table = ReturnTypeMapperTable::new(Vec::new(), "ISO-8859-1");

        let response = render(&table, Completion::Success(Reply::text("für")));
        assert_eq!(response.content_type().as_deref(), Some("text/plain; charset=ISO-8859-1"));
        assert_eq!(response.body(), vec![0x66, 0xFC, 0x72]);

        let response = render(&table, Completion::Success(Reply::empty()));
        assert_eq!(response.status(), 204);

        let response = render(&table, Completion::Success(Reply::new(Bytes::from_static(b"\x01"))));
        assert_eq!(response.content_type().as_deref(), Some("application/octet-stream"));

        let response = render(&table, Completion::Success(Reply::json(Order { id: 3 })));
        assert_eq!(response.body_json().unwrap(), json!({ "id": 3 }));

        let response = render(&table, Completion::Success(Reply::new(json!([1, 2]))));
        assert_eq!(response.body_json().unwrap(), json!([1, 2]));

        let response = render(&table, Completion::Success(Reply::new(7u8)));
        assert_eq!(response.status(), 500);
    }

    #[test]
    fn mismatched_target_is_an_error() {
        let (ctx, _) = context();
        let mapper = erase_return_mapper(Arc::new(Shouting));
        assert_eq!(mapper.key(), ReturnKey::Exact(TypeKey::of::<String>()));
        assert!(mapper.render(&Completion::Success(Reply::new(1u8)), &ctx).is_err());
    }
}
