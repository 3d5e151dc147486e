use crate::component::TypeKey;
use crate::context::RequestContext;
use crate::host::AsyncExchange;
use crate::mapper::defaults;
use crate::status::{DispatchError, Failure};
use async_trait::async_trait;
use fnv::FnvBuildHasher;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Where a parameter's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Query,
    Path,
    Header,
    Cookie,
    Attribute,
    Body,
}

/// Declared metadata on a handler parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    source: Source,
    name: String,
    required: bool,
}

impl Annotation {
    pub fn new(source: Source, name: impl Into<String>) -> Self {
        Self {
            source,
            name: name.into(),
            required: false,
        }
    }

    pub fn query(name: impl Into<String>) -> Self {
        Self::new(Source::Query, name)
    }

    pub fn path(name: impl Into<String>) -> Self {
        Self::new(Source::Path, name)
    }

    pub fn header(name: impl Into<String>) -> Self {
        Self::new(Source::Header, name)
    }

    pub fn cookie(name: impl Into<String>) -> Self {
        Self::new(Source::Cookie, name)
    }

    pub fn attribute(name: impl Into<String>) -> Self {
        Self::new(Source::Attribute, name)
    }

    pub fn body() -> Self {
        Self::new(Source::Body, "")
    }

    /// A required parameter that resolves to nothing fails the request with
    /// `400`.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

/// A declared handler parameter: its type and optional annotation.
#[derive(Debug, Clone)]
pub struct Parameter {
    key: TypeKey,
    annotation: Option<Annotation>,
}

impl Parameter {
    pub fn new(key: TypeKey, annotation: Option<Annotation>) -> Self {
        Self { key, annotation }
    }

    pub fn of<T: Any>(annotation: Option<Annotation>) -> Self {
        Self::new(TypeKey::of::<T>(), annotation)
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn annotation(&self) -> Option<&Annotation> {
        self.annotation.as_ref()
    }

    pub fn is_required(&self) -> bool {
        self.annotation.as_ref().is_some_and(Annotation::is_required)
    }
}

/// Resolved parameter values, in declaration order.
pub struct Arguments {
    values: Vec<Option<Box<dyn Any + Send>>>,
}

impl Arguments {
    pub fn new(values: Vec<Option<Box<dyn Any + Send>>>) -> Self {
        Self { values }
    }

    /// Moves the value at `index` out. `None` when the parameter resolved to
    /// nothing, was already taken, or is not a `T`.
    pub fn take<T: Any>(&mut self, index: usize) -> Option<T> {
        let slot = self.values.get_mut(index)?;
        match slot.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }

    /// Like [`Arguments::take`] but a missing value is a `400` failure.
    pub fn require<T: Any>(&mut self, index: usize) -> Result<T, Failure> {
        self.take(index)
            .ok_or_else(|| DispatchError::missing_parameter(index, std::any::type_name::<T>()).into())
    }

    pub fn is_present(&self, index: usize) -> bool {
        self.values.get(index).is_some_and(Option::is_some)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Debug for Arguments {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.values.iter().map(Option::is_some))
            .finish()
    }
}

/// Resolves one parameter type from request data. Returning `Ok(None)` passes
/// the parameter to the next mapper in the chain.
#[async_trait]
pub trait ArgumentMapper: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn map(
        &self,
        ctx: &RequestContext,
        annotation: Option<&Annotation>,
    ) -> Result<Option<Self::Output>, Failure>;
}

/// Object-safe view of an [`ArgumentMapper`].
#[async_trait]
pub trait DynArgumentMapper: Send + Sync {
    fn output(&self) -> TypeKey;

    fn mapper_type(&self) -> &'static str;

    async fn map_any(
        &self,
        ctx: &RequestContext,
        annotation: Option<&Annotation>,
    ) -> Result<Option<Box<dyn Any + Send>>, Failure>;
}

struct ArgumentMapperAdapter<M> {
    mapper: Arc<M>,
}

#[async_trait]
impl<M> DynArgumentMapper for ArgumentMapperAdapter<M>
where
    M: ArgumentMapper,
{
    fn output(&self) -> TypeKey {
        TypeKey::of::<M::Output>()
    }

    fn mapper_type(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    async fn map_any(
        &self,
        ctx: &RequestContext,
        annotation: Option<&Annotation>,
    ) -> Result<Option<Box<dyn Any + Send>>, Failure> {
        let value = self.mapper.map(ctx, annotation).await?;
        Ok(value.map(|value| Box::new(value) as Box<dyn Any + Send>))
    }
}

pub fn erase_argument_mapper<M: ArgumentMapper>(mapper: Arc<M>) -> Arc<dyn DynArgumentMapper> {
    Arc::new(ArgumentMapperAdapter { mapper })
}

/// Mapper chains keyed by declared parameter type. User mappers come first,
/// library defaults after them.
pub struct ArgumentMapperTable {
    chains: HashMap<TypeId, Vec<Arc<dyn DynArgumentMapper>>, FnvBuildHasher>,
}

impl ArgumentMapperTable {
    pub fn new(user_mappers: Vec<Arc<dyn DynArgumentMapper>>) -> Self {
        let mut chains: HashMap<TypeId, Vec<Arc<dyn DynArgumentMapper>>, FnvBuildHasher> =
            HashMap::with_hasher(FnvBuildHasher::default());
        let user_count = user_mappers.len();
        for mapper in user_mappers.into_iter().chain(defaults::argument_mappers()) {
            log::debug!(
                "Argument mapper {} registered for {}",
                mapper.mapper_type(),
                mapper.output()
            );
            chains.entry(mapper.output().id()).or_default().push(mapper);
        }
        log::info!(
            "Argument mapper table built with {} user mappers over {} types",
            user_count,
            chains.len()
        );
        Self { chains }
    }

    /// Never fails; an unknown type has an empty chain.
    pub fn mappers_for(&self, key: &TypeKey) -> &[Arc<dyn DynArgumentMapper>] {
        self.chains
            .get(&key.id())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The first non-empty value the parameter's chain produces. The exchange
    /// handle and the request context itself are injected directly.
    pub async fn resolve(
        &self,
        ctx: &RequestContext,
        parameter: &Parameter,
    ) -> Result<Option<Box<dyn Any + Send>>, Failure> {
        let key = parameter.key();
        if key.is::<Arc<dyn AsyncExchange>>() {
            return Ok(Some(Box::new(ctx.exchange().clone())));
        }
        if key.is::<RequestContext>() {
            return Ok(Some(Box::new(ctx.clone())));
        }
        for mapper in self.mappers_for(&key) {
            if let Some(value) = mapper.map_any(ctx, parameter.annotation()).await? {
                log::trace!("{}: {} resolved by {}", ctx.id(), key, mapper.mapper_type());
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostRequest;
    use crate::host::memory::{MemoryRequest, context_for};
    use crate::mapper::body::MultiMap;

    struct Shouting;

    #[async_trait]
    impl ArgumentMapper for Shouting {
        type Output = String;

        async fn map(
            &self,
            ctx: &RequestContext,
            annotation: Option<&Annotation>,
        ) -> Result<Option<String>, Failure> {
            Ok(annotation
                .filter(|annotation| annotation.source() == Source::Query)
                .and_then(|annotation| ctx.request().parameter(annotation.name()))
                .map(|value| value.to_uppercase()))
        }
    }

    fn string_param(annotation: Annotation) -> Parameter {
        Parameter::of::<String>(Some(annotation))
    }

    #[test]
    fn unknown_type_has_empty_chain() {
        let table = ArgumentMapperTable::new(Vec::new());
        assert!(table.mappers_for(&TypeKey::of::<Vec<u128>>()).is_empty());
        assert!(!table.mappers_for(&TypeKey::of::<String>()).is_empty());
    }

    #[tokio::test]
    async fn user_mapper_runs_before_default() {
        let table = ArgumentMapperTable::new(vec![erase_argument_mapper(Arc::new(Shouting))]);
        let chain = table.mappers_for(&TypeKey::of::<String>());
        assert!(chain[0].mapper_type().ends_with("Shouting"));

        let ctx = context_for(MemoryRequest::get("/?name=ann").build());
        let mut args = Arguments::new(vec![
            table.resolve(&ctx, &string_param(Annotation::query("name"))).await.unwrap(),
        ]);
        assert_eq!(args.take::<String>(0).as_deref(), Some("ANN"));
    }

    #[tokio::test]
    async fn defaults_resolve_each_source() {
        let table = ArgumentMapperTable::new(Vec::new());
        let request = MemoryRequest::get("/?q=rust&n=42")
            .header("X-Trace", "t-1")
            .header("Cookie", "theme=dark")
            .attribute("user", "ann")
            .build();
        let ctx = context_for(request);

        for (annotation, expected) in [
            (Annotation::query("q"), "rust"),
            (Annotation::header("x-trace"), "t-1"),
            (Annotation::cookie("theme"), "dark"),
            (Annotation::attribute("user"), "ann"),
        ] {
            let mut args = Arguments::new(vec![table.resolve(&ctx, &string_param(annotation)).await.unwrap()]);
            assert_eq!(args.take::<String>(0).as_deref(), Some(expected));
        }

        let value = table
            .resolve(&ctx, &Parameter::of::<i64>(Some(Annotation::query("n"))))
            .await
            .unwrap();
        assert_eq!(Arguments::new(vec![value]).take::<i64>(0), Some(42));
    }

    #[tokio::test]
    async fn bad_integer_is_a_conversion_failure() {
        let table = ArgumentMapperTable::new(Vec::new());
        let ctx = context_for(MemoryRequest::get("/?n=forty").build());
        let failure = table
            .resolve(&ctx, &Parameter::of::<i32>(Some(Annotation::query("n"))))
            .await
            .unwrap_err();
        assert!(matches!(
            failure.downcast_ref::<DispatchError>(),
            Some(DispatchError::Conversion { .. })
        ));
    }

    #[tokio::test]
    async fn missing_value_binds_none() {
        let table = ArgumentMapperTable::new(Vec::new());
        let ctx = context_for(MemoryRequest::get("/").build());
        let value = table
            .resolve(&ctx, &string_param(Annotation::query("absent")))
            .await
            .unwrap();
        assert!(value.is_none());
        let value = table.resolve(&ctx, &Parameter::of::<MultiMap>(None)).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn context_and_exchange_are_injected() {
        let table = ArgumentMapperTable::new(Vec::new());
        let ctx = context_for(MemoryRequest::get("/").build());
        let mut args = Arguments::new(vec![
            table.resolve(&ctx, &Parameter::of::<RequestContext>(None)).await.unwrap(),
            table.resolve(&ctx, &Parameter::of::<Arc<dyn AsyncExchange>>(None)).await.unwrap(),
            table.resolve(&ctx, &Parameter::of::<Arc<dyn HostRequest>>(None)).await.unwrap(),
        ]);
        assert_eq!(args.take::<RequestContext>(0).map(|c| *c.id()), Some(*ctx.id()));
        assert!(args.take::<Arc<dyn AsyncExchange>>(1).is_some());
        assert!(args.take::<Arc<dyn HostRequest>>(2).is_some());
    }

    #[test]
    fn take_leaves_mismatched_value_in_place() {
        let mut args = Arguments::new(vec![Some(Box::new(3u8)), None]);
        assert_eq!(args.take::<u16>(0), None);
        assert!(args.is_present(0));
        assert_eq!(args.take::<u8>(0), Some(3));
        assert_eq!(args.take::<u8>(0), None);
        assert!(args.require::<u8>(1).is_err());
        assert_eq!(args.take::<u8>(7), None);
    }
}
