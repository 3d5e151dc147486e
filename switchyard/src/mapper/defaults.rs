//! Library default argument mappers, appended after every user mapper.

use crate::context::RequestContext;
use crate::host::{HostRequest, HostResponse};
use crate::mapper::argument::{
    Annotation, ArgumentMapper, DynArgumentMapper, Source, erase_argument_mapper,
};
use crate::mapper::body::{self, MultiMap};
use crate::status::{DispatchError, Failure};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Display;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

const FALLBACK_CHARSET: &str = "UTF-8";

/// Fixed order: scalars, host handles, then the body views.
pub(crate) fn argument_mappers() -> Vec<Arc<dyn DynArgumentMapper>> {
    vec![
        erase_argument_mapper(Arc::new(TextMapper)),
        erase_argument_mapper(Arc::new(ParsedMapper::<i32>::new())),
        erase_argument_mapper(Arc::new(ParsedMapper::<i64>::new())),
        erase_argument_mapper(Arc::new(RequestMapper)),
        erase_argument_mapper(Arc::new(ResponseMapper)),
        erase_argument_mapper(Arc::new(BytesBodyMapper)),
        erase_argument_mapper(Arc::new(TextBodyMapper)),
        erase_argument_mapper(Arc::new(FormBodyMapper)),
        erase_argument_mapper(Arc::new(ObjectMapper)),
    ]
}

/// Looks a named value up in the source the annotation points at.
fn lookup(ctx: &RequestContext, annotation: &Annotation) -> Option<String> {
    let name = annotation.name();
    let request = ctx.request();
    match annotation.source() {
        Source::Query => request.parameter(name),
        Source::Path => ctx.path_variable(name).map(str::to_string),
        Source::Header => request.header(name),
        Source::Cookie => request.cookie(name),
        Source::Attribute => request.attribute(name),
        Source::Body => None,
    }
}

fn is_body(annotation: Option<&Annotation>) -> bool {
    annotation.is_some_and(|annotation| annotation.source() == Source::Body)
}

async fn body_text(ctx: &RequestContext) -> Result<String, Failure> {
    let bytes = ctx.body().await?;
    let charset = ctx
        .request()
        .character_encoding()
        .unwrap_or_else(|| FALLBACK_CHARSET.to_string());
    Ok(body::decode(&bytes, &charset)?)
}

struct TextMapper;

#[async_trait]
impl ArgumentMapper for TextMapper {
    type Output = String;

    async fn map(
        &self,
        ctx: &RequestContext,
        annotation: Option<&Annotation>,
    ) -> Result<Option<String>, Failure> {
        Ok(annotation.and_then(|annotation| lookup(ctx, annotation)))
    }
}

/// Scalars parsed from a named value. Parse errors are `400`s.
struct ParsedMapper<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> ParsedMapper<T> {
    fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T> ArgumentMapper for ParsedMapper<T>
where
    T: FromStr + Send + 'static,
    T::Err: Display,
{
    type Output = T;

    async fn map(
        &self,
        ctx: &RequestContext,
        annotation: Option<&Annotation>,
    ) -> Result<Option<T>, Failure> {
        let Some(annotation) = annotation else {
            return Ok(None);
        };
        match lookup(ctx, annotation) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| DispatchError::conversion(annotation.name(), e.to_string()).into()),
            None => Ok(None),
        }
    }
}

struct RequestMapper;

#[async_trait]
impl ArgumentMapper for RequestMapper {
    type Output = Arc<dyn HostRequest>;

    async fn map(
        &self,
        ctx: &RequestContext,
        _annotation: Option<&Annotation>,
    ) -> Result<Option<Self::Output>, Failure> {
        Ok(Some(ctx.request().clone()))
    }
}

struct ResponseMapper;

#[async_trait]
impl ArgumentMapper for ResponseMapper {
    type Output = Arc<dyn HostResponse>;

    async fn map(
        &self,
        ctx: &RequestContext,
        _annotation: Option<&Annotation>,
    ) -> Result<Option<Self::Output>, Failure> {
        Ok(Some(ctx.response().clone()))
    }
}

struct BytesBodyMapper;

#[async_trait]
impl ArgumentMapper for BytesBodyMapper {
    type Output = Bytes;

    async fn map(
        &self,
        ctx: &RequestContext,
        annotation: Option<&Annotation>,
    ) -> Result<Option<Bytes>, Failure> {
        if !is_body(annotation) {
            return Ok(None);
        }
        Ok(Some(ctx.body().await?))
    }
}

struct TextBodyMapper;

#[async_trait]
impl ArgumentMapper for TextBodyMapper {
    type Output = String;

    async fn map(
        &self,
        ctx: &RequestContext,
        annotation: Option<&Annotation>,
    ) -> Result<Option<String>, Failure> {
        if !is_body(annotation) {
            return Ok(None);
        }
        body_text(ctx).await.map(Some)
    }
}

/// Form fields from an urlencoded body.
struct FormBodyMapper;

#[async_trait]
impl ArgumentMapper for FormBodyMapper {
    type Output = MultiMap;

    async fn map(
        &self,
        ctx: &RequestContext,
        annotation: Option<&Annotation>,
    ) -> Result<Option<MultiMap>, Failure> {
        if !is_body(annotation) {
            return Ok(None);
        }
        let bytes = ctx.body().await?;
        Ok(Some(body::parse_form(&bytes)))
    }
}

/// Catch-all for untyped parameters: JSON for the body, a string otherwise.
struct ObjectMapper;

#[async_trait]
impl ArgumentMapper for ObjectMapper {
    type Output = serde_json::Value;

    async fn map(
        &self,
        ctx: &RequestContext,
        annotation: Option<&Annotation>,
    ) -> Result<Option<serde_json::Value>, Failure> {
        let Some(annotation) = annotation else {
            return Ok(None);
        };
        if annotation.source() != Source::Body {
            return Ok(lookup(ctx, annotation).map(serde_json::Value::String));
        }
        let bytes = ctx.body().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| DispatchError::conversion("body", e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{MemoryRequest, context_for};
    use serde_json::json;

    #[tokio::test]
    async fn body_mappers_ignore_non_body_parameters() {
        let ctx = context_for(MemoryRequest::post("/?a=1").form("a=2").build());
        assert_eq!(TextBodyMapper.map(&ctx, Some(&Annotation::query("a"))).await.unwrap(), None);
        assert_eq!(FormBodyMapper.map(&ctx, None).await.unwrap(), None);
        let form = FormBodyMapper.map(&ctx, Some(&Annotation::body())).await.unwrap().unwrap();
        assert_eq!(form["a"], vec!["2"]);
    }

    #[tokio::test]
    async fn text_body_honours_charset() {
        let request = MemoryRequest::post("/")
            .header("content-type", "text/plain; charset=ISO-8859-1")
            .body(vec![0x66, 0xFC, 0x72])
            .build();
        let ctx = context_for(request);
        let text = TextBodyMapper.map(&ctx, Some(&Annotation::body())).await.unwrap();
        assert_eq!(text.as_deref(), Some("für"));
    }

    #[tokio::test]
    async fn object_mapper_parses_json_body() {
        let ctx = context_for(MemoryRequest::post("/?tag=x").json(&json!({ "n": 1 })).build());
        let body = ObjectMapper.map(&ctx, Some(&Annotation::body())).await.unwrap();
        assert_eq!(body, Some(json!({ "n": 1 })));
        let tag = ObjectMapper.map(&ctx, Some(&Annotation::query("tag"))).await.unwrap();
        assert_eq!(tag, Some(json!("x")));
    }

    #[tokio::test]
    async fn path_variables_feed_scalars() {
        let ctx = context_for(MemoryRequest::get("/users/7").build());
        let ctx = ctx.with_variables([("id".to_string(), "7".to_string())].into());
        let id = ParsedMapper::<i64>::new()
            .map(&ctx, Some(&Annotation::path("id")))
            .await
            .unwrap();
        assert_eq!(id, Some(7));
    }
}
