use crate::context::RequestContext;
use crate::status::Failure;
use async_trait::async_trait;

/// Runs before a matched route's handler. Returning an error stops the
/// request and the error is rendered like any handler failure.
///
/// Filters are components: a route naming a filter type the component table
/// does not hold is skipped when the route table is built.
#[async_trait]
pub trait Filter: Send + Sync + 'static {
    async fn filter(&self, ctx: &RequestContext) -> Result<(), Failure>;
}
