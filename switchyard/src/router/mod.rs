pub mod filter;
pub mod invokable;
pub mod path;
pub mod route;

pub use filter::Filter;
pub use invokable::Invokable;
pub use route::{Controller, ControllerDefinition, RouteBuilder, RouteDefinition, Routes};

use crate::cache::{Cache, new_map};
use crate::component::{ComponentTable, TypeKey};
use crate::router::path::{PathMatcher, PathMatcherError};
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Reasons a single route is left out of the table.
#[derive(Error, Debug)]
pub enum RouteTableError {
    #[error("Controller '{controller}' is not in the component table")]
    MissingController { controller: &'static str },

    #[error("Route '{route}' names filter '{filter}' which is not in the component table")]
    MissingFilter {
        route: String,
        filter: &'static str,
    },

    #[error("Route '{route}' has an invalid pattern")]
    InvalidPattern {
        route: String,
        #[source]
        source: PathMatcherError,
    },

    #[error("Route '{route}' accepts no methods")]
    NoMethods { route: String },
}

impl RouteTableError {
    #[inline]
    pub(crate) const fn missing_controller(controller: &'static str) -> Self {
        Self::MissingController { controller }
    }

    #[inline]
    pub(crate) fn missing_filter(route: impl Into<String>, filter: &'static str) -> Self {
        Self::MissingFilter {
            route: route.into(),
            filter,
        }
    }

    #[inline]
    pub(crate) fn invalid_pattern(route: impl Into<String>, source: PathMatcherError) -> Self {
        Self::InvalidPattern {
            route: route.into(),
            source,
        }
    }

    #[inline]
    pub(crate) fn no_methods(route: impl Into<String>) -> Self {
        Self::NoMethods {
            route: route.into(),
        }
    }
}

/// One shared instance per concrete type, for the duration of a build.
struct InstanceCache<V: ?Sized> {
    id: &'static str,
    instances: DashMap<TypeId, Arc<V>, FnvBuildHasher>,
}

impl<V: ?Sized> InstanceCache<V> {
    fn new(id: &'static str) -> Self {
        Self {
            id,
            instances: new_map(),
        }
    }
}

impl<V: ?Sized> Cache<TypeId, V> for InstanceCache<V> {
    fn inner(&self) -> &DashMap<TypeId, Arc<V>, FnvBuildHasher> {
        &self.instances
    }

    fn cache_id(&self) -> &'static str {
        self.id
    }
}

struct Binder<'a> {
    components: &'a ComponentTable,
    controllers: InstanceCache<dyn Any + Send + Sync>,
    matchers: InstanceCache<dyn PathMatcher>,
    filters: InstanceCache<dyn Filter>,
}

impl<'a> Binder<'a> {
    fn new(components: &'a ComponentTable) -> Self {
        Self {
            components,
            controllers: InstanceCache::new("RouteTable::controllers"),
            matchers: InstanceCache::new("RouteTable::matchers"),
            filters: InstanceCache::new("RouteTable::filters"),
        }
    }

    fn bind(
        &self,
        controller: &ControllerDefinition,
        route: &RouteDefinition,
    ) -> Result<Invokable, RouteTableError> {
        if route.methods().is_empty() {
            return Err(RouteTableError::no_methods(route.name()));
        }
        let instance = self
            .controllers
            .get_or_resolve(controller.key().id(), || {
                controller
                    .resolve(self.components)
                    .ok_or_else(|| RouteTableError::missing_controller(controller.type_name()))
            })?;

        let matcher_key = route.matcher().key();
        let matcher = self
            .matchers
            .get_or_resolve::<_, RouteTableError>(matcher_key.id(), || {
                Ok(route.matcher().create(self.components))
            })?;
        matcher
            .validate(route.pattern())
            .map_err(|e| RouteTableError::invalid_pattern(route.name(), e))?;

        let mut filters: Vec<(TypeKey, Arc<dyn Filter>)> = Vec::with_capacity(route.filters().len());
        for filter in route.filters() {
            let key = filter.key();
            let instance = self.filters.get_or_resolve(key.id(), || {
                filter
                    .create(self.components)
                    .ok_or_else(|| RouteTableError::missing_filter(route.name(), key.name()))
            })?;
            filters.push((key, instance));
        }

        Ok(Invokable::new(
            route.name().to_string(),
            route.pattern().to_string(),
            route.methods().to_vec(),
            (controller.key(), instance),
            (matcher_key, matcher),
            filters,
            route.parameters().to_vec(),
            route.handler().clone(),
        ))
    }
}

/// Invokables indexed by HTTP method, each list in scan order.
pub struct RouteTable {
    by_method: HashMap<String, Vec<Arc<Invokable>>, FnvBuildHasher>,
    routes: usize,
    skipped: usize,
}

impl RouteTable {
    /// Binds every route of every controller. Controllers are scanned in
    /// order of their type name and routes in declaration order. A route
    /// that cannot be bound is logged and left out.
    pub fn build(controllers: &[&ControllerDefinition], components: &ComponentTable) -> Self {
        let mut controllers = controllers.to_vec();
        controllers.sort_by_key(|controller| controller.type_name());

        let binder = Binder::new(components);
        let mut by_method: HashMap<String, Vec<Arc<Invokable>>, FnvBuildHasher> =
            HashMap::with_hasher(FnvBuildHasher::default());
        let mut routes = 0;
        let mut skipped = 0;
        for controller in controllers {
            for route in controller.routes() {
                match binder.bind(controller, route) {
                    Ok(invokable) => {
                        let invokable = Arc::new(invokable);
                        for method in invokable.methods() {
                            by_method
                                .entry(method.clone())
                                .or_default()
                                .push(invokable.clone());
                        }
                        log::debug!(
                            "Route '{}' bound to {} via {}",
                            invokable.name(),
                            controller.type_name(),
                            invokable.matcher_type()
                        );
                        routes += 1;
                    }
                    Err(e) => {
                        log::warn!("Skipping route of {}: {}", controller.type_name(), e);
                        skipped += 1;
                    }
                }
            }
        }
        log::info!(
            "Route table built with {} routes over {} methods ({} skipped)",
            routes,
            by_method.len(),
            skipped
        );
        Self {
            by_method,
            routes,
            skipped,
        }
    }

    /// Candidates for `method` in scan order. Empty, never absent, when the
    /// method has no routes.
    pub fn routes_by_method(&self, method: &str) -> &[Arc<Invokable>] {
        self.by_method
            .get(method)
            .or_else(|| self.by_method.get(&method.to_ascii_uppercase()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.by_method.keys().map(String::as_str)
    }

    /// Number of bound routes. A route accepting several methods counts once.
    pub fn len(&self) -> usize {
        self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes == 0
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }
}
