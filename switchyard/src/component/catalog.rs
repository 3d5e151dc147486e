use crate::component::{ComponentDefinition, ComponentTable, Injectable, TypeKey};
use crate::mapper::argument::{ArgumentMapper, DynArgumentMapper, erase_argument_mapper};
use crate::mapper::response::{DynReturnTypeMapper, ReturnTypeMapper, erase_return_mapper};
use crate::router::route::{Controller, ControllerDefinition};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// A link-time registration submitted by `#[derive(Component)]`.
pub struct Declaration {
    register: fn(Catalog) -> Catalog,
}

impl Declaration {
    pub const fn new(register: fn(Catalog) -> Catalog) -> Self {
        Self { register }
    }
}

inventory::collect!(Declaration);

type Create<V> = Arc<dyn Fn(&ComponentTable) -> Option<Arc<V>> + Send + Sync>;

/// A mapper to be fetched or built once the component table exists.
pub struct MapperDeclaration<V: ?Sized> {
    key: TypeKey,
    create: Create<V>,
}

impl<V: ?Sized> MapperDeclaration<V> {
    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn type_name(&self) -> &'static str {
        self.key.name()
    }

    pub(crate) fn create(&self, table: &ComponentTable) -> Option<Arc<V>> {
        (self.create)(table)
    }
}

pub type ArgumentMapperDeclaration = MapperDeclaration<dyn DynArgumentMapper>;
pub type ReturnMapperDeclaration = MapperDeclaration<dyn DynReturnTypeMapper>;

/// Every declaration the dispatcher boots from: components, controllers and
/// user mappers.
///
/// A catalog is filled explicitly, collected from `#[derive(Component)]`
/// declarations with [`Catalog::discover`], or both via [`Catalog::merge`].
/// Reads are filtered by type path prefix and come back sorted by type name,
/// so boot order never depends on registration order.
#[derive(Default)]
pub struct Catalog {
    components: Vec<ComponentDefinition>,
    controllers: Vec<ControllerDefinition>,
    argument_mappers: Vec<ArgumentMapperDeclaration>,
    return_mappers: Vec<ReturnMapperDeclaration>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything submitted through `#[derive(Component)]` in the final
    /// binary.
    pub fn discover() -> Self {
        let catalog = inventory::iter::<Declaration>
            .into_iter()
            .fold(Catalog::new(), |catalog, declaration| (declaration.register)(catalog));
        log::debug!(
            "Discovered {} components and {} controllers",
            catalog.components.len(),
            catalog.controllers.len()
        );
        catalog
    }

    /// Adds a component definition. A second definition for the same type is
    /// ignored.
    pub fn component(mut self, definition: ComponentDefinition) -> Self {
        if self.components.iter().any(|known| known.key() == definition.key()) {
            log::debug!("{} already declared, ignoring duplicate", definition.type_name());
            return self;
        }
        self.components.push(definition);
        self
    }

    pub fn register<C: Injectable>(self) -> Self {
        self.component(C::definition())
    }

    /// Registers `C` as a component and scans its routes.
    pub fn controller<C: Controller>(mut self) -> Self {
        let key = TypeKey::of::<C>();
        if self.controllers.iter().all(|known| known.key() != key) {
            self.controllers.push(ControllerDefinition::of::<C>());
        }
        self.register::<C>()
    }

    /// Registers `M` as a component; the mapper instance is the one the
    /// component table builds.
    pub fn argument_mapper<M>(mut self) -> Self
    where
        M: ArgumentMapper + Injectable,
    {
        self.argument_mappers.push(MapperDeclaration {
            key: TypeKey::of::<M>(),
            create: Arc::new(|table: &ComponentTable| table.get::<M>().map(erase_argument_mapper)),
        });
        self.register::<M>()
    }

    /// Adds a ready-made argument mapper that needs no injection.
    pub fn argument_mapper_instance<M: ArgumentMapper>(mut self, mapper: M) -> Self {
        let erased = erase_argument_mapper(Arc::new(mapper));
        self.argument_mappers.push(MapperDeclaration {
            key: TypeKey::of::<M>(),
            create: Arc::new(move |_: &ComponentTable| Some(erased.clone())),
        });
        self
    }

    pub fn return_mapper<M>(mut self) -> Self
    where
        M: ReturnTypeMapper + Injectable,
    {
        self.return_mappers.push(MapperDeclaration {
            key: TypeKey::of::<M>(),
            create: Arc::new(|table: &ComponentTable| table.get::<M>().map(erase_return_mapper)),
        });
        self.register::<M>()
    }

    pub fn return_mapper_instance<M: ReturnTypeMapper>(mut self, mapper: M) -> Self {
        let erased = erase_return_mapper(Arc::new(mapper));
        self.return_mappers.push(MapperDeclaration {
            key: TypeKey::of::<M>(),
            create: Arc::new(move |_: &ComponentTable| Some(erased.clone())),
        });
        self
    }

    /// Folds `other` into this catalog. Definitions already present win.
    pub fn merge(self, other: Catalog) -> Self {
        let mut merged = other
            .components
            .into_iter()
            .fold(self, |catalog, definition| catalog.component(definition));
        for controller in other.controllers {
            if merged.controllers.iter().all(|known| known.key() != controller.key()) {
                merged.controllers.push(controller);
            }
        }
        merged.argument_mappers.extend(other.argument_mappers);
        merged.return_mappers.extend(other.return_mappers);
        merged
    }

    pub fn components_in(&self, namespace: &str) -> Vec<&ComponentDefinition> {
        in_namespace(&self.components, namespace, ComponentDefinition::type_name)
    }

    pub fn controllers_in(&self, namespace: &str) -> Vec<&ControllerDefinition> {
        in_namespace(&self.controllers, namespace, ControllerDefinition::type_name)
    }

    pub fn argument_mappers_in(&self, namespace: &str) -> Vec<&ArgumentMapperDeclaration> {
        in_namespace(&self.argument_mappers, namespace, MapperDeclaration::type_name)
    }

    pub fn return_mappers_in(&self, namespace: &str) -> Vec<&ReturnMapperDeclaration> {
        in_namespace(&self.return_mappers, namespace, MapperDeclaration::type_name)
    }
}

fn in_namespace<'a, T>(
    items: &'a [T],
    namespace: &str,
    name: impl Fn(&T) -> &'static str,
) -> Vec<&'a T> {
    let mut found: Vec<&T> = items
        .iter()
        .filter(|item| name(item).starts_with(namespace))
        .collect();
    found.sort_by_key(|item| name(item));
    found
}

impl Debug for Catalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("components", &self.components.len())
            .field("controllers", &self.controllers.len())
            .field("argument_mappers", &self.argument_mappers.len())
            .field("return_mappers", &self.return_mappers.len())
            .finish()
    }
}
