pub mod catalog;
pub mod registry;

pub use catalog::{Catalog, Declaration};
pub use registry::{ComponentTable, ComponentTableBuilder};

use crate::status::Failure;
use std::any::{Any, TypeId};
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComponentError {
    #[error("Circular dependency on '{type_name}' (resolving {stack})")]
    Circular {
        type_name: &'static str,
        stack: String,
    },

    #[error("'{component}' requires '{dependency}' but nothing provides it")]
    Unresolved {
        component: &'static str,
        dependency: &'static str,
    },

    #[error("Could not construct '{type_name}': {message}")]
    Construction {
        type_name: &'static str,
        message: String,
    },

    #[error("{phase} hook of '{type_name}' failed: {message}")]
    Lifecycle {
        type_name: &'static str,
        phase: &'static str,
        message: String,
    },
}

impl ComponentError {
    #[inline]
    pub(crate) fn circular(type_name: &'static str, stack: &[TypeKey]) -> Self {
        let stack = stack
            .iter()
            .map(|key| key.name())
            .chain(std::iter::once(type_name))
            .collect::<Vec<_>>()
            .join(" -> ");
        Self::Circular { type_name, stack }
    }

    #[inline]
    pub(crate) const fn unresolved(component: &'static str, dependency: &'static str) -> Self {
        Self::Unresolved {
            component,
            dependency,
        }
    }

    #[inline]
    pub fn construction(type_name: &'static str, message: impl Into<String>) -> Self {
        Self::Construction {
            type_name,
            message: message.into(),
        }
    }

    #[inline]
    pub(crate) fn lifecycle(type_name: &'static str, phase: &'static str, failure: &Failure) -> Self {
        Self::Lifecycle {
            type_name,
            phase,
            message: failure.to_string(),
        }
    }
}

/// Identity of a type, concrete or `dyn Trait`, with its name kept for
/// diagnostics. Equality and hashing use the `TypeId` only.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for TypeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

impl Display for TypeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// A singleton managed by the component table.
pub trait Component: Send + Sync + 'static {
    /// Runs once after the whole table has been built.
    fn initialize(&self) -> Result<(), Failure> {
        Ok(())
    }

    /// Runs once when the table is torn down.
    fn destroy(&self) -> Result<(), Failure> {
        Ok(())
    }
}

/// A component that knows how to describe its own construction.
/// `#[derive(Component)]` implements this.
pub trait Injectable: Component + Sized {
    fn definition() -> ComponentDefinition;
}

#[derive(Debug, Clone, Copy)]
pub struct Dependency {
    key: TypeKey,
    required: bool,
}

impl Dependency {
    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

/// Dependency lookup handed to a component factory.
pub struct Dependencies<'a> {
    table: &'a ComponentTable,
    owner: &'static str,
}

impl<'a> Dependencies<'a> {
    pub(crate) fn new(table: &'a ComponentTable, owner: &'static str) -> Self {
        Self { table, owner }
    }

    pub fn require<T>(&self) -> Result<Arc<T>, ComponentError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.table
            .get::<T>()
            .ok_or_else(|| ComponentError::unresolved(self.owner, std::any::type_name::<T>()))
    }

    pub fn optional<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.table.get::<T>()
    }
}

type Slot = (TypeKey, Box<dyn Any + Send + Sync>);

pub(crate) struct Instance {
    pub(crate) slots: Vec<Slot>,
    pub(crate) lifecycle: Arc<dyn Component>,
}

type ErasedFactory = dyn Fn(&Dependencies<'_>) -> Result<Instance, ComponentError> + Send + Sync;
type Cast<C> = Box<dyn Fn(Arc<C>) -> Box<dyn Any + Send + Sync> + Send + Sync>;

/// How to build one component: its dependencies, the interfaces it is
/// published under, and the factory that constructs it.
pub struct ComponentDefinition {
    key: TypeKey,
    dependencies: Vec<Dependency>,
    interfaces: Vec<TypeKey>,
    factory: Box<ErasedFactory>,
}

impl ComponentDefinition {
    pub fn of<C, F>(factory: F) -> DefinitionBuilder<C>
    where
        C: Component,
        F: Fn(&Dependencies<'_>) -> Result<C, ComponentError> + Send + Sync + 'static,
    {
        DefinitionBuilder {
            dependencies: Vec::new(),
            interfaces: Vec::new(),
            factory: Box::new(factory),
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn type_name(&self) -> &'static str {
        self.key.name()
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn interfaces(&self) -> &[TypeKey] {
        &self.interfaces
    }

    pub fn provides(&self, key: &TypeKey) -> bool {
        self.interfaces.contains(key)
    }

    pub(crate) fn instantiate(&self, dependencies: &Dependencies<'_>) -> Result<Instance, ComponentError> {
        (self.factory)(dependencies)
    }
}

impl Debug for ComponentDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentDefinition")
            .field("type", &self.key)
            .field("dependencies", &self.dependencies)
            .field("interfaces", &self.interfaces)
            .finish()
    }
}

pub struct DefinitionBuilder<C> {
    dependencies: Vec<Dependency>,
    interfaces: Vec<(TypeKey, Cast<C>)>,
    factory: Box<dyn Fn(&Dependencies<'_>) -> Result<C, ComponentError> + Send + Sync>,
    _marker: PhantomData<fn() -> C>,
}

impl<C> DefinitionBuilder<C>
where
    C: Component,
{
    pub fn requires<T: ?Sized + 'static>(mut self) -> Self {
        self.dependencies.push(Dependency {
            key: TypeKey::of::<T>(),
            required: true,
        });
        self
    }

    pub fn optional<T: ?Sized + 'static>(mut self) -> Self {
        self.dependencies.push(Dependency {
            key: TypeKey::of::<T>(),
            required: false,
        });
        self
    }

    /// Publishes the component under interface `I` as well.
    pub fn provides<I>(mut self, cast: fn(Arc<C>) -> Arc<I>) -> Self
    where
        I: ?Sized + Send + Sync + 'static,
    {
        let erase: Cast<C> = Box::new(move |component: Arc<C>| {
            Box::new(cast(component)) as Box<dyn Any + Send + Sync>
        });
        self.interfaces.push((TypeKey::of::<I>(), erase));
        self
    }

    pub fn build(self) -> ComponentDefinition {
        let key = TypeKey::of::<C>();
        let interface_keys = self.interfaces.iter().map(|(key, _)| *key).collect();
        let interfaces = self.interfaces;
        let factory = self.factory;
        let erased = move |dependencies: &Dependencies<'_>| -> Result<Instance, ComponentError> {
            let component = Arc::new(factory(dependencies)?);
            let mut slots: Vec<Slot> = Vec::with_capacity(interfaces.len() + 1);
            slots.push((key, Box::new(component.clone()) as Box<dyn Any + Send + Sync>));
            for (interface, cast) in &interfaces {
                slots.push((*interface, cast(component.clone())));
            }
            Ok(Instance {
                slots,
                lifecycle: component,
            })
        };
        ComponentDefinition {
            key,
            dependencies: self.dependencies,
            interfaces: interface_keys,
            factory: Box::new(erased),
        }
    }
}
