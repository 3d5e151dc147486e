use crate::component::{Component, ComponentDefinition, ComponentError, Dependencies, TypeKey};
use crate::config::LifecyclePolicy;
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use std::any::{Any, TypeId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const UNINITIALIZED: u8 = 0;
const INITIALIZED: u8 = 1;

struct Managed {
    type_name: &'static str,
    component: Arc<dyn Component>,
}

/// Singletons keyed by concrete type and by every interface they provide.
///
/// Each slot holds an `Arc<T>` behind `dyn Any`, where `T` is the key type,
/// so `get::<dyn Trait>()` and `get::<Concrete>()` both hand back a
/// correctly typed `Arc`.
pub struct ComponentTable {
    slots: DashMap<TypeId, Box<dyn Any + Send + Sync>, FnvBuildHasher>,
    managed: Vec<Managed>,
    state: AtomicU8,
    policy: LifecyclePolicy,
}

impl ComponentTable {
    pub fn builder() -> ComponentTableBuilder {
        ComponentTableBuilder::new()
    }

    fn empty(policy: LifecyclePolicy) -> Self {
        Self {
            slots: DashMap::with_hasher(FnvBuildHasher::default()),
            managed: Vec::new(),
            state: AtomicU8::new(UNINITIALIZED),
            policy,
        }
    }

    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.slots
            .get(&TypeId::of::<T>())
            .and_then(|slot| slot.value().downcast_ref::<Arc<T>>().cloned())
    }

    pub fn contains(&self, key: &TypeKey) -> bool {
        self.slots.contains_key(&key.id())
    }

    /// Number of distinct keys, concrete types and interfaces together.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of constructed components that take part in the lifecycle.
    pub fn component_count(&self) -> usize {
        self.managed.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == INITIALIZED
    }

    /// Calls every `initialize` hook once, in construction order. Repeated and
    /// concurrent calls after the first are no-ops.
    pub fn initialize_all(&self) -> Result<(), ComponentError> {
        if self
            .state
            .compare_exchange(UNINITIALIZED, INITIALIZED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Component table already initialized");
            return Ok(());
        }
        for managed in &self.managed {
            log::trace!("Initializing {}", managed.type_name);
            if let Err(failure) = managed.component.initialize() {
                let error = ComponentError::lifecycle(managed.type_name, "initialize", &failure);
                match self.policy {
                    LifecyclePolicy::LogAndContinue => log::error!("{}", error),
                    LifecyclePolicy::FailFast => return Err(error),
                }
            }
        }
        log::info!("Initialized {} components", self.managed.len());
        Ok(())
    }

    /// Calls every `destroy` hook once, in reverse construction order. Does
    /// nothing unless the table is initialized.
    pub fn destroy_all(&self) -> Result<(), ComponentError> {
        if self
            .state
            .compare_exchange(INITIALIZED, UNINITIALIZED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Component table not initialized, nothing to destroy");
            return Ok(());
        }
        for managed in self.managed.iter().rev() {
            log::trace!("Destroying {}", managed.type_name);
            if let Err(failure) = managed.component.destroy() {
                let error = ComponentError::lifecycle(managed.type_name, "destroy", &failure);
                match self.policy {
                    LifecyclePolicy::LogAndContinue => log::error!("{}", error),
                    LifecyclePolicy::FailFast => return Err(error),
                }
            }
        }
        Ok(())
    }
}

pub struct ComponentTableBuilder {
    definitions: Vec<ComponentDefinition>,
    instances: Vec<(TypeId, Box<dyn Any + Send + Sync>)>,
    policy: LifecyclePolicy,
}

impl ComponentTableBuilder {
    pub fn new() -> Self {
        Self {
            definitions: Vec::new(),
            instances: Vec::new(),
            policy: LifecyclePolicy::default(),
        }
    }

    pub fn definition(mut self, definition: ComponentDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn definitions(mut self, definitions: impl IntoIterator<Item = ComponentDefinition>) -> Self {
        self.definitions.extend(definitions);
        self
    }

    /// Registers a ready-made instance under `T`. It counts as resolved before
    /// any definition is built and takes no part in the lifecycle.
    pub fn instance<T>(mut self, instance: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let instance: Box<dyn Any + Send + Sync> = Box::new(instance);
        self.instances.push((TypeId::of::<T>(), instance));
        self
    }

    pub fn policy(mut self, policy: LifecyclePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<ComponentTable, ComponentError> {
        let definitions: Vec<&ComponentDefinition> = self.definitions.iter().collect();
        build_table(&definitions, self.instances, self.policy)
    }
}

impl Default for ComponentTableBuilder {
    fn default() -> Self {
        ComponentTableBuilder::new()
    }
}

/// Builds a table from borrowed definitions, in the order given.
pub(crate) fn build_table(
    definitions: &[&ComponentDefinition],
    instances: Vec<(TypeId, Box<dyn Any + Send + Sync>)>,
    policy: LifecyclePolicy,
) -> Result<ComponentTable, ComponentError> {
    let mut table = ComponentTable::empty(policy);
    for (type_id, instance) in instances {
        table.slots.insert(type_id, instance);
    }
    let mut resolver = Resolver {
        definitions,
        stack: Vec::new(),
        managed: Vec::new(),
    };
    for definition in definitions {
        resolver.resolve(&table, definition.key())?;
    }
    table.managed = resolver.managed;
    log::debug!(
        "Component table built with {} components under {} keys",
        table.managed.len(),
        table.slots.len()
    );
    Ok(table)
}

struct Resolver<'a> {
    definitions: &'a [&'a ComponentDefinition],
    stack: Vec<TypeKey>,
    managed: Vec<Managed>,
}

impl<'a> Resolver<'a> {
    /// The definition for a concrete key, or else the first one providing it
    /// as an interface.
    fn find(&self, key: &TypeKey) -> Option<&'a ComponentDefinition> {
        self.definitions
            .iter()
            .find(|definition| definition.key() == *key)
            .or_else(|| self.definitions.iter().find(|definition| definition.provides(key)))
            .copied()
    }

    /// Returns `false` when nothing can provide `key`.
    fn resolve(&mut self, table: &ComponentTable, key: TypeKey) -> Result<bool, ComponentError> {
        if table.contains(&key) {
            return Ok(true);
        }
        let definition = match self.find(&key) {
            Some(definition) => definition,
            None => return Ok(false),
        };
        if table.contains(&definition.key()) {
            return Ok(true);
        }
        if self.stack.contains(&definition.key()) {
            return Err(ComponentError::circular(definition.type_name(), &self.stack));
        }

        self.stack.push(definition.key());
        for dependency in definition.dependencies() {
            let found = self.resolve(table, dependency.key())?;
            if !found && dependency.is_required() {
                self.stack.pop();
                return Err(ComponentError::unresolved(
                    definition.type_name(),
                    dependency.key().name(),
                ));
            }
        }
        let instance = definition.instantiate(&Dependencies::new(table, definition.type_name()));
        self.stack.pop();
        let instance = instance?;

        for (slot_key, slot) in instance.slots {
            if table.slots.insert(slot_key.id(), slot).is_some() {
                log::debug!(
                    "{} replaces an earlier provider of {}",
                    definition.type_name(),
                    slot_key
                );
            }
        }
        self.managed.push(Managed {
            type_name: definition.type_name(),
            component: instance.lifecycle,
        });
        log::debug!("Constructed component {}", definition.type_name());
        Ok(true)
    }
}
