use fnv::FnvBuildHasher;
use std::any::{Any, TypeId};
use std::collections::HashMap;

/// Typed property bag keyed by name and value type.
///
/// The same name may hold one value per type. Argument mappers use it to hand
/// data to later mappers in the same request.
pub struct Attachments {
    attachments: HashMap<AttachmentKey, Box<dyn Any + Send + Sync>, FnvBuildHasher>,
}

impl Attachments {
    pub fn new() -> Self {
        Self {
            attachments: HashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    /// Stores `value`, replacing any previous value with the same name and
    /// type.
    pub fn add<K>(&mut self, key: impl AsRef<str>, value: K)
    where
        K: Send + Sync + 'static,
    {
        self.attachments
            .insert(AttachmentKey::new(key, TypeId::of::<K>()), Box::new(value));
    }

    pub fn get<K>(&self, key: impl AsRef<str>) -> Option<&K>
    where
        K: Send + Sync + 'static,
    {
        self.attachments
            .get(&AttachmentKey::new(key, TypeId::of::<K>()))
            .and_then(|value| value.downcast_ref::<K>())
    }

    pub fn get_mut<K>(&mut self, key: impl AsRef<str>) -> Option<&mut K>
    where
        K: Send + Sync + 'static,
    {
        self.attachments
            .get_mut(&AttachmentKey::new(key, TypeId::of::<K>()))
            .and_then(|value| value.downcast_mut::<K>())
    }

    pub fn remove<K>(&mut self, key: impl AsRef<str>) -> Option<K>
    where
        K: Send + Sync + 'static,
    {
        self.attachments
            .remove(&AttachmentKey::new(key, TypeId::of::<K>()))
            .and_then(|value| value.downcast::<K>().ok())
            .map(|value| *value)
    }

    pub fn len(&self) -> usize {
        self.attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }
}

impl Default for Attachments {
    fn default() -> Self {
        Attachments::new()
    }
}

#[derive(PartialEq, Eq, Hash)]
struct AttachmentKey {
    name: Box<str>,
    type_id: TypeId,
}

impl AttachmentKey {
    fn new(key: impl AsRef<str>, type_id: TypeId) -> Self {
        Self {
            name: key.as_ref().into(),
            type_id,
        }
    }
}
