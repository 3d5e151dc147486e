use dashmap::{DashMap, Entry};
use fnv::FnvBuildHasher;
use std::hash::Hash;
use std::sync::Arc;

/// A process-lifetime cache backed by a sharded concurrent map.
///
/// Entries are never invalidated. Values are handed out as `Arc` clones so a
/// cached value can outlive the shard guard that produced it.
pub trait Cache<K, V>
where
    K: Eq + Hash,
    V: ?Sized,
{
    fn inner(&self) -> &DashMap<K, Arc<V>, FnvBuildHasher>;

    fn cache_id(&self) -> &'static str;

    fn get(&self, key: &K) -> Option<Arc<V>> {
        self.inner().get(key).map(|found| found.value().clone())
    }

    /// Returns the cached value for `key`, running `resolver` only when the
    /// key is vacant. The shard stays locked while the resolver runs, so two
    /// threads racing on the same key construct the value once.
    fn get_or_resolve<F, E>(&self, key: K, resolver: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<Arc<V>, E>,
    {
        match self.inner().entry(key) {
            Entry::Occupied(found) => Ok(found.get().clone()),
            Entry::Vacant(vacant) => {
                let value = resolver()?;
                vacant.insert(value.clone());
                log::trace!("{}: cached new entry", self.cache_id());
                Ok(value)
            }
        }
    }

    /// Inserts `value` unless the key is already present, in which case the
    /// existing value wins and is returned.
    fn init(&self, key: K, value: Arc<V>) -> Arc<V> {
        match self.inner().entry(key) {
            Entry::Occupied(found) => found.get().clone(),
            Entry::Vacant(vacant) => {
                vacant.insert(value.clone());
                value
            }
        }
    }

    fn len(&self) -> usize {
        self.inner().len()
    }
}

/// Builds an empty map with the hasher every cache in the crate uses.
pub(crate) fn new_map<K, V>() -> DashMap<K, Arc<V>, FnvBuildHasher>
where
    K: Eq + Hash,
    V: ?Sized,
{
    DashMap::with_hasher(FnvBuildHasher::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct WordCache {
        words: DashMap<String, Arc<str>, FnvBuildHasher>,
    }

    impl Cache<String, str> for WordCache {
        fn inner(&self) -> &DashMap<String, Arc<str>, FnvBuildHasher> {
            &self.words
        }

        fn cache_id(&self) -> &'static str {
            "WordCache"
        }
    }

    #[test]
    fn resolver_runs_once_per_key() {
        let cache = WordCache { words: new_map() };
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = cache
                .get_or_resolve::<_, Infallible>("greeting".to_string(), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::from("hello"))
                })
                .unwrap();
            assert_eq!(&*value, "hello");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_resolution_leaves_key_vacant() {
        let cache = WordCache { words: new_map() };
        let result = cache.get_or_resolve("broken".to_string(), || Err("nope"));
        assert_eq!(result.unwrap_err(), "nope");
        assert!(cache.get(&"broken".to_string()).is_none());
    }

    #[test]
    fn init_keeps_first_value() {
        let cache = WordCache { words: new_map() };
        cache.init("k".to_string(), Arc::from("first"));
        let kept = cache.init("k".to_string(), Arc::from("second"));
        assert_eq!(&*kept, "first");
    }
}
