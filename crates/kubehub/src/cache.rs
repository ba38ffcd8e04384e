//! Read side of the watched state, addressed by `namespace/name` keys.

use std::sync::Arc;

use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Resource, ResourceExt};
use rustc_hash::FxHashMap;

/// Latest known version of each watched object.
pub trait ObjectCache<K>: Send + Sync {
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>>;
}

impl<K> ObjectCache<K> for Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        let mut obj_ref = ObjectRef::<K>::new(name);
        if let Some(ns) = namespace {
            obj_ref = obj_ref.within(ns);
        }
        Store::get(self, &obj_ref)
    }
}

/// Fixed set of objects, for dry runs and tests.
pub struct MapCache<K> {
    objects: FxHashMap<String, Arc<K>>,
}

impl<K> Default for MapCache<K> {
    fn default() -> Self { Self { objects: FxHashMap::default() } }
}

impl<K: Resource> MapCache<K> {
    pub fn insert(&mut self, obj: K) -> String {
        let key = object_key(&obj);
        self.objects.insert(key.clone(), Arc::new(obj));
        key
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<K>> { self.objects.remove(key) }

    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }
}

impl<K: Send + Sync> ObjectCache<K> for MapCache<K> {
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        self.objects.get(&join_key(namespace, name)).cloned()
    }
}

/// `namespace/name`, or just `name` for cluster-scoped objects.
pub fn object_key<K: Resource>(obj: &K) -> String { join_key(obj.namespace().as_deref(), &obj.name_any()) }

pub fn join_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}
