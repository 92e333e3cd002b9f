use std::hash::Hash;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use rustc_hash::FxHashMap;

/// A copy-on-write map behind a single atomic pointer: reads take a consistent snapshot without
///  locking, updates clone-and-swap. Intended for maps that are read on every send/receive but
///  mutated only on connection lifecycle changes.
pub struct AtomicMap<K,V> {
    map: AtomicPtr<Arc<FxHashMap<K,V>>>,
}
impl <K: Hash+Eq+Clone+Sync+Send,V:Clone+Sync+Send> Default for AtomicMap<K,V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash+Eq+Clone+Sync+Send, V:Clone+Sync+Send> AtomicMap<K,V> {
    pub fn new() -> AtomicMap<K,V> {
        let map = Arc::new(FxHashMap::<K,V>::default());
        let raw = Box::into_raw(Box::new(map));

        AtomicMap {
            map: AtomicPtr::new(raw),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        unsafe {
            (*self.map.load(Ordering::Acquire))
                .get(key)
                .cloned()
        }
    }

    /// a consistent snapshot of the whole map
    pub fn load(&self) -> Arc<FxHashMap<K,V>> {
        unsafe {
            (*self.map.load(Ordering::Acquire)).clone()
        }
    }

    pub fn update(&self, f: impl Fn(&mut FxHashMap<K,V>)) {
        loop {
            let old = self.map.load(Ordering::Acquire);

            let mut map: FxHashMap<K,V> = unsafe { (**old).clone() };
            f(&mut map);
            let new = Box::into_raw(Box::new(Arc::new(map)));

            match self.map.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(prev) => {
                    unsafe { drop(Box::from_raw(prev)); }
                    return;
                }
                Err(_) => {
                    unsafe { drop(Box::from_raw(new)); }
                }
            }
        }
    }

    /// insert the value only if the key is absent, returning the entry that is in the map
    ///  afterwards. This is the 'race into the map' primitive: the loser of a concurrent
    ///  insert gets the winner's value back.
    pub fn insert_if_absent(&self, key: K, value: V) -> (bool, V) {
        loop {
            let old = self.map.load(Ordering::Acquire);

            if let Some(existing) = unsafe { (**old).get(&key) } {
                return (false, existing.clone());
            }

            let mut map: FxHashMap<K,V> = unsafe { (**old).clone() };
            map.insert(key.clone(), value.clone());
            let new = Box::into_raw(Box::new(Arc::new(map)));

            match self.map.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(prev) => {
                    unsafe { drop(Box::from_raw(prev)); }
                    return (true, value);
                }
                Err(_) => {
                    unsafe { drop(Box::from_raw(new)); }
                }
            }
        }
    }

    pub fn remove(&self, key: &K) {
        self.update(|m| { m.remove(key); });
    }
}

impl <K,V> Drop for AtomicMap<K,V> {
    fn drop(&mut self) {
        unsafe {
            let raw = self.map.load(Ordering::Acquire);
            drop (Box::from_raw(raw));
        }
    }
}
