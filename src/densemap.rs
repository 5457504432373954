//! A map of dense integer key to value.

use std::marker::PhantomData;

pub trait Index: From<usize> {
    fn index(&self) -> usize;
}

/// A map of a dense integer key to value, implemented as a vector.
/// Effectively wraps Vec<V> to provided typed keys.
pub struct DenseMap<K, V> {
    vec: Vec<V>,
    key_type: PhantomData<K>,
}

impl<K, V> Default for DenseMap<K, V> {
    fn default() -> Self {
        DenseMap {
            vec: Vec::default(),
            key_type: PhantomData,
        }
    }
}

impl<K: Index, V> DenseMap<K, V> {
    pub fn lookup(&self, k: K) -> Option<&V> {
        self.vec.get(k.index())
    }

    pub fn lookup_mut(&mut self, k: K) -> Option<&mut V> {
        self.vec.get_mut(k.index())
    }

    pub fn next_id(&self) -> K {
        K::from(self.vec.len())
    }

    pub fn push(&mut self, val: V) -> K {
        let id = self.next_id();
        self.vec.push(val);
        id
    }

    pub fn len(&self) -> usize {
        self.vec.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.vec.iter().enumerate().map(|(i, v)| (K::from(i), v))
    }
}

/// A slot map: keys are never reused, removed entries leave a hole.
impl<K: Index, V> DenseMap<K, Option<V>> {
    pub fn get(&self, k: K) -> Option<&V> {
        self.lookup(k).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, k: K) -> Option<&mut V> {
        self.lookup_mut(k).and_then(Option::as_mut)
    }

    pub fn take(&mut self, k: K) -> Option<V> {
        self.lookup_mut(k).and_then(Option::take)
    }

    pub fn live(&self) -> impl Iterator<Item = (K, &V)> {
        self.iter().filter_map(|(k, v)| v.as_ref().map(|v| (k, v)))
    }
}
