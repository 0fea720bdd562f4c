//! In-memory key/value map backing the built-in commands.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub struct Keyspace {
    map: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Vec<u8>, Vec<u8>>> {
        self.map.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Vec<u8>, Vec<u8>>> {
        self.map.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.read().get(key).cloned()
    }

    /// Returns the previous value.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Option<Vec<u8>> {
        self.write().insert(key.to_vec(), value.to_vec())
    }

    /// Number of keys removed.
    pub fn del<K: AsRef<[u8]>>(&self, keys: &[K]) -> usize {
        let mut map = self.write();
        keys.iter().filter(|k| map.remove(k.as_ref()).is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_del() {
        let ks = Keyspace::new();
        assert!(ks.is_empty());
        assert_eq!(ks.set(b"a", b"1"), None);
        assert_eq!(ks.set(b"a", b"2"), Some(b"1".to_vec()));
        ks.set(b"b", b"3");
        assert_eq!(ks.get(b"a"), Some(b"2".to_vec()));
        assert_eq!(ks.del(&[&b"a"[..], b"b", b"missing"]), 2);
        assert_eq!(ks.get(b"a"), None);
        assert_eq!(ks.len(), 0);
    }
}
