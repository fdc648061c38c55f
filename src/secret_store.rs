use std::collections::HashMap;
use std::convert::TryInto;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::random_version;
use crate::errors::{ChainError, ChainResult};
use crate::secret::{PrivateKey25519, PublicKey25519Proposition};
use crate::storage::VersionedStore;

#[derive(Serialize, Deserialize)]
struct StoredSecret {
    ordinal: u64,
    secret: PrivateKey25519,
}

/// Insertion-ordered map of proposition-hash to secret.
///
/// Secrets are independent of block versions: every mutation is written under
/// a freshly drawn random version that exists only to satisfy the underlying
/// store, and those versions are never rolled back through. The insertion
/// order lives in an in-memory index rebuilt at startup from the stored
/// ordinals.
pub struct SecretStore {
    store: VersionedStore,
    order: Vec<[u8; 32]>,
    secrets: HashMap<[u8; 32], PrivateKey25519>,
    next_ordinal: u64,
}

impl SecretStore {
    pub fn load(store: VersionedStore) -> ChainResult<Self> {
        let mut entries = Vec::new();
        for (key, value) in store.get_all()? {
            let key: [u8; 32] = key
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::Config("invalid secret store key length".into()))?;
            let stored: StoredSecret = bincode::deserialize(&value)?;
            entries.push((stored.ordinal, key, stored.secret));
        }
        entries.sort_by_key(|(ordinal, _, _)| *ordinal);
        let next_ordinal = entries
            .last()
            .map(|(ordinal, _, _)| ordinal + 1)
            .unwrap_or(0);
        let mut order = Vec::with_capacity(entries.len());
        let mut secrets = HashMap::with_capacity(entries.len());
        for (_, key, secret) in entries {
            order.push(key);
            secrets.insert(key, secret);
        }
        debug!(count = order.len(), "loaded wallet secrets");
        Ok(Self {
            store,
            order,
            secrets,
            next_ordinal,
        })
    }

    pub fn add(&mut self, secret: PrivateKey25519) -> ChainResult<()> {
        let key = secret.public_image().key_hash();
        if self.secrets.contains_key(&key) {
            return Err(ChainError::Validation(format!(
                "secret already present for proposition {}",
                hex::encode(secret.public_image().bytes())
            )));
        }
        let stored = StoredSecret {
            ordinal: self.next_ordinal,
            secret: secret.clone(),
        };
        self.store.update(
            random_version(),
            vec![(key.to_vec(), bincode::serialize(&stored)?)],
            vec![],
        )?;
        self.next_ordinal += 1;
        self.order.push(key);
        self.secrets.insert(key, secret);
        Ok(())
    }

    /// Removing an absent proposition is a no-op that still writes a version.
    pub fn remove(&mut self, proposition: &PublicKey25519Proposition) -> ChainResult<()> {
        let key = proposition.key_hash();
        self.store
            .update(random_version(), vec![], vec![key.to_vec()])?;
        if self.secrets.remove(&key).is_some() {
            self.order.retain(|entry| entry != &key);
        }
        Ok(())
    }

    pub fn get(&self, proposition: &PublicKey25519Proposition) -> Option<&PrivateKey25519> {
        self.secrets.get(&proposition.key_hash())
    }

    pub fn contains(&self, proposition: &PublicKey25519Proposition) -> bool {
        self.secrets.contains_key(&proposition.key_hash())
    }

    /// Secrets in insertion order.
    pub fn secrets(&self) -> Vec<&PrivateKey25519> {
        self.order
            .iter()
            .filter_map(|key| self.secrets.get(key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NodeStorages;
    use tempfile::TempDir;

    fn secret(tag: u8) -> PrivateKey25519 {
        PrivateKey25519::from_seed([tag; 32]).unwrap()
    }

    #[test]
    fn add_and_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut store = SecretStore::load(storages.secrets()).unwrap();
        let first = secret(1);
        store.add(first.clone()).unwrap();
        assert!(store.contains(&first.public_image()));
        assert_eq!(store.get(&first.public_image()), Some(&first));
    }

    #[test]
    fn duplicate_add_fails() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut store = SecretStore::load(storages.secrets()).unwrap();
        store.add(secret(1)).unwrap();
        let err = store.add(secret(1)).unwrap_err();
        assert!(matches!(err, ChainError::Validation(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_of_absent_key_still_writes_a_version() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 10).unwrap();
        let mut store = SecretStore::load(storages.secrets()).unwrap();
        let before = storages.secrets().number_of_versions().unwrap();
        store.remove(&secret(9).public_image()).unwrap();
        assert_eq!(storages.secrets().number_of_versions().unwrap(), before + 1);
    }

    #[test]
    fn insertion_order_survives_reload() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 100).unwrap();
        let tags = [5u8, 1, 9, 3, 7];
        {
            let mut store = SecretStore::load(storages.secrets()).unwrap();
            for tag in tags {
                store.add(secret(tag)).unwrap();
            }
            store.remove(&secret(9).public_image()).unwrap();
        }
        let store = SecretStore::load(storages.secrets()).unwrap();
        let reloaded: Vec<_> = store
            .secrets()
            .iter()
            .map(|secret| secret.public_image())
            .collect();
        let expected: Vec<_> = [5u8, 1, 3, 7]
            .iter()
            .map(|tag| secret(*tag).public_image())
            .collect();
        assert_eq!(reloaded, expected);
    }

    #[test]
    fn versions_are_random_and_unique() {
        let dir = TempDir::new().unwrap();
        let storages = NodeStorages::open(dir.path(), 100).unwrap();
        let mut store = SecretStore::load(storages.secrets()).unwrap();
        store.add(secret(1)).unwrap();
        store.add(secret(2)).unwrap();
        let versions = storages.secrets().rollback_versions(10).unwrap();
        assert_eq!(versions.len(), 2);
        assert_ne!(versions[0], versions[1]);
    }
}
