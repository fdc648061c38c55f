use std::collections::HashSet;
use std::convert::TryInto;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options, WriteBatch,
};
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::Version;

pub const STORAGE_SCHEMA_VERSION: u32 = 1;

pub(crate) const STORE_HISTORY: &str = "history";
pub(crate) const STORE_CONSENSUS_DATA: &str = "consensus_data";
pub(crate) const STORE_STATE: &str = "state";
pub(crate) const STORE_STATE_FORGER_BOXES: &str = "state_forger_boxes";
pub(crate) const STORE_UTXO_MERKLE_TREE: &str = "utxo_merkle_tree";
pub(crate) const STORE_WALLET_BOXES: &str = "wallet_boxes";
pub(crate) const STORE_WALLET_TRANSACTIONS: &str = "wallet_transactions";
pub(crate) const STORE_FORGER_BOX_INFO: &str = "forger_box_info";
pub(crate) const STORE_CSW_DATA: &str = "csw_data";
pub(crate) const STORE_SECRETS: &str = "secrets";

const ALL_STORES: [&str; 10] = [
    STORE_HISTORY,
    STORE_CONSENSUS_DATA,
    STORE_STATE,
    STORE_STATE_FORGER_BOXES,
    STORE_UTXO_MERKLE_TREE,
    STORE_WALLET_BOXES,
    STORE_WALLET_TRANSACTIONS,
    STORE_FORGER_BOX_INFO,
    STORE_CSW_DATA,
    STORE_SECRETS,
];

const CF_METADATA: &str = "metadata";
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

type Db = DBWithThreadMode<MultiThreaded>;

/// One rocksdb database holding every logical store of the node view. Each
/// store is an independent versioned keyed storage; there are no cross-store
/// keys.
pub struct NodeStorages {
    db: Arc<Db>,
    max_rollback_versions: usize,
}

impl NodeStorages {
    pub fn open(path: &Path, max_rollback_versions: usize) -> ChainResult<Self> {
        if max_rollback_versions == 0 {
            return Err(ChainError::Config(
                "max_rollback_versions must be at least 1".into(),
            ));
        }
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let mut cf_descriptors = vec![ColumnFamilyDescriptor::new(CF_METADATA, Options::default())];
        for store in ALL_STORES {
            cf_descriptors.push(ColumnFamilyDescriptor::new(store, Options::default()));
            cf_descriptors.push(ColumnFamilyDescriptor::new(
                undo_cf_name(store),
                Options::default(),
            ));
        }
        let db = Db::open_cf_descriptors(&opts, path, cf_descriptors)?;
        let storages = Self {
            db: Arc::new(db),
            max_rollback_versions,
        };
        storages.ensure_schema_supported()?;
        Ok(storages)
    }

    fn ensure_schema_supported(&self) -> ChainResult<()> {
        let metadata_cf = self
            .db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| ChainError::Config("missing metadata column family".into()))?;
        match self.db.get_cf(&metadata_cf, SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid schema version encoding".into()))?;
                let version = u32::from_be_bytes(bytes);
                if version != STORAGE_SCHEMA_VERSION {
                    return Err(ChainError::Config(format!(
                        "database schema version {version} is not supported, expected {STORAGE_SCHEMA_VERSION}"
                    )));
                }
                Ok(())
            }
            None => {
                self.db.put_cf(
                    &metadata_cf,
                    SCHEMA_VERSION_KEY,
                    STORAGE_SCHEMA_VERSION.to_be_bytes(),
                )?;
                Ok(())
            }
        }
    }

    fn store(&self, name: &'static str) -> VersionedStore {
        VersionedStore {
            db: self.db.clone(),
            name,
            undo_cf: undo_cf_name(name),
            max_versions: self.max_rollback_versions,
        }
    }

    pub fn history(&self) -> VersionedStore {
        self.store(STORE_HISTORY)
    }

    pub fn consensus_data(&self) -> VersionedStore {
        self.store(STORE_CONSENSUS_DATA)
    }

    pub fn state(&self) -> VersionedStore {
        self.store(STORE_STATE)
    }

    pub fn state_forger_boxes(&self) -> VersionedStore {
        self.store(STORE_STATE_FORGER_BOXES)
    }

    pub fn utxo_merkle_tree(&self) -> VersionedStore {
        self.store(STORE_UTXO_MERKLE_TREE)
    }

    pub fn wallet_boxes(&self) -> VersionedStore {
        self.store(STORE_WALLET_BOXES)
    }

    pub fn wallet_transactions(&self) -> VersionedStore {
        self.store(STORE_WALLET_TRANSACTIONS)
    }

    pub fn forger_box_info(&self) -> VersionedStore {
        self.store(STORE_FORGER_BOX_INFO)
    }

    pub fn csw_data(&self) -> VersionedStore {
        self.store(STORE_CSW_DATA)
    }

    pub fn secrets(&self) -> VersionedStore {
        self.store(STORE_SECRETS)
    }
}

fn undo_cf_name(store: &str) -> String {
    format!("{store}_versions")
}

#[derive(Serialize, Deserialize)]
struct VersionRecord {
    version: Version,
    undo: Vec<UndoEntry>,
}

#[derive(Serialize, Deserialize)]
struct UndoEntry {
    key: Vec<u8>,
    previous: Option<Vec<u8>>,
}

/// Append-only sequence of (version, writeset) with bounded rollback history.
///
/// `update` is atomic through a single write batch. `rollback(v)` restores
/// exactly the contents present right after the update that produced `v` and
/// discards every strictly newer version. Undo records older than the
/// retention bound are pruned; pruning ages out rollback capability only,
/// never current data.
#[derive(Clone)]
pub struct VersionedStore {
    db: Arc<Db>,
    name: &'static str,
    undo_cf: String,
    max_versions: usize,
}

impl VersionedStore {
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn cf(&self, name: &str) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::Config(format!("missing column family {name}")))
    }

    fn data_cf(&self) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.cf(self.name)
    }

    fn undo_cf(&self) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.cf(&self.undo_cf)
    }

    fn metadata_cf(&self) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.cf(CF_METADATA)
    }

    fn next_seq_key(&self) -> Vec<u8> {
        [self.name.as_bytes(), b"/next_seq"].concat()
    }

    fn first_seq_key(&self) -> Vec<u8> {
        [self.name.as_bytes(), b"/first_seq"].concat()
    }

    fn marker_key(&self, version: &Version) -> Vec<u8> {
        [self.name.as_bytes(), b"/v/", version.as_slice()].concat()
    }

    fn read_seq(&self, key: &[u8]) -> ChainResult<u64> {
        let metadata_cf = self.metadata_cf()?;
        match self.db.get_cf(&metadata_cf, key)? {
            Some(bytes) => decode_seq(&bytes),
            None => Ok(0),
        }
    }

    fn next_seq(&self) -> ChainResult<u64> {
        self.read_seq(&self.next_seq_key())
    }

    fn first_seq(&self) -> ChainResult<u64> {
        self.read_seq(&self.first_seq_key())
    }

    fn version_seq(&self, version: &Version) -> ChainResult<Option<u64>> {
        let metadata_cf = self.metadata_cf()?;
        match self.db.get_cf(&metadata_cf, self.marker_key(version))? {
            Some(bytes) => Ok(Some(decode_seq(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_record(&self, seq: u64) -> ChainResult<Option<VersionRecord>> {
        let undo_cf = self.undo_cf()?;
        match self.db.get_cf(&undo_cf, seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains_version(&self, version: &Version) -> ChainResult<bool> {
        Ok(self.version_seq(version)?.is_some())
    }

    pub fn update(
        &self,
        version: Version,
        puts: Vec<(Vec<u8>, Vec<u8>)>,
        deletes: Vec<Vec<u8>>,
    ) -> ChainResult<()> {
        if self.contains_version(&version)? {
            return Err(ChainError::Validation(format!(
                "version {} already present in store {}",
                hex::encode(version),
                self.name
            )));
        }
        let put_keys: HashSet<&[u8]> = puts.iter().map(|(key, _)| key.as_slice()).collect();
        if deletes.iter().any(|key| put_keys.contains(key.as_slice())) {
            return Err(ChainError::Validation(format!(
                "the same key cannot be updated and removed in store {}",
                self.name
            )));
        }

        let data_cf = self.data_cf()?;
        let undo_cf = self.undo_cf()?;
        let metadata_cf = self.metadata_cf()?;

        let mut undo = Vec::new();
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        for (key, _) in &puts {
            if seen.insert(key.clone()) {
                undo.push(UndoEntry {
                    key: key.clone(),
                    previous: self.db.get_cf(&data_cf, key)?,
                });
            }
        }
        for key in &deletes {
            if seen.insert(key.clone()) {
                undo.push(UndoEntry {
                    key: key.clone(),
                    previous: self.db.get_cf(&data_cf, key)?,
                });
            }
        }

        let next_seq = self.next_seq()?;
        let mut first_seq = self.first_seq()?;
        let record = VersionRecord { version, undo };

        let mut batch = WriteBatch::default();
        for (key, value) in &puts {
            batch.put_cf(&data_cf, key, value);
        }
        for key in &deletes {
            batch.delete_cf(&data_cf, key);
        }
        batch.put_cf(&undo_cf, next_seq.to_be_bytes(), bincode::serialize(&record)?);
        batch.put_cf(&metadata_cf, self.marker_key(&version), next_seq.to_be_bytes());
        batch.put_cf(
            &metadata_cf,
            self.next_seq_key(),
            (next_seq + 1).to_be_bytes(),
        );
        while next_seq + 1 - first_seq > self.max_versions as u64 {
            if let Some(pruned) = self.read_record(first_seq)? {
                batch.delete_cf(&metadata_cf, self.marker_key(&pruned.version));
            }
            batch.delete_cf(&undo_cf, first_seq.to_be_bytes());
            first_seq += 1;
        }
        batch.put_cf(&metadata_cf, self.first_seq_key(), first_seq.to_be_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    pub fn rollback(&self, version: Version) -> ChainResult<()> {
        let target_seq = self.version_seq(&version)?.ok_or_else(|| {
            ChainError::Rollback(format!(
                "version {} not found in store {}",
                hex::encode(version),
                self.name
            ))
        })?;
        let next_seq = self.next_seq()?;
        let data_cf = self.data_cf()?;
        let undo_cf = self.undo_cf()?;
        let metadata_cf = self.metadata_cf()?;

        let mut batch = WriteBatch::default();
        for seq in ((target_seq + 1)..next_seq).rev() {
            let record = self.read_record(seq)?.ok_or_else(|| {
                ChainError::Rollback(format!("missing undo record {seq} in store {}", self.name))
            })?;
            for entry in record.undo {
                match entry.previous {
                    Some(previous) => batch.put_cf(&data_cf, &entry.key, &previous),
                    None => batch.delete_cf(&data_cf, &entry.key),
                }
            }
            batch.delete_cf(&undo_cf, seq.to_be_bytes());
            batch.delete_cf(&metadata_cf, self.marker_key(&record.version));
        }
        batch.put_cf(
            &metadata_cf,
            self.next_seq_key(),
            (target_seq + 1).to_be_bytes(),
        );
        self.db.write(batch)?;
        Ok(())
    }

    pub fn last_version_id(&self) -> ChainResult<Option<Version>> {
        let next_seq = self.next_seq()?;
        if next_seq == self.first_seq()? {
            return Ok(None);
        }
        match self.read_record(next_seq - 1)? {
            Some(record) => Ok(Some(record.version)),
            None => Err(ChainError::Consistency(format!(
                "missing undo record for latest version of store {}",
                self.name
            ))),
        }
    }

    /// Versions still available as rollback targets, most recent first.
    pub fn rollback_versions(&self, limit: usize) -> ChainResult<Vec<Version>> {
        let first_seq = self.first_seq()?;
        let next_seq = self.next_seq()?;
        let mut versions = Vec::new();
        for seq in (first_seq..next_seq).rev().take(limit) {
            match self.read_record(seq)? {
                Some(record) => versions.push(record.version),
                None => {
                    return Err(ChainError::Consistency(format!(
                        "missing undo record {seq} in store {}",
                        self.name
                    )))
                }
            }
        }
        Ok(versions)
    }

    pub fn number_of_versions(&self) -> ChainResult<usize> {
        Ok((self.next_seq()? - self.first_seq()?) as usize)
    }

    pub fn get(&self, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        let data_cf = self.data_cf()?;
        Ok(self.db.get_cf(&data_cf, key)?)
    }

    pub fn get_all(&self) -> ChainResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let data_cf = self.data_cf()?;
        let mut entries = Vec::new();
        let mut iterator = self.db.iterator_cf(&data_cf, rocksdb::IteratorMode::Start);
        while let Some(entry) = iterator.next() {
            let (key, value) = entry?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    pub fn is_empty(&self) -> ChainResult<bool> {
        let data_cf = self.data_cf()?;
        let mut iterator = self.db.iterator_cf(&data_cf, rocksdb::IteratorMode::Start);
        Ok(iterator.next().transpose()?.is_none())
    }
}

fn decode_seq(bytes: &[u8]) -> ChainResult<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ChainError::Config("invalid sequence number encoding".into()))?;
    Ok(u64::from_be_bytes(bytes))
}
