//! BalanceStore: durable address balance table over RocksDB. All mutation
//! goes through `update()`, which commits insert/update/delete across the
//! `address_balance` and `chain_tip` column families as a single atomic
//! `WriteBatch` — a crash mid-commit leaves the prior state intact rather
//! than a partially applied one.

use std::collections::HashMap;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, WriteOptions, DB};

use crate::config::AppConfig;
use crate::errors::IndexerError;
use crate::metrics;

pub const CF_ADDRESS_BALANCE: &str = "address_balance";
pub const CF_CHAIN_TIP: &str = "chain_tip";
const CHAIN_TIP_KEY: &[u8] = b"height";

pub struct BalanceStore {
    db: Arc<DB>,
    fast_sync: bool,
}

impl BalanceStore {
    pub fn open(config: &AppConfig) -> Result<Self, IndexerError> {
        let mut cf_options = Options::default();
        // "4KB pages" tuning translated to RocksDB's block size knob.
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_block_size(4096);
        block_opts.set_block_cache(&rocksdb::Cache::new_lru_cache(64 * 1024 * 1024));
        cf_options.set_block_based_table_factory(&block_opts);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ADDRESS_BALANCE, cf_options.clone()),
            ColumnFamilyDescriptor::new(CF_CHAIN_TIP, cf_options),
        ];

        let mut db_options = Options::default();
        db_options.create_if_missing(true);
        db_options.create_missing_column_families(true);

        let db = DB::open_cf_descriptors(&db_options, &config.db_path, cf_descriptors)
            .map_err(|e| IndexerError::StoreError(e.to_string()))?;

        Ok(BalanceStore {
            db: Arc::new(db),
            fast_sync: config.fast_sync,
        })
    }

    fn cf_balance(&self) -> Result<&rocksdb::ColumnFamily, IndexerError> {
        self.db
            .cf_handle(CF_ADDRESS_BALANCE)
            .ok_or_else(|| IndexerError::StoreError("address_balance CF missing".into()))
    }

    fn cf_tip(&self) -> Result<&rocksdb::ColumnFamily, IndexerError> {
        self.db
            .cf_handle(CF_CHAIN_TIP)
            .ok_or_else(|| IndexerError::StoreError("chain_tip CF missing".into()))
    }

    /// Durable tip height, 0 if the store has never been committed to.
    pub fn height(&self) -> Result<u32, IndexerError> {
        let cf = self.cf_tip()?;
        match self.db.get_cf(cf, CHAIN_TIP_KEY)? {
            Some(bytes) => Ok(u32::from_le_bytes(bytes.as_slice().try_into().map_err(
                |_| IndexerError::StoreError("corrupt tip height record".into()),
            )?)),
            None => Ok(0),
        }
    }

    pub fn get(&self, address: &str) -> Result<i64, IndexerError> {
        let cf = self.cf_balance()?;
        match self.db.get_cf(cf, address.as_bytes())? {
            Some(bytes) => Ok(i64::from_le_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| IndexerError::StoreError("corrupt balance record".into()))?,
            )),
            None => Ok(0),
        }
    }

    /// Fetch the stored balance for every address in `addresses`,
    /// omitting ones with no record (caller treats those as zero).
    pub fn get_bulk(&self, addresses: &[String]) -> Result<HashMap<String, i64>, IndexerError> {
        let cf = self.cf_balance()?;
        let mut out = HashMap::with_capacity(addresses.len());
        for address in addresses {
            if let Some(bytes) = self.db.get_cf(cf, address.as_bytes())? {
                let value = i64::from_le_bytes(
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| IndexerError::StoreError("corrupt balance record".into()))?,
                );
                out.insert(address.clone(), value);
            }
        }
        Ok(out)
    }

    /// Apply insert/update/delete in one atomic transaction and advance the
    /// durable tip height. `insert` and `update` both write absolute
    /// balances (the caller has already merged the delta into the stored
    /// value); `delete` removes an address whose balance returned to zero.
    pub fn update(
        &self,
        insert: &HashMap<String, i64>,
        update: &HashMap<String, i64>,
        delete: &[String],
        height: u32,
    ) -> Result<(), IndexerError> {
        let timer = metrics::Timer::new();
        let cf_balance = self.cf_balance()?;
        let cf_tip = self.cf_tip()?;

        let mut batch = WriteBatch::default();
        for (addr, value) in insert.iter().chain(update.iter()) {
            batch.put_cf(cf_balance, addr.as_bytes(), value.to_le_bytes());
        }
        for addr in delete {
            batch.delete_cf(cf_balance, addr.as_bytes());
        }
        batch.put_cf(cf_tip, CHAIN_TIP_KEY, height.to_le_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.disable_wal(self.fast_sync);

        let result = self
            .db
            .write_opt(batch, &write_opts)
            .map_err(|e| IndexerError::StoreError(e.to_string()));
        metrics::record_store_commit_duration(timer.elapsed_secs());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (BalanceStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.db_path = dir.path().to_string_lossy().to_string();
        (BalanceStore::open(&config).unwrap(), dir)
    }

    #[test]
    fn unknown_address_has_zero_balance() {
        let (store, _dir) = test_store();
        assert_eq!(store.get("nobody").unwrap(), 0);
    }

    #[test]
    fn update_commits_insert_update_delete_atomically() {
        let (store, _dir) = test_store();

        let mut insert = HashMap::new();
        insert.insert("alice".to_string(), 100i64);
        store.update(&insert, &HashMap::new(), &[], 10).unwrap();
        assert_eq!(store.get("alice").unwrap(), 100);
        assert_eq!(store.height().unwrap(), 10);

        let mut update = HashMap::new();
        update.insert("alice".to_string(), 50i64);
        store
            .update(&HashMap::new(), &update, &[], 11)
            .unwrap();
        assert_eq!(store.get("alice").unwrap(), 50);

        store
            .update(&HashMap::new(), &HashMap::new(), &["alice".to_string()], 12)
            .unwrap();
        assert_eq!(store.get("alice").unwrap(), 0);
        assert_eq!(store.height().unwrap(), 12);
    }

    #[test]
    fn get_bulk_omits_unknown_addresses() {
        let (store, _dir) = test_store();
        let mut insert = HashMap::new();
        insert.insert("alice".to_string(), 5i64);
        store.update(&insert, &HashMap::new(), &[], 1).unwrap();

        let result = store
            .get_bulk(&["alice".to_string(), "bob".to_string()])
            .unwrap();
        assert_eq!(result.get("alice"), Some(&5));
        assert_eq!(result.get("bob"), None);
    }
}
