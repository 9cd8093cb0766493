use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Where a ledger keeps its chain between runs
pub trait ChainStore: Send + Sync {
    /// Returns `None` when nothing has been stored yet
    fn load(&self) -> Result<Option<Vec<Block>>, StorageError>;

    /// Replaces the stored chain with `chain`
    fn save(&self, chain: &[Block]) -> Result<(), StorageError>;
}

/// Chain storage backed by a sled database, one entry per block keyed by height
pub struct SledStorage {
    /// The database instance
    db: Db,

    /// Tree for blocks
    blocks: Tree,
}

impl std::fmt::Debug for SledStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStorage").finish()
    }
}

impl SledStorage {
    /// Opens (or creates) the database directory at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let blocks = db.open_tree("blocks")?;

        Ok(Self { db, blocks })
    }
}

impl ChainStore for SledStorage {
    fn load(&self) -> Result<Option<Vec<Block>>, StorageError> {
        if self.blocks.is_empty() {
            return Ok(None);
        }

        // Big-endian keys iterate in height order.
        let mut chain = Vec::with_capacity(self.blocks.len());
        for result in self.blocks.iter() {
            let (key, value) = result?;
            let block: Block = bincode::deserialize(&value).map_err(|e| {
                StorageError::DeserializationError(format!(
                    "block at key {}: {}",
                    hex::encode(&key),
                    e
                ))
            })?;
            chain.push(block);
        }

        Ok(Some(chain))
    }

    fn save(&self, chain: &[Block]) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();

        for (height, block) in chain.iter().enumerate() {
            let value = bincode::serialize(block)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            batch.insert((height as u64).to_be_bytes().to_vec(), value);
        }

        // A replaced chain may be shorter than the stored one.
        for key in self.blocks.range((chain.len() as u64).to_be_bytes()..) {
            let (key, _) = key?;
            batch.remove(key);
        }

        self.blocks.apply_batch(batch)?;
        self.db.flush()?;

        debug!("Saved {} blocks to sled", chain.len());
        Ok(())
    }
}

/// Chain storage as a single pretty-printed JSON document
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChainStore for JsonFileStorage {
    fn load(&self) -> Result<Option<Vec<Block>>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)?;
        let chain = serde_json::from_str(&content)
            .map_err(|e| StorageError::DeserializationError(e.to_string()))?;

        Ok(Some(chain))
    }

    fn save(&self, chain: &[Block]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(chain)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        // Write then rename so a crash never leaves a half-written chain.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;

        debug!("Saved {} blocks to {}", chain.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{Address, Transaction, Wallet};
    use tempfile::tempdir;

    fn sample_chain() -> Vec<Block> {
        let wallet = Wallet::new();
        let mut tx = Transaction::new(wallet.address().clone(), Address("to".to_string()), 5.5);
        tx.sign(&wallet).unwrap();

        let genesis = Block::genesis();
        let mut block = Block::new(
            2,
            vec![tx, Transaction::new_reward(wallet.address().clone(), 100.0)],
            genesis.hash.clone(),
        );
        block.mine(1);

        vec![genesis, block]
    }

    fn assert_roundtrip(store: &dyn ChainStore) {
        assert!(store.load().unwrap().is_none());

        let chain = sample_chain();
        store.save(&chain).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, chain);
        for block in &loaded {
            assert_eq!(block.calculate_hash(), block.hash);
        }
    }

    #[test]
    fn test_sled_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SledStorage::new(dir.path().join("db")).unwrap();
        assert_roundtrip(&store);
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = tempdir().unwrap();
        let store = JsonFileStorage::new(dir.path().join("nested").join("chain.json"));
        assert_roundtrip(&store);
    }

    #[test]
    fn test_sled_save_shrinks_chain() {
        let dir = tempdir().unwrap();
        let store = SledStorage::new(dir.path().join("db")).unwrap();

        let chain = sample_chain();
        store.save(&chain).unwrap();
        store.save(&chain[..1]).unwrap();

        assert_eq!(store.load().unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_json_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chain.json");
        fs::write(&path, "{ not json").unwrap();

        let store = JsonFileStorage::new(&path);
        assert!(matches!(
            store.load(),
            Err(StorageError::DeserializationError(_))
        ));
    }
}
