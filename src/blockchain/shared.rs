use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};

use super::block::Block;
use super::chain::{Blockchain, BlockchainError};
use super::crypto::Address;
use super::transaction::Transaction;

/// A blockchain shared between connection tasks, the miner and the API.
///
/// Every mutation takes the write lock. Proof of work and the signature checks
/// of a received chain run on the blocking pool with no ledger lock held, and
/// mutations that hit storage take the lock from a blocking worker, so peers
/// keep being served meanwhile.
#[derive(Clone, Debug)]
pub struct SharedBlockchain {
    inner: Arc<RwLock<Blockchain>>,
    /// One miner at a time
    mining: Arc<Mutex<()>>,
    /// Set by `close` to stop an unfinished nonce search
    abort_mining: Arc<AtomicBool>,
}

impl SharedBlockchain {
    pub fn new(blockchain: Blockchain) -> Self {
        Self {
            inner: Arc::new(RwLock::new(blockchain)),
            mining: Arc::new(Mutex::new(())),
            abort_mining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Read access for balances, validation and snapshots
    pub async fn read(&self) -> RwLockReadGuard<'_, Blockchain> {
        self.inner.read().await
    }

    pub async fn chain(&self) -> Vec<Block> {
        self.inner.read().await.chain().to_vec()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn balance_of(&self, address: &Address) -> f64 {
        self.inner.read().await.balance_of(address)
    }

    pub async fn submit_transaction(&self, transaction: Transaction) -> Result<(), BlockchainError> {
        self.inner.write().await.submit_transaction(transaction)
    }

    /// Runs `f` under the write lock on a blocking worker
    async fn write_blocking<F, R>(&self, f: F) -> Result<R, BlockchainError>
    where
        F: FnOnce(&mut Blockchain) -> R + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&mut inner.blocking_write()))
            .await
            .map_err(|e| BlockchainError::SystemError(format!("ledger task failed: {}", e)))
    }

    /// Adopts `candidate` if it is longer and valid.
    ///
    /// The candidate is validated on a blocking worker without any lock; the
    /// length is checked again under the write lock before the swap.
    pub async fn replace_chain(&self, candidate: Vec<Block>) -> bool {
        let difficulty = {
            let blockchain = self.inner.read().await;
            if !blockchain.is_longer(&candidate) {
                return false;
            }
            blockchain.difficulty()
        };

        let validated = tokio::task::spawn_blocking(move || {
            Blockchain::validate_chain(&candidate, difficulty).then_some(candidate)
        })
        .await;

        let candidate = match validated {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                warn!("Received chain is invalid");
                return false;
            }
            Err(e) => {
                warn!("Chain validation task failed: {}", e);
                return false;
            }
        };

        match self.write_blocking(move |blockchain| blockchain.adopt_chain(candidate)).await {
            Ok(adopted) => adopted,
            Err(e) => {
                warn!("Failed to adopt received chain: {}", e);
                false
            }
        }
    }

    /// Mines the pending pool into a new block paying `reward_address`.
    ///
    /// If a longer chain is adopted while the search runs, the commit fails
    /// with `StaleBlock` and the adopted chain is kept. After `close` the
    /// search stops with `MiningAborted`.
    pub async fn mine_next(&self, reward_address: &Address) -> Result<Block, BlockchainError> {
        let _mining = self.mining.lock().await;

        let (mut block, difficulty) = {
            let blockchain = self.inner.read().await;
            (blockchain.prepare_block(reward_address), blockchain.difficulty())
        };

        let abort = Arc::clone(&self.abort_mining);
        let block = tokio::task::spawn_blocking(move || {
            block.mine_until(difficulty, &abort).then_some(block)
        })
        .await
        .map_err(|e| BlockchainError::SystemError(format!("mining task failed: {}", e)))?
        .ok_or(BlockchainError::MiningAborted)?;

        self.write_blocking(move |blockchain| {
            let hash = block.hash.clone();
            match blockchain.commit_block(block.clone()) {
                Ok(()) => {
                    info!("Block {} appended at height {}", hash, blockchain.len() - 1);
                    Ok(block)
                }
                Err(e) => {
                    warn!("Discarding mined block {}: {}", hash, e);
                    Err(e)
                }
            }
        })
        .await?
    }

    /// Stops any running nonce search, then makes the final save under the
    /// write lock so no mutation races it
    pub async fn close(&self) -> Result<(), BlockchainError> {
        self.abort_mining.store(true, Ordering::Relaxed);
        self.write_blocking(|blockchain| blockchain.shutdown()).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Wallet;

    #[tokio::test]
    async fn test_mine_next_on_worker() {
        let miner = Wallet::new();
        let shared = SharedBlockchain::new(Blockchain::with_params(2, 100.0));

        let block = shared.mine_next(miner.address()).await.unwrap();

        assert!(block.hash.starts_with("00"));
        assert_eq!(shared.len().await, 2);
        assert_eq!(shared.balance_of(miner.address()).await, 100.0);
        assert!(shared.read().await.is_valid());
    }

    #[tokio::test]
    async fn test_concurrent_miners_extend_one_chain() {
        let miner = Wallet::new();
        let shared = SharedBlockchain::new(Blockchain::with_params(1, 100.0));

        let first = {
            let shared = shared.clone();
            let address = miner.address().clone();
            tokio::spawn(async move { shared.mine_next(&address).await })
        };
        let second = {
            let shared = shared.clone();
            let address = miner.address().clone();
            tokio::spawn(async move { shared.mine_next(&address).await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(shared.len().await, 3);
        assert!(shared.read().await.is_valid());
    }

    #[tokio::test]
    async fn test_adopted_chain_beats_late_block() {
        let miner = Wallet::new();
        let shared = SharedBlockchain::new(Blockchain::with_params(1, 100.0));

        let mut remote = Blockchain::with_params(1, 100.0);
        for _ in 0..3 {
            remote.mine_pending_transactions(miner.address()).unwrap();
        }

        // Build on the old tip, then let a longer chain arrive first.
        let mut late = shared.read().await.prepare_block(miner.address());
        late.mine(1);
        assert!(shared.replace_chain(remote.chain().to_vec()).await);

        let result = shared.inner.write().await.commit_block(late);
        assert!(matches!(result, Err(BlockchainError::StaleBlock { .. })));
        assert_eq!(shared.chain().await, remote.chain());
    }

    #[tokio::test]
    async fn test_close_aborts_unfinished_mining() {
        let miner = Wallet::new();
        // 64 zero digits is never reached, so only close ends the search.
        let shared = SharedBlockchain::new(Blockchain::with_params(64, 100.0));

        let mining = {
            let shared = shared.clone();
            let address = miner.address().clone();
            tokio::spawn(async move { shared.mine_next(&address).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!mining.is_finished());

        shared.close().await.unwrap();

        let result = mining.await.unwrap();
        assert!(matches!(result, Err(BlockchainError::MiningAborted)));
        assert_eq!(shared.len().await, 1);
    }

    #[tokio::test]
    async fn test_replace_chain_validates_off_lock() {
        let miner = Wallet::new();
        let shared = SharedBlockchain::new(Blockchain::with_params(1, 100.0));

        let mut remote = Blockchain::with_params(1, 100.0);
        remote.mine_pending_transactions(miner.address()).unwrap();
        remote.mine_pending_transactions(miner.address()).unwrap();

        let mut tampered = remote.chain().to_vec();
        tampered[1].transactions[0].amount = 1_000.0;
        assert!(!shared.replace_chain(tampered).await);
        assert!(!shared.replace_chain(vec![Block::genesis()]).await);

        assert!(shared.replace_chain(remote.chain().to_vec()).await);
        assert_eq!(shared.chain().await, remote.chain());
    }
}
