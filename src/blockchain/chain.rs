use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;

use super::block::{meets_difficulty, Block};
use super::crypto::Address;
use super::storage::{ChainStore, StorageError};
use super::transaction::{Transaction, TransactionError};

/// Leading zero hex digits required by default
pub const DEFAULT_DIFFICULTY: usize = 2;

/// Amount minted for whoever seals a block
pub const DEFAULT_MINING_REWARD: f64 = 100.0;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Transaction must include both a sender and a recipient")]
    MissingParties,

    #[error("Transaction amount must be positive, got {0}")]
    NonPositiveAmount(f64),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Block built on {built_on} but the tip is now {tip}")]
    StaleBlock { built_on: String, tip: String },

    #[error("Mining was abandoned before a valid nonce was found")]
    MiningAborted,

    #[error("Chain corruption: {0}")]
    ChainCorruption(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("System error: {0}")]
    SystemError(String),
}

/// The local copy of the ledger: blocks, pending pool and mining parameters
#[derive(Clone)]
pub struct Blockchain {
    /// The chain of blocks, genesis first
    chain: Vec<Block>,

    /// Transactions waiting for the next mined block
    pending_transactions: Vec<Transaction>,

    /// Mining difficulty (number of leading zeros required in hash)
    difficulty: usize,

    /// Mining reward
    mining_reward: f64,

    /// Where the chain is persisted after every mutation
    storage: Option<Arc<dyn ChainStore>>,
}

impl fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blockchain")
            .field("height", &self.chain.len())
            .field("pending_transactions", &self.pending_transactions.len())
            .field("difficulty", &self.difficulty)
            .field("mining_reward", &self.mining_reward)
            .field("persistent", &self.storage.is_some())
            .finish()
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

impl Blockchain {
    /// Creates an in-memory blockchain holding only the genesis block
    pub fn new() -> Self {
        Self::with_params(DEFAULT_DIFFICULTY, DEFAULT_MINING_REWARD)
    }

    /// Creates an in-memory blockchain with custom mining parameters
    pub fn with_params(difficulty: usize, mining_reward: f64) -> Self {
        Blockchain {
            chain: vec![Self::create_genesis_block()],
            pending_transactions: Vec::new(),
            difficulty,
            mining_reward,
            storage: None,
        }
    }

    /// Opens a blockchain backed by `storage`.
    ///
    /// An empty store is initialised with the genesis block. A stored chain
    /// that fails validation is refused with `ChainCorruption` rather than
    /// silently replaced.
    pub fn with_storage(
        storage: Arc<dyn ChainStore>,
        difficulty: usize,
        mining_reward: f64,
    ) -> Result<Self, BlockchainError> {
        let mut blockchain = Self::with_params(difficulty, mining_reward);

        match storage.load()? {
            Some(chain) => {
                if !blockchain.is_chain_valid(&chain) {
                    return Err(BlockchainError::ChainCorruption(format!(
                        "stored chain of {} blocks failed validation",
                        chain.len()
                    )));
                }
                info!("Loaded {} blocks from storage", chain.len());
                blockchain.chain = chain;
                blockchain.storage = Some(storage);
            }
            None => {
                info!("No existing blockchain found in storage, starting from genesis");
                blockchain.storage = Some(storage);
                blockchain.persist()?;
            }
        }

        Ok(blockchain)
    }

    /// The genesis block is identical on every node so chains stay comparable
    pub fn create_genesis_block() -> Block {
        Block::genesis()
    }

    /// Gets the last block in the chain
    pub fn latest_block(&self) -> &Block {
        // The chain always holds at least the genesis block.
        &self.chain[self.chain.len() - 1]
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    pub fn mining_reward(&self) -> f64 {
        self.mining_reward
    }

    pub fn pending_transactions(&self) -> &[Transaction] {
        &self.pending_transactions
    }

    /// Adds a signed transfer to the pending pool.
    ///
    /// The sender must be able to cover this amount plus everything it
    /// already has pending.
    pub fn submit_transaction(&mut self, transaction: Transaction) -> Result<(), BlockchainError> {
        if !transaction.is_valid()? {
            return Err(BlockchainError::InvalidTransaction(
                "signature does not match the sender".to_string(),
            ));
        }

        if self.pending_transactions.contains(&transaction)
            || self.contains_transaction(&transaction)
        {
            return Err(BlockchainError::InvalidTransaction(
                "duplicate transaction".to_string(),
            ));
        }

        let from_address = match &transaction.from_address {
            Some(address) if !address.is_empty() && !transaction.to_address.is_empty() => address,
            _ => return Err(BlockchainError::MissingParties),
        };

        // Written this way round so NaN is rejected too.
        if !(transaction.amount > 0.0) {
            return Err(BlockchainError::NonPositiveAmount(transaction.amount));
        }

        let available = self.balance_of(from_address);
        let pending: f64 = self
            .pending_transactions
            .iter()
            .filter(|tx| tx.from_address.as_ref() == Some(from_address))
            .map(|tx| tx.amount)
            .sum();
        let required = pending + transaction.amount;

        if required > available {
            return Err(BlockchainError::InsufficientFunds {
                required,
                available,
            });
        }

        debug!(
            "Transaction added: {} -> {} ({})",
            from_address, transaction.to_address, transaction.amount
        );
        self.pending_transactions.push(transaction);

        Ok(())
    }

    /// Builds an unsealed block holding the pending pool plus one reward
    /// transaction for `reward_address`, linked to the current tip.
    pub fn prepare_block(&self, reward_address: &Address) -> Block {
        let mut transactions = self.pending_transactions.clone();
        transactions.push(Transaction::new_reward(
            reward_address.clone(),
            self.mining_reward,
        ));

        Block::new_now(transactions, self.latest_block().hash.clone())
    }

    /// Appends a sealed block built by `prepare_block`.
    ///
    /// Fails with `StaleBlock` if the tip moved while the block was being
    /// mined, leaving the chain untouched.
    pub fn commit_block(&mut self, block: Block) -> Result<(), BlockchainError> {
        let tip = &self.latest_block().hash;
        if &block.previous_hash != tip {
            return Err(BlockchainError::StaleBlock {
                built_on: block.previous_hash,
                tip: tip.clone(),
            });
        }

        if block.hash != block.calculate_hash() {
            return Err(BlockchainError::InvalidBlock(
                "stored hash does not match its contents".to_string(),
            ));
        }

        if !meets_difficulty(&block.hash, self.difficulty) {
            return Err(BlockchainError::InvalidBlock(format!(
                "hash {} does not meet difficulty {}",
                block.hash, self.difficulty
            )));
        }

        if !block.has_valid_transactions() {
            return Err(BlockchainError::InvalidBlock(
                "block contains an invalid transaction".to_string(),
            ));
        }

        self.pending_transactions
            .retain(|tx| !block.transactions.contains(tx));
        self.chain.push(block);

        self.persist_or_log();
        Ok(())
    }

    /// Mines every pending transaction plus a reward into a new block.
    ///
    /// Blocks the calling thread for the whole proof-of-work search.
    pub fn mine_pending_transactions(
        &mut self,
        reward_address: &Address,
    ) -> Result<Block, BlockchainError> {
        let mut block = self.prepare_block(reward_address);
        block.mine(self.difficulty);
        self.commit_block(block.clone())?;
        Ok(block)
    }

    /// Credits minus debits for `address` across the whole chain
    pub fn balance_of(&self, address: &Address) -> f64 {
        let mut balance = 0.0;

        for block in &self.chain {
            for transaction in &block.transactions {
                if transaction.from_address.as_ref() == Some(address) {
                    balance -= transaction.amount;
                }
                if &transaction.to_address == address {
                    balance += transaction.amount;
                }
            }
        }

        balance
    }

    /// Every mined transaction that sends to or from `address`, oldest first
    pub fn transactions_for(&self, address: &Address) -> Vec<Transaction> {
        self.chain
            .iter()
            .flat_map(|block| block.transactions.iter())
            .filter(|tx| tx.from_address.as_ref() == Some(address) || &tx.to_address == address)
            .cloned()
            .collect()
    }

    /// Validates the local chain
    pub fn is_valid(&self) -> bool {
        self.is_chain_valid(&self.chain)
    }

    /// Validates any chain against this ledger's genesis block and difficulty
    pub fn is_chain_valid(&self, chain: &[Block]) -> bool {
        Self::validate_chain(chain, self.difficulty)
    }

    /// Checks genesis, hashes, links, proof of work and every signature of
    /// `chain`. A signed transfer may appear only once.
    ///
    /// Needs no ledger state, so a received chain can be checked on a worker
    /// thread before any lock is taken.
    pub fn validate_chain(chain: &[Block], difficulty: usize) -> bool {
        let genesis = match chain.first() {
            Some(block) => block,
            None => return false,
        };

        if *genesis != Self::create_genesis_block() {
            debug!("Chain rejected: unknown genesis block {}", genesis.hash);
            return false;
        }

        let mut seen_signatures = HashSet::new();

        for window in chain.windows(2) {
            let previous_block = &window[0];
            let current_block = &window[1];

            if current_block.hash != current_block.calculate_hash() {
                debug!("Chain rejected: block {} hash mismatch", current_block.hash);
                return false;
            }

            if current_block.previous_hash != previous_block.hash {
                debug!("Chain rejected: block {} is not linked", current_block.hash);
                return false;
            }

            if !meets_difficulty(&current_block.hash, difficulty) {
                debug!("Chain rejected: block {} lacks proof of work", current_block.hash);
                return false;
            }

            if !current_block.has_valid_transactions() {
                debug!(
                    "Chain rejected: block {} has invalid transactions",
                    current_block.hash
                );
                return false;
            }

            let replayed = current_block
                .transactions
                .iter()
                .filter_map(|tx| tx.signature.as_ref())
                .any(|signature| !seen_signatures.insert(signature.0.as_str()));
            if replayed {
                debug!(
                    "Chain rejected: block {} repeats a transaction",
                    current_block.hash
                );
                return false;
            }
        }

        true
    }

    /// Adopts `candidate` if it is strictly longer and fully valid.
    ///
    /// Ties keep the local chain. Only length is compared, not accumulated
    /// work, which is sound only while every node mines at the same
    /// difficulty.
    pub fn replace_chain(&mut self, candidate: Vec<Block>) -> bool {
        if !self.is_longer(&candidate) {
            return false;
        }

        if !self.is_chain_valid(&candidate) {
            warn!("Received chain of {} blocks is invalid", candidate.len());
            return false;
        }

        self.adopt_chain(candidate)
    }

    /// Whether `candidate` would win the longest-chain rule, validity aside
    pub fn is_longer(&self, candidate: &[Block]) -> bool {
        if candidate.len() <= self.chain.len() {
            debug!(
                "Received chain of {} blocks is not longer than ours ({})",
                candidate.len(),
                self.chain.len()
            );
            return false;
        }
        true
    }

    /// Swaps in a chain that already passed [`Blockchain::validate_chain`] at
    /// this ledger's difficulty. The length is checked again since the local
    /// chain may have grown meanwhile.
    pub fn adopt_chain(&mut self, candidate: Vec<Block>) -> bool {
        if !self.is_longer(&candidate) {
            return false;
        }

        info!(
            "Replacing chain of {} blocks with received chain of {} blocks",
            self.chain.len(),
            candidate.len()
        );
        self.chain = candidate;

        // Re-admit what is still spendable on the new chain.
        let pending = std::mem::take(&mut self.pending_transactions);
        for transaction in pending {
            if self.contains_transaction(&transaction) {
                continue;
            }
            if let Err(e) = self.submit_transaction(transaction) {
                debug!("Dropping pending transaction after chain replacement: {}", e);
            }
        }

        self.persist_or_log();
        true
    }

    fn contains_transaction(&self, transaction: &Transaction) -> bool {
        self.chain
            .iter()
            .any(|block| block.transactions.contains(transaction))
    }

    /// Writes the chain to storage, if any is configured
    pub fn persist(&self) -> Result<(), BlockchainError> {
        if let Some(storage) = &self.storage {
            storage.save(&self.chain)?;
        }
        Ok(())
    }

    fn persist_or_log(&self) {
        if let Err(e) = self.persist() {
            error!("Failed to save the blockchain: {}", e);
        }
    }

    /// Final save before the process exits
    pub fn shutdown(&self) -> Result<(), BlockchainError> {
        self.persist()?;
        info!("Blockchain saved on shutdown ({} blocks)", self.chain.len());
        Ok(())
    }
}
