use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::transaction::Transaction;

/// Timestamp of the genesis block, 2024-01-01T00:00:00Z in milliseconds
pub const GENESIS_TIMESTAMP: i64 = 1_704_067_200_000;

const ABORT_CHECK_INTERVAL: u64 = 1024;

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Transactions in insertion order; the order is part of the hash
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block, empty for genesis
    pub previous_hash: String,

    /// Hash of the current block
    pub hash: String,

    /// Proof of work counter
    pub nonce: u64,
}

impl Block {
    /// Creates an unsealed block with `nonce = 0`
    pub fn new(timestamp: i64, transactions: Vec<Transaction>, previous_hash: String) -> Self {
        let mut block = Block {
            timestamp,
            transactions,
            previous_hash,
            hash: String::new(),
            nonce: 0,
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Creates an unsealed block stamped with the current time
    pub fn new_now(transactions: Vec<Transaction>, previous_hash: String) -> Self {
        Self::new(Utc::now().timestamp_millis(), transactions, previous_hash)
    }

    /// The fixed first block shared by every node
    pub fn genesis() -> Self {
        Self::new(GENESIS_TIMESTAMP, Vec::new(), String::new())
    }

    /// Calculates the hash of the block
    ///
    /// # Returns
    ///
    /// The SHA-256 hash of the block as a hexadecimal string
    pub fn calculate_hash(&self) -> String {
        // Vec<Transaction> always serializes; fall back to an empty list so the
        // hash stays a pure function of the fields.
        let transactions = serde_json::to_string(&self.transactions).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(self.timestamp.to_string().as_bytes());
        hasher.update(transactions.as_bytes());
        hasher.update(self.nonce.to_string().as_bytes());

        format!("{:x}", hasher.finalize())
    }

    /// Searches nonces until the hash has `difficulty` leading zero digits.
    ///
    /// CPU bound and unbounded; callers on an async runtime must run this on a
    /// blocking worker.
    pub fn mine(&mut self, difficulty: usize) {
        self.mine_until(difficulty, &AtomicBool::new(false));
    }

    /// Like [`Block::mine`], but gives up once `abort` is set.
    ///
    /// Returns false if the search was abandoned; the block is then unsealed.
    pub fn mine_until(&mut self, difficulty: usize, abort: &AtomicBool) -> bool {
        self.hash = self.calculate_hash();
        while !meets_difficulty(&self.hash, difficulty) {
            if self.nonce % ABORT_CHECK_INTERVAL == 0 && abort.load(Ordering::Relaxed) {
                debug!("Mining abandoned at nonce {}", self.nonce);
                return false;
            }
            self.nonce += 1;
            self.hash = self.calculate_hash();
        }
        info!("Block mined: {} (nonce {})", self.hash, self.nonce);
        true
    }

    /// Returns false on the first transaction that is invalid or unsigned
    pub fn has_valid_transactions(&self) -> bool {
        self.transactions
            .iter()
            .all(|tx| matches!(tx.is_valid(), Ok(true)))
    }
}

/// Checks that a hex hash starts with `difficulty` zero digits
pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{Address, Wallet};

    fn signed_tx(wallet: &Wallet) -> Transaction {
        let mut tx = Transaction::new(
            wallet.address().clone(),
            Address("address2".to_string()),
            10.0,
        );
        tx.timestamp = 1;
        tx.sign(wallet).unwrap();
        tx
    }

    #[test]
    fn test_new_block() {
        let transactions = vec![
            Transaction::new_reward(Address("recipient1".to_string()), 10.0),
            Transaction::new_reward(Address("recipient2".to_string()), 20.0),
        ];

        let block = Block::new(1000, transactions, "a1".to_string());

        assert_eq!(block.timestamp, 1000);
        assert_eq!(block.nonce, 0);
        assert_eq!(block.previous_hash, "a1");
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(block.hash, block.calculate_hash());
        assert_eq!(block.hash.len(), 64);
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let first = Block::genesis();
        let second = Block::genesis();

        assert_eq!(first, second);
        assert!(first.previous_hash.is_empty());
        assert!(first.transactions.is_empty());
    }

    #[test]
    fn test_mine_meets_difficulty() {
        for difficulty in 0..=3 {
            let mut block = Block::new(1, Vec::new(), "prev".to_string());
            block.mine(difficulty);

            assert!(meets_difficulty(&block.hash, difficulty));
            assert_eq!(block.hash, block.calculate_hash());
        }
    }

    #[test]
    fn test_hash_changes_with_every_field() {
        let wallet = Wallet::new();
        let mut block = Block::new(1000, vec![signed_tx(&wallet)], "a1".to_string());
        block.mine(1);
        let original = block.calculate_hash();

        let mut changed = block.clone();
        changed.timestamp = 100;
        assert_ne!(changed.calculate_hash(), original);

        let mut changed = block.clone();
        changed.nonce += 1;
        assert_ne!(changed.calculate_hash(), original);

        let mut changed = block.clone();
        changed.previous_hash = "a2".to_string();
        assert_ne!(changed.calculate_hash(), original);

        let mut changed = block.clone();
        changed.transactions[0].amount = 999.0;
        assert_ne!(changed.calculate_hash(), original);
    }

    #[test]
    fn test_transaction_order_is_hashed() {
        let a = Transaction::new_reward(Address("a".to_string()), 1.0);
        let b = Transaction::new_reward(Address("b".to_string()), 1.0);

        let first = Block::new(1, vec![a.clone(), b.clone()], String::new());
        let second = Block::new(1, vec![b, a], String::new());

        assert_ne!(first.hash, second.hash);
    }

    #[test]
    fn test_has_valid_transactions() {
        let wallet = Wallet::new();
        let block = Block::new(
            1000,
            vec![signed_tx(&wallet), signed_tx(&wallet), signed_tx(&wallet)],
            "a1".to_string(),
        );
        assert!(block.has_valid_transactions());

        let mut bad_tx = signed_tx(&wallet);
        bad_tx.amount = 999.0;
        let block = Block::new(
            1000,
            vec![signed_tx(&wallet), bad_tx, signed_tx(&wallet)],
            "a1".to_string(),
        );
        assert!(!block.has_valid_transactions());
    }

    #[test]
    fn test_unsigned_transaction_makes_block_invalid() {
        let wallet = Wallet::new();
        let unsigned = Transaction::new(wallet.address().clone(), Address("x".to_string()), 1.0);
        let block = Block::new(1, vec![unsigned], String::new());

        assert!(!block.has_valid_transactions());
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(meets_difficulty("00ab", 2));
        assert!(meets_difficulty("00ab", 0));
        assert!(!meets_difficulty("0a0b", 2));
        assert!(!meets_difficulty("0", 2));
    }

    #[test]
    fn test_mine_until_gives_up_when_aborted() {
        let abort = AtomicBool::new(true);
        let mut block = Block::new(1000, Vec::new(), "a1".to_string());

        // 64 zero digits is never reached, so only the flag ends the search.
        assert!(!block.mine_until(64, &abort));
        assert!(!meets_difficulty(&block.hash, 64));

        let running = AtomicBool::new(false);
        assert!(block.mine_until(1, &running));
        assert!(block.hash.starts_with('0'));
    }
}
