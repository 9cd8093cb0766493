// Blockchain module
//
// This module contains the ledger implementation including:
// - Block structure and proof of work
// - Blockchain structure (validation, balances, mining, fork choice)
// - Transaction structure
// - Cryptography utilities
// - Chain storage
// - Shared access for concurrent tasks

pub mod block;
pub mod chain;
pub mod crypto;
pub mod shared;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Blockchain, BlockchainError};
pub use crypto::{Address, DigitalSignature, Wallet};
pub use shared::SharedBlockchain;
pub use storage::{ChainStore, JsonFileStorage, SledStorage, StorageError};
pub use transaction::{Transaction, TransactionError};
