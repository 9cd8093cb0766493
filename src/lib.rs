//! A proof-of-work ledger replicated between peers.
//!
//! Each node keeps its own chain, accepts signed transfers, mines blocks and
//! gossips its chain over TCP. Nodes converge on the longest valid chain.

pub mod api;
pub mod blockchain;
pub mod config;
pub mod network;
