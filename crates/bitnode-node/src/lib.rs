//! # Bitnode
//!
//! Lightweight Bitcoin node: it follows the best chain of its peers, keeps the chain state in
//! RocksDB, tracks the unconfirmed transactions and exposes them through [`api::NodeApi`].

pub mod api;
pub mod cli;
mod error;
mod informant;
pub mod service;

pub use self::error::Error;
