//! chainsync - header tree, block download and UTXO consistency for a
//! Bitcoin-like full node
//!
//! # Architecture
//!
//! ## Chain data
//! - [`blockchain`] - Headers, blocks, hashing and proof of work
//! - [`transaction`] - Transactions and outpoints
//!
//! ## Headers
//! - [`headers`] - Header tree, its storage and the per-connection header sync
//!
//! ## Block download
//! - [`fetch`] - Shared wanted-block table and per-connection fetch driver
//! - [`cache`] - Bounded cache of downloaded blocks
//! - [`network`] - Peer messages and the connection task
//!
//! ## UTXO set
//! - [`utxo`] - Update pipeline, signature validation and storage
//! - [`crypto`] - secp256k1 pay-to-pubkey verification
//!
//! ## Wiring & Utilities
//! - [`node`] - Assembly of all components
//! - [`events`] - Notifications between components
//! - [`config`] - Configuration management
//! - [`error`] - Error types
//! - [`logging`] - Tracing subscriber setup
//! - `testing` - Regtest chain builders for tests (feature `testing`)

#![forbid(unsafe_code)]

// ============================================================================
// Chain data
// ============================================================================
pub mod blockchain;
pub mod transaction;

// ============================================================================
// Sync
// ============================================================================
pub mod cache;
pub mod fetch;
pub mod headers;
pub mod network;

// ============================================================================
// UTXO set
// ============================================================================
pub mod crypto;
pub mod utxo;

// ============================================================================
// Wiring & Utilities
// ============================================================================
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod node;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{ChainError, Result};
pub use node::{PeerChannels, SyncContext, SyncNode};
