//! Header tree, its storage and the per-connection header sync driver

pub mod store;
pub mod subchain;
pub mod sync;
pub mod tree;

pub use store::{HeaderRecord, HeaderStore, InMemoryHeaderStore, SqliteHeaderStore};
pub use subchain::{ChainLink, SubChain};
pub use sync::{HeaderSyncDriver, SyncState};
pub use tree::{AddOutcome, HeaderTree, InvalidateOutcome};
