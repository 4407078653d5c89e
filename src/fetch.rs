//! Block download: the shared wanted-block table and the per-connection driver

pub mod coordinator;
pub mod driver;

pub use coordinator::{BlockFetchCoordinator, ConnectionId, ConsumerId, FetchStats, WantedHeader};
pub use driver::BlockFetchDriver;
