//! Headers, blocks and proof-of-work arithmetic

pub mod block;
pub mod pow;

pub use block::*;
