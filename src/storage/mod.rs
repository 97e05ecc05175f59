//! Data derived from or waiting for the chain
//!
//! The UTXO index lives in the same sled database as the blocks. The memory
//! pool and the blocks-in-transit queue are in-memory state owned by a node.

pub mod memory_pool;
pub mod utxo_set;

pub use memory_pool::{BlockInTransit, MemoryPool};
pub use utxo_set::{UTXOSet, UnspentOutput};
