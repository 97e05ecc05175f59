//! Core ledger functionality
//!
//! Blocks, transactions, the Merkle commitment, proof-of-work and the
//! persistent chain store.

pub mod block;
pub mod blockchain;
pub mod merkle;
pub mod proof_of_work;
pub mod transaction;

pub use block::Block;
pub use blockchain::{Blockchain, BlockchainIterator};
pub use merkle::MerkleTree;
pub use proof_of_work::{ProofOfWork, DEFAULT_DIFFICULTY};
pub use transaction::{
    OutputLookup, Signer, TXInput, TXOutput, Transaction, COINBASE_VOUT, SUBSIDY,
};
