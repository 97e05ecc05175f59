//! # Proof Ledger
//!
//! A small proof-of-work ledger: blocks chained by hash and mined against a
//! leading-zero target, transactions in the unspent-output model with ECDSA
//! signatures, a Merkle root per block, and TCP peers that sync the longest
//! chain and relay pooled transactions.
//!
//! ## Layout
//! - `core/`: transactions, Merkle tree, proof-of-work, blocks and the chain store
//! - `storage/`: the UTXO index, memory pool and blocks-in-transit queue
//! - `network/`: wire framing, peer registry and the node server
//! - `wallet/`: key pairs, addresses and the per-node wallet file
//! - `config/`: settings resolved from the environment
//! - `utils/`: hashing, signing, base58, timestamps, bincode helpers
//! - `cli/`: command definitions dispatched by `main.rs`
//!
//! Each node keeps its own sled database under `data/node_<NODE_ID>/`, so
//! several nodes can run on one machine.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub mod testnet;

pub use cli::{Command, Opt};
pub use config::{Config, SEED_NODE};
pub use core::{
    Block, Blockchain, BlockchainIterator, MerkleTree, OutputLookup, ProofOfWork, Signer,
    TXInput, TXOutput, Transaction, DEFAULT_DIFFICULTY, SUBSIDY,
};
pub use error::{BlockchainError, Result};
pub use network::{send_tx, InvKind, NodeState, Nodes, Outbound, Package, Server};
pub use storage::{BlockInTransit, MemoryPool, UTXOSet, UnspentOutput};
pub use utils::{
    base58_decode, base58_encode, current_timestamp, ecdsa_p256_sha256_sign_digest,
    ecdsa_p256_sha256_sign_verify, new_key_pair, ripemd160_digest, sha256_digest,
};
pub use wallet::{
    address_to_pub_key_hash, convert_address, hash_pub_key, validate_address, Wallet, Wallets,
    ADDRESS_CHECK_SUM_LEN,
};
