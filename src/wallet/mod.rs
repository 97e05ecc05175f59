//! Key management and address encoding
//!
//! Wallets sit outside the ledger core: the core only needs something that
//! implements [`crate::core::Signer`], which [`Wallet`] does.

#[allow(clippy::module_inception)]
pub mod wallet;
pub mod wallets;

pub use wallet::{
    address_to_pub_key_hash, convert_address, hash_pub_key, validate_address, Wallet,
    ADDRESS_CHECK_SUM_LEN,
};
pub use wallets::Wallets;
