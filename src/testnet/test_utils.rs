//! Test utilities for ledger testing

use crate::core::{Block, Blockchain, TXOutput, Transaction};
use crate::error::{BlockchainError, Result};
use crate::storage::UTXOSet;
use crate::wallet::Wallet;
use tempfile::TempDir;

/// Low enough that a block is found in a handful of hashes.
pub const TEST_DIFFICULTY: u32 = 4;

/// A chain whose genesis coinbase pays `wallet`, with its UTXO index built.
pub struct FundedChain {
    pub wallet: Wallet,
    pub blockchain: Blockchain,
    pub utxo_set: UTXOSet,
}

pub fn create_temp_dir() -> Result<TempDir> {
    tempfile::tempdir().map_err(|e| BlockchainError::Io(e.to_string()))
}

/// Create a test blockchain with temporary storage
pub fn create_test_blockchain() -> Result<(Blockchain, Wallet, TempDir)> {
    let temp_dir = create_temp_dir()?;
    let wallet = Wallet::new()?;
    let blockchain = Blockchain::create_blockchain_with_path(
        &wallet.get_address(),
        temp_dir.path().join("test_blockchain"),
        TEST_DIFFICULTY,
    )?;
    Ok((blockchain, wallet, temp_dir))
}

pub fn create_funded_chain() -> Result<(FundedChain, TempDir)> {
    let (blockchain, wallet, temp_dir) = create_test_blockchain()?;
    let utxo_set = UTXOSet::new(blockchain.clone());
    utxo_set.reindex()?;
    Ok((
        FundedChain {
            wallet,
            blockchain,
            utxo_set,
        },
        temp_dir,
    ))
}

/// Opens `count` stores under one directory that all start from the same
/// genesis block, each with a built UTXO index.
pub fn create_shared_chains(count: usize) -> Result<(Vec<Blockchain>, Wallet, TempDir)> {
    let temp_dir = create_temp_dir()?;
    let wallet = Wallet::new()?;
    let coinbase = Transaction::new_coinbase_tx(&wallet.get_address(), b"shared genesis")?;
    let genesis = Block::generate_genesis_block(&coinbase, TEST_DIFFICULTY)?;

    let mut chains = Vec::with_capacity(count);
    for i in 0..count {
        let blockchain = Blockchain::create_with_genesis_block(
            &genesis,
            temp_dir.path().join(format!("test_node_{i}")),
            TEST_DIFFICULTY,
        )?;
        UTXOSet::new(blockchain.clone()).reindex()?;
        chains.push(blockchain);
    }
    Ok((chains, wallet, temp_dir))
}

/// An output lookup that knows the outputs of a single funding transaction.
pub fn fund_lookup(
    txid: Vec<u8>,
    outputs: Vec<TXOutput>,
) -> impl Fn(&[u8], usize) -> Result<Option<TXOutput>> {
    move |id: &[u8], vout: usize| {
        if id == txid.as_slice() {
            Ok(outputs.get(vout).cloned())
        } else {
            Ok(None)
        }
    }
}

/// Mines a block holding only a coinbase to `address` and applies it to the index.
pub fn mine_coinbase_block(blockchain: &Blockchain, address: &str) -> Result<Block> {
    let coinbase = Transaction::new_coinbase_tx(address, b"")?;
    let block = blockchain.mine_block(&[coinbase])?;
    UTXOSet::new(blockchain.clone()).update(&block)?;
    Ok(block)
}

/// Pays `amount` from the fixture wallet to `to` and mines it right away,
/// with the block reward going back to the fixture wallet.
pub fn send_and_mine(fixture: &FundedChain, to: &str, amount: u64) -> Result<Block> {
    let tx = Transaction::new_utxo_transaction(&fixture.wallet, to, amount, &fixture.utxo_set)?;
    let coinbase = Transaction::new_coinbase_tx(&fixture.wallet.get_address(), b"")?;
    let block = fixture.blockchain.mine_block(&[coinbase, tx])?;
    fixture.utxo_set.update(&block)?;
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SUBSIDY;
    use crate::wallet::hash_pub_key;

    #[test]
    fn test_funded_chain_pays_wallet() {
        let (fixture, _dir) = create_funded_chain().unwrap();
        let pub_key_hash = hash_pub_key(fixture.wallet.get_public_key());
        assert_eq!(fixture.utxo_set.get_balance(&pub_key_hash).unwrap(), SUBSIDY);
    }

    #[test]
    fn test_shared_chains_start_identical() {
        let (chains, _wallet, _dir) = create_shared_chains(3).unwrap();
        assert_eq!(chains.len(), 3);
        for chain in &chains[1..] {
            assert_eq!(chain.get_tip_hash(), chains[0].get_tip_hash());
            assert_eq!(chain.get_best_height().unwrap(), 0);
        }
    }

    #[test]
    fn test_send_and_mine_extends_chain() {
        let (fixture, _dir) = create_funded_chain().unwrap();
        let to = Wallet::new().unwrap();
        let block = send_and_mine(&fixture, &to.get_address(), 3).unwrap();

        assert_eq!(block.get_height(), 1);
        assert_eq!(block.get_transactions().len(), 2);
        assert_eq!(
            fixture
                .utxo_set
                .get_balance(&hash_pub_key(to.get_public_key()))
                .unwrap(),
            3
        );
    }

    #[test]
    fn test_fund_lookup() {
        let lookup = fund_lookup(vec![1; 32], vec![TXOutput::new_locked(5, &[0; 20])]);
        assert_eq!(lookup(&[1; 32], 0).unwrap().unwrap().get_value(), 5);
        assert!(lookup(&[1; 32], 1).unwrap().is_none());
        assert!(lookup(&[2; 32], 0).unwrap().is_none());
    }
}
