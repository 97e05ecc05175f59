// The chain store: blocks keyed by hash in a sled tree plus one tip record.
// Blocks are only ever appended; the tip moves in the same sled transaction
// that writes the block it points at.

use crate::config::Config;
use crate::core::{Block, ProofOfWork, Transaction, SUBSIDY};
use crate::error::{BlockchainError, Result};
use crate::storage::{UTXOSet, UnspentOutput};
use data_encoding::HEXLOWER;
use log::{debug, info};
use sled::transaction::TransactionError;
use sled::{Db, Tree};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

const TIP_BLOCK_HASH_KEY: &str = "tip_block_hash"; // key holding the hash of the latest block
const BLOCKS_TREE: &str = "blocks";

#[derive(Clone)]
pub struct Blockchain {
    tip_hash: Arc<RwLock<Vec<u8>>>,
    db: Db,
    difficulty: u32,
    // held while a block is validated and written so the tip cannot move underneath
    commit_lock: Arc<Mutex<()>>,
}

impl Blockchain {
    /// Creates the chain for this node with a genesis block paying `genesis_address`.
    pub fn create_blockchain(genesis_address: &str, config: &Config) -> Result<Blockchain> {
        Self::create_blockchain_with_path(genesis_address, config.data_dir(), config.difficulty)
    }

    /// Opens the chain for this node, failing if none was created yet.
    pub fn new_blockchain(config: &Config) -> Result<Blockchain> {
        Self::new_blockchain_with_path(config.data_dir(), config.difficulty)
    }

    pub fn create_blockchain_with_path(
        genesis_address: &str,
        db_path: impl AsRef<Path>,
        difficulty: u32,
    ) -> Result<Blockchain> {
        let coinbase_tx = Transaction::new_coinbase_tx(genesis_address, b"")?;
        let genesis = Block::generate_genesis_block(&coinbase_tx, difficulty)?;
        Self::create_with_genesis_block(&genesis, db_path, difficulty)
    }

    /// Initializes a store from an already mined genesis block, so several
    /// nodes can share the same chain origin.
    pub fn create_with_genesis_block(
        genesis: &Block,
        db_path: impl AsRef<Path>,
        difficulty: u32,
    ) -> Result<Blockchain> {
        if !genesis.is_genesis() || genesis.get_height() != 0 {
            return Err(BlockchainError::InvalidBlock(
                "Genesis block must have height 0 and no previous hash".to_string(),
            ));
        }
        if genesis.get_transactions().len() != 1 || !genesis.get_transactions()[0].is_coinbase() {
            return Err(BlockchainError::InvalidBlock(
                "Genesis block must hold exactly one coinbase transaction".to_string(),
            ));
        }
        if !ProofOfWork::validate(genesis, difficulty)? {
            return Err(BlockchainError::InvalidBlock(
                "Genesis block fails proof-of-work".to_string(),
            ));
        }

        let path = db_path.as_ref();
        let (db, blocks_tree) = Self::open_store(path)?;
        if blocks_tree.contains_key(TIP_BLOCK_HASH_KEY)? {
            return Err(BlockchainError::Database(format!(
                "Blockchain already exists at {}",
                path.display()
            )));
        }

        Self::update_blocks_tree(&blocks_tree, genesis)?;
        info!("Created genesis block {}", HEXLOWER.encode(genesis.get_hash()));

        Ok(Blockchain {
            tip_hash: Arc::new(RwLock::new(genesis.get_hash().to_vec())),
            db,
            difficulty,
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn new_blockchain_with_path(db_path: impl AsRef<Path>, difficulty: u32) -> Result<Blockchain> {
        let path = db_path.as_ref();
        let (db, blocks_tree) = Self::open_store(path)?;

        let tip_hash = blocks_tree.get(TIP_BLOCK_HASH_KEY)?.ok_or_else(|| {
            BlockchainError::Database(format!(
                "No existing blockchain found at {}. Create one first.",
                path.display()
            ))
        })?;

        Ok(Blockchain {
            tip_hash: Arc::new(RwLock::new(tip_hash.to_vec())),
            db,
            difficulty,
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    fn open_store(path: &Path) -> Result<(Db, Tree)> {
        let db = sled::open(path).map_err(|e| {
            BlockchainError::Database(format!("Failed to open database {}: {e}", path.display()))
        })?;
        let blocks_tree = db
            .open_tree(BLOCKS_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open blocks tree: {e}")))?;
        Ok((db, blocks_tree))
    }

    // block and tip pointer land together or not at all
    fn update_blocks_tree(blocks_tree: &Tree, block: &Block) -> Result<()> {
        let block_hash = block.get_hash();
        let block_data = block.serialize()?;

        blocks_tree
            .transaction(|tx_db| {
                tx_db.insert(block_hash, block_data.as_slice())?;
                tx_db.insert(TIP_BLOCK_HASH_KEY, block_hash)?;
                Ok(())
            })
            .map_err(|e: TransactionError| {
                BlockchainError::Database(format!("Failed to update blocks tree: {e}"))
            })?;
        blocks_tree.flush()?;
        Ok(())
    }

    fn blocks_tree(&self) -> Result<Tree> {
        self.db
            .open_tree(BLOCKS_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open blocks tree: {e}")))
    }

    pub fn get_db(&self) -> &Db {
        &self.db
    }

    pub fn get_difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn get_tip_hash(&self) -> Vec<u8> {
        self.tip_hash
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_tip_hash(&self, new_tip_hash: &[u8]) {
        let mut tip_hash = self.tip_hash.write().unwrap_or_else(PoisonError::into_inner);
        *tip_hash = new_tip_hash.to_vec();
    }

    pub fn get_best_height(&self) -> Result<usize> {
        let tip_hash = self.get_tip_hash();
        let tip_block = self.get_block(&tip_hash)?.ok_or_else(|| {
            BlockchainError::Database(format!("Tip block {} not found", HEXLOWER.encode(&tip_hash)))
        })?;
        Ok(tip_block.get_height())
    }

    /// Validates `transactions` against the live UTXO set, mines them on top
    /// of the current tip and makes the new block the tip.
    ///
    /// The UTXO set is not touched; callers apply [`UTXOSet::update`] with the
    /// returned block.
    pub fn mine_block(&self, transactions: &[Transaction]) -> Result<Block> {
        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.check_transactions(transactions)?;

        let tip_hash = self.get_tip_hash();
        let next_height = self.get_best_height()? + 1;
        debug!(
            "Mining {} transactions at height {next_height}",
            transactions.len()
        );

        let block = Block::new_block(&tip_hash, transactions, next_height, self.difficulty)?;
        Self::update_blocks_tree(&self.blocks_tree()?, &block)?;
        self.set_tip_hash(block.get_hash());

        info!(
            "Mined block {} at height {next_height}",
            HEXLOWER.encode(block.get_hash())
        );
        Ok(block)
    }

    /// Accepts a block received from a peer.
    ///
    /// Returns `Ok(false)` for a block that is already stored. Only a block
    /// extending the current tip by exactly one height is accepted, so the
    /// first valid block seen at a height wins.
    pub fn add_block(&self, block: &Block) -> Result<bool> {
        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let block_hex = HEXLOWER.encode(block.get_hash());

        if self.block_exists(block.get_hash())? {
            debug!("Block {block_hex} already stored");
            return Ok(false);
        }

        let tip_hash = self.get_tip_hash();
        if block.get_pre_block_hash() != tip_hash.as_slice() {
            return Err(BlockchainError::InvalidBlock(format!(
                "Block {block_hex} does not extend tip {}",
                HEXLOWER.encode(&tip_hash)
            )));
        }

        let expected_height = self.get_best_height()? + 1;
        if block.get_height() != expected_height {
            return Err(BlockchainError::InvalidBlock(format!(
                "Block {block_hex} has height {}, expected {expected_height}",
                block.get_height()
            )));
        }

        if block.get_transactions().is_empty() {
            return Err(BlockchainError::InvalidBlock(format!(
                "Block {block_hex} has no transactions"
            )));
        }

        if !ProofOfWork::validate(block, self.difficulty)? {
            return Err(BlockchainError::InvalidBlock(format!(
                "Block {block_hex} fails proof-of-work"
            )));
        }

        self.check_transactions(block.get_transactions())
            .map_err(|e| BlockchainError::InvalidBlock(format!("Block {block_hex}: {e}")))?;

        Self::update_blocks_tree(&self.blocks_tree()?, block)?;
        self.set_tip_hash(block.get_hash());
        info!("Added block {block_hex} at height {}", block.get_height());
        Ok(true)
    }

    // Unique ids, coinbase placement, in-batch double spends and
    // per-transaction Verify against the live UTXO set.
    fn check_transactions(&self, transactions: &[Transaction]) -> Result<()> {
        let utxo_set = UTXOSet::new(self.clone());
        let mut spent_outputs: HashSet<(Vec<u8>, i64)> = HashSet::new();
        let mut seen_ids: HashSet<&[u8]> = HashSet::new();

        for (i, transaction) in transactions.iter().enumerate() {
            let txid_hex = HEXLOWER.encode(transaction.get_id());

            // an id may appear once on the whole chain
            if !seen_ids.insert(transaction.get_id()) {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "Transaction {txid_hex} appears twice in the block"
                )));
            }
            if self.find_transaction(transaction.get_id())?.is_some() {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "Transaction {txid_hex} is already on the chain"
                )));
            }

            if transaction.is_coinbase() {
                if i != 0 {
                    return Err(BlockchainError::InvalidTransaction(format!(
                        "Coinbase {txid_hex} must be the first transaction"
                    )));
                }
                if transaction.get_vout().is_empty() {
                    return Err(BlockchainError::InvalidTransaction(format!(
                        "Coinbase {txid_hex} has no outputs"
                    )));
                }
                if transaction.get_output_value()? > SUBSIDY {
                    return Err(BlockchainError::InvalidTransaction(format!(
                        "Coinbase {txid_hex} mints more than {SUBSIDY}"
                    )));
                }
                continue;
            }

            for input in transaction.get_vin() {
                let output_reference = (input.get_txid().to_vec(), input.get_vout());
                if !spent_outputs.insert(output_reference) {
                    return Err(BlockchainError::InvalidTransaction(format!(
                        "Transaction {txid_hex} double-spends {}:{}",
                        HEXLOWER.encode(input.get_txid()),
                        input.get_vout()
                    )));
                }
            }

            transaction.verify(&utxo_set).map_err(|e| {
                BlockchainError::InvalidTransaction(format!("Transaction {txid_hex}: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn iterator(&self) -> Result<BlockchainIterator> {
        Ok(BlockchainIterator::new(self.get_tip_hash(), self.blocks_tree()?))
    }

    /// Scans the whole chain for outputs no later input references.
    // ( K -> txid, V -> unspent outputs with their original index )
    pub fn find_utxo(&self) -> Result<HashMap<Vec<u8>, Vec<UnspentOutput>>> {
        let mut utxo: HashMap<Vec<u8>, Vec<UnspentOutput>> = HashMap::new();
        let mut spent_txos: HashMap<Vec<u8>, HashSet<usize>> = HashMap::new();

        // Walking tip to genesis (and each block back to front) means every
        // spending input is seen before the output it spends.
        for block in self.iterator()? {
            let block = block?;
            for tx in block.get_transactions().iter().rev() {
                let spent = spent_txos.get(tx.get_id());
                for (idx, out) in tx.get_vout().iter().enumerate() {
                    if spent.is_some_and(|outs| outs.contains(&idx)) {
                        continue;
                    }
                    utxo.entry(tx.get_id().to_vec())
                        .or_default()
                        .push(UnspentOutput::new(idx, out.clone()));
                }

                if tx.is_coinbase() {
                    continue;
                }
                for txin in tx.get_vin() {
                    if let Some(idx) = txin.output_index() {
                        spent_txos
                            .entry(txin.get_txid().to_vec())
                            .or_default()
                            .insert(idx);
                    }
                }
            }
        }
        Ok(utxo)
    }

    pub fn find_transaction(&self, txid: &[u8]) -> Result<Option<Transaction>> {
        for block in self.iterator()? {
            if let Some(tx) = block?
                .get_transactions()
                .iter()
                .find(|tx| tx.get_id() == txid)
            {
                return Ok(Some(tx.clone()));
            }
        }
        Ok(None)
    }

    pub fn get_block(&self, block_hash: &[u8]) -> Result<Option<Block>> {
        match self.blocks_tree()?.get(block_hash)? {
            Some(block_bytes) => Ok(Some(Block::deserialize(block_bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    pub fn block_exists(&self, block_hash: &[u8]) -> Result<bool> {
        Ok(self.blocks_tree()?.contains_key(block_hash)?)
    }

    /// Hashes of every block on the chain, tip first.
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>> {
        self.iterator()?
            .map(|block| block.map(|b| b.get_hash().to_vec()))
            .collect()
    }
}

/// Walks the chain from a starting hash back to genesis.
///
/// The walk ends after the block with an empty previous hash. A missing or
/// undecodable block yields one error and ends the walk.
pub struct BlockchainIterator {
    blocks_tree: Tree,
    current_hash: Option<Vec<u8>>,
}

impl BlockchainIterator {
    fn new(tip_hash: Vec<u8>, blocks_tree: Tree) -> BlockchainIterator {
        BlockchainIterator {
            blocks_tree,
            current_hash: Some(tip_hash),
        }
    }

    fn load(&self, hash: &[u8]) -> Result<Block> {
        let data = self.blocks_tree.get(hash)?.ok_or_else(|| {
            BlockchainError::Database(format!("Block {} not found", HEXLOWER.encode(hash)))
        })?;
        Block::deserialize(data.as_ref())
    }
}

impl Iterator for BlockchainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current_hash.take()?;
        match self.load(&hash) {
            Ok(block) => {
                if !block.is_genesis() {
                    self.current_hash = Some(block.get_pre_block_hash().to_vec());
                }
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testnet::{create_funded_chain, create_test_blockchain, TEST_DIFFICULTY};
    use crate::wallet::Wallet;
    use tempfile::tempdir;

    #[test]
    fn test_new_chain_has_genesis_tip() {
        let (blockchain, _wallet, _dir) = create_test_blockchain().unwrap();
        assert_eq!(blockchain.get_best_height().unwrap(), 0);

        let blocks: Vec<Block> = blockchain
            .iterator()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_genesis());
        assert_eq!(blocks[0].get_hash(), blockchain.get_tip_hash().as_slice());
    }

    #[test]
    fn test_create_refuses_existing_chain() {
        let dir = tempdir().unwrap();
        let address = Wallet::new().unwrap().get_address();
        let path = dir.path().join("chain");

        let blockchain =
            Blockchain::create_blockchain_with_path(&address, &path, TEST_DIFFICULTY).unwrap();
        drop(blockchain);

        assert!(matches!(
            Blockchain::create_blockchain_with_path(&address, &path, TEST_DIFFICULTY),
            Err(BlockchainError::Database(_))
        ));
    }

    #[test]
    fn test_open_missing_chain_fails() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Blockchain::new_blockchain_with_path(dir.path().join("none"), TEST_DIFFICULTY),
            Err(BlockchainError::Database(_))
        ));
    }

    #[test]
    fn test_mine_block_advances_tip() {
        let (fixture, _dir) = create_funded_chain().unwrap();
        let blockchain = &fixture.blockchain;
        let genesis_hash = blockchain.get_tip_hash();

        let coinbase = Transaction::new_coinbase_tx(&fixture.wallet.get_address(), b"").unwrap();
        let block = blockchain.mine_block(&[coinbase]).unwrap();

        assert_eq!(block.get_height(), 1);
        assert_eq!(block.get_pre_block_hash(), genesis_hash.as_slice());
        assert_eq!(blockchain.get_tip_hash(), block.get_hash());
        assert_eq!(blockchain.get_best_height().unwrap(), 1);
        assert!(ProofOfWork::validate(&block, TEST_DIFFICULTY).unwrap());
    }

    #[test]
    fn test_mine_block_rejects_misplaced_coinbase() {
        let (fixture, _dir) = create_funded_chain().unwrap();
        let address = fixture.wallet.get_address();
        let first = Transaction::new_coinbase_tx(&address, b"").unwrap();
        let second = Transaction::new_coinbase_tx(&address, b"").unwrap();

        assert!(matches!(
            fixture.blockchain.mine_block(&[first, second]),
            Err(BlockchainError::InvalidTransaction(_))
        ));
        assert_eq!(fixture.blockchain.get_best_height().unwrap(), 0);
    }

    #[test]
    fn test_mine_block_rejects_double_spend() {
        let (fixture, _dir) = create_funded_chain().unwrap();
        let recipient = Wallet::new().unwrap().get_address();

        let a = Transaction::new_utxo_transaction(&fixture.wallet, &recipient, 3, &fixture.utxo_set)
            .unwrap();
        let b = Transaction::new_utxo_transaction(&fixture.wallet, &recipient, 4, &fixture.utxo_set)
            .unwrap();

        assert!(matches!(
            fixture.blockchain.mine_block(&[a, b]),
            Err(BlockchainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_add_block_accepts_only_tip_extensions() {
        let (fixture, _dir) = create_funded_chain().unwrap();
        let blockchain = &fixture.blockchain;
        let address = fixture.wallet.get_address();

        let genesis = blockchain.get_block(&blockchain.get_tip_hash()).unwrap().unwrap();
        assert!(!blockchain.add_block(&genesis).unwrap());

        let coinbase = Transaction::new_coinbase_tx(&address, b"").unwrap();
        let next = Block::new_block(genesis.get_hash(), &[coinbase], 1, TEST_DIFFICULTY).unwrap();
        assert!(blockchain.add_block(&next).unwrap());
        assert_eq!(blockchain.get_tip_hash(), next.get_hash());

        // a competing block at the same height arrives second and loses
        let rival_coinbase = Transaction::new_coinbase_tx(&address, b"").unwrap();
        let rival =
            Block::new_block(genesis.get_hash(), &[rival_coinbase], 1, TEST_DIFFICULTY).unwrap();
        assert!(matches!(
            blockchain.add_block(&rival),
            Err(BlockchainError::InvalidBlock(_))
        ));

        let skipping_coinbase = Transaction::new_coinbase_tx(&address, b"").unwrap();
        let skipping =
            Block::new_block(next.get_hash(), &[skipping_coinbase], 3, TEST_DIFFICULTY).unwrap();
        assert!(matches!(
            blockchain.add_block(&skipping),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert_eq!(blockchain.get_best_height().unwrap(), 1);
    }

    #[test]
    fn test_add_block_rejects_bad_proof_of_work() {
        let (fixture, _dir) = create_funded_chain().unwrap();
        let blockchain = &fixture.blockchain;
        let coinbase = Transaction::new_coinbase_tx(&fixture.wallet.get_address(), b"").unwrap();
        let block =
            Block::new_block(&blockchain.get_tip_hash(), &[coinbase], 1, TEST_DIFFICULTY).unwrap();
        let tampered = block.with_nonce(block.get_nonce().wrapping_add(1));

        assert!(matches!(
            blockchain.add_block(&tampered),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert!(!blockchain.block_exists(tampered.get_hash()).unwrap());
    }

    #[test]
    fn test_find_utxo_skips_only_spent_outputs() {
        let (fixture, _dir) = create_funded_chain().unwrap();
        let recipient = Wallet::new().unwrap();
        let tx = Transaction::new_utxo_transaction(
            &fixture.wallet,
            &recipient.get_address(),
            5,
            &fixture.utxo_set,
        )
        .unwrap();
        let coinbase = Transaction::new_coinbase_tx(&fixture.wallet.get_address(), b"").unwrap();
        fixture.blockchain.mine_block(&[coinbase, tx.clone()]).unwrap();

        let utxo = fixture.blockchain.find_utxo().unwrap();
        // genesis coinbase fully spent, new coinbase plus payment and change unspent
        assert_eq!(utxo.len(), 2);
        let outs = &utxo[tx.get_id()];
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[0].get_index(), 0);
        assert_eq!(outs[1].get_index(), 1);
    }

    #[test]
    fn test_find_transaction_and_hashes() {
        let (fixture, _dir) = create_funded_chain().unwrap();
        let coinbase = Transaction::new_coinbase_tx(&fixture.wallet.get_address(), b"").unwrap();
        let block = fixture.blockchain.mine_block(&[coinbase.clone()]).unwrap();

        let found = fixture.blockchain.find_transaction(coinbase.get_id()).unwrap();
        assert_eq!(found, Some(coinbase));
        assert_eq!(fixture.blockchain.find_transaction(&[0; 32]).unwrap(), None);

        let hashes = fixture.blockchain.get_block_hashes().unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], block.get_hash());
    }

    #[test]
    fn test_transaction_ids_are_unique_on_chain() {
        let (fixture, _dir) = create_funded_chain().unwrap();
        let blockchain = &fixture.blockchain;
        let address = fixture.wallet.get_address();

        let coinbase = Transaction::new_coinbase_tx(&address, b"same").unwrap();
        blockchain.mine_block(&[coinbase.clone()]).unwrap();

        let repeat = Transaction::new_coinbase_tx(&address, b"same").unwrap();
        assert_eq!(repeat.get_id(), coinbase.get_id());
        assert!(matches!(
            blockchain.mine_block(&[repeat.clone()]),
            Err(BlockchainError::InvalidTransaction(_))
        ));

        // the same id sent by a peer
        let block =
            Block::new_block(&blockchain.get_tip_hash(), &[repeat], 2, TEST_DIFFICULTY).unwrap();
        assert!(matches!(
            blockchain.add_block(&block),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert_eq!(blockchain.get_best_height().unwrap(), 1);
    }

    #[test]
    fn test_repeated_id_within_block_is_rejected() {
        let (fixture, _dir) = create_funded_chain().unwrap();
        let tx = Transaction::new_utxo_transaction(
            &fixture.wallet,
            &Wallet::new().unwrap().get_address(),
            2,
            &fixture.utxo_set,
        )
        .unwrap();

        assert!(matches!(
            fixture.blockchain.mine_block(&[tx.clone(), tx]),
            Err(BlockchainError::InvalidTransaction(_))
        ));
        assert_eq!(fixture.blockchain.get_best_height().unwrap(), 0);
    }
}
