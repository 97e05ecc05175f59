use crate::core::{Block, Blockchain, OutputLookup, TXOutput};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use data_encoding::HEXLOWER;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sled::{Batch, Tree};
use std::collections::{BTreeMap, HashMap};

const UTXO_TREE: &str = "chainstate";

/// An unspent output together with its position in the transaction that created it.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct UnspentOutput {
    index: usize,
    output: TXOutput,
}

impl UnspentOutput {
    pub fn new(index: usize, output: TXOutput) -> UnspentOutput {
        UnspentOutput { index, output }
    }

    pub fn get_index(&self) -> usize {
        self.index
    }

    pub fn get_output(&self) -> &TXOutput {
        &self.output
    }
}

/// Index of unspent outputs derived from the chain, stored next to it in the
/// `chainstate` tree (txid -> unspent outputs of that transaction).
///
/// [`UTXOSet::reindex`] is the reference result; [`UTXOSet::update`] must
/// always leave the tree exactly as a reindex of the extended chain would.
pub struct UTXOSet {
    blockchain: Blockchain,
}

impl UTXOSet {
    pub fn new(blockchain: Blockchain) -> UTXOSet {
        UTXOSet { blockchain }
    }

    fn utxo_tree(&self) -> Result<Tree> {
        self.blockchain
            .get_db()
            .open_tree(UTXO_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open UTXO tree: {e}")))
    }

    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<UnspentOutput>)>> {
        let mut entries = vec![];
        for item in self.utxo_tree()?.iter() {
            let (k, v) = item.map_err(|e| {
                BlockchainError::Database(format!("Failed to iterate UTXO tree: {e}"))
            })?;
            entries.push((k.to_vec(), deserialize(v.as_ref())?));
        }
        Ok(entries)
    }

    /// Picks outputs locked to `pub_key_hash` until they cover `amount`.
    ///
    /// Candidates are taken in ascending txid order, then ascending output
    /// index, so the selection is deterministic. The returned total may fall
    /// short of `amount`; the caller decides whether that is an error.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, BTreeMap<Vec<u8>, Vec<usize>>)> {
        let mut unspent_outputs: BTreeMap<Vec<u8>, Vec<usize>> = BTreeMap::new();
        let mut accumulated: u64 = 0;

        'entries: for (txid, outs) in self.entries()? {
            for out in outs {
                if accumulated >= amount {
                    break 'entries;
                }
                if out.output.is_locked_with_key(pub_key_hash) {
                    accumulated = accumulated.saturating_add(out.output.get_value());
                    unspent_outputs.entry(txid.clone()).or_default().push(out.index);
                }
            }
        }
        Ok((accumulated, unspent_outputs))
    }

    /// Every unspent output locked to `pub_key_hash`.
    pub fn find_unspent_transactions(&self, pub_key_hash: &[u8]) -> Result<Vec<TXOutput>> {
        let mut utxos = vec![];
        for (_, outs) in self.entries()? {
            utxos.extend(
                outs.into_iter()
                    .filter(|out| out.output.is_locked_with_key(pub_key_hash))
                    .map(|out| out.output),
            );
        }
        Ok(utxos)
    }

    pub fn get_balance(&self, pub_key_hash: &[u8]) -> Result<u64> {
        self.find_unspent_transactions(pub_key_hash)?
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.get_value()))
            .ok_or_else(|| BlockchainError::Database("Balance overflow".to_string()))
    }

    /// Number of transactions with at least one unspent output.
    pub fn count_transactions(&self) -> Result<usize> {
        let mut counter = 0;
        for item in self.utxo_tree()?.iter() {
            item.map_err(|e| {
                BlockchainError::Database(format!("Failed to iterate UTXO tree: {e}"))
            })?;
            counter += 1;
        }
        Ok(counter)
    }

    /// Full index contents ordered by txid.
    pub fn snapshot(&self) -> Result<BTreeMap<Vec<u8>, Vec<UnspentOutput>>> {
        Ok(self.entries()?.into_iter().collect())
    }

    /// Rebuilds the index from a full chain scan, replacing whatever was there.
    pub fn reindex(&self) -> Result<()> {
        let utxo_tree = self.utxo_tree()?;
        let utxo_map = self.blockchain.find_utxo()?;

        let mut batch = Batch::default();
        for key in utxo_tree.iter().keys() {
            batch.remove(key?);
        }
        for (txid, outs) in &utxo_map {
            batch.insert(txid.as_slice(), serialize(outs)?);
        }
        utxo_tree.apply_batch(batch)?;
        utxo_tree.flush()?;

        info!("Reindexed UTXO set: {} transactions", utxo_map.len());
        Ok(())
    }

    /// Applies one newly stored block: drops the outputs its inputs spend and
    /// adds every output it creates.
    ///
    /// All changes land in one batch; an input pointing at an output the index
    /// does not hold leaves the tree untouched and returns an error.
    pub fn update(&self, block: &Block) -> Result<()> {
        let utxo_tree = self.utxo_tree()?;
        // pending state per txid, None marks a removed entry
        let mut overlay: HashMap<Vec<u8>, Option<Vec<UnspentOutput>>> = HashMap::new();

        for tx in block.get_transactions() {
            if !tx.is_coinbase() {
                for vin in tx.get_vin() {
                    let reference = || {
                        format!("{}:{}", HEXLOWER.encode(vin.get_txid()), vin.get_vout())
                    };
                    let idx = vin.output_index().ok_or_else(|| {
                        BlockchainError::Database(format!("Invalid output index {}", reference()))
                    })?;

                    let mut outs = match overlay.get(vin.get_txid()) {
                        Some(pending) => pending.clone(),
                        None => match utxo_tree.get(vin.get_txid())? {
                            Some(bytes) => Some(deserialize::<Vec<UnspentOutput>>(bytes.as_ref())?),
                            None => None,
                        },
                    }
                    .ok_or_else(|| {
                        BlockchainError::Database(format!("UTXO not found: {}", reference()))
                    })?;

                    let position = outs
                        .iter()
                        .position(|out| out.index == idx)
                        .ok_or_else(|| {
                            BlockchainError::Database(format!("UTXO not found: {}", reference()))
                        })?;
                    outs.remove(position);

                    let pending = if outs.is_empty() { None } else { Some(outs) };
                    overlay.insert(vin.get_txid().to_vec(), pending);
                }
            }

            // a full scan never records a transaction without outputs
            if tx.get_vout().is_empty() {
                continue;
            }
            let new_outputs = tx
                .get_vout()
                .iter()
                .enumerate()
                .map(|(idx, out)| UnspentOutput::new(idx, out.clone()))
                .collect();
            overlay.insert(tx.get_id().to_vec(), Some(new_outputs));
        }

        let mut batch = Batch::default();
        for (txid, pending) in overlay {
            match pending {
                Some(outs) => batch.insert(txid, serialize(&outs)?),
                None => batch.remove(txid),
            }
        }
        utxo_tree.apply_batch(batch)?;
        utxo_tree.flush()?;

        debug!(
            "Applied block {} to UTXO set",
            HEXLOWER.encode(block.get_hash())
        );
        Ok(())
    }
}

impl OutputLookup for UTXOSet {
    fn find_output(&self, txid: &[u8], vout: usize) -> Result<Option<TXOutput>> {
        let Some(bytes) = self.utxo_tree()?.get(txid)? else {
            return Ok(None);
        };
        let outs: Vec<UnspentOutput> = deserialize(bytes.as_ref())?;
        Ok(outs
            .into_iter()
            .find(|out| out.index == vout)
            .map(|out| out.output))
    }
}
