// Value moves by consuming earlier outputs and creating new ones (UTXO model).
// A transaction's id is the hash of its contents with signatures blanked, so
// signing never changes the id.

use crate::error::{BlockchainError, Result};
use crate::storage::UTXOSet;
use crate::utils::{deserialize, ecdsa_p256_sha256_sign_verify, serialize, sha256_digest};
use crate::wallet::{address_to_pub_key_hash, hash_pub_key, validate_address};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Reward minted by every coinbase transaction.
pub const SUBSIDY: u64 = 20;

/// Output index carried by the single coinbase input.
pub const COINBASE_VOUT: i64 = -1;

/// The signing half of the key capability. The ledger never sees private keys.
pub trait Signer {
    fn public_key(&self) -> &[u8];
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// Resolves the output an input points at.
///
/// `Ok(None)` means the output is unknown to this lookup, which for the UTXO
/// set also covers outputs that were already spent.
pub trait OutputLookup {
    fn find_output(&self, txid: &[u8], vout: usize) -> Result<Option<TXOutput>>;
}

impl<F> OutputLookup for F
where
    F: Fn(&[u8], usize) -> Result<Option<TXOutput>>,
{
    fn find_output(&self, txid: &[u8], vout: usize) -> Result<Option<TXOutput>> {
        self(txid, vout)
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXInput {
    txid: Vec<u8>,      // transaction holding the output being spent
    vout: i64,          // index of that output, -1 for coinbase
    signature: Vec<u8>,
    pub_key: Vec<u8>,   // spender's public key; coinbase auxiliary data
}

impl TXInput {
    pub fn new(txid: &[u8], vout: usize) -> Result<TXInput> {
        let vout = i64::try_from(vout).map_err(|_| {
            BlockchainError::InvalidTransaction(format!("Output index {vout} out of range"))
        })?;
        Ok(TXInput {
            txid: txid.to_vec(),
            vout,
            signature: vec![],
            pub_key: vec![],
        })
    }

    pub fn get_txid(&self) -> &[u8] {
        self.txid.as_slice()
    }

    pub fn get_vout(&self) -> i64 {
        self.vout
    }

    /// The referenced output index, `None` for the coinbase sentinel.
    pub fn output_index(&self) -> Option<usize> {
        usize::try_from(self.vout).ok()
    }

    pub fn get_signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    pub fn get_pub_key(&self) -> &[u8] {
        self.pub_key.as_slice()
    }

    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash_pub_key(self.pub_key.as_slice()).eq(pub_key_hash)
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXOutput {
    value: u64,
    pub_key_hash: Vec<u8>, // who may spend this output
}

impl TXOutput {
    /// Locks `value` to the key hash encoded in `address`.
    pub fn new(value: u64, address: &str) -> Result<TXOutput> {
        Ok(TXOutput {
            value,
            pub_key_hash: address_to_pub_key_hash(address)?,
        })
    }

    pub fn new_locked(value: u64, pub_key_hash: &[u8]) -> TXOutput {
        TXOutput {
            value,
            pub_key_hash: pub_key_hash.to_vec(),
        }
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash.eq(pub_key_hash)
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    id: Vec<u8>,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
}

impl Transaction {
    /// Builds the reward transaction paying [`SUBSIDY`] to `to`.
    ///
    /// `data` is opaque; when empty, random bytes are used so two coinbases to
    /// the same address never share an id.
    pub fn new_coinbase_tx(to: &str, data: &[u8]) -> Result<Transaction> {
        let data = if data.is_empty() {
            Uuid::new_v4().as_bytes().to_vec()
        } else {
            data.to_vec()
        };

        let tx_input = TXInput {
            txid: vec![],
            vout: COINBASE_VOUT,
            signature: vec![],
            pub_key: data,
        };

        let mut tx = Transaction {
            id: vec![],
            vin: vec![tx_input],
            vout: vec![TXOutput::new(SUBSIDY, to)?],
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Spends outputs locked to `signer`'s key, paying `amount` to `to` and
    /// returning any remainder to the signer as change.
    pub fn new_utxo_transaction<S: Signer + ?Sized>(
        signer: &S,
        to: &str,
        amount: u64,
        utxo_set: &UTXOSet,
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(BlockchainError::InvalidTransaction(
                "Amount must be positive".to_string(),
            ));
        }

        if !validate_address(to) {
            return Err(BlockchainError::InvalidAddress(format!(
                "Invalid to address: {to}"
            )));
        }

        let public_key = signer.public_key();
        let public_key_hash = hash_pub_key(public_key);

        let (accumulated, valid_outputs) =
            utxo_set.find_spendable_outputs(public_key_hash.as_slice(), amount)?;

        if accumulated < amount {
            return Err(BlockchainError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }

        let mut inputs = vec![];
        for (txid, outs) in valid_outputs {
            for out in outs {
                let mut input = TXInput::new(txid.as_slice(), out)?;
                input.pub_key = public_key.to_vec();
                inputs.push(input);
            }
        }

        let mut outputs = vec![TXOutput::new(amount, to)?];
        if accumulated > amount {
            outputs.push(TXOutput::new_locked(
                accumulated - amount,
                public_key_hash.as_slice(),
            ));
        }

        let mut tx = Transaction {
            id: vec![],
            vin: inputs,
            vout: outputs,
        };
        tx.id = tx.hash()?;
        tx.sign(signer, utxo_set)?;
        Ok(tx)
    }

    /// A copy with every input's signature and public key blanked.
    fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .vin
            .iter()
            .map(|input| TXInput {
                txid: input.txid.clone(),
                vout: input.vout,
                signature: vec![],
                pub_key: vec![],
            })
            .collect();

        Transaction {
            id: self.id.clone(),
            vin: inputs,
            vout: self.vout.clone(),
        }
    }

    /// Digest signed for input `idx`: the trimmed copy with that input
    /// temporarily carrying the key hash of the output it spends.
    fn signing_digest(&mut self, idx: usize, locking_key_hash: &[u8]) -> Result<Vec<u8>> {
        self.vin[idx].pub_key = locking_key_hash.to_vec();
        let digest = self.hash();
        self.vin[idx].pub_key = vec![];
        digest
    }

    fn referenced_outputs<L: OutputLookup + ?Sized>(&self, lookup: &L) -> Result<Vec<TXOutput>> {
        self.vin
            .iter()
            .map(|vin| {
                let missing = || {
                    BlockchainError::UnknownReference(format!(
                        "{}:{}",
                        HEXLOWER.encode(vin.get_txid()),
                        vin.get_vout()
                    ))
                };
                let idx = vin.output_index().ok_or_else(missing)?;
                lookup.find_output(vin.get_txid(), idx)?.ok_or_else(missing)
            })
            .collect()
    }

    pub fn sign<S, L>(&mut self, signer: &S, lookup: &L) -> Result<()>
    where
        S: Signer + ?Sized,
        L: OutputLookup + ?Sized,
    {
        if self.is_coinbase() {
            return Ok(());
        }

        let prev_outputs = self.referenced_outputs(lookup)?;
        let mut tx_copy = self.trimmed_copy();
        for (idx, prev) in prev_outputs.iter().enumerate() {
            let digest = tx_copy.signing_digest(idx, prev.get_pub_key_hash())?;
            self.vin[idx].signature = signer.sign(digest.as_slice())?;
        }
        Ok(())
    }

    /// Checks every input against the output it spends.
    ///
    /// Coinbase transactions pass trivially; their placement inside a block is
    /// checked by the chain.
    pub fn verify<L: OutputLookup + ?Sized>(&self, lookup: &L) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        if self.vin.is_empty() {
            return Err(BlockchainError::InvalidTransaction(
                "Transaction has no inputs".to_string(),
            ));
        }
        if self.vout.is_empty() {
            return Err(BlockchainError::InvalidTransaction(
                "Transaction has no outputs".to_string(),
            ));
        }

        if self.id != self.hash()? {
            return Err(BlockchainError::InvalidTransaction(format!(
                "Id {} does not match contents",
                HEXLOWER.encode(&self.id)
            )));
        }

        let prev_outputs = self.referenced_outputs(lookup)?;

        let input_value = prev_outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.get_value()))
            .ok_or_else(|| BlockchainError::InvalidTransaction("Input value overflow".to_string()))?;
        let output_value = self.get_output_value()?;
        if input_value < output_value {
            return Err(BlockchainError::InvalidTransaction(format!(
                "Outputs ({output_value}) exceed inputs ({input_value})"
            )));
        }

        let mut tx_copy = self.trimmed_copy();
        for (idx, (vin, prev)) in self.vin.iter().zip(prev_outputs.iter()).enumerate() {
            if !vin.uses_key(prev.get_pub_key_hash()) {
                return Err(BlockchainError::InvalidSignature(format!(
                    "Input {idx} is not signed by the owner of the spent output"
                )));
            }

            let digest = tx_copy.signing_digest(idx, prev.get_pub_key_hash())?;
            if !ecdsa_p256_sha256_sign_verify(
                vin.pub_key.as_slice(),
                vin.signature.as_slice(),
                digest.as_slice(),
            ) {
                return Err(BlockchainError::InvalidSignature(format!(
                    "Input {idx} of transaction {}",
                    HEXLOWER.encode(&self.id)
                )));
            }
        }
        Ok(())
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].txid.is_empty() && self.vin[0].vout == COINBASE_VOUT
    }

    /// Same inputs with `vout` swapped in, re-identified and re-signed.
    #[cfg(test)]
    pub(crate) fn with_outputs<S, L>(
        &self,
        vout: Vec<TXOutput>,
        signer: &S,
        lookup: &L,
    ) -> Result<Transaction>
    where
        S: Signer + ?Sized,
        L: OutputLookup + ?Sized,
    {
        let mut tx = Transaction {
            id: vec![],
            vin: self.vin.clone(),
            vout,
        };
        tx.id = tx.hash()?;
        tx.sign(signer, lookup)?;
        Ok(tx)
    }

    fn hash(&self) -> Result<Vec<u8>> {
        let mut tx_copy = self.clone();
        tx_copy.id = vec![];
        for input in tx_copy.vin.iter_mut() {
            input.signature = vec![];
        }
        Ok(sha256_digest(tx_copy.serialize()?.as_slice()))
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn get_output_value(&self) -> Result<u64> {
        self.vout
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.get_value()))
            .ok_or_else(|| BlockchainError::InvalidTransaction("Output value overflow".to_string()))
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", HEXLOWER.encode(&self.id))?;
        for (i, input) in self.vin.iter().enumerate() {
            writeln!(f, "     Input {i}:")?;
            writeln!(f, "       TXID:      {}", HEXLOWER.encode(&input.txid))?;
            writeln!(f, "       Out:       {}", input.vout)?;
            writeln!(f, "       Signature: {}", HEXLOWER.encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", HEXLOWER.encode(&input.pub_key))?;
        }
        for (i, output) in self.vout.iter().enumerate() {
            writeln!(f, "     Output {i}:")?;
            writeln!(f, "       Value:  {}", output.value)?;
            write!(f, "       Script: {}", HEXLOWER.encode(&output.pub_key_hash))?;
            if i + 1 < self.vout.len() {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
