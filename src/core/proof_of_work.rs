use crate::core::{Block, MerkleTree};
use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;
use log::{debug, info};
use num_bigint::{BigInt, Sign};
use std::ops::ShlAssign;

/// Leading zero bits required of a block hash unless configured otherwise.
pub const DEFAULT_DIFFICULTY: u32 = 12;

/// Nonce search for one block at a fixed difficulty.
pub struct ProofOfWork<'a> {
    block: &'a Block,
    merkle_root: Vec<u8>,
    target: BigInt,
    difficulty: u32,
}

impl<'a> ProofOfWork<'a> {
    pub fn new_proof_of_work(block: &'a Block, difficulty: u32) -> Result<ProofOfWork<'a>> {
        if difficulty == 0 || difficulty >= 256 {
            return Err(BlockchainError::Mining(format!(
                "Difficulty must be between 1 and 255, got {difficulty}"
            )));
        }

        let mut target = BigInt::from(1);
        target.shl_assign(256 - difficulty);
        let merkle_root = MerkleTree::new(block.get_transactions())?.root_hash().to_vec();

        Ok(ProofOfWork {
            block,
            merkle_root,
            target,
            difficulty,
        })
    }

    /// Checks the stored nonce and hash of `block` against `difficulty`.
    pub fn validate(block: &Block, difficulty: u32) -> Result<bool> {
        let pow = ProofOfWork::new_proof_of_work(block, difficulty)?;
        let hash = sha256_digest(pow.prepare_data(block.get_nonce()).as_slice());
        if hash.as_slice() != block.get_hash() {
            debug!(
                "Stored hash {} does not match recomputed {}",
                HEXLOWER.encode(block.get_hash()),
                HEXLOWER.encode(&hash)
            );
            return Ok(false);
        }
        Ok(pow.meets_target(&hash))
    }

    fn prepare_data(&self, nonce: u64) -> Vec<u8> {
        let mut data_bytes = vec![];
        data_bytes.extend(self.block.get_pre_block_hash());
        data_bytes.extend(self.merkle_root.as_slice());
        data_bytes.extend(self.block.get_timestamp().to_be_bytes());
        data_bytes.extend(self.difficulty.to_be_bytes());
        data_bytes.extend(nonce.to_be_bytes());
        data_bytes
    }

    fn meets_target(&self, hash: &[u8]) -> bool {
        BigInt::from_bytes_be(Sign::Plus, hash) < self.target
    }

    /// Searches nonces from zero until the header hash falls below the target.
    pub fn run(&self) -> Result<(u64, Vec<u8>)> {
        info!(
            "Mining block at height {} (difficulty {})",
            self.block.get_height(),
            self.difficulty
        );
        let (nonce, hash) = self.search(0)?;
        info!("Found nonce {nonce}, hash {}", HEXLOWER.encode(&hash));
        Ok((nonce, hash))
    }

    fn search(&self, start: u64) -> Result<(u64, Vec<u8>)> {
        let mut nonce = start;
        loop {
            let hash = sha256_digest(self.prepare_data(nonce).as_slice());
            if self.meets_target(&hash) {
                return Ok((nonce, hash));
            }
            nonce = nonce.checked_add(1).ok_or_else(|| {
                BlockchainError::Mining(format!(
                    "Nonce space exhausted at difficulty {}",
                    self.difficulty
                ))
            })?;
        }
    }
}
