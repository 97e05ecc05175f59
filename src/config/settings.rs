use crate::core::DEFAULT_DIFFICULTY;
use crate::error::{BlockchainError, Result};
use std::env;
use std::path::{Path, PathBuf};

/// The well-known contact point every other node dials on startup.
pub const SEED_NODE: &str = "127.0.0.1:3000";

const NODE_ID_KEY: &str = "NODE_ID";
const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const POW_DIFFICULTY_KEY: &str = "POW_DIFFICULTY";

const DEFAULT_DATA_ROOT: &str = "data";

/// Node settings, resolved once at startup and passed down explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub node_id: String,
    pub node_addr: String,
    pub seed_nodes: Vec<String>,
    pub difficulty: u32,
    data_root: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_id = lookup(NODE_ID_KEY)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BlockchainError::Config(format!("{NODE_ID_KEY} env. var is not set")))?;

        if node_id.contains(['/', '\\']) || node_id.contains("..") {
            return Err(BlockchainError::Config(format!(
                "{NODE_ID_KEY} must not contain path separators: {node_id}"
            )));
        }

        let node_addr = lookup(NODE_ADDRESS_KEY)
            .filter(|addr| !addr.trim().is_empty())
            .unwrap_or_else(|| format!("127.0.0.1:{node_id}"));

        let difficulty = match lookup(POW_DIFFICULTY_KEY) {
            Some(raw) => {
                let bits: u32 = raw.trim().parse().map_err(|e| {
                    BlockchainError::Config(format!("Invalid {POW_DIFFICULTY_KEY} '{raw}': {e}"))
                })?;
                if !(1..=255).contains(&bits) {
                    return Err(BlockchainError::Config(format!(
                        "{POW_DIFFICULTY_KEY} must be between 1 and 255, got {bits}"
                    )));
                }
                bits
            }
            None => DEFAULT_DIFFICULTY,
        };

        Ok(Config {
            node_id,
            node_addr,
            seed_nodes: vec![SEED_NODE.to_string()],
            difficulty,
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
        })
    }

    /// Moves the chain store and wallet file under `root`.
    pub fn with_data_root(mut self, root: impl AsRef<Path>) -> Config {
        self.data_root = root.as_ref().to_path_buf();
        self
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_root.join(format!("node_{}", self.node_id))
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.data_root.join(format!("wallet_{}.dat", self.node_id))
    }

    pub fn is_seed(&self) -> bool {
        self.seed_nodes.iter().any(|seed| seed == &self.node_addr)
    }
}
