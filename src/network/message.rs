// Wire format: a 12-byte NUL-padded command name followed by the bincode
// payload for that command. One message per connection; the sender closes its
// write half and the receiver reads to EOF.

use crate::core::{Block, Transaction};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};

pub const COMMAND_LENGTH: usize = 12;
pub const NODE_VERSION: u32 = 1;

/// Upper bound on one message, command included.
pub const MAX_MESSAGE_SIZE: u64 = 32 * 1024 * 1024;

const CMD_VERSION: &str = "version";
const CMD_GET_BLOCKS: &str = "getblocks";
const CMD_INV: &str = "inv";
const CMD_GET_DATA: &str = "getdata";
const CMD_BLOCK: &str = "block";
const CMD_TX: &str = "tx";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum InvKind {
    Block,
    Tx,
}

impl fmt::Display for InvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvKind::Block => write!(f, "block"),
            InvKind::Tx => write!(f, "tx"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Package {
    Version {
        addr_from: String,
        version: u32,
        best_height: usize,
    },
    GetBlocks {
        addr_from: String,
    },
    Inv {
        addr_from: String,
        kind: InvKind,
        items: Vec<Vec<u8>>,
    },
    GetData {
        addr_from: String,
        kind: InvKind,
        id: Vec<u8>,
    },
    Block {
        addr_from: String,
        block: Block,
    },
    Tx {
        addr_from: String,
        transaction: Transaction,
    },
}

#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode)]
struct VersionPayload {
    addr_from: String,
    version: u32,
    best_height: u64,
}

#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode)]
struct GetBlocksPayload {
    addr_from: String,
}

#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode)]
struct InvPayload {
    addr_from: String,
    kind: InvKind,
    items: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode)]
struct GetDataPayload {
    addr_from: String,
    kind: InvKind,
    id: Vec<u8>,
}

// blocks and transactions travel in their on-disk encoding
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode)]
struct ItemPayload {
    addr_from: String,
    data: Vec<u8>,
}

impl Package {
    pub fn command(&self) -> &'static str {
        match self {
            Package::Version { .. } => CMD_VERSION,
            Package::GetBlocks { .. } => CMD_GET_BLOCKS,
            Package::Inv { .. } => CMD_INV,
            Package::GetData { .. } => CMD_GET_DATA,
            Package::Block { .. } => CMD_BLOCK,
            Package::Tx { .. } => CMD_TX,
        }
    }

    pub fn addr_from(&self) -> &str {
        match self {
            Package::Version { addr_from, .. }
            | Package::GetBlocks { addr_from }
            | Package::Inv { addr_from, .. }
            | Package::GetData { addr_from, .. }
            | Package::Block { addr_from, .. }
            | Package::Tx { addr_from, .. } => addr_from.as_str(),
        }
    }

    /// Frames the package as command bytes followed by its payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Package::Version {
                addr_from,
                version,
                best_height,
            } => serialize(&VersionPayload {
                addr_from: addr_from.clone(),
                version: *version,
                best_height: *best_height as u64,
            })?,
            Package::GetBlocks { addr_from } => serialize(&GetBlocksPayload {
                addr_from: addr_from.clone(),
            })?,
            Package::Inv {
                addr_from,
                kind,
                items,
            } => serialize(&InvPayload {
                addr_from: addr_from.clone(),
                kind: *kind,
                items: items.clone(),
            })?,
            Package::GetData {
                addr_from,
                kind,
                id,
            } => serialize(&GetDataPayload {
                addr_from: addr_from.clone(),
                kind: *kind,
                id: id.clone(),
            })?,
            Package::Block { addr_from, block } => serialize(&ItemPayload {
                addr_from: addr_from.clone(),
                data: block.serialize()?,
            })?,
            Package::Tx {
                addr_from,
                transaction,
            } => serialize(&ItemPayload {
                addr_from: addr_from.clone(),
                data: transaction.serialize()?,
            })?,
        };

        let mut frame = command_to_bytes(self.command()).to_vec();
        frame.extend(payload);
        Ok(frame)
    }

    pub fn decode(frame: &[u8]) -> Result<Package> {
        if frame.len() < COMMAND_LENGTH {
            return Err(BlockchainError::Network(format!(
                "Message of {} bytes is shorter than its command",
                frame.len()
            )));
        }
        let (command, payload) = frame.split_at(COMMAND_LENGTH);

        let package = match bytes_to_command(command)?.as_str() {
            CMD_VERSION => {
                let p: VersionPayload = deserialize(payload)?;
                let best_height = usize::try_from(p.best_height).map_err(|_| {
                    BlockchainError::Serialization(format!("Height {} out of range", p.best_height))
                })?;
                Package::Version {
                    addr_from: p.addr_from,
                    version: p.version,
                    best_height,
                }
            }
            CMD_GET_BLOCKS => {
                let p: GetBlocksPayload = deserialize(payload)?;
                Package::GetBlocks {
                    addr_from: p.addr_from,
                }
            }
            CMD_INV => {
                let p: InvPayload = deserialize(payload)?;
                Package::Inv {
                    addr_from: p.addr_from,
                    kind: p.kind,
                    items: p.items,
                }
            }
            CMD_GET_DATA => {
                let p: GetDataPayload = deserialize(payload)?;
                Package::GetData {
                    addr_from: p.addr_from,
                    kind: p.kind,
                    id: p.id,
                }
            }
            CMD_BLOCK => {
                let p: ItemPayload = deserialize(payload)?;
                Package::Block {
                    addr_from: p.addr_from,
                    block: Block::deserialize(&p.data)?,
                }
            }
            CMD_TX => {
                let p: ItemPayload = deserialize(payload)?;
                Package::Tx {
                    addr_from: p.addr_from,
                    transaction: Transaction::deserialize(&p.data)?,
                }
            }
            other => {
                return Err(BlockchainError::Network(format!(
                    "Unknown command '{other}'"
                )))
            }
        };
        Ok(package)
    }
}

fn command_to_bytes(command: &str) -> [u8; COMMAND_LENGTH] {
    let mut bytes = [0u8; COMMAND_LENGTH];
    for (slot, byte) in bytes.iter_mut().zip(command.as_bytes()) {
        *slot = *byte;
    }
    bytes
}

fn bytes_to_command(bytes: &[u8]) -> Result<String> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    if bytes[end..].iter().any(|b| *b != 0) {
        return Err(BlockchainError::Network(
            "Command field has bytes after its padding".to_string(),
        ));
    }
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|e| BlockchainError::Network(format!("Command is not UTF-8: {e}")))
}

/// Reads one framed package, consuming the reader to EOF.
pub fn read_package<R: Read>(reader: R) -> Result<Package> {
    let mut frame = vec![];
    reader
        .take(MAX_MESSAGE_SIZE + 1)
        .read_to_end(&mut frame)
        .map_err(|e| BlockchainError::Network(format!("Failed to read message: {e}")))?;
    if frame.len() as u64 > MAX_MESSAGE_SIZE {
        return Err(BlockchainError::Network(format!(
            "Message exceeds {MAX_MESSAGE_SIZE} bytes"
        )));
    }
    Package::decode(&frame)
}

pub fn write_package<W: Write>(mut writer: W, package: &Package) -> Result<()> {
    let frame = package.encode()?;
    writer
        .write_all(&frame)
        .and_then(|_| writer.flush())
        .map_err(|e| BlockchainError::Network(format!("Failed to send data: {e}")))
}
