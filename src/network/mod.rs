//! Peer-to-peer networking
//!
//! One framed message per TCP connection. Nodes announce their height with
//! `version`, pull missing blocks through `getblocks`/`inv`/`getdata`, and
//! relay pooled transactions the same way.

pub mod message;
pub mod node;
pub mod server;

pub use message::{read_package, write_package, InvKind, Package, COMMAND_LENGTH, NODE_VERSION};
pub use node::{Node, Nodes};
pub use server::{send_tx, NodeState, Outbound, Server, TRANSACTION_THRESHOLD};
