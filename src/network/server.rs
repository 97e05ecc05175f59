use crate::config::Config;
use crate::core::{Block, Blockchain, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::message::{read_package, write_package, InvKind, Package, NODE_VERSION};
use crate::network::Nodes;
use crate::storage::{BlockInTransit, MemoryPool, UTXOSet};
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Pool size at which a mining node assembles a block.
pub const TRANSACTION_THRESHOLD: usize = 2;
const TCP_WRITE_TIMEOUT: u64 = 5000; // ms, connect and write
const TCP_READ_TIMEOUT: u64 = 60; // s

/// A package to send once the handler that produced it has released the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub addr: String,
    pub package: Package,
}

/// Everything a node shares between its connection threads.
///
/// The chain and its UTXO index sit behind one mutex, so block acceptance,
/// mining and index maintenance never interleave.
pub struct NodeState {
    node_addr: String,
    mining_addr: Option<String>,
    ledger: Mutex<Blockchain>,
    known_nodes: Nodes,
    mempool: MemoryPool,
    blocks_in_transit: BlockInTransit,
}

impl NodeState {
    pub fn new(
        node_addr: &str,
        seed_nodes: &[String],
        blockchain: Blockchain,
        mining_addr: Option<String>,
    ) -> NodeState {
        let known_nodes = Nodes::new();
        for seed in seed_nodes {
            known_nodes.add_node(seed);
        }
        NodeState {
            node_addr: node_addr.to_string(),
            mining_addr,
            ledger: Mutex::new(blockchain),
            known_nodes,
            mempool: MemoryPool::new(),
            blocks_in_transit: BlockInTransit::new(),
        }
    }

    pub fn get_node_addr(&self) -> &str {
        self.node_addr.as_str()
    }

    pub fn known_nodes(&self) -> &Nodes {
        &self.known_nodes
    }

    pub fn mempool(&self) -> &MemoryPool {
        &self.mempool
    }

    pub fn blocks_in_transit(&self) -> &BlockInTransit {
        &self.blocks_in_transit
    }

    fn ledger(&self) -> MutexGuard<'_, Blockchain> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn version_message(&self) -> Result<Package> {
        let best_height = self.ledger().get_best_height()?;
        Ok(self.version_at(best_height))
    }

    fn version_at(&self, best_height: usize) -> Package {
        Package::Version {
            addr_from: self.node_addr.clone(),
            version: NODE_VERSION,
            best_height,
        }
    }

    fn outbound(addr: &str, package: Package) -> Outbound {
        Outbound {
            addr: addr.to_string(),
            package,
        }
    }

    fn peers_except(&self, sender: &str) -> Vec<String> {
        self.known_nodes
            .get_nodes()
            .into_iter()
            .map(|node| node.get_addr().to_string())
            .filter(|addr| addr != &self.node_addr && addr != sender)
            .collect()
    }

    /// Applies one incoming package and returns the replies it calls for.
    pub fn handle(&self, package: Package) -> Result<Vec<Outbound>> {
        match package {
            Package::Version {
                addr_from,
                version,
                best_height,
            } => self.handle_version(addr_from, version, best_height),
            Package::GetBlocks { addr_from } => self.handle_get_blocks(addr_from),
            Package::Inv {
                addr_from,
                kind,
                items,
            } => self.handle_inv(addr_from, kind, items),
            Package::GetData {
                addr_from,
                kind,
                id,
            } => self.handle_get_data(addr_from, kind, id),
            Package::Block { addr_from, block } => self.handle_block(addr_from, block),
            Package::Tx {
                addr_from,
                transaction,
            } => self.handle_tx(addr_from, transaction),
        }
    }

    fn handle_version(
        &self,
        addr_from: String,
        version: u32,
        best_height: usize,
    ) -> Result<Vec<Outbound>> {
        debug!("Version {version} from {addr_from}, best_height={best_height}");
        let local_best_height = self.ledger().get_best_height()?;

        let mut outbound = vec![];
        if local_best_height < best_height {
            outbound.push(Self::outbound(
                &addr_from,
                Package::GetBlocks {
                    addr_from: self.node_addr.clone(),
                },
            ));
        } else if local_best_height > best_height {
            outbound.push(Self::outbound(
                &addr_from,
                self.version_at(local_best_height),
            ));
        }

        if addr_from != self.node_addr && self.known_nodes.add_node(&addr_from) {
            info!("Discovered peer {addr_from}");
        }
        Ok(outbound)
    }

    fn handle_get_blocks(&self, addr_from: String) -> Result<Vec<Outbound>> {
        let hashes = self.ledger().get_block_hashes()?;
        Ok(vec![Self::outbound(
            &addr_from,
            Package::Inv {
                addr_from: self.node_addr.clone(),
                kind: InvKind::Block,
                items: hashes,
            },
        )])
    }

    fn handle_inv(
        &self,
        addr_from: String,
        kind: InvKind,
        items: Vec<Vec<u8>>,
    ) -> Result<Vec<Outbound>> {
        debug!("Inventory from {addr_from}: {} {kind}(s)", items.len());
        match kind {
            InvKind::Block => {
                // inventories list tip first; fetch what we lack oldest first
                let mut missing = vec![];
                {
                    let ledger = self.ledger();
                    for hash in items.into_iter().rev() {
                        if !ledger.block_exists(&hash)? {
                            missing.push(hash);
                        }
                    }
                }
                if missing.is_empty() {
                    return Ok(vec![]);
                }

                let first = missing.remove(0);
                self.blocks_in_transit.set(missing);
                Ok(vec![Self::outbound(
                    &addr_from,
                    Package::GetData {
                        addr_from: self.node_addr.clone(),
                        kind: InvKind::Block,
                        id: first,
                    },
                )])
            }
            InvKind::Tx => Ok(items
                .into_iter()
                .filter(|txid| !self.mempool.contains(txid))
                .map(|txid| {
                    Self::outbound(
                        &addr_from,
                        Package::GetData {
                            addr_from: self.node_addr.clone(),
                            kind: InvKind::Tx,
                            id: txid,
                        },
                    )
                })
                .collect()),
        }
    }

    fn handle_get_data(
        &self,
        addr_from: String,
        kind: InvKind,
        id: Vec<u8>,
    ) -> Result<Vec<Outbound>> {
        let package = match kind {
            InvKind::Block => self
                .ledger()
                .get_block(&id)?
                .map(|block| Package::Block {
                    addr_from: self.node_addr.clone(),
                    block,
                }),
            InvKind::Tx => self.mempool.get(&id).map(|transaction| Package::Tx {
                addr_from: self.node_addr.clone(),
                transaction,
            }),
        };

        match package {
            Some(package) => Ok(vec![Self::outbound(&addr_from, package)]),
            None => {
                debug!("{addr_from} asked for unknown {kind} {}", HEXLOWER.encode(&id));
                Ok(vec![])
            }
        }
    }

    fn handle_block(&self, addr_from: String, block: Block) -> Result<Vec<Outbound>> {
        let block_hex = HEXLOWER.encode(block.get_hash());
        let ledger = self.ledger();

        let added = match ledger.add_block(&block) {
            Ok(added) => added,
            Err(BlockchainError::InvalidBlock(reason)) => {
                warn!("Discarding block from {addr_from}: {reason}");
                self.blocks_in_transit.clear();

                // the sender is ahead of us; ask for its whole inventory
                let local_best_height = ledger.get_best_height()?;
                if block.get_height() > local_best_height + 1 {
                    info!(
                        "Block {block_hex} is ahead of height {local_best_height}, \
                         resyncing with {addr_from}"
                    );
                    return Ok(vec![Self::outbound(
                        &addr_from,
                        Package::GetBlocks {
                            addr_from: self.node_addr.clone(),
                        },
                    )]);
                }
                return Ok(vec![]);
            }
            Err(e) => return Err(e),
        };

        let utxo_set = UTXOSet::new(ledger.clone());
        if added {
            utxo_set.update(&block)?;
            for tx in block.get_transactions() {
                self.mempool.remove(tx.get_id());
            }
            info!("Received block {block_hex} from {addr_from}");
        }

        if let Some(next) = self.blocks_in_transit.pop_front() {
            return Ok(vec![Self::outbound(
                &addr_from,
                Package::GetData {
                    addr_from: self.node_addr.clone(),
                    kind: InvKind::Block,
                    id: next,
                },
            )]);
        }

        if added {
            utxo_set.reindex()?;
        }
        Ok(vec![])
    }

    fn handle_tx(&self, addr_from: String, tx: Transaction) -> Result<Vec<Outbound>> {
        let txid_hex = HEXLOWER.encode(tx.get_id());
        if self.mempool.contains(tx.get_id()) {
            debug!("Transaction {txid_hex} already pooled");
            return Ok(vec![]);
        }
        if tx.is_coinbase() {
            warn!("Discarding coinbase transaction {txid_hex} from {addr_from}");
            return Ok(vec![]);
        }

        let ledger = self.ledger();
        if let Err(e) = tx.verify(&UTXOSet::new(ledger.clone())) {
            warn!("Discarding transaction {txid_hex} from {addr_from}: {e}");
            return Ok(vec![]);
        }

        let txid = tx.get_id().to_vec();
        self.mempool.add(tx);
        info!(
            "Pooled transaction {txid_hex} from {addr_from} ({} pending)",
            self.mempool.len()
        );

        let peers = self.peers_except(&addr_from);
        let mut outbound: Vec<Outbound> = peers
            .iter()
            .map(|peer| {
                Self::outbound(
                    peer,
                    Package::Inv {
                        addr_from: self.node_addr.clone(),
                        kind: InvKind::Tx,
                        items: vec![txid.clone()],
                    },
                )
            })
            .collect();

        if let Some(mining_addr) = &self.mining_addr {
            for block in self.mine_pending(&ledger, mining_addr)? {
                for peer in &peers {
                    outbound.push(Self::outbound(
                        peer,
                        Package::Inv {
                            addr_from: self.node_addr.clone(),
                            kind: InvKind::Block,
                            items: vec![block.get_hash().to_vec()],
                        },
                    ));
                }
            }
        }
        Ok(outbound)
    }

    // Mines while the pool holds at least TRANSACTION_THRESHOLD entries.
    // Pooled transactions that no longer verify, or that spend an output
    // already taken by another selected transaction, are dropped.
    fn mine_pending(&self, blockchain: &Blockchain, mining_addr: &str) -> Result<Vec<Block>> {
        let mut mined = vec![];

        while self.mempool.len() >= TRANSACTION_THRESHOLD {
            let utxo_set = UTXOSet::new(blockchain.clone());
            let mut spent: HashSet<(Vec<u8>, i64)> = HashSet::new();
            let mut txs = vec![];

            for tx in self.mempool.get_all() {
                let conflicts = tx
                    .get_vin()
                    .iter()
                    .any(|vin| spent.contains(&(vin.get_txid().to_vec(), vin.get_vout())));
                if conflicts || tx.verify(&utxo_set).is_err() {
                    warn!(
                        "Dropping pooled transaction {}",
                        HEXLOWER.encode(tx.get_id())
                    );
                    self.mempool.remove(tx.get_id());
                    continue;
                }
                for vin in tx.get_vin() {
                    spent.insert((vin.get_txid().to_vec(), vin.get_vout()));
                }
                txs.push(tx);
            }

            if txs.is_empty() {
                info!("All pooled transactions are invalid, waiting for new ones");
                break;
            }

            let mut block_txs = vec![Transaction::new_coinbase_tx(mining_addr, b"")?];
            block_txs.extend(txs.iter().cloned());

            let block = blockchain.mine_block(&block_txs)?;
            utxo_set.update(&block)?;
            for tx in &txs {
                self.mempool.remove(tx.get_id());
            }
            info!("New block {} is mined!", HEXLOWER.encode(block.get_hash()));
            mined.push(block);
        }
        Ok(mined)
    }

    /// Sends each package; a peer that cannot be reached is dropped from the registry.
    pub fn deliver(&self, outbound: Vec<Outbound>) {
        for Outbound { addr, package } in outbound {
            if let Err(e) = send_data(&addr, &package) {
                warn!("Peer {addr} is not available, evicting: {e}");
                self.known_nodes.evict_node(&addr);
            }
        }
    }
}

pub struct Server {
    state: Arc<NodeState>,
    seed_nodes: Vec<String>,
    is_seed: bool,
}

impl Server {
    pub fn new(config: &Config, blockchain: Blockchain, mining_addr: Option<String>) -> Server {
        Server {
            state: Arc::new(NodeState::new(
                &config.node_addr,
                &config.seed_nodes,
                blockchain,
                mining_addr,
            )),
            seed_nodes: config.seed_nodes.clone(),
            is_seed: config.is_seed(),
        }
    }

    pub fn get_state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// Binds the node address and serves connections until the listener fails.
    pub fn run(&self) -> Result<()> {
        let addr = self.state.get_node_addr();
        let listener = TcpListener::bind(addr)
            .map_err(|e| BlockchainError::Network(format!("Failed to bind to {addr}: {e}")))?;
        info!("Server listening on {addr}");

        if !self.is_seed {
            let version = self.state.version_message()?;
            let hello = self
                .seed_nodes
                .iter()
                .map(|seed| NodeState::outbound(seed, version.clone()))
                .collect();
            self.state.deliver(hello);
        }

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let state = Arc::clone(&self.state);
                    thread::spawn(move || {
                        if let Err(e) = Self::handle_connection(&state, stream) {
                            error!("Error handling connection: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }
        Ok(())
    }

    fn handle_connection(state: &NodeState, stream: TcpStream) -> Result<()> {
        let peer_addr = stream.peer_addr()?;
        stream
            .set_read_timeout(Some(Duration::from_secs(TCP_READ_TIMEOUT)))
            .map_err(|e| BlockchainError::Network(format!("Failed to set read timeout: {e}")))?;

        let package = read_package(&stream)
            .map_err(|e| BlockchainError::Network(format!("Bad message from {peer_addr}: {e}")))?;
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            debug!("Failed to close connection from {peer_addr}: {e}");
        }
        debug!(
            "Received {} from {peer_addr} ({})",
            package.command(),
            package.addr_from()
        );

        let outbound = state.handle(package)?;
        state.deliver(outbound);
        Ok(())
    }
}

fn send_data(addr: &str, package: &Package) -> Result<()> {
    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| BlockchainError::Network(format!("Invalid address {addr}: {e}")))?
        .next()
        .ok_or_else(|| BlockchainError::Network(format!("Address {addr} did not resolve")))?;
    debug!("Sending {} to {addr}", package.command());

    let stream =
        TcpStream::connect_timeout(&socket_addr, Duration::from_millis(TCP_WRITE_TIMEOUT))
            .map_err(|e| BlockchainError::Network(format!("Failed to connect to {addr}: {e}")))?;
    stream
        .set_write_timeout(Some(Duration::from_millis(TCP_WRITE_TIMEOUT)))
        .map_err(|e| BlockchainError::Network(format!("Failed to set write timeout: {e}")))?;

    write_package(&stream, package)?;
    stream
        .shutdown(Shutdown::Write)
        .map_err(|e| BlockchainError::Network(format!("Failed to close {addr}: {e}")))?;
    Ok(())
}

/// Hands a transaction to the node at `addr`.
pub fn send_tx(addr_from: &str, addr: &str, tx: &Transaction) -> Result<()> {
    send_data(
        addr,
        &Package::Tx {
            addr_from: addr_from.to_string(),
            transaction: tx.clone(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SUBSIDY;
    use crate::testnet::{create_shared_chains, mine_coinbase_block, TEST_DIFFICULTY};
    use crate::wallet::{hash_pub_key, Wallet};
    use std::collections::VecDeque;

    const SEED: &str = "127.0.0.1:3000";
    const PEER: &str = "127.0.0.1:3001";
    const WALLET_NODE: &str = "127.0.0.1:3002";

    // Delivers packages between in-process nodes through the wire encoding.
    fn route(nodes: &[&NodeState], initial: Vec<Outbound>) -> usize {
        let mut queue: VecDeque<Outbound> = initial.into();
        let mut delivered = 0;
        while let Some(out) = queue.pop_front() {
            if let Some(node) = nodes.iter().find(|n| n.get_node_addr() == out.addr) {
                let package = Package::decode(&out.package.encode().unwrap()).unwrap();
                queue.extend(node.handle(package).unwrap());
                delivered += 1;
            }
            assert!(delivered < 1000, "message storm");
        }
        delivered
    }

    fn seeds() -> Vec<String> {
        vec![SEED.to_string()]
    }

    #[test]
    fn test_version_handshake_syncs_longer_chain() {
        let (chains, wallet, _dir) = create_shared_chains(2).unwrap();
        let seed = NodeState::new(SEED, &seeds(), chains[0].clone(), None);
        let peer = NodeState::new(PEER, &seeds(), chains[1].clone(), None);

        mine_coinbase_block(&chains[0], &wallet.get_address()).unwrap();
        mine_coinbase_block(&chains[0], &wallet.get_address()).unwrap();

        let hello = NodeState::outbound(SEED, peer.version_message().unwrap());
        let delivered = route(&[&seed, &peer], vec![hello]);
        assert_eq!(delivered, 8);

        assert_eq!(chains[1].get_best_height().unwrap(), 2);
        assert_eq!(chains[1].get_tip_hash(), chains[0].get_tip_hash());
        assert_eq!(
            UTXOSet::new(chains[1].clone()).snapshot().unwrap(),
            UTXOSet::new(chains[0].clone()).snapshot().unwrap()
        );
        assert!(seed.known_nodes().node_is_known(PEER));
        assert!(peer.blocks_in_transit().is_empty());
    }

    #[test]
    fn test_equal_heights_exchange_nothing() {
        let (chains, _wallet, _dir) = create_shared_chains(2).unwrap();
        let seed = NodeState::new(SEED, &seeds(), chains[0].clone(), None);
        let peer = NodeState::new(PEER, &seeds(), chains[1].clone(), None);

        let replies = seed.handle(peer.version_message().unwrap()).unwrap();
        assert!(replies.is_empty());
        assert!(seed.known_nodes().node_is_known(PEER));

        // a repeated handshake does not duplicate the peer
        seed.handle(peer.version_message().unwrap()).unwrap();
        assert_eq!(seed.known_nodes().len(), 2);
    }

    #[test]
    fn test_inv_requests_only_missing_blocks() {
        let (chains, wallet, _dir) = create_shared_chains(2).unwrap();
        let peer = NodeState::new(PEER, &seeds(), chains[1].clone(), None);
        mine_coinbase_block(&chains[0], &wallet.get_address()).unwrap();

        let replies = peer
            .handle(Package::Inv {
                addr_from: SEED.to_string(),
                kind: InvKind::Block,
                items: chains[0].get_block_hashes().unwrap(),
            })
            .unwrap();
        assert_eq!(
            replies,
            vec![NodeState::outbound(
                SEED,
                Package::GetData {
                    addr_from: PEER.to_string(),
                    kind: InvKind::Block,
                    id: chains[0].get_tip_hash(),
                }
            )]
        );
        assert!(peer.blocks_in_transit().is_empty());

        let known = peer
            .handle(Package::Inv {
                addr_from: SEED.to_string(),
                kind: InvKind::Block,
                items: chains[1].get_block_hashes().unwrap(),
            })
            .unwrap();
        assert!(known.is_empty());
    }

    #[test]
    fn test_miner_pools_relays_and_mines() {
        let (chains, first, _dir) = create_shared_chains(1).unwrap();
        let chain = &chains[0];
        let second = Wallet::new().unwrap();
        mine_coinbase_block(chain, &second.get_address()).unwrap();

        let miner_wallet = Wallet::new().unwrap();
        let miner = NodeState::new(
            SEED,
            &seeds(),
            chain.clone(),
            Some(miner_wallet.get_address()),
        );
        miner.known_nodes().add_node(PEER);

        let recipient = Wallet::new().unwrap();
        let utxo_set = UTXOSet::new(chain.clone());
        let tx1 = Transaction::new_utxo_transaction(&first, &recipient.get_address(), 5, &utxo_set)
            .unwrap();
        let tx2 =
            Transaction::new_utxo_transaction(&second, &recipient.get_address(), 7, &utxo_set)
                .unwrap();

        let out1 = miner
            .handle(Package::Tx {
                addr_from: WALLET_NODE.to_string(),
                transaction: tx1.clone(),
            })
            .unwrap();
        assert_eq!(out1.len(), 1);
        assert_eq!(out1[0].addr, PEER);
        assert!(matches!(out1[0].package, Package::Inv { kind: InvKind::Tx, .. }));
        assert_eq!(miner.mempool().len(), 1);
        assert_eq!(chain.get_best_height().unwrap(), 1);

        let out2 = miner
            .handle(Package::Tx {
                addr_from: WALLET_NODE.to_string(),
                transaction: tx2,
            })
            .unwrap();
        assert!(miner.mempool().is_empty());
        assert_eq!(chain.get_best_height().unwrap(), 2);
        assert_eq!(out2.len(), 2);
        assert_eq!(
            out2[1].package,
            Package::Inv {
                addr_from: SEED.to_string(),
                kind: InvKind::Block,
                items: vec![chain.get_tip_hash()],
            }
        );

        assert_eq!(
            utxo_set.get_balance(&hash_pub_key(recipient.get_public_key())).unwrap(),
            12
        );
        assert_eq!(
            utxo_set.get_balance(&hash_pub_key(miner_wallet.get_public_key())).unwrap(),
            SUBSIDY
        );

        // the same transaction arriving again is already spent
        let replay = miner
            .handle(Package::Tx {
                addr_from: WALLET_NODE.to_string(),
                transaction: tx1,
            })
            .unwrap();
        assert!(replay.is_empty());
        assert!(miner.mempool().is_empty());
    }

    #[test]
    fn test_non_miner_only_pools() {
        let (chains, wallet, _dir) = create_shared_chains(1).unwrap();
        let node = NodeState::new(SEED, &seeds(), chains[0].clone(), None);
        let second = Wallet::new().unwrap();
        mine_coinbase_block(&chains[0], &second.get_address()).unwrap();

        let utxo_set = UTXOSet::new(chains[0].clone());
        let to = Wallet::new().unwrap().get_address();
        for (signer, amount) in [(&wallet, 3), (&second, 4)] {
            let tx = Transaction::new_utxo_transaction(signer, &to, amount, &utxo_set).unwrap();
            node.handle(Package::Tx {
                addr_from: WALLET_NODE.to_string(),
                transaction: tx,
            })
            .unwrap();
        }
        assert_eq!(node.mempool().len(), 2);
        assert_eq!(chains[0].get_best_height().unwrap(), 1);

        // pooled transactions are served on request
        let pooled = node.mempool().get_all();
        let replies = node
            .handle(Package::GetData {
                addr_from: PEER.to_string(),
                kind: InvKind::Tx,
                id: pooled[0].get_id().to_vec(),
            })
            .unwrap();
        assert!(matches!(replies[0].package, Package::Tx { .. }));

        let wanted = node
            .handle(Package::Inv {
                addr_from: PEER.to_string(),
                kind: InvKind::Tx,
                items: vec![pooled[0].get_id().to_vec(), vec![9; 32]],
            })
            .unwrap();
        assert_eq!(wanted.len(), 1);
    }

    #[test]
    fn test_coinbase_from_peer_is_discarded() {
        let (chains, wallet, _dir) = create_shared_chains(1).unwrap();
        let node = NodeState::new(SEED, &seeds(), chains[0].clone(), None);
        let coinbase = Transaction::new_coinbase_tx(&wallet.get_address(), b"").unwrap();

        let replies = node
            .handle(Package::Tx {
                addr_from: PEER.to_string(),
                transaction: coinbase,
            })
            .unwrap();
        assert!(replies.is_empty());
        assert!(node.mempool().is_empty());
    }

    #[test]
    fn test_block_ahead_of_tip_triggers_resync() {
        let (chains, wallet, _dir) = create_shared_chains(2).unwrap();
        let seed = NodeState::new(SEED, &seeds(), chains[0].clone(), None);
        let peer = NodeState::new(PEER, &seeds(), chains[1].clone(), None);

        let b1 = mine_coinbase_block(&chains[0], &wallet.get_address()).unwrap();
        let b2 = mine_coinbase_block(&chains[0], &wallet.get_address()).unwrap();

        // announcements raced and the second block arrived first
        let replies = peer
            .handle(Package::Block {
                addr_from: SEED.to_string(),
                block: b2,
            })
            .unwrap();
        assert_eq!(
            replies,
            vec![NodeState::outbound(
                SEED,
                Package::GetBlocks {
                    addr_from: PEER.to_string(),
                }
            )]
        );
        assert_eq!(chains[1].get_best_height().unwrap(), 0);

        let late_first = NodeState::outbound(
            PEER,
            Package::Block {
                addr_from: SEED.to_string(),
                block: b1,
            },
        );
        let mut pending = vec![late_first];
        pending.extend(replies);
        route(&[&seed, &peer], pending);

        assert_eq!(chains[1].get_best_height().unwrap(), 2);
        assert_eq!(chains[1].get_tip_hash(), chains[0].get_tip_hash());
        assert_eq!(
            UTXOSet::new(chains[1].clone()).snapshot().unwrap(),
            UTXOSet::new(chains[0].clone()).snapshot().unwrap()
        );
    }

    #[test]
    fn test_invalid_block_is_discarded() {
        let (chains, wallet, _dir) = create_shared_chains(1).unwrap();
        let node = NodeState::new(SEED, &seeds(), chains[0].clone(), None);
        node.blocks_in_transit().set(vec![vec![1; 32]]);

        let coinbase = Transaction::new_coinbase_tx(&wallet.get_address(), b"").unwrap();
        let orphan = Block::new_block(&[5; 32], &[coinbase], 1, TEST_DIFFICULTY).unwrap();

        let replies = node
            .handle(Package::Block {
                addr_from: PEER.to_string(),
                block: orphan.clone(),
            })
            .unwrap();
        assert!(replies.is_empty());
        assert!(node.blocks_in_transit().is_empty());
        assert!(!chains[0].block_exists(orphan.get_hash()).unwrap());
        assert_eq!(chains[0].get_best_height().unwrap(), 0);
    }

    #[test]
    fn test_get_data_for_unknown_block() {
        let (chains, _wallet, _dir) = create_shared_chains(1).unwrap();
        let node = NodeState::new(SEED, &seeds(), chains[0].clone(), None);

        let missing = node
            .handle(Package::GetData {
                addr_from: PEER.to_string(),
                kind: InvKind::Block,
                id: vec![0; 32],
            })
            .unwrap();
        assert!(missing.is_empty());

        let found = node
            .handle(Package::GetData {
                addr_from: PEER.to_string(),
                kind: InvKind::Block,
                id: chains[0].get_tip_hash(),
            })
            .unwrap();
        assert!(matches!(found[0].package, Package::Block { .. }));
    }

    #[test]
    fn test_unreachable_peer_is_evicted() {
        let (chains, _wallet, _dir) = create_shared_chains(1).unwrap();
        let node = NodeState::new(SEED, &seeds(), chains[0].clone(), None);
        let unreachable = "127.0.0.1:1";
        node.known_nodes().add_node(unreachable);

        node.deliver(vec![NodeState::outbound(
            unreachable,
            Package::GetBlocks {
                addr_from: SEED.to_string(),
            },
        )]);
        assert!(!node.known_nodes().node_is_known(unreachable));
        assert!(node.known_nodes().node_is_known(SEED));
    }
}
