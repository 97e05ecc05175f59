// Entry point for the ledger CLI. Configuration is resolved once here and
// every command gets it explicitly.
use clap::Parser;
use data_encoding::HEXLOWER;
use log::{error, info, LevelFilter};
use proof_ledger::{
    address_to_pub_key_hash, send_tx, validate_address, Blockchain, BlockchainError, Command,
    Config, Opt, ProofOfWork, Result, Server, Transaction, UTXOSet, Wallets,
};
use std::process;

fn main() {
    // Info by default, RUST_LOG still wins
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    if let Err(e) = run_command(opt.command, &config) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn require_address(address: &str) -> Result<()> {
    if validate_address(address) {
        Ok(())
    } else {
        Err(BlockchainError::InvalidAddress(address.to_string()))
    }
}

fn run_command(command: Command, config: &Config) -> Result<()> {
    match command {
        Command::Createblockchain { address } => {
            require_address(&address)?;
            let blockchain = Blockchain::create_blockchain(&address, config)?;
            UTXOSet::new(blockchain).reindex()?;
            println!("Done!");
        }
        Command::Createwallet => {
            let mut wallets = Wallets::load(config.wallet_path())?;
            let address = wallets.create_wallet()?;
            println!("Your new address: {address}")
        }
        Command::GetBalance { address } => {
            require_address(&address)?;
            let pub_key_hash = address_to_pub_key_hash(&address)?;
            let utxo_set = UTXOSet::new(Blockchain::new_blockchain(config)?);
            let balance = utxo_set.get_balance(&pub_key_hash)?;
            println!("Balance of {address}: {balance}");
        }
        Command::ListAddresses => {
            let wallets = Wallets::load(config.wallet_path())?;
            for address in wallets.get_addresses() {
                println!("{address}")
            }
        }
        Command::Send {
            from,
            to,
            amount,
            mine,
        } => {
            require_address(&from)?;
            require_address(&to)?;

            let wallets = Wallets::load(config.wallet_path())?;
            let wallet = wallets.get_wallet(&from).ok_or_else(|| {
                BlockchainError::Wallet(format!("No key for {from} in this node's wallet file"))
            })?;

            let blockchain = Blockchain::new_blockchain(config)?;
            let utxo_set = UTXOSet::new(blockchain.clone());
            let transaction = Transaction::new_utxo_transaction(wallet, &to, amount, &utxo_set)?;

            if mine {
                let coinbase_tx = Transaction::new_coinbase_tx(&from, b"")?;
                let block = blockchain.mine_block(&[coinbase_tx, transaction])?;
                utxo_set.update(&block)?;
                info!("Mined block {}", HEXLOWER.encode(block.get_hash()));
            } else {
                let seed = config
                    .seed_nodes
                    .first()
                    .ok_or_else(|| BlockchainError::Config("No seed node configured".to_string()))?;
                send_tx(&config.node_addr, seed, &transaction)?;
            }
            println!("Success!")
        }
        Command::Printchain => {
            let blockchain = Blockchain::new_blockchain(config)?;
            for block in blockchain.iterator()? {
                let block = block?;
                println!("============ Block {} ============", HEXLOWER.encode(block.get_hash()));
                println!("Height: {}", block.get_height());
                println!("Prev. block: {}", HEXLOWER.encode(block.get_pre_block_hash()));
                println!(
                    "PoW: {}",
                    ProofOfWork::validate(&block, blockchain.get_difficulty())?
                );
                for tx in block.get_transactions() {
                    println!("{tx}");
                }
                println!();
            }
        }
        Command::Reindexutxo => {
            let utxo_set = UTXOSet::new(Blockchain::new_blockchain(config)?);
            utxo_set.reindex()?;
            let count = utxo_set.count_transactions()?;
            println!("Done! There are {count} transactions in the UTXO set.");
        }
        Command::StartNode { miner } => {
            if let Some(addr) = &miner {
                require_address(addr)?;
                println!("Mining is on. Address to receive rewards: {addr}");
            }

            // a joining node starts from a copy of the seed's store, so both share a genesis
            let blockchain = Blockchain::new_blockchain(config)?;
            info!("Starting node {} at {}", config.node_id, config.node_addr);
            Server::new(config, blockchain, miner).run()?
        }
    }
    Ok(())
}
