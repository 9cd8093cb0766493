use actix_web::{web, HttpResponse, Responder};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::blockchain::{Address, Block, BlockchainError, Transaction, Wallet};
use crate::network::{NetworkError, P2PServer};

/// Handle to the running node
pub type NodeData = web::Data<P2PServer>;

/// Response for the chain endpoint
#[derive(Serialize, Deserialize)]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The blocks in the chain
    pub chain: Vec<Block>,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Request for the transaction endpoint
#[derive(Serialize, Deserialize)]
pub struct TransactionRequest {
    /// The sender's address
    pub sender: String,

    /// The recipient's address
    pub recipient: String,

    /// The amount to transfer
    pub amount: f64,

    /// The sender's private key (hex, for signing)
    pub private_key: String,
}

/// Response for the transaction endpoint
#[derive(Serialize, Deserialize)]
pub struct TransactionResponse {
    pub message: String,

    /// The signed transaction as it entered the pending pool
    pub transaction: Transaction,
}

/// Request for the mine endpoint
#[derive(Serialize, Deserialize)]
pub struct MineRequest {
    /// The miner's address
    pub miner_address: String,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize)]
pub struct MineResponse {
    pub message: String,

    /// The newly mined block
    pub block: Block,
}

/// Response for the create wallet endpoint
#[derive(Serialize, Deserialize)]
pub struct WalletResponse {
    /// The wallet's address
    pub address: String,

    /// The wallet's private key (hex encoded)
    pub private_key: String,
}

#[derive(Serialize, Deserialize)]
pub struct BalanceResponse {
    pub address: String,
    pub balance: f64,
}

#[derive(Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Peer listen address, `host:port`
    pub address: String,
}

fn error_body(message: String) -> serde_json::Value {
    serde_json::json!({ "error": message })
}

fn blockchain_error_response(context: &str, err: &BlockchainError) -> HttpResponse {
    let body = error_body(format!("{}: {}", context, err));
    match err {
        BlockchainError::StaleBlock { .. } => HttpResponse::Conflict().json(body),
        BlockchainError::MiningAborted => HttpResponse::ServiceUnavailable().json(body),
        BlockchainError::StorageError(_)
        | BlockchainError::ChainCorruption(_)
        | BlockchainError::SystemError(_) => HttpResponse::InternalServerError().json(body),
        _ => HttpResponse::BadRequest().json(body),
    }
}

fn network_error_response(context: &str, err: &NetworkError) -> HttpResponse {
    match err {
        NetworkError::BlockchainError(inner) => blockchain_error_response(context, inner),
        NetworkError::IoError(_) | NetworkError::ConnectTimeout(_) => {
            HttpResponse::BadGateway().json(error_body(format!("{}: {}", context, err)))
        }
        _ => HttpResponse::InternalServerError().json(error_body(format!("{}: {}", context, err))),
    }
}

fn parse_address(raw: &str) -> Result<Address, HttpResponse> {
    raw.parse::<Address>().map_err(|err| {
        HttpResponse::BadRequest().json(error_body(format!("Invalid address {}: {}", raw, err)))
    })
}

/// Get the full blockchain and its validity
pub async fn get_chain(node: NodeData) -> impl Responder {
    let blockchain = node.blockchain().read().await;
    let chain = blockchain.chain().to_vec();

    let response = ChainResponse {
        length: chain.len(),
        is_valid: blockchain.is_valid(),
        chain,
    };

    HttpResponse::Ok().json(response)
}

/// Get all transactions waiting to be included in a block
pub async fn get_pending_transactions(node: NodeData) -> impl Responder {
    let transactions = node.blockchain().read().await.pending_transactions().to_vec();
    HttpResponse::Ok().json(transactions)
}

/// Create, sign and submit a transaction
///
/// The private key must belong to the sender.
pub async fn new_transaction(
    node: NodeData,
    transaction_req: web::Json<TransactionRequest>,
) -> impl Responder {
    let sender_address = match parse_address(&transaction_req.sender) {
        Ok(address) => address,
        Err(response) => return response,
    };
    let recipient_address = match parse_address(&transaction_req.recipient) {
        Ok(address) => address,
        Err(response) => return response,
    };

    let wallet = match Wallet::from_hex(&transaction_req.private_key) {
        Ok(wallet) => wallet,
        Err(err) => {
            return HttpResponse::BadRequest()
                .json(error_body(format!("Invalid private key: {}", err)));
        }
    };

    if wallet.address() != &sender_address {
        return HttpResponse::BadRequest().json(error_body(
            "Private key does not match sender address".to_string(),
        ));
    }

    let mut transaction = Transaction::new(sender_address, recipient_address, transaction_req.amount);
    if let Err(err) = transaction.sign(&wallet) {
        return HttpResponse::BadRequest()
            .json(error_body(format!("Failed to sign transaction: {}", err)));
    }

    match node.submit_transaction(transaction.clone()).await {
        Ok(()) => HttpResponse::Created().json(TransactionResponse {
            message: "Transaction will be added to the next block".to_string(),
            transaction,
        }),
        Err(err) => network_error_response("Failed to add transaction", &err),
    }
}

/// Mine the pending transactions into a new block and gossip it
pub async fn mine_block(node: NodeData, mine_req: web::Json<MineRequest>) -> impl Responder {
    let miner_address = match parse_address(&mine_req.miner_address) {
        Ok(address) => address,
        Err(response) => return response,
    };

    match node.mine_and_broadcast(&miner_address).await {
        Ok(block) => HttpResponse::Ok().json(MineResponse {
            message: "New Block Mined".to_string(),
            block,
        }),
        Err(err) => {
            warn!("Mining for {} failed: {}", miner_address, err);
            network_error_response("Failed to mine block", &err)
        }
    }
}

/// Validate the entire local chain
pub async fn validate_chain(node: NodeData) -> impl Responder {
    let is_valid = node.blockchain().read().await.is_valid();
    HttpResponse::Ok().json(is_valid)
}

/// Create a wallet with a random keypair
///
/// The private key is not kept by the node; the caller must store it.
pub async fn create_wallet() -> impl Responder {
    let wallet = Wallet::new();

    HttpResponse::Created().json(WalletResponse {
        address: wallet.address().to_string(),
        private_key: hex::encode(wallet.export_secret_key()),
    })
}

pub async fn get_wallet_balance(node: NodeData, address: web::Path<String>) -> impl Responder {
    let wallet_address = match parse_address(&address) {
        Ok(address) => address,
        Err(response) => return response,
    };

    let balance = node.blockchain().balance_of(&wallet_address).await;

    HttpResponse::Ok().json(BalanceResponse {
        address: wallet_address.0,
        balance,
    })
}

/// Transactions sent or received by an address, oldest first
pub async fn get_wallet_transactions(
    node: NodeData,
    address: web::Path<String>,
) -> impl Responder {
    let wallet_address = match parse_address(&address) {
        Ok(address) => address,
        Err(response) => return response,
    };

    let transactions = node.blockchain().read().await.transactions_for(&wallet_address);
    HttpResponse::Ok().json(transactions)
}

pub async fn get_peers(node: NodeData) -> impl Responder {
    match node.peers().await {
        Ok(peers) => HttpResponse::Ok().json(peers),
        Err(err) => network_error_response("Failed to list peers", &err),
    }
}

/// Dial a peer by its listen address
pub async fn connect_peer(node: NodeData, connect_req: web::Json<ConnectRequest>) -> impl Responder {
    match node.connect(connect_req.address.clone()).await {
        Ok(connected) => HttpResponse::Ok().json(serde_json::json!({
            "address": connect_req.address,
            "connected": connected
        })),
        Err(err) => network_error_response("Failed to connect", &err),
    }
}
