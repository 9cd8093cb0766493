// API module
//
// HTTP surface for driving a node: chain queries, wallets, transactions,
// mining and peer management

pub mod handlers;
pub mod routes;

// Re-export main components for easier access
pub use routes::configure_routes;
