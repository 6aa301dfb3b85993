use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The node could not be reached at startup. This is the only error that aborts a run.
    #[error("Bitcoin-core RPC not available: {0}")]
    SourceUnavailable(String),
    #[error("RPC error: {0}")]
    Rpc(#[from] bitcoincore_rpc::Error),
    #[error("Block {0} not found")]
    BlockNotFound(u64),
    #[error("Malformed block data: {0}")]
    MalformedBlock(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("{0} requires the database (not available in metadata-only mode)")]
    DatabaseRequired(&'static str),
    #[error("No previous scans found, nothing to scan backwards from")]
    NoScanAnchor,
    #[error("No stored data for payload {txid}:{vout_index}")]
    PayloadDataMissing { txid: String, vout_index: u32 },
}
