//! Domain types the scanner works on, independent of the node's JSON shapes.

use bitcoin::{Amount, SignedAmount};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub hash: String,
    pub height: u64,
    /// Unix seconds.
    pub time: i64,
    pub txs: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub txid: String,
    pub size: Option<u64>,
    pub vsize: Option<u64>,
    pub time: Option<i64>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Signed fee as reported by the node (negative in some RPC results).
    pub fee: Option<SignedAmount>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TxInput {
    Coinbase {
        script_hex: String,
    },
    Spend {
        txid: String,
        vout: u32,
        /// Resolved source output, when the node annotated the input.
        prevout: Option<Prevout>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prevout {
    pub value: Amount,
    pub addresses: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxOutput {
    pub n: u32,
    pub value: Amount,
    pub script_hex: String,
    pub addresses: BTreeSet<String>,
}

impl Transaction {
    pub fn coinbase_script(&self) -> Option<&str> {
        match self.inputs.first()? {
            TxInput::Coinbase { script_hex } => Some(script_hex),
            TxInput::Spend { .. } => None,
        }
    }
}

/// One row per scanned block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockScanRecord {
    pub block_number: u64,
    pub block_hash: String,
    pub block_time: i64,
    pub total_transactions: u64,
    pub large_payload_count: u64,
    pub mined_by: Option<String>,
    pub coinbase_text: Option<String>,
    pub scanned_at: i64,
}

/// One row per qualifying OP_RETURN output.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedPayload {
    pub block_number: u64,
    pub txid: String,
    pub vout_index: u32,
    pub data_size: u64,
    /// `None` for payloads above the inline limit; the sidecars hold the data.
    pub raw_hex: Option<String>,
    pub decoded_text: Option<String>,
    pub file_type: String,
    pub mime_type: String,
    pub is_text: bool,
    pub tx_fee: Option<u64>,
    pub tx_size: Option<u64>,
    pub fee_rate: Option<f64>,
    pub cost_per_byte: Option<f64>,
    pub input_count: Option<u64>,
    pub output_count: Option<u64>,
}
