//! Per-transaction cost metrics.

use crate::model::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxCost {
    /// Satoshis.
    pub fee: u64,
    /// Virtual size if the node reported it, raw size otherwise.
    pub size: u64,
    pub input_count: u64,
    pub output_count: u64,
}

impl TxCost {
    pub fn of(tx: &Transaction) -> Self {
        Self {
            fee: tx.fee.map_or(0, |x| x.to_sat().unsigned_abs()),
            size: tx.vsize.or(tx.size).unwrap_or(0),
            input_count: tx.inputs.len() as u64,
            output_count: tx.outputs.len() as u64,
        }
    }

    /// sat/vB
    pub fn fee_rate(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        self.fee as f64 / self.size as f64
    }

    /// Satoshis paid per byte of embedded payload.
    pub fn cost_per_byte(&self, payload_size: usize) -> f64 {
        if payload_size == 0 {
            return 0.0;
        }
        self.fee as f64 / payload_size as f64
    }
}
