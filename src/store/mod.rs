//! Hybrid persistence: a SQLite index plus per-payload files on disk.
//!
//! The files are the long-term record. Payloads above the inline limit have their hex and
//! text columns left NULL in the database and live only on disk.

pub mod db;
pub mod files;

pub use db::Database;
pub use files::{ArtifactPaths, FileSink, PayloadMetadata};

use crate::config::ScanConfig;
use crate::content::Classification;
use crate::error::Result;
use crate::fee::TxCost;
use crate::miner::UNKNOWN_POOL;
use crate::model::{BlockScanRecord, ExtractedPayload};
use crate::EncodeHex;
use chrono::DateTime;
use std::path::PathBuf;

pub struct PayloadStore {
    db: Option<Database>,
    files: FileSink,
    inline_limit: usize,
}

impl PayloadStore {
    pub fn new(db: Option<Database>, files: FileSink, inline_limit: usize) -> Self {
        Self {
            db,
            files,
            inline_limit,
        }
    }

    pub fn open(config: &ScanConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.output_dir)?;
        let db = config.db_path.as_ref().map(Database::open).transpose()?;
        Ok(Self::new(
            db,
            FileSink::new(&config.output_dir),
            config.db_inline_limit,
        ))
    }

    /// `None` in metadata-only mode.
    pub fn database(&self) -> Option<&Database> {
        self.db.as_ref()
    }

    pub fn files(&self) -> &FileSink {
        &self.files
    }

    /// Always `false` without a database: metadata-only runs have no checkpoint.
    pub fn is_scanned(&self, block_number: u64) -> Result<bool> {
        match &self.db {
            Some(db) => db.is_scanned(block_number),
            None => Ok(false),
        }
    }

    /// Opens the per-block unit of work and records the block with a zero count.
    ///
    /// Nothing reaches the database unless [`BlockWriter::finish`] is called.
    pub fn begin_block(&mut self, record: &BlockScanRecord) -> Result<BlockWriter<'_>> {
        let (tx, scan_id) = match &mut self.db {
            Some(db) => {
                let tx = db.transaction()?;
                let scan_id = db::insert_scan(&tx, record)?;
                (Some(tx), Some(scan_id))
            }
            None => (None, None),
        };
        Ok(BlockWriter {
            tx,
            scan_id,
            files: &self.files,
            inline_limit: self.inline_limit,
            block_number: record.block_number,
            block_time: block_time_rfc3339(record.block_time),
            mined_by: record
                .mined_by
                .clone()
                .unwrap_or_else(|| UNKNOWN_POOL.into()),
            payloads: Vec::new(),
            artifacts: Vec::new(),
        })
    }
}

pub fn block_time_rfc3339(unix_secs: i64) -> String {
    DateTime::from_timestamp(unix_secs, 0)
        .map(|x| x.to_rfc3339())
        .unwrap_or_else(|| unix_secs.to_string())
}

/// Zero means "no data" for the fee columns.
fn non_zero<T: Default + PartialOrd>(x: T) -> Option<T> {
    (x > T::default()).then_some(x)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// One payload found in a block, ready to persist.
pub struct Finding<'a> {
    pub txid: &'a str,
    pub vout_index: u32,
    pub data: &'a [u8],
    pub classification: &'a Classification,
    pub cost: &'a TxCost,
}

pub struct BlockWriter<'a> {
    tx: Option<rusqlite::Transaction<'a>>,
    scan_id: Option<i64>,
    files: &'a FileSink,
    inline_limit: usize,
    block_number: u64,
    block_time: String,
    mined_by: String,
    payloads: Vec<ExtractedPayload>,
    artifacts: Vec<PathBuf>,
}

/// What a committed block produced.
#[derive(Debug, Default)]
pub struct BlockOutcome {
    pub payloads: Vec<ExtractedPayload>,
    pub artifacts: Vec<PathBuf>,
}

impl BlockWriter<'_> {
    /// Files first, then the database row.
    pub fn persist(&mut self, finding: &Finding) -> Result<&ExtractedPayload> {
        let Finding {
            txid,
            vout_index,
            data,
            classification,
            cost,
        } = *finding;
        let hex = data.hex();
        let inline = data.len() <= self.inline_limit;
        let fee_rate = cost.fee_rate();
        let cost_per_byte = cost.cost_per_byte(data.len());

        let metadata = PayloadMetadata {
            block_number: self.block_number,
            block_time: self.block_time.clone(),
            mined_by: self.mined_by.clone(),
            transaction_id: txid.into(),
            vout_index,
            data_size: data.len() as u64,
            file_type: classification.file_type().into(),
            mime_type: classification.mime_type().into(),
            content_category: Some(classification.category()),
            raw_data_hex: hex.clone(),
            transaction_fee_sats: non_zero(cost.fee),
            transaction_size_vbytes: non_zero(cost.size),
            fee_rate_sats_per_vbyte: non_zero(fee_rate).map(round2),
            cost_per_byte_of_data: non_zero(cost_per_byte).map(round2),
            tx_inputs: non_zero(cost.input_count),
            tx_outputs: non_zero(cost.output_count),
        };
        let written = self.files.write_payload(&metadata, data, classification)?;

        let payload = ExtractedPayload {
            block_number: self.block_number,
            txid: txid.into(),
            vout_index,
            data_size: data.len() as u64,
            raw_hex: inline.then_some(hex),
            decoded_text: classification.text.clone().filter(|_| inline),
            file_type: metadata.file_type,
            mime_type: metadata.mime_type,
            is_text: classification.is_text(),
            tx_fee: metadata.transaction_fee_sats,
            tx_size: metadata.transaction_size_vbytes,
            fee_rate: non_zero(fee_rate),
            cost_per_byte: non_zero(cost_per_byte),
            input_count: metadata.tx_inputs,
            output_count: metadata.tx_outputs,
        };
        if let (Some(tx), Some(scan_id)) = (&self.tx, self.scan_id) {
            db::insert_payload(tx, scan_id, &payload, chrono::Utc::now().timestamp())?;
        }

        self.artifacts.extend(written);
        self.payloads.push(payload);
        Ok(&self.payloads[self.payloads.len() - 1])
    }

    pub fn found(&self) -> u64 {
        self.payloads.len() as u64
    }

    /// Writes the final count and commits. Dropping the writer instead rolls the block back.
    pub fn finish(self) -> Result<BlockOutcome> {
        if let (Some(tx), Some(scan_id)) = (self.tx, self.scan_id) {
            db::set_found_count(&tx, scan_id, self.payloads.len() as u64)?;
            tx.commit()?;
        }
        Ok(BlockOutcome {
            payloads: self.payloads,
            artifacts: self.artifacts,
        })
    }
}
