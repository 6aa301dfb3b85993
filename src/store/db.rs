//! SQLite index of scanned blocks and their payloads.

use crate::error::Result;
use crate::model::{BlockScanRecord, ExtractedPayload};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;

const SCHEMA: &str = r#"create table if not exists op_return_scans
(
    id                     integer primary key autoincrement,
    block_number           integer not null unique,
    block_hash             text    not null,
    block_time             integer not null,
    total_transactions     integer not null,
    large_op_returns_found integer not null default 0,
    mined_by               text,
    coinbase_text          text,
    scanned_at             integer not null
);
create index if not exists idx_scans_mined_by on op_return_scans (mined_by);

create table if not exists large_op_returns
(
    id              integer primary key autoincrement,
    scan_id         integer not null references op_return_scans (id) on delete cascade,
    block_number    integer not null,
    txid            text    not null,
    vout_index      integer not null,
    data_size       integer not null,
    raw_data        text,
    decoded_text    text,
    file_type       text    not null,
    mime_type       text    not null,
    is_text         integer not null,
    tx_fee          integer,
    tx_size         integer,
    fee_rate        real,
    cost_per_byte   real,
    tx_input_count  integer,
    tx_output_count integer,
    created_at      integer not null,
    unique (txid, vout_index)
);
create index if not exists idx_payloads_block on large_op_returns (block_number);
create index if not exists idx_payloads_file_type on large_op_returns (file_type);
create index if not exists idx_payloads_fee_rate on large_op_returns (fee_rate);"#;

pub(crate) const SCAN_COLUMNS: &str = "block_number, block_hash, block_time, total_transactions, \
    large_op_returns_found, mined_by, coinbase_text, scanned_at";

pub(crate) const PAYLOAD_COLUMNS: &str = "block_number, txid, vout_index, data_size, raw_data, \
    decoded_text, file_type, mime_type, is_text, tx_fee, tx_size, fee_rate, cost_per_byte, \
    tx_input_count, tx_output_count";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn transaction(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }

    pub fn is_scanned(&self, block_number: u64) -> Result<bool> {
        let count = self.conn.query_row(
            "select count(*) from op_return_scans where block_number = ?",
            params![block_number],
            |r| r.get::<_, u64>(0),
        )?;
        Ok(count > 0)
    }

    pub fn last_scanned_block(&self) -> Result<Option<u64>> {
        Ok(self.conn.query_row(
            "select max(block_number) from op_return_scans",
            params![],
            |r| r.get(0),
        )?)
    }

    pub fn first_scanned_block(&self) -> Result<Option<u64>> {
        Ok(self.conn.query_row(
            "select min(block_number) from op_return_scans",
            params![],
            |r| r.get(0),
        )?)
    }

    pub fn scan_record(&self, block_number: u64) -> Result<Option<BlockScanRecord>> {
        Ok(self
            .conn
            .query_row(
                &format!("select {SCAN_COLUMNS} from op_return_scans where block_number = ?"),
                params![block_number],
                scan_from_row,
            )
            .optional()?)
    }

    /// Most recently scanned blocks first.
    pub fn recent_scans(&self, limit: u64) -> Result<Vec<BlockScanRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "select {SCAN_COLUMNS} from op_return_scans order by block_number desc limit ?"
        ))?;
        let rows = stmt.query_map(params![limit], scan_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Block numbers whose scan found at least one payload, ascending.
    pub fn blocks_with_findings(&self) -> Result<Vec<(u64, u64)>> {
        let mut stmt = self.conn.prepare(
            "select block_number, large_op_returns_found from op_return_scans
            where large_op_returns_found > 0 order by block_number",
        )?;
        let rows = stmt.query_map(params![], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Deletes a block's scan record; its payload rows go with it. Returns whether a record existed.
    pub fn delete_scan(&self, block_number: u64) -> Result<bool> {
        let deleted = self.conn.execute(
            "delete from op_return_scans where block_number = ?",
            params![block_number],
        )?;
        Ok(deleted > 0)
    }

    pub fn payloads_in_block(&self, block_number: u64) -> Result<Vec<ExtractedPayload>> {
        self.query_payloads(
            "where block_number = ? order by txid, vout_index",
            params![block_number],
        )
    }

    pub fn payloads_of_type(&self, file_type: &str) -> Result<Vec<ExtractedPayload>> {
        self.query_payloads(
            "where file_type = ? order by block_number, txid, vout_index",
            params![file_type],
        )
    }

    pub fn search_txid(&self, fragment: &str) -> Result<Vec<ExtractedPayload>> {
        self.query_payloads(
            "where txid like '%' || ? || '%' order by block_number, vout_index",
            params![fragment],
        )
    }

    /// Payloads with `min <= data_size <= max`, largest first.
    pub fn payloads_by_size(&self, min: u64, max: Option<u64>) -> Result<Vec<ExtractedPayload>> {
        self.query_payloads(
            "where data_size >= ? and (? is null or data_size <= ?)
            order by data_size desc, block_number",
            params![min, max, max],
        )
    }

    fn query_payloads(
        &self,
        clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ExtractedPayload>> {
        let mut stmt = self
            .conn
            .prepare(&format!("select {PAYLOAD_COLUMNS} from large_op_returns {clause}"))?;
        let rows = stmt.query_map(params, payload_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Returns whether the row existed.
    pub fn update_file_type(
        &self,
        txid: &str,
        vout_index: u32,
        file_type: &str,
        mime_type: &str,
    ) -> Result<bool> {
        let updated = self.conn.execute(
            "update large_op_returns set file_type = ?, mime_type = ? where txid = ? and vout_index = ?",
            params![file_type, mime_type, txid, vout_index],
        )?;
        Ok(updated > 0)
    }
}

pub(crate) fn insert_scan(conn: &Connection, record: &BlockScanRecord) -> Result<i64> {
    conn.execute(
        &format!("insert into op_return_scans ({SCAN_COLUMNS}) values (?, ?, ?, ?, ?, ?, ?, ?)"),
        params![
            record.block_number,
            record.block_hash,
            record.block_time,
            record.total_transactions,
            record.large_payload_count,
            record.mined_by,
            record.coinbase_text,
            record.scanned_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn set_found_count(conn: &Connection, scan_id: i64, count: u64) -> Result<()> {
    conn.execute(
        "update op_return_scans set large_op_returns_found = ? where id = ?",
        params![count, scan_id],
    )?;
    Ok(())
}

pub(crate) fn insert_payload(
    conn: &Connection,
    scan_id: i64,
    payload: &ExtractedPayload,
    created_at: i64,
) -> Result<()> {
    let mut stmt = conn.prepare_cached(&format!(
        "insert into large_op_returns (scan_id, created_at, {PAYLOAD_COLUMNS})
        values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))?;
    stmt.execute(params![
        scan_id,
        created_at,
        payload.block_number,
        payload.txid,
        payload.vout_index,
        payload.data_size,
        payload.raw_hex,
        payload.decoded_text,
        payload.file_type,
        payload.mime_type,
        payload.is_text,
        payload.tx_fee,
        payload.tx_size,
        payload.fee_rate,
        payload.cost_per_byte,
        payload.input_count,
        payload.output_count,
    ])?;
    Ok(())
}

fn scan_from_row(r: &Row) -> rusqlite::Result<BlockScanRecord> {
    Ok(BlockScanRecord {
        block_number: r.get(0)?,
        block_hash: r.get(1)?,
        block_time: r.get(2)?,
        total_transactions: r.get(3)?,
        large_payload_count: r.get(4)?,
        mined_by: r.get(5)?,
        coinbase_text: r.get(6)?,
        scanned_at: r.get(7)?,
    })
}

fn payload_from_row(r: &Row) -> rusqlite::Result<ExtractedPayload> {
    Ok(ExtractedPayload {
        block_number: r.get(0)?,
        txid: r.get(1)?,
        vout_index: r.get(2)?,
        data_size: r.get(3)?,
        raw_hex: r.get(4)?,
        decoded_text: r.get(5)?,
        file_type: r.get(6)?,
        mime_type: r.get(7)?,
        is_text: r.get(8)?,
        tx_fee: r.get(9)?,
        tx_size: r.get(10)?,
        fee_rate: r.get(11)?,
        cost_per_byte: r.get(12)?,
        input_count: r.get(13)?,
        output_count: r.get(14)?,
    })
}
