//! Block-by-block OP_RETURN scanning.
//!
//! One block is fetched, parsed and persisted before the next one starts. A block that
//! already has a scan record is skipped; a block that fails is rolled back, logged and
//! left unscanned so it can be rescanned explicitly later.

use crate::config::ScanConfig;
use crate::content::Classification;
use crate::error::{Error, Result};
use crate::fee::TxCost;
use crate::miner;
use crate::model::{BlockScanRecord, ExtractedPayload};
use crate::progress::ProgressReporter;
use crate::rpc::BlockSource;
use crate::script::extract_op_return_hex;
use crate::store::{BlockOutcome, Finding, PayloadStore};
use bytesize::ByteSize;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Called after each committed block that produced files.
pub trait ArtifactObserver {
    fn on_new_artifacts(&mut self, block_number: u64, artifacts: &[PathBuf]);
}

pub struct LoggingObserver;

impl ArtifactObserver for LoggingObserver {
    fn on_new_artifacts(&mut self, block_number: u64, artifacts: &[PathBuf]) {
        info!(
            "Block {block_number}: {} new file(s) under {}",
            artifacts.len(),
            artifacts
                .first()
                .and_then(|x| x.parent())
                .map(|x| x.display().to_string())
                .unwrap_or_default()
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// `end` defaults to the current chain height.
    Range { start: u64, end: Option<u64> },
    /// From the block after the last scanned one. With nothing scanned yet, from
    /// `fallback_start`, or the chain tip if that is absent.
    Continue {
        fallback_start: Option<u64>,
        end: Option<u64>,
    },
    /// The `backfill_window` blocks before the first scanned one, newest first.
    Backwards,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
    pub descending: bool,
}

impl BlockRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn blocks(&self) -> Box<dyn Iterator<Item = u64>> {
        let range = self.start..=self.end;
        if self.descending {
            Box::new(range.rev())
        } else {
            Box::new(range)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockStatus {
    Skipped,
    Scanned {
        mined_by: Option<String>,
        payloads: Vec<ExtractedPayload>,
    },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundItem {
    pub block_number: u64,
    pub mined_by: String,
    pub data_size: u64,
    pub file_type: String,
    pub txid: String,
}

#[derive(Debug, Default)]
pub struct ScanSummary {
    pub range: Option<BlockRange>,
    pub scanned: u64,
    pub skipped: u64,
    pub found: Vec<FoundItem>,
    pub errors: Vec<(u64, String)>,
    pub cancelled: bool,
}

impl ScanSummary {
    fn add(&mut self, block_number: u64, status: BlockStatus) {
        match status {
            BlockStatus::Skipped => self.skipped += 1,
            BlockStatus::Scanned { mined_by, payloads } => {
                self.scanned += 1;
                self.found.extend(payloads.into_iter().map(|x| FoundItem {
                    block_number,
                    mined_by: mined_by.clone().unwrap_or_else(|| miner::UNKNOWN_POOL.into()),
                    data_size: x.data_size,
                    file_type: x.file_type,
                    txid: x.txid,
                }));
            }
            BlockStatus::Failed(e) => self.errors.push((block_number, e)),
        }
    }

    pub fn log(&self) {
        info!(
            "Scan {}: {} blocks scanned, {} skipped, {} failed, {} OP_RETURN payload(s) found",
            if self.cancelled { "cancelled" } else { "complete" },
            self.scanned,
            self.skipped,
            self.errors.len(),
            self.found.len()
        );
        if !self.found.is_empty() {
            info!(
                "{:<8} {:<20} {:<12} {:<10} Transaction ID",
                "Block", "Miner", "Size (bytes)", "Type"
            );
            for x in &self.found {
                info!(
                    "{:<8} {:<20} {:<12} {:<10} {}...",
                    x.block_number,
                    x.mined_by,
                    x.data_size,
                    x.file_type,
                    &x.txid[..x.txid.len().min(16)]
                );
            }
        }
        for (block, e) in &self.errors {
            warn!("Block {block} failed: {e}");
        }
    }
}

pub struct Scanner<'a, S: BlockSource> {
    source: &'a S,
    store: &'a mut PayloadStore,
    config: &'a ScanConfig,
    observer: Option<&'a mut dyn ArtifactObserver>,
    cancel: Arc<AtomicBool>,
}

impl<'a, S: BlockSource> Scanner<'a, S> {
    pub fn new(source: &'a S, store: &'a mut PayloadStore, config: &'a ScanConfig) -> Self {
        Self {
            source,
            store,
            config,
            observer: None,
            cancel: Default::default(),
        }
    }

    pub fn with_observer(mut self, observer: &'a mut dyn ArtifactObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &PayloadStore {
        &*self.store
    }

    pub fn source(&self) -> &S {
        self.source
    }

    pub fn config(&self) -> &ScanConfig {
        self.config
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Turns a mode into concrete block bounds. `None` means there is nothing to scan.
    pub fn resolve(&self, mode: ScanMode) -> Result<Option<BlockRange>> {
        let (start, end, descending) = match mode {
            ScanMode::Range { start, end } => (start, self.end_or_tip(end)?, false),
            ScanMode::Continue {
                fallback_start,
                end,
            } => {
                let db = self
                    .store
                    .database()
                    .ok_or(Error::DatabaseRequired("Auto-continue"))?;
                let start = match (db.last_scanned_block()?, fallback_start) {
                    (Some(last), _) => {
                        info!("Auto-continue from last scanned block: {last}");
                        last + 1
                    }
                    (None, Some(start)) => {
                        info!("No previous scans found, starting from block {start}");
                        start
                    }
                    (None, None) => {
                        let tip = self.source.chain_height()?;
                        info!("No previous scans found, starting from the chain tip {tip}");
                        tip
                    }
                };
                (start, self.end_or_tip(end)?, false)
            }
            ScanMode::Backwards => {
                let db = self
                    .store
                    .database()
                    .ok_or(Error::DatabaseRequired("Backwards scanning"))?;
                let first = db.first_scanned_block()?.ok_or(Error::NoScanAnchor)?;
                let Some(end) = first.checked_sub(1) else {
                    info!("First scanned block is the genesis block, nothing earlier to scan");
                    return Ok(None);
                };
                let start = end.saturating_sub(self.config.backfill_window);
                info!(
                    "Scanning backwards from first scanned block {first} ({} blocks)",
                    end - start + 1
                );
                (start, end, true)
            }
        };

        if start > end {
            info!("Nothing to scan: start {start} is past end {end}");
            return Ok(None);
        }
        Ok(Some(BlockRange {
            start,
            end,
            descending,
        }))
    }

    fn end_or_tip(&self, end: Option<u64>) -> Result<u64> {
        match end {
            Some(x) => Ok(x),
            None => self.source.chain_height(),
        }
    }

    pub fn run(&mut self, mode: ScanMode) -> Result<ScanSummary> {
        match self.resolve(mode)? {
            Some(range) => Ok(self.scan_range(range)),
            None => Ok(ScanSummary::default()),
        }
    }

    pub fn scan_range(&mut self, range: BlockRange) -> ScanSummary {
        info!(
            "Scanning blocks {} to {}{}, looking for OP_RETURN payloads > {} bytes",
            range.start,
            range.end,
            if range.descending { " (newest first)" } else { "" },
            self.config.min_payload_size
        );
        info!("Output directory: {}", self.store.files().root().display());

        let mut summary = ScanSummary {
            range: Some(range),
            ..Default::default()
        };
        let mut progress = ProgressReporter::new("Scan", range.len(), &self.config.progress);
        for n in range.blocks() {
            if self.is_cancelled() {
                warn!("Cancelled before block {n}");
                summary.cancelled = true;
                break;
            }
            let started = Instant::now();
            let status = self.scan_block(n, true);
            summary.add(n, status);
            progress.record(n, started.elapsed());
        }
        summary
    }

    /// Scans one block. Errors are logged and reported in the status, never propagated.
    pub fn scan_block(&mut self, block_number: u64, skip_if_scanned: bool) -> BlockStatus {
        if skip_if_scanned {
            match self.store.is_scanned(block_number) {
                Ok(true) => {
                    info!("Block {block_number} already scanned, skipping");
                    return BlockStatus::Skipped;
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Error scanning block {block_number}: {e}");
                    return BlockStatus::Failed(e.to_string());
                }
            }
        }

        match self.try_scan_block(block_number) {
            Ok((record, outcome)) => {
                if let Some(observer) = self.observer.as_deref_mut() {
                    if !outcome.artifacts.is_empty() {
                        observer.on_new_artifacts(block_number, &outcome.artifacts);
                    }
                }
                BlockStatus::Scanned {
                    mined_by: record.mined_by,
                    payloads: outcome.payloads,
                }
            }
            Err(e) => {
                error!("Error scanning block {block_number}: {e}");
                BlockStatus::Failed(e.to_string())
            }
        }
    }

    fn try_scan_block(&mut self, block_number: u64) -> Result<(BlockScanRecord, BlockOutcome)> {
        let block = self.source.block_at(block_number)?;
        if block.height != block_number {
            return Err(Error::MalformedBlock(format!(
                "asked for block {block_number}, got {}",
                block.height
            )));
        }

        let attribution = block.txs.first().and_then(miner::attribute);
        if let Some(x) = attribution.as_ref().filter(|x| x.is_known()) {
            info!("Block {block_number} mined by {}", x.pool);
        }
        let record = BlockScanRecord {
            block_number,
            block_hash: block.hash.clone(),
            block_time: block.time,
            total_transactions: block.txs.len() as u64,
            large_payload_count: 0,
            mined_by: attribution.as_ref().map(|x| x.pool.clone()),
            coinbase_text: attribution.map(|x| x.coinbase_text),
            scanned_at: chrono::Utc::now().timestamp(),
        };

        let min_size = self.config.min_payload_size;
        let mut writer = self.store.begin_block(&record)?;
        for tx in &block.txs {
            let cost = TxCost::of(tx);
            for output in &tx.outputs {
                let Some(data) = extract_op_return_hex(&output.script_hex) else {
                    continue;
                };
                if data.len() <= min_size {
                    continue;
                }
                let classification = Classification::of(&data);
                let payload = writer.persist(&Finding {
                    txid: &tx.txid,
                    vout_index: output.n,
                    data: &data,
                    classification: &classification,
                    cost: &cost,
                })?;
                info!(
                    "Found OP_RETURN in block {block_number}, tx {}, vout {}: {}, {}",
                    tx.txid,
                    output.n,
                    ByteSize(payload.data_size).to_string_as(true),
                    payload.file_type
                );
                if let (Some(fee), Some(rate), Some(per_byte)) =
                    (payload.tx_fee, payload.fee_rate, payload.cost_per_byte)
                {
                    info!("  Fee: {fee} sats ({rate:.2} sat/vB, {per_byte:.2} sats per payload byte)");
                }
            }
        }
        let outcome = writer.finish()?;
        Ok((record, outcome))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{ProgressConfig, ScanConfig};
    use crate::script::PushForm;
    use crate::store::{Database, FileSink};
    use crate::testing::{block, coinbase, op_return_script, tx, MemorySource};
    use hex_literal::hex;

    fn config() -> ScanConfig {
        ScanConfig {
            progress: ProgressConfig {
                every_blocks: 1,
                ..Default::default()
            },
            backfill_window: 5,
            ..Default::default()
        }
    }

    fn store(dir: &std::path::Path) -> PayloadStore {
        PayloadStore::new(
            Some(Database::open_in_memory().unwrap()),
            FileSink::new(dir),
            32_767,
        )
    }

    fn png_payload() -> Vec<u8> {
        let mut data = hex!("89504E470D0A1A0A").to_vec();
        data.extend_from_slice(&[0x42; 200]);
        data
    }

    /// Blocks 100..=104: 101 carries a PNG, a short push and a non-OP_RETURN output;
    /// 103 carries a text payload behind OP_PUSHDATA2.
    fn chain() -> MemorySource {
        let text = "Hello from the chain! ".repeat(20);
        MemorySource::new([
            block(100, vec![coinbase(100, "/ViaBTC/")]),
            block(
                101,
                vec![
                    coinbase(101, "/F2Pool/"),
                    tx(
                        &"a1".repeat(32),
                        &[
                            op_return_script(PushForm::PushData1, &png_payload()),
                            op_return_script(PushForm::Direct, &[0x55; 75]),
                            "0014".to_string() + &"22".repeat(20),
                        ],
                        5000,
                    ),
                ],
            ),
            block(102, vec![coinbase(102, "solo")]),
            block(
                103,
                vec![
                    coinbase(103, "/AntPool/"),
                    tx(
                        &"b2".repeat(32),
                        &[op_return_script(PushForm::PushData2, text.as_bytes())],
                        0,
                    ),
                ],
            ),
            block(104, vec![coinbase(104, "")]),
        ])
    }

    #[test]
    fn scans_range_and_persists_payloads() {
        let tmp = tempfile::tempdir().unwrap();
        let source = chain();
        let mut store = store(tmp.path());
        let config = config();
        let mut scanner = Scanner::new(&source, &mut store, &config);

        let summary = scanner
            .run(ScanMode::Range {
                start: 100,
                end: Some(104),
            })
            .unwrap();
        assert_eq!(summary.scanned, 5);
        assert!(summary.errors.is_empty());
        assert_eq!(
            summary
                .found
                .iter()
                .map(|x| (x.block_number, x.mined_by.as_str(), x.file_type.as_str()))
                .collect::<Vec<_>>(),
            [(101, "F2Pool", "png"), (103, "AntPool", "text")]
        );

        let db = store.database().unwrap();
        let record = db.scan_record(101).unwrap().unwrap();
        assert_eq!(record.large_payload_count, 1);
        assert_eq!(record.total_transactions, 2);
        assert_eq!(db.scan_record(102).unwrap().unwrap().mined_by.as_deref(), Some("Unknown"));

        let payloads = db.payloads_in_block(101).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].vout_index, 0);
        assert_eq!(payloads[0].data_size, 208);
        assert_eq!(payloads[0].tx_fee, Some(5000));
        assert_eq!(payloads[0].fee_rate, Some(20.0));

        let text = &db.payloads_in_block(103).unwrap()[0];
        assert!(text.is_text);
        assert_eq!(text.tx_fee, None);

        let paths = FileSink::new(tmp.path()).paths(101, &"a1".repeat(32), 0);
        assert!(paths.typed("png").exists());
        assert!(paths.metadata().exists());
    }

    #[test]
    fn payload_threshold_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let source = MemorySource::new([block(
            1,
            vec![
                coinbase(1, ""),
                tx(
                    &"c3".repeat(32),
                    &[
                        op_return_script(PushForm::PushData1, &[0xAA; 83]),
                        op_return_script(PushForm::PushData1, &[0xAA; 84]),
                    ],
                    1000,
                ),
            ],
        )]);
        let mut store = store(tmp.path());
        let config = config();
        let mut scanner = Scanner::new(&source, &mut store, &config);
        let BlockStatus::Scanned { payloads, .. } = scanner.scan_block(1, true) else {
            panic!("block should scan");
        };
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].vout_index, 1);
        assert_eq!(payloads[0].data_size, 84);
    }

    #[test]
    fn second_scan_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let source = chain();
        let mut store = store(tmp.path());
        let config = config();
        let mut scanner = Scanner::new(&source, &mut store, &config);

        assert!(matches!(scanner.scan_block(101, true), BlockStatus::Scanned { .. }));
        assert_eq!(scanner.scan_block(101, true), BlockStatus::Skipped);
        assert_eq!(source.fetches.get(), 1);

        let db = store.database().unwrap();
        assert_eq!(db.recent_scans(10).unwrap().len(), 1);
        assert_eq!(db.payloads_in_block(101).unwrap().len(), 1);
    }

    #[test]
    fn failed_block_is_rolled_back_and_run_continues() {
        let tmp = tempfile::tempdir().unwrap();
        let source = chain();
        source.fail_at(101);
        let mut store = store(tmp.path());
        let config = config();
        let mut scanner = Scanner::new(&source, &mut store, &config);

        let summary = scanner
            .run(ScanMode::Range {
                start: 100,
                end: None,
            })
            .unwrap();
        assert_eq!(summary.scanned, 4);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].0, 101);
        assert!(!store.is_scanned(101).unwrap());
        assert!(store.is_scanned(102).unwrap());
    }

    #[test]
    fn continue_and_backwards_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let source = chain();
        let mut store = store(tmp.path());
        let config = config();
        let mut scanner = Scanner::new(&source, &mut store, &config);

        assert!(matches!(
            scanner.resolve(ScanMode::Backwards),
            Err(Error::NoScanAnchor)
        ));
        let range = scanner
            .resolve(ScanMode::Continue {
                fallback_start: Some(102),
                end: None,
            })
            .unwrap()
            .unwrap();
        assert_eq!((range.start, range.end), (102, 104));
        scanner.scan_range(range);

        // everything up to the tip is done
        assert_eq!(
            scanner
                .resolve(ScanMode::Continue {
                    fallback_start: None,
                    end: None,
                })
                .unwrap(),
            None
        );

        let range = scanner.resolve(ScanMode::Backwards).unwrap().unwrap();
        assert_eq!(
            range,
            BlockRange {
                start: 96,
                end: 101,
                descending: true
            }
        );
        assert_eq!(range.blocks().take(2).collect::<Vec<_>>(), [101, 100]);
    }

    #[test]
    fn backwards_from_genesis_has_nothing_to_do() {
        let tmp = tempfile::tempdir().unwrap();
        let source = MemorySource::new([block(0, vec![coinbase(0, "")])]);
        let mut store = store(tmp.path());
        let config = config();
        let mut scanner = Scanner::new(&source, &mut store, &config);
        scanner.scan_block(0, true);
        assert_eq!(scanner.resolve(ScanMode::Backwards).unwrap(), None);
    }

    #[test]
    fn metadata_only_mode_writes_files_without_checkpoints() {
        let tmp = tempfile::tempdir().unwrap();
        let source = chain();
        let mut store = PayloadStore::new(None, FileSink::new(tmp.path()), 32_767);
        let config = config();
        let mut scanner = Scanner::new(&source, &mut store, &config);

        assert!(matches!(
            scanner.resolve(ScanMode::Continue {
                fallback_start: None,
                end: None
            }),
            Err(Error::DatabaseRequired(_))
        ));
        let summary = scanner
            .run(ScanMode::Range {
                start: 101,
                end: Some(101),
            })
            .unwrap();
        assert_eq!(summary.found.len(), 1);
        // no database, no idempotency skip
        assert!(matches!(scanner.scan_block(101, true), BlockStatus::Scanned { .. }));
        assert!(FileSink::new(tmp.path())
            .read_metadata(101, &"a1".repeat(32), 0)
            .unwrap()
            .is_some());
    }

    #[derive(Default)]
    struct Recorder(Vec<(u64, usize)>);

    impl ArtifactObserver for Recorder {
        fn on_new_artifacts(&mut self, block_number: u64, artifacts: &[PathBuf]) {
            self.0.push((block_number, artifacts.len()));
        }
    }

    #[test]
    fn observer_sees_committed_blocks_only() {
        let tmp = tempfile::tempdir().unwrap();
        let source = chain();
        let mut store = store(tmp.path());
        let config = config();
        let mut recorder = Recorder::default();
        let mut scanner = Scanner::new(&source, &mut store, &config).with_observer(&mut recorder);
        scanner
            .run(ScanMode::Range {
                start: 100,
                end: Some(104),
            })
            .unwrap();
        // png: metadata, raw, typed; text: metadata, raw, decoded
        assert_eq!(recorder.0, [(101, 3), (103, 3)]);
    }

    #[test]
    fn cancellation_stops_between_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        let source = chain();
        let mut store = store(tmp.path());
        let config = config();
        let cancel = Arc::new(AtomicBool::new(true));
        let mut scanner = Scanner::new(&source, &mut store, &config).with_cancel(cancel);
        let summary = scanner
            .run(ScanMode::Range {
                start: 100,
                end: Some(104),
            })
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.scanned, 0);
    }
}
