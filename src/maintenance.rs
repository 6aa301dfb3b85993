//! Maintenance over already-persisted data: reclassifying payloads with the current
//! detector, and rebuilding blocks from the node.

use crate::content::Classification;
use crate::error::{Error, Result};
use crate::model::ExtractedPayload;
use crate::progress::ProgressReporter;
use crate::rpc::BlockSource;
use crate::scanner::{BlockStatus, Scanner};
use crate::store::files::remove_if_exists;
use crate::store::{Database, PayloadStore};
use log::{error, info, warn};
use std::fs;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReinterpretReport {
    pub candidates: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Re-runs content detection on payloads stuck at one file type, typically the
/// `binary` fallback, without touching the node.
pub struct ReinterpretationJob<'a> {
    store: &'a PayloadStore,
}

impl<'a> ReinterpretationJob<'a> {
    pub fn new(store: &'a PayloadStore) -> Self {
        Self { store }
    }

    pub fn run(&self, file_type: &str) -> Result<ReinterpretReport> {
        let db = self
            .store
            .database()
            .ok_or(Error::DatabaseRequired("Reinterpretation"))?;
        let candidates = db.payloads_of_type(file_type)?;
        let mut report = ReinterpretReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            info!("No OP_RETURNs found with file type '{file_type}'");
            return Ok(report);
        }
        info!(
            "Reinterpreting {} OP_RETURN(s) with file type '{file_type}'",
            candidates.len()
        );

        for payload in &candidates {
            match self.reinterpret(db, payload, file_type) {
                Ok(true) => report.updated += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    error!(
                        "Error reinterpreting OP_RETURN {}:{}: {e}",
                        payload.txid, payload.vout_index
                    );
                    report.failed += 1;
                }
            }
        }
        info!(
            "Reinterpretation complete: {} updated, {} unchanged, {} failed",
            report.updated, report.unchanged, report.failed
        );
        Ok(report)
    }

    /// Returns whether the payload got a new type.
    fn reinterpret(&self, db: &Database, payload: &ExtractedPayload, current: &str) -> Result<bool> {
        let files = self.store.files();
        let (block, txid, vout) = (payload.block_number, &payload.txid, payload.vout_index);
        let mut metadata = files.read_metadata(block, txid, vout)?;

        // large payloads only have their hex on disk
        let stored_hex = match (&payload.raw_hex, &metadata) {
            (Some(x), _) => x,
            (None, Some(m)) => &m.raw_data_hex,
            (None, None) => {
                return Err(Error::PayloadDataMissing {
                    txid: txid.clone(),
                    vout_index: vout,
                })
            }
        };
        let data = hex::decode(stored_hex)?;
        let classification = Classification::of(&data);
        let Some(detected) = classification.detected.as_ref().filter(|x| x.ext != current) else {
            return Ok(false);
        };
        info!(
            "Block {block}, tx {}...: {current} -> {} ({}), {} bytes",
            &txid[..txid.len().min(16)],
            detected.ext,
            detected.mime,
            payload.data_size
        );

        if let Some(m) = metadata.as_mut() {
            m.file_type = detected.ext.clone();
            m.mime_type = detected.mime.clone();
            m.content_category = Some(classification.category());
            files.write_metadata(m)?;
        }

        let paths = files.paths(block, txid, vout);
        if classification.is_dangerous() {
            warn!("Executable type {}, no files are created for it", detected.ext);
            if remove_if_exists(&paths.raw())? {
                info!("Removed existing {}", paths.raw().display());
            }
        } else {
            let typed = paths.typed(&detected.ext);
            if !typed.exists() {
                fs::create_dir_all(paths.dir())?;
                fs::write(&typed, classification.file_bytes(&data))?;
                info!("Created {}", typed.display());
            }
        }

        db.update_file_type(txid, vout, &detected.ext, &detected.mime)?;
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescanTarget {
    /// Every block whose scan found at least one payload.
    WithFindings,
    Blocks(Vec<u64>),
}

/// What a rescan is about to delete, shown to the operator before confirming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescanPlan {
    pub blocks: Vec<u64>,
    pub payloads: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RescanReport {
    pub rescanned: u64,
    pub found: u64,
    pub failed: Vec<(u64, String)>,
    /// The operator declined the confirmation; nothing was deleted.
    pub declined: bool,
    pub cancelled: bool,
}

/// Deletes blocks' scan records (and their payloads) and scans them again through the
/// normal path.
pub struct RescanJob<'s, 'a, S: BlockSource> {
    scanner: &'s mut Scanner<'a, S>,
}

impl<'s, 'a, S: BlockSource> RescanJob<'s, 'a, S> {
    pub fn new(scanner: &'s mut Scanner<'a, S>) -> Self {
        Self { scanner }
    }

    pub fn plan(&self, target: &RescanTarget) -> Result<RescanPlan> {
        let db = self
            .scanner
            .store()
            .database()
            .ok_or(Error::DatabaseRequired("Rescan"))?;
        Ok(match target {
            RescanTarget::WithFindings => {
                let blocks = db.blocks_with_findings()?;
                RescanPlan {
                    payloads: blocks.iter().map(|x| x.1).sum(),
                    blocks: blocks.into_iter().map(|x| x.0).collect(),
                }
            }
            RescanTarget::Blocks(blocks) => {
                let mut payloads = 0;
                for &n in blocks {
                    payloads += db.scan_record(n)?.map_or(0, |x| x.large_payload_count);
                }
                RescanPlan {
                    blocks: blocks.clone(),
                    payloads,
                }
            }
        })
    }

    /// `confirm` is asked once, before anything is deleted.
    pub fn run(
        &mut self,
        target: &RescanTarget,
        confirm: impl FnOnce(&RescanPlan) -> bool,
    ) -> Result<RescanReport> {
        let plan = self.plan(target)?;
        let mut report = RescanReport::default();
        if plan.blocks.is_empty() {
            info!("No blocks to re-scan");
            return Ok(report);
        }
        info!(
            "Re-scan will delete and rebuild {} block(s) with {} OP_RETURN payload(s)",
            plan.blocks.len(),
            plan.payloads
        );
        if !confirm(&plan) {
            info!("Re-scan cancelled");
            report.declined = true;
            return Ok(report);
        }

        let config = self.scanner.config().progress.clone();
        let mut progress = ProgressReporter::new("Re-scan", plan.blocks.len() as u64, &config);
        for &n in &plan.blocks {
            if self.scanner.is_cancelled() {
                warn!("Re-scan cancelled before block {n}");
                report.cancelled = true;
                break;
            }
            let started = std::time::Instant::now();
            match self.rescan_block(n) {
                Ok(found) => {
                    report.rescanned += 1;
                    report.found += found;
                }
                Err(e) => report.failed.push((n, e)),
            }
            progress.record(n, started.elapsed());
        }
        info!(
            "Re-scan complete: {} block(s) re-scanned, {} payload(s) found, {} failed",
            report.rescanned,
            report.found,
            report.failed.len()
        );
        Ok(report)
    }

    fn rescan_block(&mut self, block_number: u64) -> std::result::Result<u64, String> {
        let deleted = self
            .scanner
            .store()
            .database()
            .ok_or_else(|| Error::DatabaseRequired("Rescan").to_string())
            .and_then(|db| db.delete_scan(block_number).map_err(|e| e.to_string()))
            .inspect_err(|e| error!("Error deleting block {block_number}: {e}"))?;
        if !deleted {
            info!("Block {block_number} had no scan record");
        }
        match self.scanner.scan_block(block_number, false) {
            BlockStatus::Scanned { payloads, .. } => Ok(payloads.len() as u64),
            BlockStatus::Failed(e) => Err(e),
            BlockStatus::Skipped => Ok(0),
        }
    }
}
