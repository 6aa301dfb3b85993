//! Per-payload files under `<root>/block_<n>/`.
//!
//! For each payload, with base name `tx_<txid>_<vout>`:
//!
//! - `<base>_metadata.json`: always; carries the full hex dump
//! - `<base>_raw.bin`: the payload (or the decoded data-URI body)
//! - `<base>_decoded.txt`: when the payload is text
//! - `<base>.<ext>`: when a file type was detected
//!
//! Executable types only ever get the metadata file.

use crate::content::{Classification, ContentCategory};
use crate::error::Result;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Contents of `<base>_metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    pub block_number: u64,
    /// RFC 3339, UTC.
    pub block_time: String,
    pub mined_by: String,
    pub transaction_id: String,
    pub vout_index: u32,
    pub data_size: u64,
    pub file_type: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_category: Option<ContentCategory>,
    pub raw_data_hex: String,
    pub transaction_fee_sats: Option<u64>,
    pub transaction_size_vbytes: Option<u64>,
    pub fee_rate_sats_per_vbyte: Option<f64>,
    pub cost_per_byte_of_data: Option<f64>,
    pub tx_inputs: Option<u64>,
    pub tx_outputs: Option<u64>,
}

pub struct ArtifactPaths {
    dir: PathBuf,
    base: String,
}

impl ArtifactPaths {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> PathBuf {
        self.dir.join(format!("{}_metadata.json", self.base))
    }

    pub fn raw(&self) -> PathBuf {
        self.dir.join(format!("{}_raw.bin", self.base))
    }

    pub fn decoded(&self) -> PathBuf {
        self.dir.join(format!("{}_decoded.txt", self.base))
    }

    pub fn typed(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", self.base))
    }
}

#[derive(Debug, Clone)]
pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn block_dir(&self, block_number: u64) -> PathBuf {
        self.root.join(format!("block_{block_number}"))
    }

    pub fn paths(&self, block_number: u64, txid: &str, vout_index: u32) -> ArtifactPaths {
        ArtifactPaths {
            dir: self.block_dir(block_number),
            base: format!("tx_{txid}_{vout_index}"),
        }
    }

    /// Writes every artifact for one payload, metadata first. Returns the paths written.
    ///
    /// Existing files are overwritten, so writing the same payload twice is harmless.
    pub fn write_payload(
        &self,
        metadata: &PayloadMetadata,
        data: &[u8],
        classification: &Classification,
    ) -> Result<Vec<PathBuf>> {
        let paths = self.paths(
            metadata.block_number,
            &metadata.transaction_id,
            metadata.vout_index,
        );
        fs::create_dir_all(paths.dir())?;

        let mut written = vec![paths.metadata()];
        write_json(&written[0], metadata)?;

        if classification.is_dangerous() {
            warn!(
                "Executable payload ({}) in {}:{}, only the metadata file is kept",
                classification.file_type(),
                metadata.transaction_id,
                metadata.vout_index
            );
            return Ok(written);
        }

        let bytes = classification.file_bytes(data);
        written.push(paths.raw());
        fs::write(paths.raw(), bytes)?;

        if let Some(text) = &classification.text {
            written.push(paths.decoded());
            fs::write(paths.decoded(), text)?;
        }

        if let Some(detected) = &classification.detected {
            let typed = paths.typed(&detected.ext);
            fs::write(&typed, bytes)?;
            debug!("File saved: {} ({})", typed.display(), detected.mime);
            written.push(typed);
        }
        Ok(written)
    }

    /// `None` if the payload has no metadata file.
    pub fn read_metadata(
        &self,
        block_number: u64,
        txid: &str,
        vout_index: u32,
    ) -> Result<Option<PayloadMetadata>> {
        let path = self.paths(block_number, txid, vout_index).metadata();
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_metadata(&self, metadata: &PayloadMetadata) -> Result<()> {
        let paths = self.paths(
            metadata.block_number,
            &metadata.transaction_id,
            metadata.vout_index,
        );
        fs::create_dir_all(paths.dir())?;
        write_json(&paths.metadata(), metadata)
    }
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Removes `path` if present. Returns whether it existed.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
