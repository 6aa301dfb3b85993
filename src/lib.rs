//! Scanner for large OP_RETURN payloads in Bitcoin blocks.
//!
//! Blocks come from a Bitcoin-core node over JSON-RPC. Each qualifying payload is sniffed for
//! its content type and persisted as files under `<output>/block_<n>/`, indexed in SQLite.

pub mod config;
pub mod content;
pub mod error;
pub mod fee;
pub mod maintenance;
pub mod miner;
pub mod model;
pub mod progress;
pub mod retry;
pub mod rpc;
pub mod scanner;
pub mod script;
pub mod stats;
pub mod store;
#[cfg(test)]
mod testing;

pub use error::{Error, Result};

use log::LevelFilter;
use std::io;
use std::io::{stdin, stdout, Write};
use std::path::Path;

pub trait EncodeHex {
    fn hex(&self) -> String;
}

impl<A> EncodeHex for A
where
    A: AsRef<[u8]>,
{
    fn hex(&self) -> String {
        hex::encode(self)
    }
}

pub fn set_up_logging(level: LevelFilter, file: Option<&Path>) -> anyhow::Result<()> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(io::stdout());
    if let Some(file) = file {
        dispatch = dispatch.chain(fern::log_file(file)?);
    }
    dispatch.apply()?;
    Ok(())
}

/// Asks a yes/no question on the terminal. Only "y" and "yes" count as yes.
pub fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{prompt} (yes/no): ");
    stdout().flush()?;
    let mut line = String::new();
    stdin().read_line(&mut line)?;
    Ok(matches!(
        line.trim().to_lowercase().as_str(),
        "y" | "yes"
    ))
}
