//! In-memory chain for scanner and maintenance tests.

use crate::error::{Error, Result};
use crate::model::{Block, Transaction, TxInput, TxOutput};
use crate::rpc::BlockSource;
use crate::script::PushForm;
use bitcoin::{Amount, SignedAmount};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::io;

#[derive(Default)]
pub struct MemorySource {
    blocks: BTreeMap<u64, Block>,
    failing: RefCell<HashSet<u64>>,
    pub fetches: Cell<usize>,
}

impl MemorySource {
    pub fn new(blocks: impl IntoIterator<Item = Block>) -> Self {
        Self {
            blocks: blocks.into_iter().map(|x| (x.height, x)).collect(),
            ..Default::default()
        }
    }

    /// Fetching `height` times out until [`MemorySource::heal`] is called.
    pub fn fail_at(&self, height: u64) {
        self.failing.borrow_mut().insert(height);
    }

    pub fn heal(&self, height: u64) {
        self.failing.borrow_mut().remove(&height);
    }
}

impl BlockSource for MemorySource {
    fn chain_height(&self) -> Result<u64> {
        Ok(self.blocks.keys().next_back().copied().unwrap_or(0))
    }

    fn block_hash(&self, height: u64) -> Result<String> {
        self.blocks
            .get(&height)
            .map(|x| x.hash.clone())
            .ok_or(Error::BlockNotFound(height))
    }

    fn block(&self, hash: &str) -> Result<Block> {
        let block = self
            .blocks
            .values()
            .find(|x| x.hash == hash)
            .ok_or_else(|| Error::MalformedBlock(format!("unknown hash {hash}")))?;
        if self.failing.borrow().contains(&block.height) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "getblock timed out").into());
        }
        self.fetches.set(self.fetches.get() + 1);
        Ok(block.clone())
    }

    fn raw_transaction(&self, txid: &str) -> Result<Transaction> {
        self.blocks
            .values()
            .flat_map(|x| &x.txs)
            .find(|x| x.txid == txid)
            .cloned()
            .ok_or_else(|| Error::MalformedBlock(format!("unknown tx {txid}")))
    }
}

pub fn op_return_script(form: PushForm, payload: &[u8]) -> String {
    let mut script = form.header(payload.len()).unwrap();
    script.extend_from_slice(payload);
    hex::encode(script)
}

pub fn coinbase(height: u64, tag: &str) -> Transaction {
    Transaction {
        txid: format!("{height:062x}cb"),
        size: Some(150),
        vsize: Some(150),
        time: None,
        inputs: vec![TxInput::Coinbase {
            script_hex: format!("03{}", hex::encode(tag)),
        }],
        outputs: vec![TxOutput {
            n: 0,
            value: Amount::from_sat(312_500_000),
            script_hex: "0014".to_string() + &"11".repeat(20),
            addresses: Default::default(),
        }],
        fee: None,
    }
}

/// A transaction whose outputs are the given scripts, paying `fee_sat` at 250 vbytes.
pub fn tx(txid: &str, scripts: &[String], fee_sat: i64) -> Transaction {
    Transaction {
        txid: txid.into(),
        size: Some(400),
        vsize: Some(250),
        time: None,
        inputs: vec![TxInput::Spend {
            txid: "ee".repeat(32),
            vout: 0,
            prevout: None,
        }],
        outputs: scripts
            .iter()
            .enumerate()
            .map(|(n, script)| TxOutput {
                n: n as u32,
                value: Amount::ZERO,
                script_hex: script.clone(),
                addresses: Default::default(),
            })
            .collect(),
        fee: Some(SignedAmount::from_sat(fee_sat)),
    }
}

pub fn block(height: u64, txs: Vec<Transaction>) -> Block {
    Block {
        hash: format!("{height:064x}"),
        height,
        time: 1_700_000_000 + height as i64 * 600,
        txs,
    }
}
