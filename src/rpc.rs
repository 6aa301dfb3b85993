//! Block source: the Bitcoin-core node, seen through JSON-RPC.
//!
//! `getblock` with verbosity 3 gives every input's resolved prevout and every transaction's
//! fee in one call, so the scanner never has to look up previous transactions.

use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::model::{Block, Prevout, Transaction, TxInput, TxOutput};
use crate::retry::RetryPolicy;
use bitcoin::{Amount, SignedAmount};
use bitcoincore_rpc::jsonrpc;
use bitcoincore_rpc::jsonrpc::simple_http::SimpleHttpTransport;
use bitcoincore_rpc::{Client, RpcApi};
use log::debug;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

/// `getrawtransaction` verbosity with fee and prevouts (Bitcoin Core 25+).
const RAW_TX_VERBOSITY: u8 = 2;

pub trait BlockSource {
    fn chain_height(&self) -> Result<u64>;

    fn block_hash(&self, height: u64) -> Result<String>;

    /// Full block with transaction inputs resolved.
    fn block(&self, hash: &str) -> Result<Block>;

    fn raw_transaction(&self, txid: &str) -> Result<Transaction>;

    /// Cheap liveness probe, used once at startup.
    fn ping(&self) -> Result<()> {
        self.chain_height().map(|_| ())
    }

    fn block_at(&self, height: u64) -> Result<Block> {
        let hash = self.block_hash(height)?;
        self.block(&hash)
    }
}

pub struct RpcBlockSource {
    /// Liveness and height checks.
    quick: Client,
    /// Bulk block fetches.
    bulk: Client,
    verbosity: u8,
    retry: RetryPolicy,
}

fn rpc_client(config: &RpcConfig, timeout: Duration) -> Result<Client> {
    let (user, pass) = config.auth.clone().get_user_pass()?;
    let mut builder = SimpleHttpTransport::builder()
        .url(&config.url)
        .map_err(|e| Error::SourceUnavailable(format!("invalid RPC url {}: {e}", config.url)))?
        .timeout(timeout);
    if let Some(user) = user {
        builder = builder.auth(user, pass);
    }
    let client = jsonrpc::Client::with_transport(builder.build());
    Ok(Client::from_jsonrpc(client))
}

impl RpcBlockSource {
    pub fn new(config: &RpcConfig) -> Result<Self> {
        Ok(Self {
            quick: rpc_client(config, config.short_timeout)?,
            bulk: rpc_client(config, config.long_timeout)?,
            verbosity: config.verbosity,
            retry: config.retry,
        })
    }

    /// Builds the source and checks the node answers; the only failure that aborts a run.
    pub fn connect(config: &RpcConfig) -> Result<Self> {
        let source = Self::new(config)?;
        source
            .ping()
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?;
        Ok(source)
    }

    fn call<T>(&self, client: &Client, method: &str, args: &[Value]) -> Result<T>
    where
        T: for<'a> Deserialize<'a>,
    {
        debug!("RPC call: {method} {args:?}");
        Ok(self.retry.run(method, || client.call::<T>(method, args))?)
    }
}

impl BlockSource for RpcBlockSource {
    fn chain_height(&self) -> Result<u64> {
        self.call(&self.quick, "getblockcount", &[])
    }

    fn ping(&self) -> Result<()> {
        self.call::<Value>(&self.quick, "getblockchaininfo", &[])
            .map(|_| ())
    }

    fn block_hash(&self, height: u64) -> Result<String> {
        self.call(&self.quick, "getblockhash", &[height.into()])
    }

    fn block(&self, hash: &str) -> Result<Block> {
        let block: WireBlock =
            self.call(&self.bulk, "getblock", &[hash.into(), self.verbosity.into()])?;
        block.try_into()
    }

    fn raw_transaction(&self, txid: &str) -> Result<Transaction> {
        let tx: WireTx = self.call(
            &self.bulk,
            "getrawtransaction",
            &[txid.into(), RAW_TX_VERBOSITY.into()],
        )?;
        tx.try_into()
    }
}

#[derive(Deserialize)]
struct WireBlock {
    hash: String,
    height: u64,
    time: i64,
    tx: Vec<WireTx>,
}

#[derive(Deserialize)]
struct WireTx {
    txid: String,
    size: Option<u64>,
    vsize: Option<u64>,
    time: Option<i64>,
    #[serde(default)]
    vin: Vec<WireInput>,
    #[serde(default)]
    vout: Vec<WireOutput>,
    #[serde(default, with = "bitcoin::amount::serde::as_btc::opt")]
    fee: Option<SignedAmount>,
}

#[derive(Deserialize)]
struct WireInput {
    coinbase: Option<String>,
    txid: Option<String>,
    vout: Option<u32>,
    prevout: Option<WirePrevout>,
}

#[derive(Deserialize)]
struct WirePrevout {
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    value: Amount,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: WireScriptPubKey,
}

#[derive(Deserialize)]
struct WireOutput {
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    value: Amount,
    n: u32,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: WireScriptPubKey,
}

/// Older nodes report `addresses: [...]`, newer ones a single `address`.
#[derive(Deserialize)]
struct WireScriptPubKey {
    #[serde(default)]
    hex: String,
    address: Option<String>,
    addresses: Option<Vec<String>>,
}

impl WireScriptPubKey {
    fn address_set(&mut self) -> BTreeSet<String> {
        self.address
            .take()
            .into_iter()
            .chain(self.addresses.take().into_iter().flatten())
            .collect()
    }
}

impl TryFrom<WireBlock> for Block {
    type Error = Error;

    fn try_from(value: WireBlock) -> Result<Self> {
        Ok(Self {
            hash: value.hash,
            height: value.height,
            time: value.time,
            txs: value
                .tx
                .into_iter()
                .map(Transaction::try_from)
                .collect::<Result<_>>()?,
        })
    }
}

impl TryFrom<WireTx> for Transaction {
    type Error = Error;

    fn try_from(value: WireTx) -> Result<Self> {
        let txid = value.txid;
        let inputs = value
            .vin
            .into_iter()
            .map(|x| match (x.coinbase, x.txid, x.vout) {
                (Some(script_hex), _, _) => Ok(TxInput::Coinbase { script_hex }),
                (None, Some(txid), Some(vout)) => Ok(TxInput::Spend {
                    txid,
                    vout,
                    prevout: x.prevout.map(|mut p| Prevout {
                        value: p.value,
                        addresses: p.script_pub_key.address_set(),
                    }),
                }),
                _ => Err(Error::MalformedBlock(format!(
                    "input of {txid} has neither coinbase nor outpoint"
                ))),
            })
            .collect::<Result<_>>()?;
        let outputs = value
            .vout
            .into_iter()
            .map(|mut x| TxOutput {
                n: x.n,
                value: x.value,
                addresses: x.script_pub_key.address_set(),
                script_hex: x.script_pub_key.hex,
            })
            .collect();

        Ok(Self {
            txid,
            size: value.size,
            vsize: value.vsize,
            time: value.time,
            inputs,
            outputs,
            fee: value.fee,
        })
    }
}

#[cfg(test)]
mod test {
    use super::{WireBlock, WireTx, RAW_TX_VERBOSITY};
    use crate::fee::TxCost;
    use crate::model::{Block, Transaction, TxInput};
    use bitcoin::{Amount, SignedAmount};
    use serde_json::json;
    use std::collections::BTreeSet;

    #[test]
    fn block_with_resolved_inputs() {
        let value = json!({
            "hash": "00000000000000000001aa",
            "height": 917963,
            "time": 1730000000,
            "tx": [
                {
                    "txid": "c0",
                    "size": 200,
                    "vin": [{ "coinbase": "03cb010e2f4632506f6f6c2f", "sequence": 4294967295u32 }],
                    "vout": [{
                        "value": 3.125,
                        "n": 0,
                        "scriptPubKey": { "hex": "0014aa", "address": "bc1qminer" }
                    }]
                },
                {
                    "txid": "d1",
                    "size": 400,
                    "vsize": 250,
                    "fee": 0.00005,
                    "vin": [{
                        "txid": "e2",
                        "vout": 1,
                        "prevout": {
                            "value": 0.001,
                            "scriptPubKey": { "hex": "76a9", "addresses": ["1Old", "1Older"] }
                        }
                    }],
                    "vout": [
                        { "value": 0.0, "n": 0, "scriptPubKey": { "hex": "6a0568656c6c6f" } },
                        { "value": 0.00095, "n": 1, "scriptPubKey": { "hex": "0014bb", "address": "bc1qchange" } }
                    ]
                }
            ]
        });
        let block: Block = serde_json::from_value::<WireBlock>(value)
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(block.height, 917963);
        assert_eq!(block.txs.len(), 2);
        assert_eq!(block.txs[0].coinbase_script(), Some("03cb010e2f4632506f6f6c2f"));
        assert_eq!(
            block.txs[0].outputs[0].addresses,
            BTreeSet::from(["bc1qminer".to_string()])
        );

        let tx = &block.txs[1];
        assert_eq!(tx.fee, Some(SignedAmount::from_sat(5000)));
        assert_eq!(tx.vsize, Some(250));
        let TxInput::Spend { prevout, .. } = &tx.inputs[0] else {
            panic!("expected a spend");
        };
        let prevout = prevout.as_ref().unwrap();
        assert_eq!(prevout.value, Amount::from_sat(100_000));
        assert_eq!(
            prevout.addresses,
            BTreeSet::from(["1Old".to_string(), "1Older".to_string()])
        );
        assert!(tx.outputs[0].addresses.is_empty());
        assert_eq!(tx.outputs[0].script_hex, "6a0568656c6c6f");
    }

    #[test]
    fn input_without_outpoint_is_malformed() {
        let value = json!({
            "txid": "d1",
            "vin": [{ "sequence": 1 }],
            "vout": []
        });
        let tx = serde_json::from_value::<WireTx>(value).unwrap();
        assert!(Transaction::try_from(tx).is_err());
    }

    #[test]
    fn negative_fee_is_kept_signed() {
        let value = json!({ "txid": "d1", "fee": -0.0001, "vin": [], "vout": [] });
        let tx: Transaction = serde_json::from_value::<WireTx>(value)
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(tx.fee, Some(SignedAmount::from_sat(-10_000)));
    }

    #[test]
    fn raw_transaction_carries_fee_and_prevouts() {
        assert_eq!(RAW_TX_VERBOSITY, 2);
        let value = json!({
            "txid": "d1",
            "hash": "d1w",
            "version": 2,
            "size": 400,
            "vsize": 250,
            "weight": 1000,
            "locktime": 0,
            "vin": [{
                "txid": "e2",
                "vout": 1,
                "scriptSig": { "asm": "", "hex": "" },
                "txinwitness": ["30", "02"],
                "prevout": {
                    "generated": false,
                    "height": 917000,
                    "value": 0.001,
                    "scriptPubKey": { "hex": "0014cc", "address": "bc1qold", "type": "witness_v0_keyhash" }
                },
                "sequence": 4294967293u32
            }],
            "vout": [
                { "value": 0.0, "n": 0, "scriptPubKey": { "hex": "6a0568656c6c6f", "type": "nulldata" } },
                { "value": 0.00095, "n": 1, "scriptPubKey": { "hex": "0014bb", "address": "bc1qchange" } }
            ],
            "fee": 0.00005,
            "hex": "0200",
            "blockhash": "00000000000000000001aa",
            "confirmations": 12,
            "time": 1730000000,
            "blocktime": 1730000000
        });
        let tx: Transaction = serde_json::from_value::<WireTx>(value)
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(tx.time, Some(1730000000));
        let cost = TxCost::of(&tx);
        assert_eq!(cost.fee, 5000);
        assert_eq!(cost.size, 250);
        assert_eq!(cost.fee_rate(), 20.0);
        assert_eq!(cost.cost_per_byte(1000), 5.0);
        let TxInput::Spend { prevout, .. } = &tx.inputs[0] else {
            panic!("expected a spend");
        };
        assert_eq!(prevout.as_ref().unwrap().value, Amount::from_sat(100_000));
    }
}
