//! Mining pool attribution from the coinbase script.

use crate::model::Transaction;

pub const UNKNOWN_POOL: &str = "Unknown";

/// `(signature, pool name)`, matched case-insensitively in order; the first hit wins.
const POOL_SIGNATURES: &[(&str, &str)] = &[
    ("ViaBTC", "ViaBTC"),
    ("F2Pool", "F2Pool"),
    ("AntPool", "AntPool"),
    ("Foundry", "Foundry USA"),
    ("Binance", "Binance Pool"),
    ("BTC.com", "BTC.com"),
    ("Poolin", "Poolin"),
    ("SlushPool", "Slush Pool"),
    ("MARA", "Marathon Digital"),
    ("marathon", "Marathon Digital"),
    ("SpiderPool", "SpiderPool"),
    ("SBI", "SBI Crypto"),
    ("EMCD", "EMCD"),
    ("Luxor", "Luxor"),
    ("BraiinsPool", "Braiins Pool"),
    ("stratum", "Braiins Pool"),
    ("ckpool", "CKPool"),
    ("luckyPool", "luckyPool"),
    ("ultimus", "Ultimus Pool"),
    ("SecPool", "SecPool"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinerAttribution {
    /// Canonical pool name, or [`UNKNOWN_POOL`].
    pub pool: String,
    pub coinbase_text: String,
}

impl MinerAttribution {
    pub fn is_known(&self) -> bool {
        self.pool != UNKNOWN_POOL
    }
}

/// ASCII rendering of the coinbase script; non-ASCII bytes are dropped.
///
/// A script that is not valid hex is kept verbatim.
pub fn coinbase_text(script_hex: &str) -> String {
    match hex::decode(script_hex) {
        Ok(bytes) => bytes
            .into_iter()
            .filter(u8::is_ascii)
            .map(char::from)
            .collect(),
        Err(_) => script_hex.into(),
    }
}

pub fn match_pool(coinbase_text: &str) -> &'static str {
    let lower = coinbase_text.to_lowercase();
    POOL_SIGNATURES
        .iter()
        .find(|(signature, _)| lower.contains(&signature.to_lowercase()))
        .map_or(UNKNOWN_POOL, |&(_, pool)| pool)
}

/// `None` if `coinbase_tx` carries no coinbase input.
pub fn attribute(coinbase_tx: &Transaction) -> Option<MinerAttribution> {
    let text = coinbase_text(coinbase_tx.coinbase_script()?);
    Some(MinerAttribution {
        pool: match_pool(&text).into(),
        coinbase_text: text,
    })
}
