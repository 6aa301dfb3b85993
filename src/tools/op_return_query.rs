//! Read-only queries over the scan database, plus a live look at one transaction.

use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use op_return_scan::config::{RpcArgs, StoreArgs};
use op_return_scan::content::Classification;
use op_return_scan::fee::TxCost;
use op_return_scan::model::ExtractedPayload;
use op_return_scan::rpc::{BlockSource, RpcBlockSource};
use op_return_scan::script::extract_op_return_hex;
use op_return_scan::stats::Statistics;
use op_return_scan::store::{block_time_rfc3339, Database};
use op_return_scan::set_up_logging;
use pretty_hex::PrettyHex;

#[derive(Parser)]
#[command(
    name = "op-return-query",
    about = "Query OP_RETURN payloads found by op-return-scan"
)]
struct Args {
    #[command(flatten)]
    rpc: RpcArgs,
    #[command(flatten)]
    store: StoreArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Most recently scanned blocks
    Blocks {
        #[arg(short, long, default_value_t = 10)]
        limit: u64,
    },
    /// One block's scan record and payloads
    Block { number: u64 },
    /// Payloads whose transaction ID contains FRAGMENT
    Txid { fragment: String },
    /// Payloads of one file type
    FileType { file_type: String },
    /// Payloads within a size range in bytes
    Size {
        #[arg(long, default_value_t = 0)]
        min: u64,
        #[arg(long)]
        max: Option<u64>,
    },
    /// Full statistics
    Stats,
    /// Fetch a transaction from the node and classify its OP_RETURN outputs
    InspectTx { txid: String },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    set_up_logging(LevelFilter::Warn, None)?;

    if let Command::InspectTx { txid } = &args.command {
        let source = RpcBlockSource::connect(&args.rpc.to_config())?;
        return inspect_tx(&source, txid);
    }

    let db = Database::open(&args.store.db)?;
    match args.command {
        Command::Blocks { limit } => {
            println!(
                "{:<8} {:<26} {:<20} {:>6} {:>8}",
                "Block", "Time", "Miner", "Txs", "Payloads"
            );
            for r in db.recent_scans(limit)? {
                println!(
                    "{:<8} {:<26} {:<20} {:>6} {:>8}",
                    r.block_number,
                    block_time_rfc3339(r.block_time),
                    r.mined_by.as_deref().unwrap_or("-"),
                    r.total_transactions,
                    r.large_payload_count
                );
            }
        }
        Command::Block { number } => {
            let Some(r) = db.scan_record(number)? else {
                println!("Block {number} has not been scanned");
                return Ok(());
            };
            println!("Block: {}", r.block_number);
            println!("Hash: {}", r.block_hash);
            println!("Time: {}", block_time_rfc3339(r.block_time));
            println!("Miner: {}", r.mined_by.as_deref().unwrap_or("-"));
            if let Some(text) = &r.coinbase_text {
                println!("Coinbase: {text}");
            }
            println!("Transactions: {}", r.total_transactions);
            println!("Large OP_RETURNs: {}", r.large_payload_count);
            for p in db.payloads_in_block(number)? {
                println!();
                print_payload(&p);
            }
        }
        Command::Txid { fragment } => print_list(&db.search_txid(&fragment)?),
        Command::FileType { file_type } => print_list(&db.payloads_of_type(&file_type)?),
        Command::Size { min, max } => print_list(&db.payloads_by_size(min, max)?),
        Command::Stats => println!("{}", Statistics::collect(&db)?),
        Command::InspectTx { .. } => {}
    }
    Ok(())
}

fn print_list(payloads: &[ExtractedPayload]) {
    if payloads.is_empty() {
        println!("No matching OP_RETURNs");
        return;
    }
    println!(
        "{:<8} {:<66} {:>5} {:>10} {:<8}",
        "Block", "Transaction ID", "Vout", "Size", "Type"
    );
    for p in payloads {
        println!(
            "{:<8} {:<66} {:>5} {:>10} {:<8}",
            p.block_number,
            p.txid,
            p.vout_index,
            ByteSize(p.data_size).to_string(),
            p.file_type
        );
    }
    println!("{} OP_RETURN(s)", payloads.len());
}

fn print_payload(p: &ExtractedPayload) {
    println!("{}:{}", p.txid, p.vout_index);
    println!("  Size: {} ({} bytes)", ByteSize(p.data_size), p.data_size);
    println!("  Type: {} ({})", p.file_type, p.mime_type);
    if let Some(fee) = p.tx_fee {
        println!(
            "  Fee: {fee} sats, {:.2} sat/vB, {:.2} sats per data byte",
            p.fee_rate.unwrap_or_default(),
            p.cost_per_byte.unwrap_or_default()
        );
    }
    match (&p.decoded_text, &p.raw_hex) {
        (Some(text), _) => println!("  Text: {}", preview(text, 200)),
        (None, Some(raw)) => {
            if let Ok(data) = hex::decode(raw) {
                println!("{:?}", (&data[..data.len().min(64)]).hex_dump());
            }
        }
        (None, None) => println!("  (data kept in files only)"),
    }
}

fn inspect_tx(source: &impl BlockSource, txid: &str) -> anyhow::Result<()> {
    let tx = source.raw_transaction(txid)?;
    let cost = TxCost::of(&tx);
    println!("Transaction: {}", tx.txid);
    println!(
        "Inputs: {}, outputs: {}, size: {} vB, fee: {} sats ({:.2} sat/vB)",
        cost.input_count,
        cost.output_count,
        cost.size,
        cost.fee,
        cost.fee_rate()
    );
    let mut found = 0;
    for output in &tx.outputs {
        let Some(data) = extract_op_return_hex(&output.script_hex) else {
            continue;
        };
        found += 1;
        let class = Classification::of(&data);
        println!();
        println!("Output {}: {} bytes", output.n, data.len());
        println!(
            "  Type: {} ({}), category: {:?}{}",
            class.file_type(),
            class.mime_type(),
            class.category(),
            if class.is_dangerous() { ", DANGEROUS" } else { "" }
        );
        if !data.is_empty() {
            println!(
                "  Cost per data byte: {:.2} sats",
                cost.cost_per_byte(data.len())
            );
        }
        match &class.text {
            Some(text) => println!("  Text: {}", preview(text, 200)),
            None => println!("{:?}", (&data[..data.len().min(64)]).hex_dump()),
        }
    }
    if found == 0 {
        println!("No OP_RETURN outputs");
    }
    Ok(())
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
