use clap::{Parser, Subcommand};
use log::{error, info, warn, LevelFilter};
use op_return_scan::config::{
    RpcArgs, ScanConfig, StoreArgs, DEFAULT_BACKFILL_WINDOW, DEFAULT_DB_INLINE_LIMIT,
    DEFAULT_MIN_PAYLOAD_SIZE,
};
use op_return_scan::maintenance::{ReinterpretationJob, RescanJob, RescanTarget};
use op_return_scan::rpc::RpcBlockSource;
use op_return_scan::scanner::{LoggingObserver, ScanMode, Scanner};
use op_return_scan::stats::{Overview, Statistics};
use op_return_scan::store::PayloadStore;
use op_return_scan::{confirm, set_up_logging};
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::spawn;

#[derive(Parser)]
#[command(
    name = "op-return-scan",
    about = "Scan Bitcoin blocks for large OP_RETURN payloads"
)]
struct Args {
    #[command(flatten)]
    rpc: RpcArgs,
    #[command(flatten)]
    store: StoreArgs,
    /// Only payloads larger than this many bytes are kept
    #[arg(long, default_value_t = DEFAULT_MIN_PAYLOAD_SIZE)]
    min_size: usize,
    /// Payloads larger than this keep their data in files only
    #[arg(long, default_value_t = DEFAULT_DB_INLINE_LIMIT)]
    inline_limit: usize,
    #[arg(short, long)]
    verbose: bool,
    /// Also append logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan blocks START..=END; END defaults to the chain tip
    Scan { start: u64, end: Option<u64> },
    /// Continue after the last scanned block
    ///
    /// With an empty database this starts at --from, or at the current chain tip when
    /// --from is not given. Pass --from 0 to scan from the genesis block.
    Continue {
        /// Where to start when nothing has been scanned yet [default: chain tip]
        #[arg(long)]
        from: Option<u64>,
        #[arg(long)]
        end: Option<u64>,
    },
    /// Scan the blocks before the earliest scanned one, newest first
    Backwards {
        #[arg(long, default_value_t = DEFAULT_BACKFILL_WINDOW)]
        window: u64,
    },
    /// Print statistics of the scanned data
    Stats,
    /// Re-run content detection on stored payloads of one file type
    Reinterpret {
        #[arg(default_value = "binary")]
        file_type: String,
    },
    /// Delete and re-scan blocks; all blocks with findings unless --block is given
    Rescan {
        #[arg(long = "block")]
        blocks: Vec<u64>,
        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

enum Job {
    Scan(ScanMode),
    Rescan { target: RescanTarget, yes: bool },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    set_up_logging(
        if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        },
        args.log_file.as_deref(),
    )?;

    let backfill_window = match args.command {
        Command::Backwards { window } => window,
        _ => DEFAULT_BACKFILL_WINDOW,
    };
    let config = ScanConfig {
        output_dir: args.store.output.clone(),
        db_path: args.store.db_path(),
        min_payload_size: args.min_size,
        db_inline_limit: args.inline_limit,
        backfill_window,
        progress: Default::default(),
        rpc: args.rpc.to_config(),
    };
    if config.metadata_only() {
        info!("Running in metadata-only mode; no database");
    }
    let mut store = PayloadStore::open(&config)?;

    let job = match args.command {
        Command::Stats => return print_stats(&store),
        Command::Reinterpret { file_type } => {
            let report = ReinterpretationJob::new(&store).run(&file_type)?;
            info!("{report:?}");
            return Ok(());
        }
        Command::Scan { start, end } => Job::Scan(ScanMode::Range { start, end }),
        Command::Continue { from, end } => Job::Scan(ScanMode::Continue {
            fallback_start: from,
            end,
        }),
        Command::Backwards { .. } => Job::Scan(ScanMode::Backwards),
        Command::Rescan { blocks, yes } => Job::Rescan {
            target: if blocks.is_empty() {
                RescanTarget::WithFindings
            } else {
                RescanTarget::Blocks(blocks)
            },
            yes,
        },
    };

    let source = match RpcBlockSource::connect(&config.rpc) {
        Ok(x) => x,
        Err(e) => {
            error!("{e}");
            error!("Make sure Bitcoin-core is running and RPC credentials are set");
            exit(1);
        }
    };
    info!("Connected to Bitcoin-core at {}", config.rpc.url);

    let cancel = Arc::new(AtomicBool::new(false));
    watch_ctrl_c(Arc::clone(&cancel));

    if let Some(db) = store.database() {
        let overview = Overview::collect(db)?;
        if overview.total_blocks > 0 {
            info!("Previous progress:\n{overview}");
        }
    }

    let mut observer = LoggingObserver;
    let mut scanner = Scanner::new(&source, &mut store, &config)
        .with_observer(&mut observer)
        .with_cancel(cancel);
    match job {
        Job::Scan(mode) => scanner.run(mode)?.log(),
        Job::Rescan { target, yes } => {
            let report = RescanJob::new(&mut scanner).run(&target, |_| {
                yes || confirm("Continue with re-scan?").unwrap_or_else(|e| {
                    warn!("Cannot read confirmation: {e}");
                    false
                })
            })?;
            for (block, e) in &report.failed {
                warn!("Block {block} left unscanned: {e}");
            }
        }
    }
    drop(scanner);

    if let Some(db) = store.database() {
        info!("Overall statistics:\n{}", Overview::collect(db)?);
    }
    info!("Data saved to {}", config.output_dir.display());
    Ok(())
}

fn print_stats(store: &PayloadStore) -> anyhow::Result<()> {
    let Some(db) = store.database() else {
        warn!("Statistics need the database; nothing to show in metadata-only mode");
        return Ok(());
    };
    println!("{}", Statistics::collect(db)?);
    Ok(())
}

/// The first Ctrl-C lets the current block finish; a second one exits immediately.
fn watch_ctrl_c(cancel: Arc<AtomicBool>) {
    spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(x) => x,
            Err(e) => {
                warn!("Ctrl-C handling unavailable: {e}");
                return;
            }
        };
        runtime.block_on(async {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if cancel.swap(true, Ordering::SeqCst) {
                    warn!("Interrupted again, exiting");
                    exit(130);
                }
                warn!("Interrupted; finishing the current block. Press Ctrl-C again to exit now");
            }
        });
    });
}
