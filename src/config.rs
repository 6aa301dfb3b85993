use crate::retry::RetryPolicy;
use bitcoincore_rpc::Auth;
use std::path::PathBuf;
use std::time::Duration;

/// Payloads must be strictly larger than this to be kept; smaller pushes are noise.
pub const DEFAULT_MIN_PAYLOAD_SIZE: usize = 83;
/// Largest payload whose hex and text are stored inline in the database.
pub const DEFAULT_DB_INLINE_LIMIT: usize = 32_767;
/// About one month of blocks (30 days * 144 blocks/day).
pub const DEFAULT_BACKFILL_WINDOW: u64 = 4_320;

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub url: String,
    pub auth: Auth,
    /// Liveness and chain-height checks.
    pub short_timeout: Duration,
    /// Full block fetches.
    pub long_timeout: Duration,
    /// `getblock` verbosity; 3 includes resolved prevouts and fees.
    pub verbosity: u8,
    pub retry: RetryPolicy,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "localhost:8332".into(),
            auth: Auth::None,
            short_timeout: Duration::from_secs(5),
            long_timeout: Duration::from_secs(120),
            verbosity: 3,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub every_blocks: u64,
    pub interval: Duration,
    /// Number of recent per-block durations the ETA is averaged over.
    pub eta_window: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            every_blocks: 100,
            interval: Duration::from_secs(30),
            eta_window: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub output_dir: PathBuf,
    /// `None` runs in metadata-only mode: filesystem sidecars, no database.
    pub db_path: Option<PathBuf>,
    pub min_payload_size: usize,
    pub db_inline_limit: usize,
    pub backfill_window: u64,
    pub progress: ProgressConfig,
    pub rpc: RpcConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            output_dir: "op_return_data".into(),
            db_path: Some("op_return.db".into()),
            min_payload_size: DEFAULT_MIN_PAYLOAD_SIZE,
            db_inline_limit: DEFAULT_DB_INLINE_LIMIT,
            backfill_window: DEFAULT_BACKFILL_WINDOW,
            progress: Default::default(),
            rpc: Default::default(),
        }
    }
}

impl ScanConfig {
    pub fn metadata_only(&self) -> bool {
        self.db_path.is_none()
    }
}

/// Node connection flags shared by the binaries.
#[derive(Debug, Clone, clap::Args)]
pub struct RpcArgs {
    /// Bitcoin-core RPC address
    #[arg(long, env = "BTC_RPC_URL", default_value = "localhost:8332")]
    pub rpc_url: String,
    #[arg(long, env = "BTC_RPC_USER")]
    pub rpc_user: Option<String>,
    #[arg(long, env = "BTC_RPC_PASSWORD", hide_env_values = true)]
    pub rpc_password: Option<String>,
    /// Cookie file, used instead of user and password when given
    #[arg(long, env = "BTC_RPC_COOKIE")]
    pub rpc_cookie: Option<PathBuf>,
    /// Timeout for block fetches, e.g. "2m"
    #[arg(long, default_value = "120s", value_parser = humantime::parse_duration)]
    pub rpc_timeout: Duration,
    /// Attempts per RPC call before a block is given up on
    #[arg(long, default_value_t = 3)]
    pub rpc_attempts: u32,
}

impl RpcArgs {
    pub fn to_config(&self) -> RpcConfig {
        let auth = match (&self.rpc_cookie, &self.rpc_user) {
            (Some(cookie), _) => Auth::CookieFile(cookie.clone()),
            (None, Some(user)) => Auth::UserPass(
                user.clone(),
                self.rpc_password.clone().unwrap_or_default(),
            ),
            (None, None) => Auth::None,
        };
        RpcConfig {
            url: self.rpc_url.clone(),
            auth,
            long_timeout: self.rpc_timeout,
            retry: RetryPolicy {
                max_attempts: self.rpc_attempts.max(1),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Where results go.
#[derive(Debug, Clone, clap::Args)]
pub struct StoreArgs {
    /// SQLite database file
    #[arg(long, env = "OP_RETURN_DB", default_value = "op_return.db")]
    pub db: PathBuf,
    /// Directory for per-payload files
    #[arg(short, long, env = "OP_RETURN_OUTPUT", default_value = "op_return_data")]
    pub output: PathBuf,
    /// Metadata-only mode: write files, skip the database
    #[arg(long)]
    pub no_db: bool,
}

impl StoreArgs {
    pub fn db_path(&self) -> Option<PathBuf> {
        (!self.no_db).then(|| self.db.clone())
    }
}
