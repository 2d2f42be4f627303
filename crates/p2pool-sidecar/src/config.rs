//! Launch and connection configuration for the P2Pool child process.
//!
//! Everything here is plain data: the supervisor copies a [`ProcessConfig`] in at
//! start and reuses it verbatim for every restart.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port the pool process serves stratum, `/stats` and JSON-RPC on.
pub const DEFAULT_POOL_PORT: u16 = 37889;

/// Stratum bind address handed to the child. Binds all interfaces so external
/// miners can connect.
pub const STRATUM_BIND: &str = "0.0.0.0:37889";

/// Status endpoint probed by the health monitor.
pub const DEFAULT_STATUS_URL: &str = "http://127.0.0.1:37889/stats";

/// Base URL of the pool process when none is configured.
pub const DEFAULT_POOL_URL: &str = "http://127.0.0.1:37889";

/// File (inside the data directory) the child's stdout/stderr are appended to.
pub const LOG_FILE_NAME: &str = "p2pool.log";

const DEFAULT_RPC_HOST: &str = "127.0.0.1";
const DEFAULT_RPC_PORT: u16 = 8232;

/// File name of the pool binary on this platform.
pub fn binary_name() -> String {
    format!("junocash-p2pool{}", std::env::consts::EXE_SUFFIX)
}

/// Credentials the pool uses against the daemon's RPC port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCredentials {
    pub user: String,
    pub password: String,
}

/// How to launch the pool process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    pub binary_path: PathBuf,
    pub wallet_address: String,
    /// Host the pool connects back to for daemon RPC.
    pub host: String,
    pub rpc_port: u16,
    pub light_mode: bool,
    pub credentials: Option<RpcCredentials>,
}

impl ProcessConfig {
    pub fn new(binary_path: impl Into<PathBuf>, wallet_address: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            wallet_address: wallet_address.into(),
            host: DEFAULT_RPC_HOST.to_string(),
            rpc_port: DEFAULT_RPC_PORT,
            light_mode: false,
            credentials: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = port;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(RpcCredentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_light_mode(mut self, light_mode: bool) -> Self {
        self.light_mode = light_mode;
        self
    }

    /// Check the fields `start` refuses to run without.
    pub fn validate(&self) -> Result<(), String> {
        if self.binary_path.as_os_str().is_empty() {
            return Err("binary path not configured".to_string());
        }
        if !self.binary_path.exists() {
            return Err(format!(
                "binary not found at {}",
                self.binary_path.display()
            ));
        }
        if self.wallet_address.is_empty() {
            return Err("wallet address required".to_string());
        }
        Ok(())
    }

    /// Command line for the child, in a fixed order.
    ///
    /// `--host <h> --rpc-port <p> [--rpc-login user:pass] --wallet <addr>
    /// --stratum 0.0.0.0:37889 [--light-mode]`
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "--host".to_string(),
            self.host.clone(),
            "--rpc-port".to_string(),
            self.rpc_port.to_string(),
        ];

        if let Some(creds) = self.credentials.as_ref().filter(|c| !c.user.is_empty()) {
            args.push("--rpc-login".to_string());
            args.push(format!("{}:{}", creds.user, creds.password));
        }

        args.push("--wallet".to_string());
        args.push(self.wallet_address.clone());

        args.push("--stratum".to_string());
        args.push(STRATUM_BIND.to_string());

        if self.light_mode {
            args.push("--light-mode".to_string());
        }

        args
    }
}

/// Bounded exponential backoff for automatic restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed per failure episode before the supervisor gives up.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(16000),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (1-indexed): `min(base * 2^(attempt-1), cap)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .map_or(self.backoff_cap, |d| d.min(self.backoff_cap))
    }
}

/// Health monitor cadence and tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub interval: Duration,
    /// Consecutive failed probes that trigger a restart.
    pub failure_threshold: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

/// Graceful termination timings used by `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub grace: Duration,
    pub poll_interval: Duration,
    /// How long to wait for the reaper after a forceful kill.
    pub reap_wait: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(100),
            reap_wait: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid endpoint url '{url}': {reason}")]
pub struct InvalidEndpoint {
    pub url: String,
    pub reason: String,
}

/// Host and port of the pool's HTTP interface, resolved once from a URL.
///
/// Accepts `http://host:port`, `host:port` or a bare host; paths are ignored and
/// a missing port means [`DEFAULT_POOL_PORT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self, InvalidEndpoint> {
        let invalid = |reason: &str| InvalidEndpoint {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
        let authority = rest.split('/').next().unwrap_or_default();

        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid("port is not a number in 0-65535"))?;
                (host, port)
            }
            None => (authority, DEFAULT_POOL_PORT),
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Absolute `http://` URL for `path` on this endpoint.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

/// Pick the pool binary: an explicit path wins, then `<data_dir>/<binary>` if it
/// exists, then `<program_dir>/<binary>` (which may not exist; `start` reports that).
pub fn resolve_binary_path(
    custom: Option<&Path>,
    data_dir: &Path,
    program_dir: &Path,
) -> PathBuf {
    if let Some(path) = custom.filter(|p| !p.as_os_str().is_empty()) {
        return path.to_path_buf();
    }

    let in_data_dir = data_dir.join(binary_name());
    if in_data_dir.exists() {
        return in_data_dir;
    }

    program_dir.join(binary_name())
}

/// Settings the host daemon supplies: where the binary and data live, which
/// wallet to mine to and how the pool reaches the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub binary_path: Option<PathBuf>,
    pub wallet_address: String,
    pub data_dir: PathBuf,
    pub pool_url: String,
    pub rpc_host: String,
    pub rpc_port: u16,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub light_mode: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            wallet_address: String::new(),
            data_dir: PathBuf::from("."),
            pool_url: DEFAULT_POOL_URL.to_string(),
            rpc_host: DEFAULT_RPC_HOST.to_string(),
            rpc_port: DEFAULT_RPC_PORT,
            rpc_user: None,
            rpc_password: None,
            light_mode: false,
        }
    }
}

impl HostConfig {
    /// Read `P2POOL_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Self {
            binary_path: non_empty("P2POOL_BINARY").map(PathBuf::from),
            wallet_address: non_empty("P2POOL_WALLET").unwrap_or_default(),
            data_dir: non_empty("P2POOL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            pool_url: non_empty("P2POOL_URL").unwrap_or(defaults.pool_url),
            rpc_host: non_empty("P2POOL_RPC_HOST").unwrap_or(defaults.rpc_host),
            rpc_port: non_empty("P2POOL_RPC_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.rpc_port),
            rpc_user: non_empty("P2POOL_RPC_USER"),
            rpc_password: non_empty("P2POOL_RPC_PASSWORD"),
            light_mode: matches!(
                non_empty("P2POOL_LIGHT_MODE").as_deref(),
                Some("1" | "true" | "yes")
            ),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(LOG_FILE_NAME)
    }

    /// Launch config for the child, resolving the binary relative to `program_dir`.
    pub fn process_config(&self, program_dir: &Path) -> ProcessConfig {
        let binary = resolve_binary_path(self.binary_path.as_deref(), &self.data_dir, program_dir);
        let mut config = ProcessConfig::new(binary, self.wallet_address.clone())
            .with_host(self.rpc_host.clone())
            .with_rpc_port(self.rpc_port)
            .with_light_mode(self.light_mode);

        if let Some(user) = &self.rpc_user {
            config = config.with_credentials(
                user.clone(),
                self.rpc_password.clone().unwrap_or_default(),
            );
        }

        config
    }
}
