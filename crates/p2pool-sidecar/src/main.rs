use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use p2pool_sidecar::{
    HostConfig, HttpStatusSource, ProcessSupervisor, RpcClient, StatusCache, SupervisorConfig,
};

const USAGE: &str = "\
Usage: p2pool-sidecar <command> [options]

Commands:
  run                    Supervise the pool process until Ctrl-C / SIGTERM
  status                 Print one pool status snapshot
  template               Request a block template
  submit <header-hex>    Submit a solved share

Options:
  --url <url>            Pool HTTP/RPC URL [env: P2POOL_URL]
  --wallet <address>     Payout address [env: P2POOL_WALLET]
  --binary <path>        Pool binary [env: P2POOL_BINARY]
  --data-dir <dir>       Data directory for p2pool.log [env: P2POOL_DATA_DIR]
  --light-mode           Run the pool in light mode [env: P2POOL_LIGHT_MODE]
  --interval <secs>      Status line interval for `run` [default: 30]";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Run,
    Status,
    Template,
    Submit(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Args {
    command: Command,
    url: Option<String>,
    wallet: Option<String>,
    binary: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    light_mode: bool,
    interval: Duration,
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("P2POOL_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("p2pool_sidecar={base_level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut command: Option<Command> = None;
    let mut parsed = Args {
        command: Command::Run,
        url: None,
        wallet: None,
        binary: None,
        data_dir: None,
        light_mode: false,
        interval: Duration::from_secs(30),
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--url" => {
                i += 1;
                parsed.url = Some(args.get(i).ok_or("--url requires a value")?.clone());
            }
            "--wallet" => {
                i += 1;
                parsed.wallet = Some(args.get(i).ok_or("--wallet requires a value")?.clone());
            }
            "--binary" => {
                i += 1;
                parsed.binary = Some(PathBuf::from(
                    args.get(i).ok_or("--binary requires a value")?,
                ));
            }
            "--data-dir" => {
                i += 1;
                parsed.data_dir = Some(PathBuf::from(
                    args.get(i).ok_or("--data-dir requires a value")?,
                ));
            }
            "--interval" => {
                i += 1;
                let secs: u64 = args
                    .get(i)
                    .ok_or("--interval requires a value")?
                    .parse()
                    .map_err(|_| "--interval expects whole seconds".to_string())?;
                if secs == 0 {
                    return Err("--interval must be at least 1".to_string());
                }
                parsed.interval = Duration::from_secs(secs);
            }
            "--light-mode" => parsed.light_mode = true,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg if command.is_none() => {
                command = Some(match arg {
                    "run" => Command::Run,
                    "status" => Command::Status,
                    "template" => Command::Template,
                    "submit" => {
                        i += 1;
                        Command::Submit(
                            args.get(i)
                                .ok_or("submit requires <header-hex>")?
                                .clone(),
                        )
                    }
                    other => return Err(format!("unknown command: {other}")),
                });
            }
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    parsed.command = command.ok_or("missing command")?;
    Ok(parsed)
}

/// Environment first, then command-line overrides.
fn host_config(args: &Args) -> HostConfig {
    let mut host = HostConfig::from_env();
    if let Some(url) = &args.url {
        host.pool_url = url.clone();
    }
    if let Some(wallet) = &args.wallet {
        host.wallet_address = wallet.clone();
    }
    if let Some(binary) = &args.binary {
        host.binary_path = Some(binary.clone());
    }
    if let Some(dir) = &args.data_dir {
        host.data_dir = dir.clone();
    }
    host.light_mode |= args.light_mode;
    host
}

fn program_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}

async fn run(host: HostConfig, interval: Duration) -> anyhow::Result<()> {
    let config = host.process_config(&program_dir());
    let cache = StatusCache::new(Arc::new(
        HttpStatusSource::from_pool_url(&host.pool_url).context("invalid pool URL")?,
    ));

    let supervisor = ProcessSupervisor::new(SupervisorConfig::new(host.log_path()));
    supervisor
        .start(config)
        .await
        .context("failed to start pool")?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let report = supervisor.report();
        let status = cache.get_status().await;
        tracing::info!(
            state = ?report.state,
            pid = ?report.pid,
            uptime_secs = report.uptime_secs,
            restart_attempts = report.restart_attempts,
            healthy = report.healthy,
            connected = status.connected,
            miners = status.connected_miners,
            shares = status.total_shares,
            hashrate = status.pool_hashrate,
            effort = status.effort_percent,
            "Pool status"
        );
    }

    supervisor.stop().await;
    Ok(())
}

async fn dispatch(args: Args) -> anyhow::Result<()> {
    let host = host_config(&args);

    match args.command {
        Command::Run => run(host, args.interval).await,
        Command::Status => {
            let source = HttpStatusSource::from_pool_url(&host.pool_url)
                .context("invalid pool URL")?;
            let cache = StatusCache::new(Arc::new(source));
            let snapshot = cache.refresh_status().await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Command::Template => {
            let client = RpcClient::new(&host.pool_url, host.wallet_address)?;
            let template = client
                .fetch_block_template()
                .await
                .context("failed to fetch block template")?;
            println!("{}", serde_json::to_string_pretty(&template)?);
            Ok(())
        }
        Command::Submit(header) => {
            let client = RpcClient::new(&host.pool_url, host.wallet_address)?;
            let result = client.submit_share(&header).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = dispatch(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}
