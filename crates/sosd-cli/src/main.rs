#![deny(unsafe_code)]

//! sosd CLI: runs the SOS daemon and talks to a running one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sosd_config::AppConfig;
use sosd_core::ipc::{IpcClient, IpcClientError, server::socket_path_from_config};
use sosd_core::query::PivotRequest;
use sosd_core::{Daemon, LogCollector, ResultSet, SosClient};

/// SOS: telemetry ingestion and query daemon.
#[derive(Parser)]
#[command(name = "sosd", version = sosd_core::build_info::VERSION, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "sosd.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Daemon host for wire commands (defaults to `daemon.listen_addr`).
    #[arg(long, global = true)]
    host: Option<String>,

    /// Daemon wire port (defaults to `daemon.listen_port`).
    #[arg(long, global = true, env = "SOS_CMD_PORT")]
    port: Option<u16>,

    /// Working directory for the value store (overrides `store.data_dir`).
    #[arg(long, global = true, env = "SOS_WORK")]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground.
    Start,

    /// Stop a running daemon.
    Stop,

    /// Show daemon status over the admin socket.
    Status,

    /// Probe a daemon over the wire protocol.
    Probe,

    /// List known publishers.
    Manifest {
        /// Regex over title or program name.
        #[arg(long)]
        filter: Option<String>,
    },

    /// Run a SQL query.
    Query {
        sql: String,

        /// Submit, poll until done, then claim the result.
        #[arg(long = "async")]
        is_async: bool,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// One column per field name, grouped by the given keys.
    Pivot {
        #[arg(long, value_delimiter = ',', default_value = "comm_rank,frame")]
        keys: Vec<String>,

        /// Regex over field names.
        #[arg(long)]
        filter: Option<String>,

        /// Regex over pub title or program name.
        #[arg(long)]
        pub_filter: Option<String>,

        #[arg(long)]
        frame: Option<i64>,
    },

    /// Show recent daemon log events.
    Logs {
        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Minimum level, e.g. `warn`.
        #[arg(long)]
        level: Option<String>,
    },

    /// Drop every stored publisher and value.
    Reset,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli).await?;

    let level = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let collector = LogCollector::new(config.logging.capture_capacity);
    let logs = collector.reader();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(collector)
        .init();

    match &cli.command {
        Commands::Start => {
            info!(version = %sosd_core::build_info::version_string(), "Starting SOS daemon");
            let daemon = Daemon::open(config)?.with_logs(logs);
            daemon.run().await?;
        }
        Commands::Stop => cmd_stop(&config).await?,
        Commands::Status => cmd_status(&config).await?,
        Commands::Probe => {
            let reply = connect(&cli, &config).await?.probe().await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Commands::Manifest { filter } => {
            let pubs = connect(&cli, &config)
                .await?
                .manifest(filter.as_deref())
                .await?;
            println!("{:>12}  {:>6}  {:>9}  {:<20}  TITLE", "GUID", "RANK", "MAX_FRAME", "PROGRAM");
            for p in pubs {
                let frame = p.max_frame.map_or("-".to_string(), |f| f.to_string());
                println!(
                    "{:>12}  {:>6}  {:>9}  {:<20}  {}",
                    p.pub_guid, p.comm_rank, frame, p.prog_name, p.title
                );
            }
        }
        Commands::Query {
            sql,
            is_async,
            timeout_ms,
        } => {
            let mut client = connect(&cli, &config).await?;
            let rs = if *is_async {
                run_async(&mut client, sql, *timeout_ms).await?
            } else {
                client.query(sql, *timeout_ms).await?
            };
            print!("{}", render_table(&rs));
            eprintln!("({} rows, {} ms)", rs.row_count(), rs.exec_duration_ms);
        }
        Commands::Pivot {
            keys,
            filter,
            pub_filter,
            frame,
        } => {
            let req = PivotRequest {
                keys: keys.clone(),
                value_filter: filter.clone(),
                pub_filter: pub_filter.clone(),
                frame: *frame,
            };
            let rs = connect(&cli, &config).await?.pivot(&req, None).await?;
            print!("{}", render_table(&rs));
        }
        Commands::Logs { limit, level } => {
            let reply = admin(&config).logs(*limit, level.as_deref()).await?;
            for e in reply.entries {
                println!(
                    "{:>10.3}s {:>5} {}: {} {}",
                    e.elapsed_secs, e.level, e.target, e.message, e.fields
                );
            }
        }
        Commands::Reset => {
            let reply = admin(&config).reset().await?;
            println!(
                "Removed {} publishers and {} values.",
                reply.pubs_removed, reply.vals_removed
            );
        }
        Commands::Config { show } => {
            if *show {
                println!("{}", toml::to_string_pretty(&config)?);
            } else {
                println!("Configuration at '{}' is valid.", cli.config.display());
            }
        }
    }

    Ok(())
}

/// File (or defaults) plus command-line and environment overrides.
async fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = load_config(&cli.config).await?;
    if let Some(port) = cli.port {
        config.daemon.listen_port = port;
    }
    if let Some(dir) = &cli.work_dir {
        config.store.data_dir = dir.to_string_lossy().into_owned();
    }
    config.validate()?;
    Ok(config)
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(AppConfig::default())
    }
}

fn admin(config: &AppConfig) -> IpcClient {
    IpcClient::new(socket_path_from_config(config))
}

async fn connect(cli: &Cli, config: &AppConfig) -> Result<SosClient> {
    let host = cli.host.as_deref().unwrap_or(&config.daemon.listen_addr);
    let addr = format!("{host}:{}", config.daemon.listen_port);
    let mut client = SosClient::connect(addr.as_str()).await?;
    client.register(&Default::default()).await?;
    Ok(client)
}

async fn cmd_stop(config: &AppConfig) -> Result<()> {
    match admin(config).stop().await {
        Ok(reply) => {
            println!("{}", reply.message);
            Ok(())
        }
        Err(IpcClientError::NotRunning(path)) => {
            // No admin socket: fall back to a wire SHUTDOWN.
            warn!(path = %path.display(), "Admin socket not found, trying wire shutdown");
            let addr = format!("{}:{}", config.daemon.listen_addr, config.daemon.listen_port);
            let mut client = SosClient::connect(addr.as_str()).await?;
            client
                .shutdown(config.daemon.shutdown_token.as_deref())
                .await?;
            println!("Shutdown initiated");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_status(config: &AppConfig) -> Result<()> {
    let s = admin(config).status().await?;
    println!("sosd {} (pid {})", s.version, s.pid);
    println!("  lifecycle:   {:?}", s.lifecycle);
    println!("  uptime:      {}s", s.uptime_secs);
    println!("  listening:   {}:{}", s.listen_addr, s.listen_port);
    if s.persistent {
        println!("  store:       {} ({} WAL bytes)", s.data_dir, s.wal_bytes);
    } else {
        println!("  store:       in-memory");
    }
    println!(
        "  contents:    {} pubs, {} fields, {} values",
        s.pubs, s.fields, s.vals
    );
    println!(
        "  queries:     {} queued, {} executing",
        s.queued_queries, s.executing_queries
    );
    println!(
        "  connections: {} active, {} total",
        s.counters.connections_active, s.counters.connections_total
    );
    if let Some(fault) = s.fault {
        println!("  FAULT:       {fault}");
    }
    Ok(())
}

/// Submit, poll with backoff, then claim.
async fn run_async(client: &mut SosClient, sql: &str, timeout_ms: Option<u64>) -> Result<ResultSet> {
    let guid = client.submit(sql, timeout_ms).await?;
    eprintln!("query {guid} submitted");
    let mut delay = Duration::from_millis(10);
    while !client.poll(guid).await? {
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(1));
    }
    Ok(client.claim(guid, false).await?)
}

/// Aligned text table; NULL cells print as `NULL`.
fn render_table(rs: &ResultSet) -> String {
    let cells: Vec<Vec<&str>> = rs
        .rows
        .iter()
        .map(|row| row.iter().map(|c| c.as_deref().unwrap_or("NULL")).collect())
        .collect();
    let mut widths: Vec<usize> = rs.column_names.iter().map(|c| c.len()).collect();
    for row in &cells {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = table_line(rs.column_names.iter().map(String::as_str), &widths);
    out.push_str(
        &widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    out.push('\n');
    for row in &cells {
        out.push_str(&table_line(row.iter().copied(), &widths));
    }
    out
}

fn table_line<'a>(fields: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let mut line = fields
        .zip(widths)
        .map(|(f, w)| format!("{f:<w$}"))
        .collect::<Vec<_>>()
        .join(" | ");
    line.truncate(line.trim_end().len());
    line.push('\n');
    line
}
