use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use msc_config::UnusedKeyPolicy;
use msc_consumer::{DeliveryLoop, DeliveryReport, LocalQueue, MessageProcessor};
use msc_db::{PgTargetStore, TargetKey, TargetStore};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "msc")]
#[command(about = "Scan-result consumer CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> local overrides)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Replay NDJSON scan messages through the consumer pipeline into Postgres.
    Consume {
        /// Layered config paths in merge order
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// NDJSON file, one scan message per line; `-` reads stdin
        #[arg(long)]
        input: String,
    },

    /// Inspect stored targets
    Target {
        #[command(subcommand)]
        cmd: TargetCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations (idempotent).
    Migrate,
}

#[derive(Subcommand)]
enum TargetCmd {
    /// Print a target row and its messages as JSON
    Show {
        #[arg(long)]
        ip: String,

        #[arg(long)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = msc_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = msc_db::status(&pool).await?;
                    println!(
                        "db_ok={} has_targets_table={} schema_complete={}",
                        s.ok, s.has_targets_table, s.schema_complete
                    );
                }
                DbCmd::Migrate => {
                    msc_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = msc_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Consume {
            config_paths,
            input,
        } => consume(&config_paths, &input).await?,

        Commands::Target { cmd } => match cmd {
            TargetCmd::Show { ip, port } => {
                let pool = msc_db::connect_from_env().await?;
                let store = PgTargetStore::new(pool);
                let key = TargetKey::new(ip, port);

                let Some(target) = store.fetch_target(&key).await? else {
                    bail!("target not found: {key}");
                };
                let messages = store.fetch_messages(&key).await?;

                let out = serde_json::json!({ "target": target, "messages": messages });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&out).context("serialize target json")?
                );
            }
        },
    }

    Ok(())
}

async fn consume(config_paths: &[String], input: &str) -> Result<()> {
    let path_refs: Vec<&str> = config_paths.iter().map(|s| s.as_str()).collect();
    let loaded = msc_config::load_layered_yaml(&path_refs)?;
    let settings = loaded.settings()?;

    let unused = msc_config::report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn)?;
    for pointer in &unused.unused_leaf_pointers {
        warn!(pointer = %pointer, "config key is not used by the consumer");
    }

    let db_url = msc_config::resolve_database_url(&settings)?;
    let payloads = read_ndjson(input).await?;

    info!(
        config_hash = %loaded.config_hash,
        url_env = db_url.env_name(),
        messages = payloads.len(),
        "starting replay"
    );

    let pool = msc_db::connect(db_url.expose(), settings.database.max_connections).await?;
    let store = Arc::new(PgTargetStore::new(pool));

    let queue = Arc::new(LocalQueue::new(
        settings.queue.max_delivery_attempts,
        settings.redelivery_delay(),
    ));
    let published = payloads.len();
    for p in payloads {
        queue.publish(p);
    }
    queue.close();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing in-flight messages");
                cancel.cancel();
            }
        }
    });

    let processor = Arc::new(MessageProcessor::new(store, settings.lock_lease()));
    let report = DeliveryLoop::new(processor, Arc::clone(&queue), settings.consumer.max_in_flight)
        .run(cancel)
        .await?;

    println!("config_hash={}", loaded.config_hash);
    println!("published={published}");
    print_report(&report);

    let stats = queue.stats();
    println!("queue_ready={} queue_in_flight={}", stats.ready, stats.in_flight);
    for d in queue.dead_letters() {
        println!(
            "dead_letter id={} attempts={} payload={}",
            d.id,
            d.attempts,
            String::from_utf8_lossy(&d.data)
        );
    }
    Ok(())
}

fn print_report(r: &DeliveryReport) {
    println!("received={}", r.received);
    println!("acked={}", r.acked);
    println!("nacked_decode={}", r.nacked_decode);
    println!("nacked_lock_contention={}", r.nacked_lock_contention);
    println!("nacked_storage={}", r.nacked_storage);
    println!("nacked_panic={}", r.nacked_panic);
    println!("settle_failures={}", r.settle_failures);
}

async fn read_ndjson(input: &str) -> Result<Vec<Vec<u8>>> {
    if input == "-" {
        return collect_lines(BufReader::new(tokio::io::stdin()))
            .await
            .context("read stdin");
    }
    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("open input: {input}"))?;
    collect_lines(BufReader::new(file))
        .await
        .with_context(|| format!("read input: {input}"))
}

/// Non-blank lines, each one message body.
async fn collect_lines<R: AsyncBufRead + Unpin>(reader: R) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        out.push(line.as_bytes().to_vec());
    }
    Ok(out)
}

fn init_tracing() {
    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}
