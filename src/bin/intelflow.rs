//! intelflow CLI - run bots and inspect a deployment
//!
//! Every command reads the deployment file named by `--config`, or
//! `INTELFLOW_CONFIG`, or `config/intelflow.yaml`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use intelflow::bot::{read_dump_file, BotError, RunStats};
use intelflow::bots::{self, MODULES};
use intelflow::cache::MemoryCache;
use intelflow::codegen;
use intelflow::config::RuntimeConfig;
use intelflow::harmonization::{self, HarmonizationRegistry};
use intelflow::pipeline::MemoryBroker;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "intelflow")]
#[command(version, about = "Threat-intelligence message pipeline", long_about = None)]
struct Cli {
    /// Deployment configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more configured bots until interrupted
    Run {
        /// Bot ids to run
        bots: Vec<String>,

        /// Run every bot of the deployment in this process
        #[arg(short, long, conflicts_with = "bots")]
        all: bool,
    },

    /// Write the CREATE TABLE statement for the events table
    Initdb {
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate the harmonization schema and the bot configuration
    CheckHarmonization {
        /// Also print every declared field with its type
        #[arg(short, long)]
        schema: bool,
    },

    /// Print the records of a dump file
    DumpList {
        /// Dump file, e.g. var/dump/turris-parser.dump.ndjson
        file: PathBuf,

        /// Print payloads as well
        #[arg(short, long)]
        payload: bool,
    },
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(RuntimeConfig::config_path);

    let result = match cli.command {
        Commands::Run { bots, all } => run_bots(config_path, bots, all).await,
        Commands::Initdb { output } => initdb(config_path, output),
        Commands::CheckHarmonization { schema } => check_harmonization(config_path, schema),
        Commands::DumpList { file, payload } => dump_list(file, payload),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(path: &PathBuf) -> Result<RuntimeConfig, String> {
    RuntimeConfig::load_from_file(path).map_err(|e| e.to_string())
}

/// Registry for `initdb` and `check-harmonization`; a missing deployment
/// file falls back to the bundled schema.
fn registry_for(path: &PathBuf) -> Result<HarmonizationRegistry, String> {
    let config = if path.exists() {
        load_config(path)?
    } else {
        RuntimeConfig::default()
    };
    config
        .load_registry()
        .map_err(|e| format!("Failed to load harmonization schema: {}", e))
}

async fn run_bots(config_path: PathBuf, mut bot_ids: Vec<String>, all: bool) -> Result<(), String> {
    let config = load_config(&config_path)?;
    if all {
        bot_ids = config.bots.keys().cloned().collect();
    }
    if bot_ids.is_empty() {
        return Err("Name at least one bot or pass --all".to_string());
    }

    let registry = config
        .load_registry()
        .map_err(|e| format!("Failed to load harmonization schema: {}", e))?;
    let registry = harmonization::install(registry).map_err(|e| e.to_string())?;

    // In-memory backends are shared by every bot of this process.
    let broker = MemoryBroker::new();
    let local_cache = MemoryCache::new();
    let shutdown = CancellationToken::new();

    let mut handles = Vec::with_capacity(bot_ids.len());
    for bot_id in &bot_ids {
        let mut runtime = bots::build_runtime(
            &config,
            bot_id,
            Arc::clone(&registry),
            Some(&broker),
            Some(&local_cache),
        )
        .await
        .map_err(|e| format!("Failed to start bot '{}': {}", bot_id, e))?;

        let token = shutdown.clone();
        let id = bot_id.clone();
        handles.push((
            id,
            tokio::spawn(async move {
                let result = runtime.run(token.clone()).await;
                // One fatal bot brings the rest of the process down with it.
                if result.is_err() {
                    token.cancel();
                }
                result
            }),
        ));
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping bots");
        }
        signal_token.cancel();
    });

    let mut failed = Vec::new();
    for (bot_id, handle) in handles {
        let outcome: Result<RunStats, BotError> = handle
            .await
            .unwrap_or_else(|e| Err(BotError::Other(format!("task failed: {}", e))));
        match outcome {
            Ok(stats) => println!(
                "{}: processed {}, duplicates {}, retries {}, dumped {}",
                bot_id, stats.processed, stats.duplicates, stats.retries, stats.dumped
            ),
            Err(e) => failed.push(format!("{}: {}", bot_id, e)),
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(failed.join("; "))
    }
}

fn initdb(config_path: PathBuf, output: Option<PathBuf>) -> Result<(), String> {
    let registry = registry_for(&config_path)?;
    match output {
        Some(path) => {
            codegen::write_schema(&registry, &path)
                .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
            println!("✓ Wrote {} columns to {}", registry.len(), path.display());
        }
        None => print!("{}", codegen::generate_schema(&registry)),
    }
    Ok(())
}

fn check_harmonization(config_path: PathBuf, schema: bool) -> Result<(), String> {
    let registry = registry_for(&config_path)?;
    println!("✓ Harmonization schema: {} fields", registry.len());

    if schema {
        let mut fields: Vec<_> = registry.fields().collect();
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        for field in fields {
            match field.max_length {
                Some(max) => println!("  {} {} (max {})", field.name, field.field_type, max),
                None => println!("  {} {}", field.name, field.field_type),
            }
        }
    }

    if !config_path.exists() {
        println!("  ℹ No deployment file at {}, bundled schema checked", config_path.display());
        return Ok(());
    }

    let config = load_config(&config_path)?;
    let mut errors = Vec::new();
    for (bot_id, bot) in &config.bots {
        if !MODULES.contains(&bot.module.as_str()) {
            errors.push(format!("bot '{}': unknown module '{}'", bot_id, bot.module));
        }
        for field in &bot.dedup.ignore_fields {
            if !registry.contains(field) {
                errors.push(format!("bot '{}': dedup ignores unknown field '{}'", bot_id, field));
            }
        }
    }

    if !errors.is_empty() {
        for error in &errors {
            eprintln!("  ✗ {}", error);
        }
        return Err(format!("{} configuration error(s)", errors.len()));
    }
    println!("✓ {} bots configured", config.bots.len());
    Ok(())
}

fn dump_list(file: PathBuf, payload: bool) -> Result<(), String> {
    let records = read_dump_file(&file).map_err(|e| e.to_string())?;
    for record in &records {
        println!(
            "{} {} [{}] {} (queue: {})",
            record.timestamp.to_rfc3339(),
            record.bot_id,
            record.error_kind,
            record.error_message,
            record.source_queue.as_deref().unwrap_or("-")
        );
        if payload {
            match &record.payload_base64 {
                Some(encoded) => println!("    base64:{}", encoded),
                None => println!("    {}", record.payload),
            }
        }
    }
    println!("{} record(s) in {}", records.len(), file.display());
    Ok(())
}
