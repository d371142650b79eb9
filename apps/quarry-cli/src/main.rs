mod engine;
mod logging;
mod probe;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use quarry_core::util::env_bool;
use quarry_core::{
    AcquisitionRequest, Catalog, CatalogEntry, CatalogFilter, QuantizationChoice, Settings,
};
use quarry_events::Envelope;
use quarry_topics::{TOPIC_ACQUIRE_STATE, TOPIC_PROGRESS};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::Engine;

#[derive(Parser)]
#[command(name = "quarry", version, about = "Fetch, register and track local GGUF models")]
struct Cli {
    /// TOML config file (else QUARRY_CONFIG, else configs/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Skip the automatic legacy migration check on startup
    #[arg(long, global = true)]
    no_auto_migrate: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print effective paths and settings (JSON)
    Paths(PathsArgs),
    /// Browse the model catalog
    Catalog {
        #[command(subcommand)]
        cmd: CatalogCmd,
    },
    /// Download and register a model
    Acquire(AcquireArgs),
    /// Inspect and maintain download records
    Records {
        #[command(subcommand)]
        cmd: RecordsCmd,
    },
    /// Inference service helpers
    Service {
        #[command(subcommand)]
        cmd: ServiceCmd,
    },
    /// Legacy JSON migration
    Migrate {
        #[command(subcommand)]
        cmd: MigrateCmd,
    },
}

#[derive(Args)]
struct PathsArgs {
    #[arg(long)]
    pretty: bool,
}

#[derive(Args, Clone, Copy)]
struct HardwareArgs {
    /// Size recommendations to this machine
    #[arg(long)]
    auto_hw: bool,
    /// Accelerator memory in GB (implies --auto-hw)
    #[arg(long)]
    vram_gb: Option<f64>,
}

impl HardwareArgs {
    fn report(&self) -> Option<quarry_core::CapabilityReport> {
        (self.auto_hw || self.vram_gb.is_some()).then(|| probe::detect(self.vram_gb))
    }
}

#[derive(Subcommand)]
enum CatalogCmd {
    /// List entries, smallest first
    List(CatalogListArgs),
    /// Show one entry with size estimates
    Show { model: String },
}

#[derive(Args)]
struct CatalogListArgs {
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    subcategory: Option<String>,
    /// Maximum parameters in billions
    #[arg(long)]
    max_params: Option<f64>,
    /// Minimum context length
    #[arg(long)]
    min_ctx: Option<u64>,
    #[arg(long)]
    lang: Option<String>,
    #[command(flatten)]
    hw: HardwareArgs,
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct AcquireArgs {
    /// Catalog id or display name
    model: String,
    /// Quantization label, or "best"
    #[arg(long)]
    quant: Option<String>,
    #[command(flatten)]
    hw: HardwareArgs,
}

#[derive(Subcommand)]
enum RecordsCmd {
    List,
    /// Records whose model or service name contains NAME
    Find { name: String },
    /// Re-check every artifact on disk
    Verify,
    /// Delete the artifact, unregister it and drop the record
    Remove { key: String },
}

#[derive(Subcommand)]
enum ServiceCmd {
    Ping,
    List,
}

#[derive(Subcommand)]
enum MigrateCmd {
    Status,
    /// Migrate now if legacy data is waiting
    Run {
        /// Re-import even when a previous migration completed
        #[arg(long)]
        force: bool,
    },
    /// Restore legacy files from a backup (latest by default)
    Rollback {
        #[arg(long)]
        timestamp: Option<String>,
    },
    Backups,
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    if let Commands::Paths(args) = &cli.command {
        return print_json(&settings.effective_json(), args.pretty);
    }
    let engine = Engine::open(settings)?;
    let migrating = matches!(cli.command, Commands::Migrate { .. });
    let auto = !cli.no_auto_migrate && env_bool("QUARRY_AUTO_MIGRATE").unwrap_or(true);
    if auto && !migrating {
        auto_migrate(&engine);
    }

    match cli.command {
        Commands::Paths(_) => Ok(()),
        Commands::Catalog { cmd } => catalog_cmd(&engine, cmd),
        Commands::Acquire(args) => acquire_cmd(&engine, args).await,
        Commands::Records { cmd } => records_cmd(&engine, cmd).await,
        Commands::Service { cmd } => service_cmd(&engine, cmd).await,
        Commands::Migrate { cmd } => migrate_cmd(&engine, cmd),
    }
}

/// A failed startup migration is reported and the command proceeds.
fn auto_migrate(engine: &Engine) {
    match engine.migration().run() {
        Ok(Some(report)) => info!(
            conversations = report.conversations,
            download_records = report.download_records,
            skipped = report.skipped.len(),
            "legacy data migrated"
        ),
        Ok(None) => {}
        Err(err) => warn!(%err, "automatic migration failed; legacy files left untouched"),
    }
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let out = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{out}");
    Ok(())
}

fn catalog_cmd(engine: &Engine, cmd: CatalogCmd) -> Result<()> {
    let catalog = engine.catalog()?;
    match cmd {
        CatalogCmd::List(args) => {
            let filter = CatalogFilter {
                category: args.category,
                subcategory: args.subcategory,
                max_params_b: args.max_params,
                min_context: args.min_ctx,
                language: args.lang,
                hardware: args.hw.report(),
            };
            let entries: Vec<CatalogEntry> = catalog.list(filter).collect();
            if args.json {
                return print_json(&entries, true);
            }
            for e in &entries {
                println!(
                    "{:<40} {:<28} {:>6} {:>8}  {}",
                    e.id,
                    e.name,
                    e.params,
                    e.ctx,
                    e.quantizations.join(",")
                );
            }
            if entries.is_empty() {
                eprintln!("no catalog entries match");
            }
            Ok(())
        }
        CatalogCmd::Show { model } => show_entry(&catalog, &model),
    }
}

fn show_entry(catalog: &Catalog, model: &str) -> Result<()> {
    let entry = catalog.resolve(model)?;
    let sizes: Vec<serde_json::Value> = entry
        .quantizations
        .iter()
        .map(|q| {
            serde_json::json!({
                "quantization": q,
                "file": entry.filename_for(q),
                "service_name": entry.service_name(q),
                "size_gb": round1(quarry_core::hardware::estimate_size_gb(entry.params_b, q)),
                "vram_gb": round1(quarry_core::hardware::estimate_vram_gb(entry.params_b, q)),
            })
        })
        .collect();
    print_json(
        &serde_json::json!({"entry": entry, "quantizations": sizes}),
        true,
    )
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

async fn acquire_cmd(engine: &Engine, args: AcquireArgs) -> Result<()> {
    let catalog = engine.catalog()?;
    let orchestrator = engine.orchestrator(catalog, args.hw.report())?;
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling...");
            ctrl_c.cancel();
        }
    });
    let watcher = tokio::spawn(report_events(engine.bus.subscribe()));

    let req = AcquisitionRequest::new(&args.model, QuantizationChoice::parse(args.quant.as_deref()));
    let result = orchestrator.acquire_with_cancel(req, cancel).await;
    watcher.abort();
    let outcome = result.with_context(|| format!("acquiring {}", args.model))?;
    print_json(&outcome, true)
}

/// Progress and state lines on stderr while an acquisition runs.
async fn report_events(mut rx: tokio::sync::broadcast::Receiver<Envelope>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        let env = match rx.recv().await {
            Ok(env) => env,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        let p = &env.payload;
        match env.kind.as_str() {
            TOPIC_PROGRESS => {
                let file = p["file"].as_str().unwrap_or("?");
                let done = p["downloaded"].as_u64().unwrap_or(0) as f64 / 1_048_576.0;
                match p["percent"].as_f64() {
                    Some(pct) => eprintln!("  {file}: {done:.1} MiB ({pct:.1}%)"),
                    None => eprintln!("  {file}: {done:.1} MiB"),
                }
            }
            TOPIC_ACQUIRE_STATE => {
                let state = p["state"].as_str().unwrap_or("?");
                let key = p["key"].as_str().unwrap_or("?");
                eprintln!("[{key}] {state}");
            }
            _ => {}
        }
    }
}

async fn records_cmd(engine: &Engine, cmd: RecordsCmd) -> Result<()> {
    match cmd {
        RecordsCmd::List => print_json(&engine.store.list_async().await?, true),
        RecordsCmd::Find { name } => {
            let found = engine.store.find_by_name_async(&name).await?;
            if found.is_empty() {
                bail!("no download record matches {name}");
            }
            print_json(&found, true)
        }
        RecordsCmd::Verify => {
            let orchestrator = engine.orchestrator(Arc::new(Catalog::default()), None)?;
            let verified = orchestrator.verify_records().await?;
            for rec in verified.iter().filter(|r| !r.file_exists) {
                eprintln!("missing: {} ({})", rec.key, rec.artifact_path.display());
            }
            print_json(&verified, true)
        }
        RecordsCmd::Remove { key } => {
            let orchestrator = engine.orchestrator(Arc::new(Catalog::default()), None)?;
            let removal = orchestrator
                .remove(&key)
                .await
                .with_context(|| format!("removing {key}"))?;
            print_json(&removal, true)
        }
    }
}

async fn service_cmd(engine: &Engine, cmd: ServiceCmd) -> Result<()> {
    let registrar = engine.registrar()?;
    match cmd {
        ServiceCmd::Ping => {
            let status = registrar
                .ensure_available()
                .await
                .with_context(|| format!("probing {}", engine.settings.service.base_url))?;
            print_json(&status, true)
        }
        ServiceCmd::List => print_json(&registrar.list().await?, true),
    }
}

fn migrate_cmd(engine: &Engine, cmd: MigrateCmd) -> Result<()> {
    let migration = engine.migration();
    match cmd {
        MigrateCmd::Status => print_json(&migration.status()?, true),
        MigrateCmd::Run { force } => {
            let report = if force {
                Some(migration.migrate()?)
            } else {
                migration.run()?
            };
            match report {
                Some(report) => print_json(&report, true),
                None => {
                    eprintln!("nothing to migrate");
                    Ok(())
                }
            }
        }
        MigrateCmd::Rollback { timestamp } => {
            print_json(&migration.rollback(timestamp.as_deref())?, true)
        }
        MigrateCmd::Backups => print_json(&migration.list_backups()?, true),
    }
}
