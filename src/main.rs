use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use contact_recon::{Pipeline, ReconConfig, RunSummary};

#[derive(Parser, Debug)]
#[command(name = "contact-recon")]
#[command(about = "Reconcile a contact spreadsheet against an admin-panel export", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite staging database
    #[arg(long, env = "CONTACT_RECON_DB")]
    db: Option<PathBuf>,

    /// Directory for report artifacts
    #[arg(long, env = "CONTACT_RECON_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stage one export; reports once both sides are staged
    Reconcile { file: PathBuf },
    /// Full run over a spreadsheet and an admin-panel export
    Pair { first: PathBuf, second: PathBuf },
    /// Show how many rows each staging table holds
    Status,
    /// Empty both staging tables
    Clear,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ReconConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?
        .with_database_path(cli.db.clone())
        .with_output_dir(cli.output_dir.clone());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let pipeline = Pipeline::open(&config).with_context(|| {
        format!("Failed to open staging database {}", config.database_path.display())
    })?;

    match &cli.command {
        Command::Reconcile { file } => {
            let summary = pipeline
                .reconcile(file)
                .with_context(|| format!("Reconciliation of {} failed", file.display()))?;
            print_summary(&summary, cli.json)?;
        }
        Command::Pair { first, second } => {
            let summary = pipeline
                .reconcile_pair(first, second)
                .context("Paired reconciliation failed")?;
            print_summary(&summary, cli.json)?;
        }
        Command::Status => {
            let (a, b) = pipeline.staged_counts()?;
            if cli.json {
                println!("{}", serde_json::json!({ "source_a": a, "source_b": b }));
            } else {
                println!("📊 Staged rows");
                println!("   spreadsheet (A):  {}", a);
                println!("   admin panel (B):  {}", b);
            }
        }
        Command::Clear => {
            pipeline.clear()?;
            if !cli.json {
                println!("✓ Staging tables cleared");
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("🔗 Contact reconciliation run {}", summary.run_id);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for source in &summary.sources {
        println!("\n📂 {} ({})", source.file.display(), source.kind.name());
        println!("   sha256:       {}", source.sha256);
        println!("   rows read:    {}", source.rows_read);
        println!("   rows skipped: {}", source.rows_skipped);
        println!(
            "   staged:       {} new, {} duplicates, {} failed",
            source.load.inserted, source.load.incremented, source.load.failed
        );
        for warning in &source.warnings {
            println!(
                "   ⚠️  row {}: {} ({} cells)",
                warning.row, warning.reason, warning.width
            );
        }
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    match &summary.report_path {
        Some(path) => {
            println!("✅ Matched pairs:        {}", summary.matched_pairs);
            println!("✓ Duplicate keys (A):   {}", summary.duplicate_groups_a);
            println!("✓ Duplicate keys (B):   {}", summary.duplicate_groups_b);
            println!("📄 Report: {}", path.display());
        }
        None => {
            println!("⏳ Staged; waiting for the counterpart export");
        }
    }

    Ok(())
}
