use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use fwdb_core::{EmailKey, UpdateMode, TABLE_NAME};
use fwdb_reconcile::{export_diff_csv, export_filename, ingest_file, InclusionMask, ReconcileConfig, Reconciler};
use fwdb_storage::UploadStore;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fwdb-cli")]
#[command(about = "FW Data Base contact reconciliation")]
struct Cli {
    /// Overrides DATABASE_URL for this invocation.
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web UI.
    Serve,
    /// Reconcile a spreadsheet against the contact table.
    Ingest {
        file: PathBuf,
        #[arg(long, default_value = "replace")]
        mode: UpdateMode,
        /// Sheet to process; repeat for several. Defaults to the first sheet.
        #[arg(long = "sheet")]
        sheets: Vec<String>,
        /// Email whose change should not be applied; repeatable.
        #[arg(long = "exclude")]
        exclude: Vec<String>,
        #[arg(long)]
        dry_run: bool,
        /// Write the proposed changes as CSV to this path.
        #[arg(long)]
        changes_csv: Option<PathBuf>,
    },
    Stats,
    /// Export the whole table as CSV.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Write a Parquet snapshot of the table into the reports directory.
    Snapshot,
    /// Drop the contact table. Irreversible.
    Drop {
        #[arg(long)]
        confirm: bool,
    },
    /// Delete every row whose email matches.
    DeleteRow {
        #[arg(long)]
        email: String,
    },
    /// Remove stored uploads older than the given number of days.
    PruneUploads {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = ReconcileConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => fwdb_web::serve(config).await?,
        Commands::Ingest {
            file,
            mode,
            sheets,
            exclude,
            dry_run,
            changes_csv,
        } => {
            let reconciler = Reconciler::connect(config).await?;
            let ingested = ingest_file(&file, &sheets)?;
            for failure in &ingested.report.failed {
                warn!(sheet = %failure.name, error = %failure.error, "sheet skipped");
            }
            let diff = reconciler.preview(&ingested.batch, mode).await?;
            let summary = diff.summary();
            println!(
                "preview ({mode}): rows={} stored={} updates={} inserts={} duplicates={} unchanged={}",
                summary.batch_rows,
                summary.stored_rows,
                summary.updates,
                summary.inserts,
                summary.duplicates,
                summary.unchanged
            );
            if let Some(path) = changes_csv {
                tokio::fs::write(&path, export_diff_csv(&diff)?).await?;
                println!("changes written to {}", path.display());
            }
            if dry_run {
                return Ok(());
            }
            let mut mask = InclusionMask::for_diff(&diff);
            mask.exclude_all(exclude.iter().map(|email| EmailKey::from_email(email)));
            let report = reconciler.apply(&ingested.batch, mode, &mask).await?;
            println!("{}", report.message);
        }
        Commands::Stats => {
            let reconciler = Reconciler::connect(config).await?;
            let stats = reconciler.stats().await?;
            println!("table={TABLE_NAME} exists={} rows={}", stats.exists, stats.row_count);
        }
        Commands::Export { out } => {
            let reconciler = Reconciler::connect(config).await?;
            let bytes = reconciler.export_table_csv().await?;
            let path = out.unwrap_or_else(|| PathBuf::from(export_filename(TABLE_NAME, Utc::now())));
            tokio::fs::write(&path, bytes).await?;
            println!("exported to {}", path.display());
        }
        Commands::Snapshot => {
            let reconciler = Reconciler::connect(config).await?;
            match reconciler.snapshot().await? {
                Some(manifest) => println!(
                    "snapshot complete: rows={} manifest={}",
                    manifest.rows,
                    manifest.manifest_path.display()
                ),
                None => println!("table {TABLE_NAME} does not exist; nothing to snapshot"),
            }
        }
        Commands::Drop { confirm } => {
            if !confirm {
                bail!("refusing to drop {TABLE_NAME} without --confirm");
            }
            let reconciler = Reconciler::connect(config).await?;
            let report = reconciler.drop_table().await?;
            if report.existed {
                println!("dropped {TABLE_NAME} ({} rows)", report.rows_removed);
            } else {
                println!("table {TABLE_NAME} did not exist");
            }
            if let Some(snapshot) = report.snapshot {
                println!("snapshot saved to {}", snapshot.manifest_path.display());
            }
        }
        Commands::DeleteRow { email } => {
            let reconciler = Reconciler::connect(config).await?;
            let removed = reconciler.delete_by_key(&EmailKey::from_email(&email)).await?;
            println!("deleted {removed} row(s) for {email}");
        }
        Commands::PruneUploads { days } => {
            let uploads = UploadStore::new(config.uploads_dir);
            let removed = uploads.prune_older_than(Utc::now() - Duration::days(days)).await?;
            println!("pruned {removed} upload(s)");
        }
    }

    Ok(())
}
