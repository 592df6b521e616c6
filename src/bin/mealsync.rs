//! mealsync: offline meal capture CLI.
//!
//! Captures land in the local store immediately; `sync` or `run` uploads
//! them to mealsyncd when the network allows.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mealsync::client::ClientConfig;
use mealsync::{CapturePipeline, CaptureRecord, NutritionItem, StaticToken, SyncState, SyncStatus};

/// Mealsync CLI client
#[derive(Parser)]
#[command(name = "mealsync")]
#[command(version = mealsync::PKG_VERSION)]
#[command(about = "Offline-first meal capture client")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bearer token for the analysis server.
    #[arg(long, env = "MEALSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture a meal photo
    Capture {
        /// Image file
        image: PathBuf,
        /// Content type (default: guessed from the extension)
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Capture a manually entered food item
    Add {
        name: String,
        #[arg(long)]
        calories: Option<f64>,
        #[arg(long)]
        protein: Option<f64>,
        #[arg(long)]
        carbs: Option<f64>,
        #[arg(long)]
        fat: Option<f64>,
        #[arg(long)]
        sugar: Option<f64>,
        #[arg(long)]
        portion: Option<String>,
    },

    /// List captures that are not yet synced
    Status {
        /// Include synced captures
        #[arg(long)]
        all: bool,
    },

    /// Upload everything eligible now, then exit
    Sync,

    /// Run upload workers and the reconciler until Ctrl+C
    Run,

    /// Run one reconciliation sweep
    Reconcile,

    /// Make a failed capture eligible for upload again
    Retry { id: String },

    /// Delete a capture
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = ClientConfig::load(args.config.as_deref())?;
    let needs_token = matches!(args.command, Command::Sync | Command::Run);
    let token = args.token.unwrap_or_default();
    if needs_token && token.is_empty() {
        return Err("MEALSYNC_TOKEN (or --token) is required to upload".into());
    }

    let pipeline = config
        .pipeline_builder()
        .token_provider(Arc::new(StaticToken::new(token)))
        .build()?;

    match args.command {
        Command::Capture {
            image,
            content_type,
        } => {
            let content_type = content_type
                .or_else(|| guess_content_type(&image).map(str::to_string))
                .ok_or("cannot guess the image type, pass --content-type")?;
            let bytes = tokio::fs::read(&image).await?;
            let record = pipeline.capture_image(bytes, content_type)?;
            println!("captured {}", record.id);
        }

        Command::Add {
            name,
            calories,
            protein,
            carbs,
            fat,
            sugar,
            portion,
        } => {
            let item = NutritionItem {
                name,
                calories,
                protein,
                carbs,
                fat,
                sugar,
                portion,
                confidence: None,
            };
            let record = pipeline.capture_items(vec![item])?;
            println!("captured {}", record.id);
        }

        Command::Status { all } => {
            let records = if all {
                pipeline.store().snapshot().as_ref().clone()
            } else {
                pipeline.unsynced()
            };
            if records.is_empty() {
                println!("nothing to sync");
            }
            for record in &records {
                print_record(record);
            }
        }

        Command::Sync => {
            let passes = pipeline.sync_now().await;
            let failed = pipeline.list_by_state(SyncStatus::Failed).len();
            println!("{passes} upload pass(es), {failed} record(s) failed");
        }

        Command::Run => run(&pipeline).await?,

        Command::Reconcile => {
            let report = pipeline.reconcile_now()?;
            println!(
                "requeued {}, pruned {}",
                report.requeued.len(),
                report.pruned.len()
            );
        }

        Command::Retry { id } => {
            let record = pipeline.retry_now(&id)?;
            println!("{} is {:?}", record.id, record.status());
        }

        Command::Delete { id } => {
            if pipeline.delete(&id)? {
                println!("deleted {id}");
            } else {
                println!("no capture {id}");
            }
        }
    }

    Ok(())
}

async fn run(pipeline: &CapturePipeline) -> Result<(), Box<dyn std::error::Error>> {
    use futures_util::StreamExt;

    let handle = pipeline.start();
    let events = pipeline.subscribe();
    tokio::pin!(events);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.next() => match event {
                Some(mealsync::SyncEvent::Synced { id, result }) => {
                    println!("synced {id}: {:.0} kcal via {}", result.totals().calories, result.provider());
                }
                Some(mealsync::SyncEvent::Failed { id, failure }) => {
                    println!("failed {id}: {} ({})", failure.message, failure.code);
                }
                None => break,
            },
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn print_record(record: &CaptureRecord) {
    let state = match &record.sync_state {
        SyncState::Failed { reason } => format!("failed: {}", reason.code),
        other => format!("{:?}", other.status()).to_lowercase(),
    };
    let totals = record
        .result
        .as_ref()
        .map(|r| format!(" {:.0} kcal", r.totals().calories))
        .unwrap_or_default();
    println!(
        "{}  {}  {state}  attempts={}{totals}",
        record.id,
        record.created_at.format("%Y-%m-%d %H:%M"),
        record.attempts
    );
}

fn guess_content_type(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "heic" => Some("image/heic"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}
