use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trellis_content::{EntryQuery, SourceStore};
use trellis_core::ContentKind;
use trellis_sync::{ReconcileAction, SyncConfig};
use trellis_web::{publish_entry_by_id, publish_homepage, AppState};

#[derive(Debug, Parser)]
#[command(name = "trellis")]
#[command(about = "Trellis content sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web server (previews, publish triggers, webhook).
    Serve,
    /// Render one article or recipe and publish it to the destination.
    PublishArticle { id: String },
    /// Render one category listing page and publish it.
    PublishCategory { id: String },
    /// Render one FAQ and publish it.
    PublishFaq { id: String },
    /// Aggregate top-level categories and publish the homepage.
    PublishHome,
    /// Publish every live entry of a kind, one at a time.
    BulkSync {
        #[arg(long, value_enum, default_value_t = BulkKind::Article)]
        kind: BulkKind,
        /// Pause between entries, to stay polite to both APIs.
        #[arg(long, default_value_t = 1000)]
        delay_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BulkKind {
    Article,
    Recipe,
    Category,
    Faq,
}

impl From<BulkKind> for ContentKind {
    fn from(kind: BulkKind) -> Self {
        match kind {
            BulkKind::Article => ContentKind::Article,
            BulkKind::Recipe => ContentKind::Recipe,
            BulkKind::Category => ContentKind::Category,
            BulkKind::Faq => ContentKind::Faq,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trellis=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            trellis_web::serve_from_env().await?;
        }
        Commands::PublishArticle { id }
        | Commands::PublishCategory { id }
        | Commands::PublishFaq { id } => {
            let state = AppState::from_config(SyncConfig::from_env())?;
            let receipt = publish_entry_by_id(&state, &id).await?;
            println!(
                "{} {} -> {} (page id {})",
                receipt.action, id, receipt.identifier, receipt.page_id
            );
        }
        Commands::PublishHome => {
            let state = AppState::from_config(SyncConfig::from_env())?;
            let receipt = publish_homepage(&state).await?;
            println!(
                "{} homepage -> {} (page id {})",
                receipt.action, receipt.identifier, receipt.page_id
            );
        }
        Commands::BulkSync { kind, delay_ms } => {
            bulk_sync(kind.into(), delay_ms).await?;
        }
    }
    Ok(())
}

async fn bulk_sync(kind: ContentKind, delay_ms: u64) -> Result<()> {
    let state = AppState::from_config(SyncConfig::from_env())?;

    // Page through every entry of the kind; archived ones are skipped.
    let page_size = 100;
    let mut skip = 0;
    let mut ids = Vec::new();
    loop {
        let query = EntryQuery::of_kind(kind)
            .with_limit(page_size)
            .with_skip(skip);
        let page = state.delivery.entries(&query).await?;
        let fetched = page.items.len();
        ids.extend(
            page.items
                .into_iter()
                .filter(|entry| !entry.is_archived())
                .map(|entry| entry.id),
        );
        if fetched < page_size {
            break;
        }
        skip += page_size;
    }
    println!("found {} live {} entries", ids.len(), kind.as_str());

    let mut created = 0usize;
    let mut updated = 0usize;
    let mut recreated = 0usize;
    let mut failed = 0usize;
    let total = ids.len();

    for (index, id) in ids.iter().enumerate() {
        match publish_entry_by_id(&state, id).await {
            Ok(receipt) => {
                match receipt.action {
                    ReconcileAction::Created => created += 1,
                    ReconcileAction::Updated => updated += 1,
                    ReconcileAction::Recreated => recreated += 1,
                }
                println!(
                    "[{}/{}] {} {} -> {}",
                    index + 1,
                    total,
                    receipt.action,
                    id,
                    receipt.identifier
                );
            }
            Err(err) => {
                failed += 1;
                eprintln!("[{}/{}] failed {}: {}", index + 1, total, id, err);
            }
        }
        if delay_ms > 0 && index + 1 < total {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    println!(
        "bulk sync complete: created={created} updated={updated} recreated={recreated} failed={failed}"
    );
    Ok(())
}
