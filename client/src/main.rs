//! `tether` - inspect and repair a tether database.
//!
//! Lists queued, dead-lettered and conflicted operations and lets an operator
//! requeue or discard them without opening the app.

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tether_client::{Choice, Config, SyncClient};
use tether_engine::{Schema, Seq};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Inspect and repair an offline-first tether database")]
#[command(version, propagate_version = true)]
struct Cli {
    /// SQLite database URL, e.g. sqlite://dashboard.db. Defaults to DATABASE_URL
    #[arg(long)]
    database_url: Option<String>,

    /// Tab identity used for operator actions. Defaults to TAB_ID
    #[arg(long)]
    tab_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue depth, lease holder and per-collection sync state
    Status,
    /// Operations that ran out of attempts
    DeadLetters,
    /// Operations parked on a conflict
    Conflicts,
    /// Requeue a dead-lettered operation
    Retry { seq: Seq },
    /// Drop a dead-lettered or conflicted operation
    Discard { seq: Seq },
    /// Settle a parked conflict
    Resolve {
        seq: Seq,
        #[arg(long, value_enum)]
        keep: Side,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Side {
    Local,
    Remote,
}

impl From<Side> for Choice {
    fn from(side: Side) -> Self {
        match side {
            Side::Local => Choice::KeepLocal,
            Side::Remote => Choice::KeepRemote,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_client=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer().with_writer(std::io::stderr),
        )
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match cli.database_url {
        Some(url) => Config::with_database_url(url)?,
        None => Config::from_env()?,
    };
    if let Some(tab_id) = cli.tab_id {
        config.tab_id = tab_id;
    }
    let client = SyncClient::open(&config, Schema::dashboard()).await?;

    let output = match cli.command {
        Commands::Status => {
            let pending = client.pending_count().await?;
            let dead_letters = client.dead_letters().await?.len();
            let conflicts = client.conflicts().await?.len();
            let lease = client.db().lease().await?;
            let collections = client.db().all_meta().await?;
            json!({
                "pending": pending,
                "deadLetters": dead_letters,
                "conflicts": conflicts,
                "lease": lease,
                "collections": collections,
            })
        }
        Commands::DeadLetters => serde_json::to_value(client.dead_letters().await?)?,
        Commands::Conflicts => serde_json::to_value(client.conflicts().await?)?,
        Commands::Retry { seq } => {
            client.retry_dead_letter(seq).await?;
            json!({ "requeued": seq })
        }
        Commands::Discard { seq } => {
            client.discard(seq).await?;
            json!({ "discarded": seq })
        }
        Commands::Resolve { seq, keep } => {
            client.resolve_conflict(seq, keep.into()).await?;
            json!({ "resolved": seq, "keep": format!("{keep:?}").to_lowercase() })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
