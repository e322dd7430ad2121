use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Context, Result, eyre};

use drip_core::{Channel, ConditionNode};
use drip_db::{DripDb, NewContact};
use drip_engine::{
    ChannelAdapter, DeliveryScheduler, EmailAdapter, EngineEvent, LogProvider, PushAdapter,
    RetryPolicy, SchedulerConfig, SmsAdapter,
};
use drip_track::AppState;

#[derive(Parser)]
#[command(name = "drip", about = "Campaign delivery & engagement pipeline", version)]
struct Cli {
    /// SQLite database path. Defaults to the platform data directory.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tracking and campaign API server.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
        /// Seconds between sweeps that promote due scheduled campaigns.
        #[arg(long, default_value_t = 30)]
        promote_interval: u64,
        /// Delivery workers per campaign dispatch.
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Send attempts per recipient before giving up.
        #[arg(long, default_value_t = 3)]
        retry_attempts: u32,
        /// Base backoff between attempts, in milliseconds.
        #[arg(long, default_value_t = 1000)]
        retry_base_ms: u64,
        /// Backoff ceiling, in milliseconds.
        #[arg(long, default_value_t = 60_000)]
        retry_cap_ms: u64,
    },
    /// Seed a demo dataset: contacts, a segment, a campaign and credits.
    InitDemo,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .from_env_lossy()
                .add_directive("drip_cli=info".parse().unwrap())
                .add_directive("drip_engine=info".parse().unwrap())
                .add_directive("drip_track=info".parse().unwrap())
                .add_directive("drip_db=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path()?,
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).wrap_err("Failed to create the data directory")?;
    }
    let db = Arc::new(
        DripDb::open(&db_path.to_string_lossy())
            .await
            .wrap_err("Failed to open the database")?,
    );
    println!("📁 Database: {}", db_path.display());

    match cli.command {
        Command::Serve {
            bind,
            promote_interval,
            workers,
            retry_attempts,
            retry_base_ms,
            retry_cap_ms,
        } => {
            let config =
                scheduler_config(workers, retry_attempts, retry_base_ms, retry_cap_ms);
            serve(db, bind, promote_interval, config).await
        }
        Command::InitDemo => init_demo(&db).await,
    }
}

fn scheduler_config(
    workers: usize,
    retry_attempts: u32,
    retry_base_ms: u64,
    retry_cap_ms: u64,
) -> SchedulerConfig {
    SchedulerConfig {
        worker_count: workers.max(1),
        retry: RetryPolicy {
            max_attempts: retry_attempts.max(1),
            base_delay_ms: retry_base_ms,
            max_delay_ms: retry_cap_ms.max(retry_base_ms),
            ..RetryPolicy::default()
        },
        ..SchedulerConfig::default()
    }
}

fn default_db_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("dev", "drip", "drip")
        .ok_or_else(|| eyre!("Could not determine a data directory"))?;
    Ok(dirs.data_dir().join("drip.db"))
}

async fn serve(
    db: Arc<DripDb>,
    bind: SocketAddr,
    promote_interval: u64,
    config: SchedulerConfig,
) -> Result<()> {
    let provider = Arc::new(LogProvider);
    let adapters: Vec<Arc<dyn ChannelAdapter>> = vec![
        Arc::new(EmailAdapter::new(provider.clone())),
        Arc::new(SmsAdapter::new(provider.clone())),
        Arc::new(PushAdapter::new(provider)),
    ];
    let mut scheduler = DeliveryScheduler::new(db.clone(), adapters, config);
    let mut event_rx = scheduler
        .take_event_receiver()
        .ok_or_else(|| eyre!("Event receiver already taken"))?;
    let scheduler = Arc::new(scheduler);

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log_event(event);
        }
    });

    let promoter = scheduler.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(promote_interval.max(1)));
        loop {
            tick.tick().await;
            match promoter.promote_due().await {
                Ok(promoted) => {
                    for campaign_id in promoted {
                        let scheduler = promoter.clone();
                        tokio::spawn(async move {
                            if let Err(e) = scheduler.dispatch(campaign_id).await {
                                tracing::error!(campaign_id, error = %e, "dispatch failed");
                            }
                        });
                    }
                }
                Err(e) => tracing::error!(error = %e, "promotion sweep failed"),
            }
        }
    });

    let app = drip_track::router(AppState::new(db, scheduler));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .wrap_err_with(|| format!("Failed to bind {bind}"))?;
    println!("🚀 Listening on http://{bind}");
    axum::serve(listener, app).await.wrap_err("Server error")?;
    Ok(())
}

fn log_event(event: EngineEvent) {
    match event {
        EngineEvent::CampaignQueued { campaign_id, recipients } => {
            tracing::info!(campaign_id, recipients, "campaign queued");
        }
        EngineEvent::CampaignScheduled { campaign_id, run_at } => {
            tracing::info!(campaign_id, run_at, "campaign scheduled");
        }
        EngineEvent::RecipientSent { campaign_id, contact_id, message_id } => {
            tracing::info!(campaign_id, contact_id, message_id = %message_id, "recipient sent");
        }
        EngineEvent::RecipientFailed { campaign_id, contact_id, kind, reason } => {
            tracing::warn!(campaign_id, contact_id, kind = kind.as_str(), reason = %reason, "recipient failed");
        }
        EngineEvent::QuotaExhausted { campaign_id, account_id } => {
            tracing::warn!(campaign_id, account_id = %account_id, "account balance exhausted");
        }
        EngineEvent::CampaignCancelled { campaign_id, cancelled } => {
            tracing::info!(campaign_id, cancelled, "campaign cancelled");
        }
        EngineEvent::CampaignCompleted { campaign_id, sent, failed } => {
            tracing::info!(campaign_id, sent, failed, "campaign completed");
        }
    }
}

async fn init_demo(db: &DripDb) -> Result<()> {
    let people: [(&str, &str, f64, i64, &[&str]); 5] = [
        ("ada@example.com", "+15550100001", 1420.0, 6, &["vip"]),
        ("grace@example.com", "+15550100002", 310.5, 2, &["newsletter"]),
        ("alan@example.com", "+15550100003", 2275.0, 9, &["vip", "beta"]),
        ("edsger@example.com", "+15550100004", 89.9, 1, &[]),
        ("barbara@example.com", "+15550100005", 0.0, 0, &["newsletter"]),
    ];
    for (email, phone, spent, orders, tags) in people {
        db.insert_contact(&NewContact {
            email: Some(email.into()),
            phone: Some(phone.into()),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            total_spent: spent,
            total_orders: orders,
            ..NewContact::default()
        })
        .await?;
    }

    let tree: ConditionNode = serde_json::from_value(serde_json::json!({
        "operator": "AND",
        "rules": [
            { "field": "total_spent", "operator": "greater_than", "value": 1000 },
            { "field": "total_orders", "operator": "greater_than", "value": 3 },
        ],
    }))?;
    let segment = db.insert_segment("big spenders", &tree, true).await?;

    let campaign = db
        .create_campaign(
            "demo",
            "Welcome back",
            Channel::Email,
            Some("We missed you"),
            "Here is 10% off your next order.",
            "shop@example.com",
        )
        .await?;
    db.set_balance("demo", Channel::Sms, 100).await?;

    println!("✅ Seeded 5 contacts, segment {} and campaign {}", segment.id, campaign.id);
    println!(
        "   Try: curl -X POST localhost:8080/campaigns/{}/send -H 'content-type: application/json' -d '{{\"segmentIds\": [{}]}}'",
        campaign.id, segment.id
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_reach_the_scheduler_config() {
        let cli = Cli::try_parse_from([
            "drip",
            "serve",
            "--workers",
            "8",
            "--retry-attempts",
            "5",
            "--retry-base-ms",
            "250",
            "--retry-cap-ms",
            "4000",
        ])
        .unwrap();
        let Command::Serve { workers, retry_attempts, retry_base_ms, retry_cap_ms, .. } = cli.command
        else {
            panic!("expected the serve subcommand");
        };
        let config = scheduler_config(workers, retry_attempts, retry_base_ms, retry_cap_ms);
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.max_delay_ms, 4000);
    }

    #[test]
    fn serve_defaults_match_the_built_in_config() {
        let cli = Cli::try_parse_from(["drip", "serve"]).unwrap();
        let Command::Serve { workers, retry_attempts, retry_base_ms, retry_cap_ms, .. } = cli.command
        else {
            panic!("expected the serve subcommand");
        };
        let config = scheduler_config(workers, retry_attempts, retry_base_ms, retry_cap_ms);
        assert_eq!(config.worker_count, SchedulerConfig::default().worker_count);
        assert_eq!(config.retry.max_attempts, RetryPolicy::default().max_attempts);
        assert_eq!(config.retry.base_delay_ms, RetryPolicy::default().base_delay_ms);
        assert_eq!(config.retry.max_delay_ms, RetryPolicy::default().max_delay_ms);
    }
}
