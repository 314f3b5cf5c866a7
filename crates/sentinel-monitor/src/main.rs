//! Sentinel Monitor
//!
//! Consumes wallet events from Redis, runs correlation and risk gating,
//! and publishes admission decisions and alerts.

mod monitor;
mod publisher;

use std::path::PathBuf;
use std::sync::Arc;

use admission::{AuditLogger, EngineComponents, EngineSettings, PgAuditStorage, SentinelEngine};
use anyhow::Result;
use risk_manager::{CircuitBreaker, CircuitBreakerRepository};
use sentinel_core::config::Config;
use sentinel_core::db;
use sentinel_core::store::PgCorrelationStore;
use signal_attribution::{AttributionLedger, AttributionRepository, TradeForensics};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const HEALTH_FILE: &str = "/tmp/healthy";

fn touch_health_file() {
    let _ = std::fs::write(HEALTH_FILE, format!("{}", chrono::Utc::now().timestamp()));
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "sentinel_monitor=info,admission=info,correlation_engine=info,signal_attribution=info,risk_manager=info,sentinel_core=warn,sqlx=warn,hyper=warn".into()
    });

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting Sentinel Monitor");
    touch_health_file();

    let config = Config::from_env()?;
    let settings_path = std::env::var("SENTINEL_CONFIG").ok().map(PathBuf::from);
    let settings = EngineSettings::load(settings_path.as_deref())?;

    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool).await?;
    info!("Database ready");

    let store = Arc::new(PgCorrelationStore::new(pool.clone()));
    let components = EngineComponents {
        breaker: Arc::new(CircuitBreaker::with_store(
            settings.risk.clone(),
            Arc::new(CircuitBreakerRepository::new(pool.clone())),
        )),
        ledger: Arc::new(AttributionLedger::with_repository(
            settings.attribution.clone(),
            AttributionRepository::new(pool.clone()),
        )),
        forensics: Arc::new(
            TradeForensics::new().with_repository(AttributionRepository::new(pool.clone())),
        ),
        audit: Some(Arc::new(AuditLogger::new(Arc::new(PgAuditStorage::new(pool))))),
    };

    let redis_client = redis::Client::open(config.redis.url.as_str())?;
    let publisher = Arc::new(publisher::SignalPublisher::new(redis_client, config.alerts.clone()).await?);

    let engine = Arc::new(SentinelEngine::new(settings, store, components, publisher.clone()));
    engine.restore(chrono::Utc::now()).await?;

    let monitor = monitor::SentinelMonitor::new(engine, publisher, config.redis.url.clone());
    monitor.run().await?;

    Ok(())
}
