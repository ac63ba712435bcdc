use std::sync::Arc;

use tracing::{info, warn};

use chatrelay::cache::CacheBus;
use chatrelay::catalog::CatalogManager;
use chatrelay::config::Config;
use chatrelay::media::LocalMediaStorage;
use chatrelay::processor::MessageProcessor;
use chatrelay::registry::{run_bus_subscriber, ConnectionRegistry};
use chatrelay::scheduler::spawn_survey_scheduler;
use chatrelay::shop::ShopClient;
use chatrelay::store::{PostgresStore, SqliteStore, Store};
use chatrelay::web::{start_web_server, AppState};
use chatrelay::whatsapp::WhatsAppClient;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!(
        r#"chatrelay v{VERSION} — WhatsApp Cloud API gateway for agent dashboards

USAGE:
    chatrelay <COMMAND>

COMMANDS:
    start       Start the gateway
    help        Show this help message

REQUIRED ENV:
    WHATSAPP_ACCESS_TOKEN     Cloud API access token
    WHATSAPP_PHONE_NUMBER_ID  Phone number id from the Meta dashboard
    WHATSAPP_VERIFY_TOKEN     Webhook verification token (you choose)

OPTIONAL ENV:
    PORT                      Listen port (default: 8080)
    BASE_URL                  Public base URL for media links
    DB_PATH                   SQLite file path (default: data/chatrelay.db)
    DATABASE_URL              Postgres URL (overrides DB_PATH)
    CACHE_URL                 Cache/bus URL; omit to run without the cache tier
    MEDIA_DIR                 Media directory (default: media)
    CATALOG_ID                Meta catalog id for interactive product sends
    WA_MAX_CONCURRENCY        Concurrent upstream calls (default: 4)
    SEND_TEXT_PER_MIN         Per-agent text budget (default: 30)
    SEND_MEDIA_PER_MIN        Per-agent media budget (default: 5)
    ENABLE_WS_PUBSUB          Cross-instance fan-out, 1/0 (default: 1)
    AUTO_REPLY_CATALOG_MATCH  Catalog auto-reply, 1/0 (default: 0)
    AUTO_REPLY_MIN_SCORE      Fuzzy-match threshold (default: 0.6)
    AUTO_REPLY_TEST_NUMBERS   Comma-separated phone whitelist
    SHOP_API_BASE             E-commerce backend admin API base
    SHOP_API_TOKEN            E-commerce backend token
    RUST_LOG                  Log level, e.g. debug, info (default: info)"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("start") => {}
        Some("help" | "--help" | "-h") | None => {
            print_help();
            return Ok(());
        }
        Some(unknown) => {
            eprintln!("Unknown command: {unknown}\n");
            print_help();
            std::process::exit(1);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Arc::new(Config::from_env()?);
    info!("Starting chatrelay...");

    let metrics = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("metrics recorder install failed: {e}"))?;

    std::fs::create_dir_all(config.media_dir_path())?;

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => match PostgresStore::connect(url).await {
            Ok(store) => {
                info!("Connected to Postgres store");
                Arc::new(store)
            }
            Err(e) => {
                // Same fallback the deployment scripts rely on: a broken
                // DATABASE_URL must not keep the gateway down.
                warn!("Postgres unavailable, falling back to SQLite: {e}");
                Arc::new(SqliteStore::new(&config.db_path)?)
            }
        },
        None => Arc::new(SqliteStore::new(&config.db_path)?),
    };
    info!("Store initialized");

    let cache = Arc::new(CacheBus::connect(config.cache_url.as_deref()).await);
    let registry = Arc::new(ConnectionRegistry::new(store.clone(), cache.clone(), &config));
    let client = Arc::new(WhatsAppClient::new(&config));
    let catalog = Arc::new(CatalogManager::new(&config));
    let shop = Arc::new(ShopClient::new(
        config.shop_api_base.clone(),
        config.shop_api_token.clone(),
    ));
    let storage = Arc::new(LocalMediaStorage::new(
        &config.base_url,
        &config.media_dir_path(),
    ));
    let processor = Arc::new(MessageProcessor::new(
        registry.clone(),
        cache.clone(),
        store.clone(),
        client.clone(),
        catalog.clone(),
        shop,
        storage,
        &config,
    ));

    if config.enable_ws_pubsub && cache.is_enabled() {
        tokio::spawn(run_bus_subscriber(registry.clone(), cache.clone()));
    }
    if cache.is_enabled() {
        spawn_survey_scheduler(processor.clone());
    }

    // Warm the catalog cache without blocking startup.
    {
        let catalog = catalog.clone();
        tokio::spawn(async move {
            match catalog.refresh_catalog_cache().await {
                Ok(count) => info!("Catalog cache created with {count} items"),
                Err(e) => warn!("Catalog cache refresh failed: {e}"),
            }
        });
    }

    let state = AppState {
        config,
        store,
        cache,
        registry,
        processor,
        client,
        catalog,
        metrics,
    };
    start_web_server(state).await?;
    Ok(())
}
