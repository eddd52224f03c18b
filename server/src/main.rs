use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use courier_server::auth::tokens::{load_or_generate_secret, SessionAuthority};
use courier_server::broker::{self, MessagePublisher, NatsBroker};
use courier_server::cache::{ObjectCache, PresenceCache, TokenIdentityStore};
use courier_server::chat::router::{LocalSender, MessageRouter};
use courier_server::config::{generate_config_template, Config};
use courier_server::routes;
use courier_server::state::AppState;
use courier_server::store::sqlite::{init_db, SqliteStore};
use courier_server::store::{GroupDirectory, MessageStore, UserStore};
use courier_server::ws::ConnectionRegistry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "courier_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "courier_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("Courier gateway v{} starting", env!("CARGO_PKG_VERSION"));

    // SQLite-backed collaborators (users, groups, message history)
    let db = init_db(&config.data_dir)?;
    let store = Arc::new(SqliteStore::new(db));

    // Load or generate JWT signing key (256-bit random, stored in data_dir)
    let jwt_secret = load_or_generate_secret(&config.data_dir)?;

    // Presence/token cache. Unreachable Redis is a configuration error:
    // fail the boot, not the first login.
    let cache = Arc::new(PresenceCache::connect(&config.redis_url)?);
    cache.ping().await?;
    tracing::info!("Presence cache connected at {}", config.redis_url);

    let registry = Arc::new(ConnectionRegistry::new());

    let sessions = Arc::new(SessionAuthority::new(
        jwt_secret.clone(),
        config.access_ttl_secs,
        config.refresh_ttl_secs,
        cache.clone() as Arc<dyn TokenIdentityStore>,
    ));

    // Broker adapter for cross-process delivery. Without one, this gateway
    // runs single-process and remote routing degrades to history-only.
    let publisher: Option<Arc<dyn MessagePublisher>> = if config.nats_url.is_empty() {
        tracing::warn!("No NATS URL configured, running single-process: no cross-process delivery");
        None
    } else {
        let nats = NatsBroker::connect(&config.nats_url).await?;
        nats.ensure_stream().await?;

        let consumer_broker = nats.clone();
        let consumer_registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = broker::run_consumer(consumer_broker, consumer_registry).await {
                tracing::error!(error = %e, "Broker consumer exited");
            }
        });

        Some(Arc::new(nats))
    };

    let router = Arc::new(MessageRouter::new(
        registry.clone() as Arc<dyn LocalSender>,
        publisher,
        store.clone() as Arc<dyn GroupDirectory>,
        store.clone() as Arc<dyn MessageStore>,
        cache.clone() as Arc<dyn ObjectCache>,
    ));

    // Build application state
    let app_state = AppState {
        registry,
        sessions,
        router,
        jwt_secret,
        cache: cache as Arc<dyn ObjectCache>,
        users: store.clone() as Arc<dyn UserStore>,
        groups: store.clone() as Arc<dyn GroupDirectory>,
        messages: store as Arc<dyn MessageStore>,
        history_ttl: Duration::from_secs(config.history_cache_ttl_secs),
    };

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
