//! Gatekeeper worker - task-execution engine.
//!
//! Consumes membership-application tasks from RabbitMQ and carries out their
//! side effects: game-server commands, templated e-mails, document updates,
//! and cache maintenance.
//!
//! ## Configuration
//!
//! - `GATEKEEPER_CONFIG`: path to the TOML config (default: `config/gatekeeper.toml`)
//! - `FRONTEND_DEPLOYED_URL`: base URL for user-facing links
//! - `RUST_LOG`: logging level (default: "info")

use std::sync::Arc;
use tracing::{error, info};

use gatekeeper::clients::{HttpApplicationStore, RconClient, RedisCache, RelayMailer};
use gatekeeper::services::GameRpc;
use gatekeeper::shutdown::ShutdownSignal;
use gatekeeper::{Engine, GatekeeperConfig, Services};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let config = match GatekeeperConfig::load() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(environment = %config.environment, "Gatekeeper worker starting");

    // The test environment runs without a live game server
    let game_rpc: Option<Arc<dyn GameRpc>> = if config.is_test() {
        info!("Test environment: game server RPC client disabled");
        None
    } else {
        match RconClient::connect(
            &config.rcon.server,
            config.rcon.port,
            &config.rcon.password,
        )
        .await
        {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                error!(error = %err, server = %config.rcon.server, "Failed to connect to the game server");
                std::process::exit(1);
            }
        }
    };

    let redis_config = deadpool_redis::Config::from_url(config.cache.redis_url.clone());
    let redis_pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(err) => {
            error!(error = %err, "Failed to create Redis pool");
            std::process::exit(1);
        }
    };

    let mut mailer = RelayMailer::new(config.mailer.relay_url.clone());
    if let Some(api_key) = &config.mailer.api_key {
        mailer = mailer.with_api_key(api_key.clone());
    }

    let mut store = HttpApplicationStore::new(config.store.base_url.clone());
    if let Some(api_key) = &config.store.api_key {
        store = store.with_api_key(api_key.clone());
    }

    let services = Services {
        store: Arc::new(store),
        cache: Arc::new(RedisCache::new(redis_pool)),
        mailer: Arc::new(mailer),
        game_rpc,
    };

    let shutdown = ShutdownSignal::new();
    let engine = Engine::new(config, services, shutdown.clone());

    // Signal listener flips the broadcast the engine subscribes to
    let signal = shutdown.clone();
    tokio::spawn(async move {
        signal.wait().await;
    });

    if let Err(err) = engine.run().await {
        error!(error = %err, "Worker terminated with a fatal error");
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}
