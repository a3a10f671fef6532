use std::sync::Arc;

use dripline::campaign::CampaignRegistry;
use dripline::catalog::MessageCatalog;
use dripline::config::Config;
use dripline::gateway::{DeliveryGateway, LineGateway};
use dripline::handler::InboundHandler;
use dripline::richmenu;
use dripline::scheduler::{self, DripScheduler};
use dripline::store::{LibSqlBackend, Store};
use dripline::webhook::{WebhookState, webhook_routes};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export LINE_CHANNEL_ACCESS_TOKEN=...");
        eprintln!("  export LINE_CHANNEL_SECRET=...");
        std::process::exit(1);
    });

    eprintln!("🌸 Dripline v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://0.0.0.0:{}/callback", config.port);
    eprintln!("   Ops API: http://0.0.0.0:{}/api/jobs/failed", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Message catalog ──────────────────────────────────────────────────
    let catalog = MessageCatalog::from_path(&config.messages_path).unwrap_or_else(|e| {
        eprintln!(
            "Error: Failed to load message catalog from {}: {}",
            config.messages_path.display(),
            e
        );
        std::process::exit(1);
    });
    eprintln!("   Messages: {}", config.messages_path.display());

    // ── Gateway + scheduler ──────────────────────────────────────────────
    let gateway: Arc<dyn DeliveryGateway> =
        Arc::new(LineGateway::new(config.channel_access_token.clone()));

    let registry = CampaignRegistry::new(config.demo_timings);
    if config.demo_timings {
        eprintln!("   Timings: DEMO (second-scale offsets)");
    }

    let drip_scheduler = Arc::new(DripScheduler::new(
        Arc::clone(&store),
        registry,
        Arc::clone(&gateway),
        catalog.clone(),
        config.max_attempts,
    ));

    // ── Rich menu (best effort) ──────────────────────────────────────────
    if config.rich_menu {
        match richmenu::provision_rich_menu(
            &config.channel_access_token,
            config.rich_menu_image.as_deref(),
        )
        .await
        {
            Ok(()) => eprintln!("   Rich menu: provisioned"),
            Err(e) => tracing::warn!("Rich menu setup failed: {e}"),
        }
    }

    // ── Fire loop ────────────────────────────────────────────────────────
    let _fire_handle = scheduler::spawn_fire_loop(Arc::clone(&drip_scheduler), config.tick_interval);
    eprintln!(
        "   Fire loop: every {}s (max {} delivery attempts)\n",
        config.tick_interval.as_secs(),
        config.max_attempts
    );

    // ── Webhook server ───────────────────────────────────────────────────
    let handler = Arc::new(InboundHandler::new(
        Arc::clone(&store),
        drip_scheduler,
        gateway,
        catalog,
    ));

    let app = webhook_routes(WebhookState {
        handler,
        store,
        channel_secret: config.channel_secret.clone(),
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Webhook server started");
    axum::serve(listener, app).await?;

    Ok(())
}
