use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dom_billing_backend::{
    config::{Config, InviteStoreBackend},
    middleware::{AppState, Repositories, Sidecars},
    repositories::{
        InvitationStore, MemoryInvitationStore, PgApartmentRepository, PgBillRepository,
        PgInvitationStore, PgMembershipRepository, PgPaymentRepository, PgUserRepository,
    },
    services::{FileService, SandboxGateway, TelegramService},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Загружаем .env файл
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dom_billing_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!("Starting Dom Billing Backend...");
    tracing::info!(
        host = %config.database.host,
        database = %config.database.database,
        "Connecting to database..."
    );

    // Каждый запрос к БД ограничен тем же таймаутом, что и ожидание соединения
    let statement_timeout = format!("{}s", config.database.timeout_secs);
    let connect_options = config
        .database_url()
        .parse::<PgConnectOptions>()?
        .options([("statement_timeout", statement_timeout.as_str())]);

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(config.database.timeout())
        .connect_with(connect_options)
        .await?;

    tracing::info!("Connected to database successfully");

    if config.database.autocreate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("Migrations completed");
    }

    let grace = chrono::Duration::seconds(config.invite_store.grace_secs);
    let invitations: Arc<dyn InvitationStore> = match config.invite_store.backend {
        InviteStoreBackend::Postgres => Arc::new(PgInvitationStore::new(pool.clone(), grace)),
        InviteStoreBackend::Memory => {
            tracing::warn!("Invitations are kept in process memory and will not survive a restart");
            Arc::new(MemoryInvitationStore::new(grace))
        }
    };

    let repos = Repositories {
        users: Arc::new(PgUserRepository::new(pool.clone())),
        apartments: Arc::new(PgApartmentRepository::new(pool.clone())),
        memberships: Arc::new(PgMembershipRepository::new(pool.clone())),
        bills: Arc::new(PgBillRepository::new(pool.clone())),
        payments: Arc::new(PgPaymentRepository::new(pool.clone())),
        invitations,
    };

    let telegram = TelegramService::new(
        config.chat.clone(),
        config.app_base_url.clone(),
        repos.users.clone(),
        repos.apartments.clone(),
    )?;

    let sidecars = Sidecars {
        images: Arc::new(FileService::new(&config.storage)),
        notifier: Arc::new(telegram),
        gateway: Arc::new(SandboxGateway::new()),
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let sweep_every = Duration::from_secs(config.invite_store.sweep_interval_secs);

    let state = AppState::new(config, repos, sidecars);
    let _janitor = state.invitation_service.clone().spawn_janitor(sweep_every);

    let app = dom_billing_backend::app(state);

    tracing::info!("Server running on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
