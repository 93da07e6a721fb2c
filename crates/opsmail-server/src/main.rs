mod api;

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use opsmail_core::{
    AutomationDispatcher, Config, CredentialVault, Database, DeliveryRouter, JobDispatcher,
    JobQueue, MailboxConnector, MailboxService, MailboxSyncEngine, Scheduler, WorkerConfig,
    automation::{SystemMailboxSender, fallback_from_config},
    config::{AppLinksConfig, FallbackTransport},
    gmail::build_http_client,
    init_telemetry,
    integrations::IntegrationRepository,
    mailbox::SyncOptions,
    migrations,
    notifications::NotificationRepository,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub mailbox: MailboxService,
    pub links: AppLinksConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    let telemetry = init_telemetry(&config.app, &config.telemetry)?;

    let db = Database::new(&config.paths.database).await?;
    migrations::run_migrations(&db).await?;

    let vault = Arc::new(CredentialVault::from_hex_key(&config.vault.key)?);
    let http = build_http_client(Duration::from_secs(config.mailbox.request_timeout_secs))?;
    let connector = MailboxConnector::new(
        http,
        vault,
        IntegrationRepository::new(db.clone()),
        config.google.clone(),
    );

    let system_mailbox = match (
        config.fallback.transport,
        config.system_mailbox.tenant_id.as_deref(),
    ) {
        (FallbackTransport::SystemMailbox, Some(tenant_id)) => {
            match SystemMailboxSender::resolve(connector.clone(), tenant_id).await {
                Ok(sender) => Some(sender),
                Err(err) => {
                    warn!(tenant_id, error = %err, "system mailbox unavailable, fallback disabled");
                    None
                }
            }
        }
        _ => None,
    };
    let fallback = fallback_from_config(&config.fallback, system_mailbox)?;
    let router = DeliveryRouter::new(
        connector.clone(),
        fallback,
        Duration::from_secs(config.fallback.timeout_secs),
    );
    let dispatcher = AutomationDispatcher::new(db.clone(), router, &config.app_links);

    let engine = MailboxSyncEngine::new(
        db.clone(),
        connector,
        Arc::new(NotificationRepository::new(db.clone())),
        SyncOptions::from_config(&config.mailbox),
    )
    .with_dispatcher(dispatcher.clone());
    let mailbox = MailboxService::new(db.clone(), engine.clone(), dispatcher.clone());

    let shutdown = CancellationToken::new();
    let worker_handle = tokio::spawn(opsmail_core::run_worker(
        JobQueue::new(db.clone()),
        JobDispatcher::new(engine),
        WorkerConfig::default(),
        shutdown.child_token(),
    ));
    let scheduler_handles = Scheduler::new(db.clone(), dispatcher, config.scheduler.clone())
        .spawn(shutdown.child_token());

    let state = AppState {
        db,
        mailbox,
        links: config.app_links.clone(),
    };
    let app = crate::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("opsmail listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    let _ = worker_handle.await;
    for handle in scheduler_handles {
        let _ = handle.await;
    }
    info!("background tasks drained");
    telemetry.shutdown();
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhooks/gmail", post(api::mailbox::push_webhook))
        .route("/api/mailbox/callback", get(api::mailbox::oauth_callback))
        .nest("/api/tenants/{tenant_id}", api::tenant_router())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    database: String,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = state.db.health_check().await.is_ok();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: if healthy { "ok" } else { "unreachable" }.to_string(),
        }),
    )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl+c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, shutting down");
        }
        _ = terminate => {
            warn!("received terminate signal, shutting down");
        }
    }

    shutdown.cancel();
}
