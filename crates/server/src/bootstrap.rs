use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use waline_core::config::{AppConfig, ConfigError, LoadOptions};
use waline_core::{InstanceStatus, RetryPolicy};
use waline_crm::{CrmClient, HttpCrmTransport, HttpTokenEndpoint, TokenRefresher};
use waline_db::repositories::{
    CredentialRepository, InstanceRepository, RepositoryError, SqlBindingRepository,
    SqlContactRepository, SqlConversationRepository, SqlCredentialRepository,
    SqlInstanceRepository, SqlMessageRepository, SqlWebhookLogRepository,
};
use waline_db::{connect_with_settings, migrations, DbPool};
use waline_relay::{
    start_session, ConversationResolver, CrmClientGateway, InboundRelay, InstanceRegistry,
    OutboundRelay, SessionDeps, WaClientGateway,
};
use waline_wa::{HttpWaTransport, WaClient};

use crate::webhooks::WebhookState;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub registry: Arc<InstanceRegistry>,
    pub webhook_state: WebhookState,
    pub background: Vec<JoinHandle<()>>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("session resume failed: {0}")]
    SessionResume(#[source] RepositoryError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let instances = Arc::new(SqlInstanceRepository::new(db_pool.clone()));
    let bindings = Arc::new(SqlBindingRepository::new(db_pool.clone()));
    let contacts = Arc::new(SqlContactRepository::new(db_pool.clone()));
    let conversations = Arc::new(SqlConversationRepository::new(db_pool.clone()));
    let messages = Arc::new(SqlMessageRepository::new(db_pool.clone()));
    let webhook_log = Arc::new(SqlWebhookLogRepository::new(db_pool.clone()));
    let credentials: Arc<dyn CredentialRepository> =
        Arc::new(SqlCredentialRepository::new(db_pool.clone()));

    let crm_timeout = Duration::from_secs(config.crm.request_timeout_secs);
    let token_endpoint = Arc::new(HttpTokenEndpoint::new(
        config.crm.client_id.clone(),
        config.crm.client_secret.clone(),
        crm_timeout,
    ));
    let refresher = Arc::new(TokenRefresher::new(token_endpoint, credentials.clone()));
    let crm_client = Arc::new(CrmClient::new(
        Arc::new(HttpCrmTransport::new(crm_timeout)),
        refresher.clone(),
        config.crm.connector_code.clone(),
    ));

    let wa_transport = Arc::new(HttpWaTransport::new(
        &config.wa.base_url,
        config.wa.api_key.clone(),
        Duration::from_secs(config.wa.request_timeout_secs),
    ));
    let wa_client = Arc::new(WaClient::new(wa_transport));

    let crm_gateway = Arc::new(CrmClientGateway::new(crm_client, credentials.clone()));
    let wa_gateway = Arc::new(WaClientGateway::new(wa_client));

    let registry = Arc::new(InstanceRegistry::new());
    let retry = RetryPolicy::default();

    let inbound = Arc::new(InboundRelay::new(
        instances.clone(),
        bindings.clone(),
        conversations.clone(),
        messages.clone(),
        webhook_log.clone(),
        ConversationResolver::new(contacts.clone(), conversations.clone()),
        crm_gateway,
        registry.clone(),
        retry.clone(),
        config.wa.default_webhook_secret.clone(),
    ));
    let outbound = Arc::new(OutboundRelay::new(
        instances.clone(),
        bindings,
        contacts.clone(),
        conversations.clone(),
        messages,
        webhook_log,
        ConversationResolver::new(contacts, conversations),
        wa_gateway.clone(),
        retry.clone(),
    ));

    // Pairing attempts interrupted by a restart resume their pollers.
    let pending = instances
        .list_by_status(InstanceStatus::PendingQr)
        .await
        .map_err(BootstrapError::SessionResume)?;
    let session_deps =
        SessionDeps { instances: instances.clone(), wa: wa_gateway, retry: retry.clone() };
    let poll_interval = Duration::from_secs(config.relay.poll_interval_secs);
    let poll_budget = Duration::from_secs(config.relay.poll_budget_secs);
    for instance in &pending {
        start_session(&registry, session_deps.clone(), instance, poll_interval, poll_budget)
            .await;
    }
    if !pending.is_empty() {
        info!(
            event_name = "system.bootstrap.sessions_resumed",
            correlation_id = "bootstrap",
            count = pending.len(),
            "pending pairing sessions resumed"
        );
    }

    let sweep = spawn_refresh_sweep(
        credentials,
        refresher,
        Duration::from_secs(config.relay.refresh_sweep_secs),
    );

    Ok(Application {
        config,
        db_pool,
        registry,
        webhook_state: WebhookState { inbound, outbound },
        background: vec![sweep],
    })
}

/// Periodically refresh every active credential ahead of expiry so webhook
/// handling rarely pays the refresh latency inline.
fn spawn_refresh_sweep(
    credentials: Arc<dyn CredentialRepository>,
    refresher: Arc<TokenRefresher>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let list = match credentials.list_active().await {
                Ok(list) => list,
                Err(error) => {
                    warn!(
                        event_name = "system.refresh_sweep.list_failed",
                        error = %error,
                        "could not list credentials for refresh sweep"
                    );
                    continue;
                }
            };
            for credential in list {
                let credential_id = credential.id.clone();
                let outcome = refresher.ensure_fresh(credential).await;
                if outcome.token_expired() {
                    warn!(
                        event_name = "system.refresh_sweep.refresh_failed",
                        credential_id = %credential_id,
                        "credential refresh failed during sweep"
                    );
                }
            }
        }
    })
}
