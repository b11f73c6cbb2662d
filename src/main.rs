use anyhow::{Context, Result};
use issue_sync::api::{create_router, AppState};
use issue_sync::config::{self, ClientCredentials, ENCRYPTION_KEY_ENV};
use issue_sync::connectors::jira::JiraClient;
use issue_sync::connectors::IssueTracker;
use issue_sync::credentials::{CredentialStore, SecretCodec};
use issue_sync::issues::{IssueReadModel, IssueStore};
use issue_sync::oauth::{run_session_cleanup, OAuthFlow, PkceSessionStore, TokenEndpoint, TokenManager};
use issue_sync::sync::SyncEngine;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "issue_sync=info".into()),
        )
        .init();

    info!("Issue sync starting...");

    let config = config::load_from_env().context("Failed to load configuration")?;

    let codec = SecretCodec::from_env(ENCRYPTION_KEY_ENV).with_context(|| {
        format!(
            "{} is required (base64-encoded 32-byte key)",
            ENCRYPTION_KEY_ENV
        )
    })?;

    info!(
        bind_addr = %config.server.bind_addr,
        database = %config.storage.database_path,
        user_id = %config.server.user_id,
        "Configuration loaded"
    );

    let credentials = Arc::new(
        CredentialStore::new(&config.storage.database_path)
            .context("Failed to initialize credential store")?,
    );
    let issues = Arc::new(
        IssueStore::new(&config.storage.database_path)
            .context("Failed to initialize issue cache")?,
    );
    info!("Stores initialized");

    // Jira is the only provider; it is enabled when client credentials are set
    let mut endpoints = Vec::new();
    let mut trackers: Vec<Arc<dyn IssueTracker>> = Vec::new();
    let mut flows = HashMap::new();
    match ClientCredentials::from_env("jira") {
        Some(client) => {
            let provider = Arc::new(
                config
                    .jira
                    .provider(client, &config.server.callback_base_url),
            );
            info!(redirect_uri = %provider.redirect_uri, "Jira OAuth configured");

            let endpoint = TokenEndpoint::new(Arc::clone(&provider));
            flows.insert(
                provider.name.clone(),
                OAuthFlow::new(
                    endpoint.clone(),
                    Arc::clone(&credentials),
                    codec.clone(),
                    config.oauth.default_expires_in_seconds,
                ),
            );
            endpoints.push(endpoint);
            trackers.push(Arc::new(JiraClient::with_jql(
                provider.api_base_url.clone(),
                config.sync.jql.clone(),
            )));
        }
        None => warn!(
            "ISSUE_SYNC_OAUTH_JIRA_CLIENT_ID / ISSUE_SYNC_OAUTH_JIRA_CLIENT_SECRET not set, Jira disabled"
        ),
    }

    let tokens = Arc::new(TokenManager::new(
        Arc::clone(&credentials),
        codec,
        endpoints,
        config.oauth.refresh_margin_seconds,
        config.oauth.default_expires_in_seconds,
    ));

    let sync = Arc::new(SyncEngine::new(
        Arc::clone(&credentials),
        Arc::clone(&issues),
        tokens,
        trackers,
        config.status_map(),
        config.sync.pager_config(),
    ));

    let sessions = PkceSessionStore::new(config.oauth.session_ttl_seconds);
    tokio::spawn(run_session_cleanup(
        sessions.clone(),
        config.oauth.session_cleanup_interval_seconds,
    ));

    let state = AppState {
        user_id: config.server.user_id.clone(),
        frontend_url: config.server.frontend_url.clone(),
        credentials: Arc::clone(&credentials),
        flows: Arc::new(flows),
        sessions,
        session_ttl_seconds: config.oauth.session_ttl_seconds,
        sync,
        read_model: IssueReadModel::new(credentials, issues),
    };

    let router = create_router(state).layer(CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(bind_addr = %config.server.bind_addr, "API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("API server error")?;

    info!("Issue sync stopped");
    Ok(())
}
