// End-to-end tests for the OAuth connect flow and a first sync, against a mock provider

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use issue_sync::api::{create_router, AppState};
use issue_sync::connectors::jira::JiraClient;
use issue_sync::connectors::IssueTracker;
use issue_sync::credentials::{CredentialStore, SecretCodec};
use issue_sync::issues::{IssueReadModel, IssueStore, StatusMap};
use issue_sync::oauth::{OAuthFlow, PkceSessionStore, ProviderConfig, TokenEndpoint, TokenManager};
use issue_sync::sync::{PagerConfig, SyncEngine};
use mockito::{Matcher, Server, ServerGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

const KEY: [u8; 32] = [9u8; 32];
const FRONTEND: &str = "http://localhost:5173";

struct TestApp {
    router: Router,
    credentials: Arc<CredentialStore>,
}

fn create_test_app(server: &ServerGuard) -> TestApp {
    let codec = SecretCodec::from_key_bytes(&KEY).unwrap();
    let credentials = Arc::new(CredentialStore::new(":memory:").unwrap());
    let issues = Arc::new(IssueStore::new(":memory:").unwrap());

    let mut provider = ProviderConfig::jira(
        "client-id".to_string(),
        "client-secret".to_string(),
        "http://localhost:3000/api/connectors/jira/oauth/callback".to_string(),
    );
    provider.token_url = format!("{}/oauth/token", server.url());
    provider.resources_url = format!("{}/oauth/token/accessible-resources", server.url());
    provider.api_base_url = server.url();
    let provider = Arc::new(provider);

    let endpoint = TokenEndpoint::new(Arc::clone(&provider));
    let flow = OAuthFlow::new(
        endpoint.clone(),
        Arc::clone(&credentials),
        codec.clone(),
        3600,
    );
    let tokens = Arc::new(TokenManager::new(
        Arc::clone(&credentials),
        codec,
        [endpoint],
        90,
        3600,
    ));
    let tracker: Arc<dyn IssueTracker> = Arc::new(JiraClient::new(server.url()));
    let sync = Arc::new(SyncEngine::new(
        Arc::clone(&credentials),
        Arc::clone(&issues),
        tokens,
        [tracker],
        StatusMap::default(),
        PagerConfig::default(),
    ));

    let state = AppState {
        user_id: "default".to_string(),
        frontend_url: FRONTEND.to_string(),
        credentials: Arc::clone(&credentials),
        flows: Arc::new(HashMap::from([("jira".to_string(), flow)])),
        sessions: PkceSessionStore::new(600),
        session_ttl_seconds: 600,
        sync,
        read_model: IssueReadModel::new(Arc::clone(&credentials), issues),
    };

    TestApp {
        router: create_router(state),
        credentials,
    }
}

async fn get(app: &TestApp, uri: &str, cookie: Option<&str>) -> Response {
    let mut request = Request::builder().uri(uri);
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    app.router
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json(response: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn location(response: &Response) -> String {
    response.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .to_string()
}

/// Starts the flow; returns the session cookie pair and the issued state.
async fn start(app: &TestApp) -> (String, String) {
    let response = get(app, "/api/connectors/jira/oauth/start", None).await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let set_cookie = response.headers()[header::SET_COOKIE]
        .to_str()
        .unwrap()
        .to_string();
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("SameSite=Lax"));
    let cookie = set_cookie.split(';').next().unwrap().to_string();
    assert!(cookie.starts_with("issue_sync_oauth_session="));

    let url = location(&response);
    let query = url.split_once('?').unwrap().1;
    let params: HashMap<String, String> = serde_urlencoded::from_str(query).unwrap();
    assert_eq!(params["client_id"], "client-id");
    assert_eq!(params["code_challenge_method"], "S256");
    assert_eq!(params["code_challenge"].len(), 43);
    assert!(!url.contains("client-secret"));

    (cookie, params["state"].clone())
}

async fn mock_token_exchange(server: &mut ServerGuard) -> mockito::Mock {
    server
        .mock("POST", "/oauth/token")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "grant_type": "authorization_code",
            "code": "auth-code"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"access_token":"access-1","refresh_token":"refresh-1","expires_in":3600,"scope":"read:jira-work offline_access"}"#,
        )
        .create_async()
        .await
}

#[tokio::test]
async fn test_connect_then_sync() {
    let mut server = Server::new_async().await;
    let exchange = mock_token_exchange(&mut server).await;
    let _resources = server
        .mock("GET", "/oauth/token/accessible-resources")
        .match_header("authorization", "Bearer access-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"[
                {"id":"cloud-1","name":"acme","url":"https://acme.atlassian.net","scopes":[]},
                {"id":"cloud-2","name":"other","url":"https://other.atlassian.net","scopes":[]}
            ]"#,
        )
        .create_async()
        .await;
    let search = server
        .mock("GET", "/ex/jira/cloud-1/rest/api/3/search")
        .match_header("authorization", "Bearer access-1")
        .match_query(Matcher::UrlEncoded("startAt".into(), "0".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"total":2,"issues":[
                {"key":"OPS-1","fields":{"summary":"Rotate keys","status":{"name":"In Progress"},"priority":{"name":"High"},"labels":["security"],"updated":"2026-02-18T09:00:00.000+0000"}},
                {"fields":{"summary":"No key"}}
            ]}"#,
        )
        .create_async()
        .await;

    let app = create_test_app(&server);
    let (cookie, state) = start(&app).await;

    let response = get(
        &app,
        &format!(
            "/api/connectors/jira/oauth/callback?code=auth-code&state={}",
            state
        ),
        Some(&cookie),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(location(&response), format!("{}/?jira_connected=true", FRONTEND));
    exchange.assert_async().await;

    // First site wins; tokens are only stored encrypted
    let record = app.credentials.get("default", "jira").unwrap().unwrap();
    assert_eq!(record.cloud_id, "cloud-1");
    assert_eq!(record.site_name, "acme");
    assert!(record.scopes.contains("offline_access"));
    assert_ne!(record.access_token_enc, "access-1");
    let codec = SecretCodec::from_key_bytes(&KEY).unwrap();
    assert_eq!(codec.decrypt(&record.access_token_enc).unwrap(), "access-1");
    assert_eq!(
        codec
            .decrypt(record.refresh_token_enc.as_deref().unwrap())
            .unwrap(),
        "refresh-1"
    );

    // The session is single-use
    let replay = get(
        &app,
        &format!(
            "/api/connectors/jira/oauth/callback?code=auth-code&state={}",
            state
        ),
        Some(&cookie),
    )
    .await;
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/connectors/jira/sync")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["syncedCount"], 1);
    assert_eq!(body["skippedCount"], 1);
    search.assert_async().await;

    let body = json(get(&app, "/api/connectors/jira/issues", None).await).await;
    assert_eq!(body["issues"][0]["issueKey"], "OPS-1");
    assert_eq!(body["issues"][0]["state"], "IN_PROGRESS");
    assert_eq!(body["issues"][0]["labels"], serde_json::json!(["security"]));

    let body = json(get(&app, "/api/connectors/jira/status", None).await).await;
    assert_eq!(body["connected"], true);
    assert!(body["lastSyncAt"].is_string());
}

#[tokio::test]
async fn test_callback_state_mismatch() {
    let mut server = Server::new_async().await;
    let exchange = server
        .mock("POST", "/oauth/token")
        .expect(0)
        .create_async()
        .await;

    let app = create_test_app(&server);
    let (cookie, _state) = start(&app).await;

    let response = get(
        &app,
        "/api/connectors/jira/oauth/callback?code=auth-code&state=forged",
        Some(&cookie),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json(response).await;
    assert!(body["error"].as_str().unwrap().contains("state mismatch"));

    exchange.assert_async().await;
    assert!(app.credentials.get("default", "jira").unwrap().is_none());
}

#[tokio::test]
async fn test_callback_without_session() {
    let server = Server::new_async().await;
    let app = create_test_app(&server);

    let response = get(
        &app,
        "/api/connectors/jira/oauth/callback?code=auth-code&state=anything",
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json(response).await;
    assert!(body["error"].as_str().unwrap().contains("PKCE session is missing"));
}

#[tokio::test]
async fn test_callback_provider_denied() {
    let server = Server::new_async().await;
    let app = create_test_app(&server);
    let (cookie, state) = start(&app).await;

    let response = get(
        &app,
        &format!(
            "/api/connectors/jira/oauth/callback?error=access_denied&error_description=User%20declined&state={}",
            state
        ),
        Some(&cookie),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json(response).await;
    assert!(body["error"].as_str().unwrap().contains("access_denied"));
}

#[tokio::test]
async fn test_zero_resources_writes_nothing() {
    let mut server = Server::new_async().await;
    let _exchange = mock_token_exchange(&mut server).await;
    let _resources = server
        .mock("GET", "/oauth/token/accessible-resources")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("[]")
        .create_async()
        .await;

    let app = create_test_app(&server);
    let (cookie, state) = start(&app).await;

    let response = get(
        &app,
        &format!(
            "/api/connectors/jira/oauth/callback?code=auth-code&state={}",
            state
        ),
        Some(&cookie),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json(response).await;
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("no accessible resources"));
    assert!(app.credentials.get("default", "jira").unwrap().is_none());
}

#[tokio::test]
async fn test_token_exchange_rejected_surfaces_body() {
    let mut server = Server::new_async().await;
    let _exchange = server
        .mock("POST", "/oauth/token")
        .with_status(401)
        .with_body(r#"{"error":"access_denied","error_description":"Unauthorized"}"#)
        .create_async()
        .await;

    let app = create_test_app(&server);
    let (cookie, state) = start(&app).await;

    let response = get(
        &app,
        &format!(
            "/api/connectors/jira/oauth/callback?code=auth-code&state={}",
            state
        ),
        Some(&cookie),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json(response).await;
    let error = body["error"].as_str().unwrap();
    assert!(error.contains("401"));
    assert!(error.contains("access_denied"));
}
