use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use accounting::{
    Accountant, AccountingError, CalculationMode, NetCounters, SettingsUpdate, TrackedEntity,
    TrafficReport,
};
use axum::{
    Router,
    extract::{DefaultBodyLimit, Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

const MAX_BODY_BYTES: usize = 1024 * 1024;

pub struct ApiServer {
    config: Arc<ServerConfig>,
    accountant: Arc<Accountant>,
}

#[derive(Clone)]
struct AppState {
    accountant: Arc<Accountant>,
    delete_password: Arc<str>,
    agent_password: Arc<str>,
    offline_after: TimeDelta,
}

#[derive(Debug, Serialize, Deserialize)]
struct GenericResponse {
    success: bool,
    message: String,
}

impl GenericResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct PasswordRequest {
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SettingsRequest {
    password: Option<String>,
    #[serde(flatten)]
    settings: SettingsUpdate,
}

/// One row of the server list: the stored record, the agent's latest
/// free-form fields, and display state derived at read time.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerView {
    #[serde(flatten)]
    details: Map<String, Value>,
    id: String,
    raw_total_net: NetCounters,
    total_net: NetCounters,
    reset_day: u32,
    reset_hour: u32,
    reset_minute: u32,
    #[serde(with = "accounting::lenient::timestamp")]
    last_reset: Option<DateTime<Utc>>,
    #[serde(with = "accounting::lenient::timestamp")]
    last_updated: Option<DateTime<Utc>>,
    next_reset: i64,
    online: bool,
    total_traffic_limit: u64,
    traffic_calculation_mode: CalculationMode,
}

impl ServerView {
    fn new(
        entity: TrackedEntity,
        now: DateTime<Utc>,
        offset: &FixedOffset,
        offline_after: TimeDelta,
    ) -> Self {
        let policy = entity.reset_policy;
        Self {
            online: entity.is_online(now, offline_after),
            next_reset: policy.next_cycle_start(now, offset).timestamp_millis(),
            id: entity.id,
            raw_total_net: entity.raw_counters,
            total_net: entity.accumulated,
            reset_day: policy.day(),
            reset_hour: policy.hour(),
            reset_minute: policy.minute(),
            last_reset: entity.last_reset,
            last_updated: entity.last_updated,
            total_traffic_limit: entity.traffic_limit,
            traffic_calculation_mode: entity.calculation_mode,
            details: entity.details,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Accounting(AccountingError::InvalidReport(_))
            | ServerError::Accounting(AccountingError::InvalidPolicy(_)) => StatusCode::BAD_REQUEST,
            ServerError::Accounting(AccountingError::EntityNotFound(_)) => StatusCode::NOT_FOUND,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(GenericResponse {
                success: false,
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl ApiServer {
    pub fn new(config: Arc<ServerConfig>, accountant: Arc<Accountant>) -> Self {
        Self { config, accountant }
    }

    pub fn router(&self) -> Router {
        let app_state = AppState {
            accountant: self.accountant.clone(),
            delete_password: Arc::from(self.config.delete_password.as_str()),
            agent_password: Arc::from(self.config.agent_password.as_str()),
            offline_after: offline_window(self.config.offline_after_secs),
        };

        Router::new()
            .route("/health", get(health_check))
            .route("/api/report", post(receive_report))
            .route("/api/servers", get(list_servers))
            .route("/api/servers/{id}/settings", post(update_settings))
            .route("/api/servers/{id}", delete(delete_server))
            .route("/api/verify-agent-password", post(verify_agent_password))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(app_state)
    }

    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let app = self.router();

        info!("Starting API server on {}", self.config.listen_addr);

        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Saturates instead of overflowing for absurdly large settings.
fn offline_window(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

fn check_password(expected: &str, supplied: Option<&str>, what: &str) -> Result<()> {
    if supplied == Some(expected) {
        Ok(())
    } else {
        warn!("Rejected request with wrong {}", what);
        Err(ServerError::Forbidden(format!("incorrect {}", what)))
    }
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[instrument(skip(state, report), fields(id = ?report.id))]
async fn receive_report(
    State(state): State<AppState>,
    Json(report): Json<TrafficReport>,
) -> Result<impl IntoResponse> {
    state.accountant.ingest(report, Utc::now())?;
    Ok(GenericResponse::ok("Report received"))
}

async fn list_servers(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    let offset = state.accountant.offset();
    let servers: Vec<ServerView> = state
        .accountant
        .list()
        .into_iter()
        .map(|entity| ServerView::new(entity, now, &offset, state.offline_after))
        .collect();
    Json(servers)
}

#[instrument(skip(state, request))]
async fn update_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SettingsRequest>,
) -> Result<impl IntoResponse> {
    check_password(
        &state.agent_password,
        request.password.as_deref(),
        "agent password",
    )?;
    info!("API: Update settings request for {}", id);

    let outcome = state
        .accountant
        .update_settings(&id, request.settings, Utc::now())?;
    let message = match outcome.reset {
        Some(boundary) => format!(
            "Settings updated, traffic reset for the cycle starting {}",
            boundary
        ),
        None => "Settings updated".to_string(),
    };
    Ok(GenericResponse::ok(message))
}

#[instrument(skip(state, request))]
async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<PasswordRequest>>,
) -> Result<impl IntoResponse> {
    let password = request.and_then(|Json(request)| request.password);
    check_password(&state.delete_password, password.as_deref(), "delete password")?;
    info!("API: Delete request for {}", id);

    state.accountant.remove(&id)?;
    Ok(GenericResponse::ok(format!("Server {} deleted", id)))
}

async fn verify_agent_password(
    State(state): State<AppState>,
    Json(request): Json<PasswordRequest>,
) -> Result<impl IntoResponse> {
    check_password(
        &state.agent_password,
        request.password.as_deref(),
        "agent password",
    )?;
    Ok(GenericResponse::ok("Agent password is correct"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use accounting::NoopHook;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use chrono::Offset;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    fn test_config() -> ServerConfig {
        ServerConfig {
            delete_password: "delete-secret".to_string(),
            agent_password: "agent-secret".to_string(),
            ..Default::default()
        }
    }

    fn test_router() -> (Router, Arc<Accountant>) {
        let config = Arc::new(test_config());
        let accountant = Arc::new(Accountant::new(Utc.fix(), Arc::new(NoopHook)));
        let router = ApiServer::new(config, accountant.clone()).router();
        (router, accountant)
    }

    async fn send(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn report(router: &Router, id: &str, up: u64, down: u64) -> StatusCode {
        let body = json!({"id": id, "name": "edge", "rawTotalNet": {"up": up, "down": down}});
        send(router, Method::POST, "/api/report", Some(body)).await.0
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (router, _) = test_router();
        let (status, body) = send(&router, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn reports_accumulate_and_show_in_list() {
        let (router, _) = test_router();
        assert_eq!(report(&router, "srv1", 0, 0).await, StatusCode::OK);
        assert_eq!(report(&router, "srv1", 500, 100).await, StatusCode::OK);
        assert_eq!(report(&router, "srv1", 50, 30).await, StatusCode::OK);

        let (status, body) = send(&router, Method::GET, "/api/servers", None).await;
        assert_eq!(status, StatusCode::OK);
        let servers = body.as_array().unwrap();
        assert_eq!(servers.len(), 1);
        let srv1 = &servers[0];
        assert_eq!(srv1["id"], "srv1");
        assert_eq!(srv1["name"], "edge");
        assert_eq!(srv1["totalNet"], json!({"up": 550, "down": 130}));
        assert_eq!(srv1["rawTotalNet"], json!({"up": 50, "down": 30}));
        assert_eq!(srv1["online"], true);
        assert_eq!(srv1["resetDay"], 1);
        assert_eq!(srv1["trafficCalculationMode"], "bidirectional");
        assert!(srv1["nextReset"].as_i64().unwrap() > srv1["lastReset"].as_i64().unwrap());
    }

    #[tokio::test]
    async fn report_without_id_or_counters_is_rejected() {
        let (router, accountant) = test_router();

        let (status, body) = send(
            &router,
            Method::POST,
            "/api/report",
            Some(json!({"rawTotalNet": {"up": 1, "down": 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) =
            send(&router, Method::POST, "/api/report", Some(json!({"id": "srv1"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(accountant.is_empty());
    }

    #[tokio::test]
    async fn settings_require_agent_password() {
        let (router, accountant) = test_router();
        report(&router, "srv1", 0, 0).await;

        let (status, _) = send(
            &router,
            Method::POST,
            "/api/servers/srv1/settings",
            Some(json!({"password": "wrong", "totalTrafficLimit": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(accountant.get("srv1").unwrap().traffic_limit, 0);
    }

    #[tokio::test]
    async fn settings_update_known_server() {
        let (router, accountant) = test_router();
        report(&router, "srv1", 0, 0).await;

        let (status, body) = send(
            &router,
            Method::POST,
            "/api/servers/srv1/settings",
            Some(json!({
                "password": "agent-secret",
                "totalTrafficLimit": 1_000_000,
                "trafficCalculationMode": "download-only",
                "resetHour": 6,
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let entity = accountant.get("srv1").unwrap();
        assert_eq!(entity.traffic_limit, 1_000_000);
        assert_eq!(entity.calculation_mode, CalculationMode::DownloadOnly);
        assert_eq!(entity.reset_policy.hour(), 6);
    }

    #[tokio::test]
    async fn settings_errors_map_to_status_codes() {
        let (router, _) = test_router();
        report(&router, "srv1", 0, 0).await;

        let (status, _) = send(
            &router,
            Method::POST,
            "/api/servers/ghost/settings",
            Some(json!({"password": "agent-secret"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &router,
            Method::POST,
            "/api/servers/srv1/settings",
            Some(json!({"password": "agent-secret", "resetDay": 32})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_requires_delete_password() {
        let (router, accountant) = test_router();
        report(&router, "srv1", 0, 0).await;

        let (status, _) = send(
            &router,
            Method::DELETE,
            "/api/servers/srv1",
            Some(json!({"password": "agent-secret"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(&router, Method::DELETE, "/api/servers/srv1", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(accountant.get("srv1").is_some());

        let (status, _) = send(
            &router,
            Method::DELETE,
            "/api/servers/srv1",
            Some(json!({"password": "delete-secret"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(accountant.get("srv1").is_none());

        let (status, _) = send(
            &router,
            Method::DELETE,
            "/api/servers/srv1",
            Some(json!({"password": "delete-secret"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn verify_agent_password() {
        let (router, _) = test_router();

        let (status, _) = send(
            &router,
            Method::POST,
            "/api/verify-agent-password",
            Some(json!({"password": "agent-secret"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &router,
            Method::POST,
            "/api/verify-agent-password",
            Some(json!({"password": "delete-secret"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn stale_servers_show_offline() {
        let (router, accountant) = test_router();
        accountant
            .ingest(
                TrafficReport::new("srv1", 0, 0),
                Utc::now() - TimeDelta::seconds(60),
            )
            .unwrap();

        let (_, body) = send(&router, Method::GET, "/api/servers", None).await;
        assert_eq!(body[0]["online"], false);
    }

    #[tokio::test]
    async fn huge_offline_window_saturates() {
        assert_eq!(offline_window(100_000_000_000_000_000), TimeDelta::MAX);
        assert_eq!(offline_window(u64::MAX), TimeDelta::MAX);
        assert_eq!(offline_window(15), TimeDelta::seconds(15));

        let config = Arc::new(ServerConfig {
            offline_after_secs: 100_000_000_000_000_000,
            ..test_config()
        });
        let accountant = Arc::new(Accountant::new(Utc.fix(), Arc::new(NoopHook)));
        let router = ApiServer::new(config, accountant.clone()).router();
        accountant
            .ingest(
                TrafficReport::new("srv1", 0, 0),
                Utc::now() - TimeDelta::days(365),
            )
            .unwrap();

        let (status, body) = send(&router, Method::GET, "/api/servers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["online"], true);
    }
}
