//! HTTP server implementation using Axum.

use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    middleware::Next,
    routing::{delete, get, post},
};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use warclaw_core::config::GatewayConfig;
use warclaw_scheduler::{SchedulerDb, SchedulerEngine};

use crate::db::GatewayDb;
use crate::routes;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    pub start_time: std::time::Instant,
    pub pairing_code: Option<String>,
    pub scheduler: Arc<SchedulerEngine>,
    /// World registry and settings.
    pub db: Arc<GatewayDb>,
    /// Construction wish-lists live next to the scheduler's own tables.
    pub scheduler_db: Arc<SchedulerDb>,
}

/// Resolve the pairing code: `WARCLAW_PAIRING_CODE`, else `<config dir>/.pairing_code`.
/// `None` when pairing is switched off or nothing is configured.
pub fn load_pairing_code(config: &GatewayConfig, config_path: &Path) -> Option<String> {
    if !config.require_pairing {
        return None;
    }
    std::env::var("WARCLAW_PAIRING_CODE")
        .ok()
        .or_else(|| {
            config_path
                .parent()
                .and_then(|d| std::fs::read_to_string(d.join(".pairing_code")).ok())
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Pairing code auth middleware: validates the X-Pairing-Code header or `?code=`.
async fn require_pairing(State(state): State<Arc<AppState>>, req: Request<Body>, next: Next) -> Response {
    let Some(expected) = &state.pairing_code else {
        return next.run(req).await;
    };

    let from_header = req
        .headers()
        .get("X-Pairing-Code")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if from_header == expected {
        return next.run(req).await;
    }

    let from_query = req
        .uri()
        .query()
        .map(|q| q.split('&').any(|pair| pair.strip_prefix("code=") == Some(expected.as_str())))
        .unwrap_or(false);
    if from_query {
        return next.run(req).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"ok": false, "error": "Unauthorized: invalid or missing pairing code"})),
    )
        .into_response()
}

/// Verify pairing code endpoint (public).
async fn verify_pairing(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let code = body["code"].as_str().unwrap_or("");
    match &state.pairing_code {
        Some(expected) if code == expected => Json(serde_json::json!({"ok": true})),
        Some(_) => Json(serde_json::json!({"ok": false, "error": "Invalid pairing code"})),
        None => Json(serde_json::json!({"ok": true})),
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    // Protected routes: require a valid pairing code
    let protected = Router::new()
        .route("/api/v1/info", get(routes::system_info))
        .route(
            "/api/v1/worlds/{world}/trigger/{kind}",
            post(routes::trigger_task),
        )
        .route("/api/v1/settings/{world}/{kind}", post(routes::set_feature))
        .route(
            "/api/v1/settings/{world}/{kind}/interval",
            post(routes::set_interval),
        )
        .route("/api/v1/start-monitoring", post(routes::start_monitoring))
        .route("/api/v1/status", get(routes::scheduler_status))
        .route("/api/v1/crawler-status", get(routes::crawler_status))
        .route("/api/v1/default-intervals", get(routes::default_intervals))
        .route("/api/v1/worlds", get(routes::list_worlds))
        .route("/api/v1/tasks", post(routes::enqueue_task))
        .route("/api/v1/tasks/{id}", get(routes::get_task))
        .route(
            "/api/v1/lockouts/{world}/clear",
            post(routes::clear_lockout),
        )
        .route(
            "/api/v1/worlds/{world}/wishlist",
            get(routes::list_wishlist).post(routes::add_wishlist_item),
        )
        .route(
            "/api/v1/worlds/{world}/wishlist/{subject}/{level}",
            delete(routes::remove_wishlist_item),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_pairing,
        ));

    // Public routes: no auth
    let public = Router::new()
        .route("/health", get(routes::health_check))
        .route("/api/v1/verify-pairing", post(verify_pairing));

    protected
        .merge(public)
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: WARCLAW_CORS_ORIGINS=https://ops.example.net,https://admin.example.net
            if let Ok(origins_str) = std::env::var("WARCLAW_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Bind and serve until the process exits.
pub async fn start(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.gateway_config.host, state.gateway_config.port);
    if state.pairing_code.is_none() && state.gateway_config.require_pairing {
        tracing::warn!("⚠️ Pairing required but no code configured; control surface is open");
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::tests::test_app_state;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let mut state = test_app_state().await;
        state.pairing_code = Some("123456".into());
        let response = build_router(state).oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_protected_route_requires_code() {
        let mut state = test_app_state().await;
        state.pairing_code = Some("123456".into());
        let router = build_router(state);

        let denied = router.clone().oneshot(get_request("/api/v1/status")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(denied).await["ok"], false);

        let via_header = Request::builder()
            .uri("/api/v1/status")
            .header("X-Pairing-Code", "123456")
            .body(Body::empty())
            .unwrap();
        let allowed = router.clone().oneshot(via_header).await.unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);

        let via_query = router
            .oneshot(get_request("/api/v1/status?code=123456"))
            .await
            .unwrap();
        assert_eq!(via_query.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_no_code_configured_allows_all() {
        let state = test_app_state().await;
        let response = build_router(state)
            .oneshot(get_request("/api/v1/worlds"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["worlds"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_verify_pairing() {
        let mut state = test_app_state().await;
        state.pairing_code = Some("123456".into());
        let router = build_router(state);

        let request = |code: &str| {
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/verify-pairing")
                .header("Content-Type", "application/json")
                .body(Body::from(serde_json::json!({ "code": code }).to_string()))
                .unwrap()
        };
        let ok = router.clone().oneshot(request("123456")).await.unwrap();
        assert_eq!(body_json(ok).await["ok"], true);
        let bad = router.oneshot(request("000000")).await.unwrap();
        assert_eq!(body_json(bad).await["ok"], false);
    }

    #[tokio::test]
    async fn test_trigger_through_router() {
        let state = test_app_state().await;
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/worlds/W3/trigger/mini-attacks")
            .body(Body::empty())
            .unwrap();
        let response = build_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
    }

    #[test]
    fn test_pairing_code_disabled() {
        let config = GatewayConfig {
            require_pairing: false,
            ..GatewayConfig::default()
        };
        assert!(load_pairing_code(&config, Path::new("/nonexistent/config.toml")).is_none());
    }
}
