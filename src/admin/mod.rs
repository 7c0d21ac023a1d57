//! Admin API.
//!
//! Read-only JSON views of the running proxy, all behind a Bearer key:
//! live transactions, the origin session pool, per-address health and the
//! cache.

pub mod auth;
pub mod handlers;

use axum::{middleware, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::http::server::AppState;

use self::auth::admin_auth_middleware;
use self::handlers::*;

pub fn setup_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/transactions", get(get_transactions))
        .route("/admin/sessions", get(get_sessions))
        .route("/admin/upstreams", get(get_upstreams))
        .route("/admin/cache", get(get_cache))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::http::ProxyServer;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn router() -> Router {
        let mut config = ProxyConfig::default();
        config.admin.api_key = "k3y".to_string();
        setup_admin_router(ProxyServer::new(config).state())
    }

    async fn get_json(router: Router, path: &str, key: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().uri(path);
        if let Some(key) = key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        let response = router
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_key() {
        let (status, _) = get_json(router(), "/admin/status", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = get_json(router(), "/admin/status", Some("nope")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_reports_counts() {
        let (status, json) = get_json(router(), "/admin/status", Some("k3y")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "operational");
        assert_eq!(json["live_transactions"], 0);
        assert_eq!(json["client_sessions"], 0);
    }

    #[tokio::test]
    async fn views_are_served() {
        let (status, json) = get_json(router(), "/admin/transactions", Some("k3y")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.as_array().unwrap().is_empty());

        let (status, json) = get_json(router(), "/admin/sessions", Some("k3y")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["idle"], 0);

        let (status, json) = get_json(router(), "/admin/upstreams", Some("k3y")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.as_array().unwrap().is_empty());

        let (status, json) = get_json(router(), "/admin/cache", Some("k3y")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["enabled"], true);
        assert_eq!(json["stats"]["entries"], 0);
    }
}
