use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderValue},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use tower_http::{cors::CorsLayer, services::ServeDir};

use crate::{config::Settings, refresher::MarketCapService, utils::epoch_ms};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MarketCapService>,
}

/// Let the edge serve the cached body for one TTL and revalidate in the
/// background. Follows the effective TTL, so a widened TTL widens it too.
fn cache_control(ttl: Duration) -> HeaderValue {
    let s_maxage = ttl.as_secs().max(1);
    HeaderValue::from_str(&format!(
        "public, max-age=0, s-maxage={s_maxage}, stale-while-revalidate=30"
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("no-store"))
}

pub fn router(settings: &Settings, service: Arc<MarketCapService>) -> Router {
    let state = AppState { service };
    Router::new()
        .route("/api/mc", get(api_mc))
        .route("/api/health", get(api_health))
        .fallback_service(ServeDir::new(&settings.static_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(settings: Settings, service: Arc<MarketCapService>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .with_context(|| format!("listen addr {}:{}", settings.host, settings.port))?;

    let app = router(&settings, service);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    log::info!("server.start url=http://{} static_dir={}", addr, settings.static_dir);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    log::info!("server.stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("server.signal.error {}", e);
        std::future::pending::<()>().await;
    }
}

async fn api_mc(State(st): State<AppState>) -> impl IntoResponse {
    let e = st.service.read().await;
    (
        [(header::CACHE_CONTROL, cache_control(st.service.effective_ttl()))],
        Json(serde_json::json!({
            "mc": e.value,
            "ath": e.all_time_max,
            "lastUpdated": epoch_ms(e.last_updated_at),
            "ok": e.healthy,
            "source": e.source,
        })),
    )
}

async fn api_health(State(st): State<AppState>) -> impl IntoResponse {
    let svc = &st.service;
    let e = svc.peek();
    let now = tokio::time::Instant::now();
    let pacer = svc.pacer();
    Json(serde_json::json!({
        "ok": true,
        "lastUpdated": epoch_ms(e.last_updated_at),
        "mc": e.value,
        "ath": e.all_time_max,
        "healthy": e.healthy,
        "mint": svc.subject(),
        "ttlMs": svc.effective_ttl().as_millis() as u64,
        "refreshing": svc.refreshing(),
        "upstreamRuns": svc.chain_runs(),
        "pacer": {
            "waitMs": pacer.next_permitted_at().saturating_duration_since(now).as_millis() as u64,
            "backoffMs": pacer.next_allowed_at().saturating_duration_since(now).as_millis() as u64,
            "lastAttemptAgoMs": pacer.last_attempt_at().map(|t| now.saturating_duration_since(t).as_millis() as u64),
        },
    }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        cache::{SharedCache, TtlPolicy},
        fallback::{testing::FakeTier, FallbackChain},
        pacer::Pacer,
        upstream::{Source, UpstreamError},
    };

    fn app_with(script: Vec<Result<u64, UpstreamError>>, static_dir: &str) -> Router {
        let settings = Settings { static_dir: static_dir.to_string(), ..Settings::default() };
        let svc = MarketCapService::new(
            "mint",
            Duration::from_secs(1),
            SharedCache::new(TtlPolicy::fixed(settings.cache_ttl())),
            Pacer::new(Duration::ZERO, Duration::from_millis(10), Duration::from_millis(10)),
            FallbackChain::new(vec![Box::new(FakeTier::new(Source::Dexscreener, script))]),
        );
        router(&settings, svc)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, JsonValue) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        (status, headers, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn mc_endpoint_shape_and_cache_header() {
        let (status, headers, body) = get_json(app_with(vec![Ok(12346)], "./"), "/api/mc").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mc"], 12346);
        assert_eq!(body["ath"], 12346);
        assert_eq!(body["ok"], true);
        assert_eq!(body["source"], "dexscreener");
        assert!(body["lastUpdated"].as_i64().unwrap() > 0);
        assert_eq!(
            headers.get(header::CACHE_CONTROL).unwrap(),
            "public, max-age=0, s-maxage=12, stale-while-revalidate=30"
        );
    }

    #[test]
    fn cache_header_follows_effective_ttl() {
        assert_eq!(
            cache_control(Duration::from_secs(60)),
            "public, max-age=0, s-maxage=60, stale-while-revalidate=30"
        );
        assert_eq!(
            cache_control(Duration::from_millis(400)),
            "public, max-age=0, s-maxage=1, stale-while-revalidate=30"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn widened_ttl_widens_edge_cache() {
        let settings = Settings::default();
        let svc = MarketCapService::new(
            "mint",
            Duration::from_secs(1),
            SharedCache::new(TtlPolicy::new(settings.cache_ttl(), Duration::from_secs(60), 1)),
            Pacer::new(Duration::ZERO, Duration::from_millis(10), Duration::from_millis(10)),
            FallbackChain::new(vec![Box::new(FakeTier::new(Source::Dexscreener, vec![Ok(7)]))]),
        );
        // Two identical readings: the second one widens the TTL.
        svc.read().await;
        tokio::time::advance(settings.cache_ttl()).await;
        svc.read().await;

        let (_, headers, _) = get_json(router(&settings, svc), "/api/mc").await;
        assert_eq!(
            headers.get(header::CACHE_CONTROL).unwrap(),
            "public, max-age=0, s-maxage=60, stale-while-revalidate=30"
        );
    }

    #[tokio::test]
    async fn mc_endpoint_reports_failure_without_erroring() {
        let (status, _, body) =
            get_json(app_with(vec![Err(UpstreamError::Timeout)], "./"), "/api/mc").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["mc"].is_null());
        assert_eq!(body["ath"], 0);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn health_does_not_refresh() {
        let (status, _, body) = get_json(app_with(vec![Ok(5)], "./"), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert!(body["mc"].is_null());
        assert_eq!(body["lastUpdated"], 0);
        assert_eq!(body["mint"], "mint");
        assert_eq!(body["upstreamRuns"], 0);
        assert_eq!(body["refreshing"], false);
        assert!(body["pacer"]["lastAttemptAgoMs"].is_null());
    }

    #[tokio::test]
    async fn static_files_are_served() {
        let dir = std::env::temp_dir().join(format!("mcapd-static-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), "<h1>mc</h1>").unwrap();

        let app = app_with(vec![Ok(1)], dir.to_str().unwrap());
        let resp = app
            .oneshot(Request::builder().uri("/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        assert_eq!(&body[..], b"<h1>mc</h1>");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn cors_is_permissive() {
        let resp = app_with(vec![Ok(1)], "./")
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .header(header::ORIGIN, "https://example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }
}
