//! Dashboard HTTP API
//!
//! Read-only JSON views over the store plus a server-sent events relay that
//! polls for new content and fresh analysis runs.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::get,
    Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{CorrelationConfig, ServerConfig};
use crate::correlation::{rank, SortBy};
use crate::db::{AggregateMetric, ContentItem, Database, Platform};

pub struct AppState {
    pub db: Arc<Database>,
    pub events_poll: Duration,
    pub recommendation_threshold: f64,
}

impl AppState {
    pub fn new(db: Arc<Database>, server: &ServerConfig, correlation: &CorrelationConfig) -> Self {
        Self {
            db,
            events_poll: Duration::from_secs(server.events_poll_seconds.max(1)),
            recommendation_threshold: correlation.recommendation_threshold,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/dashboard/trending", get(trending))
        .route("/api/dashboard/trending-coins", get(trending))
        .route("/api/dashboard/analysis-summary", get(analysis_summary))
        .route("/api/content", get(list_content))
        .route("/api/telegram/recent", get(telegram_recent))
        .route("/api/events", get(events))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }),
        )
}

pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> std::io::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Dashboard API listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            crate::monitor::shutdown_signal().await;
            info!("Shutting down dashboard API");
        })
        .await
}

// --- Query structs ---

// Numeric params are taken as strings; bad values fall back to defaults.

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendingQuery {
    sort_by: Option<String>,
    limit: Option<String>,
}

#[derive(Deserialize)]
pub struct ContentQuery {
    limit: Option<String>,
    offset: Option<String>,
    search: Option<String>,
}

#[derive(Deserialize)]
pub struct RecentQuery {
    limit: Option<String>,
}

/// Positive integer from a query param, or `default`
fn parse_count(raw: Option<&str>, default: usize) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(default)
}

// --- Responses ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrendingResponse {
    coins: Vec<AggregateMetric>,
    total: usize,
    sort_by: &'static str,
    limit: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryResponse {
    last_analysis: String,
    total_correlations: i64,
    total_recommendations: i64,
}

#[derive(Serialize)]
struct ContentPage {
    data: Vec<ContentItem>,
    count: i64,
    limit: usize,
    offset: usize,
}

// --- Handlers ---

async fn trending(State(state): State<Arc<AppState>>, Query(params): Query<TrendingQuery>) -> Response {
    let sort = SortBy::parse(params.sort_by.as_deref().unwrap_or("correlation"));
    let limit = parse_count(params.limit.as_deref(), 20);

    match state.db.latest_metrics() {
        Ok(metrics) => {
            let total = metrics.len();
            let coins = rank(metrics, sort, limit);
            Json(TrendingResponse { coins, total, sort_by: sort.as_str(), limit }).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to load trending coins");
            let body = TrendingResponse { coins: Vec::new(), total: 0, sort_by: sort.as_str(), limit };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

async fn analysis_summary(State(state): State<Arc<AppState>>) -> Response {
    match state.db.analysis_summary(state.recommendation_threshold) {
        Ok(summary) => Json(SummaryResponse {
            last_analysis: summary
                .last_analysis
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "Never".to_string()),
            total_correlations: summary.total_correlations,
            total_recommendations: summary.total_recommendations,
        })
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to load analysis summary");
            let body = SummaryResponse {
                last_analysis: "Never".to_string(),
                total_correlations: 0,
                total_recommendations: 0,
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

async fn list_content(State(state): State<Arc<AppState>>, Query(params): Query<ContentQuery>) -> Response {
    let limit = parse_count(params.limit.as_deref(), 50).min(500);
    let offset = params
        .offset
        .as_deref()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let search = params.search.as_deref();

    let result = state
        .db
        .list_content(search, limit, offset)
        .and_then(|data| Ok((data, state.db.count_content(search)?)));

    match result {
        Ok((data, count)) => Json(ContentPage { data, count, limit, offset }).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to list content");
            let body = ContentPage { data: Vec::new(), count: 0, limit, offset };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

async fn telegram_recent(State(state): State<Arc<AppState>>, Query(params): Query<RecentQuery>) -> Response {
    let limit = parse_count(params.limit.as_deref(), 50).min(500);
    let result = state
        .db
        .recent_telegram_messages(limit)
        .and_then(|messages| Ok((messages, state.db.list_channels()?)));

    match result {
        Ok((messages, channels)) => {
            Json(serde_json::json!({ "messages": messages, "channels": channels })).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to load Telegram messages");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "messages": [], "channels": [] })),
            )
                .into_response()
        }
    }
}

/// What the relay has already pushed to one subscriber
#[derive(Default)]
struct RelayCursor {
    connected: bool,
    latest_content: Option<String>,
    latest_analysis: Option<i64>,
}

async fn events(State(state): State<Arc<AppState>>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = stream::unfold((state, RelayCursor::default()), |(state, mut cursor)| async move {
        if !cursor.connected {
            cursor.connected = true;
            let event = relay_event("connected", serde_json::json!({ "status": "connected" }));
            return Some((Ok::<_, Infallible>(event), (state, cursor)));
        }

        loop {
            tokio::time::sleep(state.events_poll).await;
            if let Some(event) = poll_changes(&state, &mut cursor) {
                return Some((Ok(event), (state, cursor)));
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Next change for this subscriber, content before analysis runs
fn poll_changes(state: &AppState, cursor: &mut RelayCursor) -> Option<Event> {
    match state.db.latest_content(Platform::TikTok) {
        Ok(Some(item)) if cursor.latest_content.as_deref() != Some(item.id.as_str()) => {
            cursor.latest_content = Some(item.id.clone());
            return Some(relay_event("tiktok_update", serde_json::json!(item)));
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Event relay content poll failed"),
    }

    match state.db.latest_metrics() {
        Ok(metrics) => {
            let stamp = metrics.first().map(|m| m.last_updated.timestamp());
            if stamp.is_some() && stamp != cursor.latest_analysis {
                cursor.latest_analysis = stamp;
                let coins = rank(metrics, SortBy::Correlation, 20);
                return Some(relay_event("trending_update", serde_json::json!(coins)));
            }
        }
        Err(e) => warn!(error = %e, "Event relay trending poll failed"),
    }

    None
}

fn relay_event(kind: &str, payload: serde_json::Value) -> Event {
    Event::default().data(serde_json::json!({ "type": kind, "payload": payload }).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{content, test_db};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Utc;
    use tower::ServiceExt;

    fn state_with(db: Database) -> Arc<AppState> {
        Arc::new(AppState::new(Arc::new(db), &ServerConfig::default(), &CorrelationConfig::default()))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn seed_metrics(db: &Database) {
        let now = Utc::now();
        let metrics: Vec<AggregateMetric> = [("BONK", 0.9, 10.0), ("WIF", 0.4, 500.0), ("POPCAT", 0.75, 50.0)]
            .iter()
            .map(|(symbol, score, volume)| {
                let id = db.insert_token(symbol, symbol, &format!("uri:{}", symbol)).unwrap();
                AggregateMetric {
                    token_id: id,
                    uri: format!("uri:{}", symbol),
                    symbol: symbol.to_string(),
                    name: symbol.to_string(),
                    trading_volume_24h: *volume,
                    tiktok_views_24h: 0,
                    correlation_score: *score,
                    price_change_24h: 0.0,
                    total_mentions: 1,
                    last_updated: now,
                }
            })
            .collect();
        db.record_analysis(now, 24, &metrics).unwrap();
    }

    #[tokio::test]
    async fn test_trending_sorted_and_limited() {
        let db = test_db();
        seed_metrics(&db);
        let app = router(state_with(db));

        let (status, body) = get_json(app.clone(), "/api/dashboard/trending?sortBy=volume&limit=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 3);
        assert_eq!(body["sortBy"], "volume");
        assert_eq!(body["limit"], 2);
        assert_eq!(body["coins"][0]["symbol"], "WIF");
        assert_eq!(body["coins"].as_array().unwrap().len(), 2);

        let (_, body) = get_json(app, "/api/dashboard/trending?sortBy=bogus").await;
        assert_eq!(body["sortBy"], "correlation");
        assert_eq!(body["coins"][0]["symbol"], "BONK");
    }

    #[tokio::test]
    async fn test_trending_bad_limit_falls_back_to_default() {
        let db = test_db();
        seed_metrics(&db);
        let app = router(state_with(db));

        for uri in [
            "/api/dashboard/trending?limit=abc",
            "/api/dashboard/trending?limit=0",
            "/api/dashboard/trending?limit=-3",
        ] {
            let (status, body) = get_json(app.clone(), uri).await;
            assert_eq!(status, StatusCode::OK, "{}", uri);
            assert_eq!(body["limit"], 20);
            assert_eq!(body["sortBy"], "correlation");
            assert_eq!(body["coins"].as_array().unwrap().len(), 3);
        }

        // large limits are honored as given
        let (_, body) = get_json(app, "/api/dashboard/trending?limit=250").await;
        assert_eq!(body["limit"], 250);
        assert_eq!(body["total"], 3);
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count(Some("7"), 20), 7);
        assert_eq!(parse_count(Some(" 12 "), 20), 12);
        assert_eq!(parse_count(Some("x"), 20), 20);
        assert_eq!(parse_count(Some("0"), 20), 20);
        assert_eq!(parse_count(None, 20), 20);
    }

    #[tokio::test]
    async fn test_analysis_summary_never() {
        let app = router(state_with(test_db()));
        let (status, body) = get_json(app, "/api/dashboard/analysis-summary").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lastAnalysis"], "Never");
        assert_eq!(body["totalCorrelations"], 0);
    }

    #[tokio::test]
    async fn test_analysis_summary_counts_recommendations() {
        let db = test_db();
        seed_metrics(&db);
        let (_, body) = get_json(router(state_with(db)), "/api/dashboard/analysis-summary").await;
        assert_eq!(body["totalCorrelations"], 3);
        assert_eq!(body["totalRecommendations"], 2);
        assert_ne!(body["lastAnalysis"], "Never");
    }

    #[tokio::test]
    async fn test_store_failure_returns_default_shape() {
        // no migrations, so every query fails
        let app = router(state_with(Database::open_in_memory().unwrap()));
        let (status, body) = get_json(app, "/api/dashboard/trending?limit=5").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["coins"], serde_json::json!([]));
        assert_eq!(body["total"], 0);
        assert_eq!(body["limit"], 5);
    }

    #[tokio::test]
    async fn test_content_listing() {
        let db = test_db();
        let mut item = content("12345", None);
        item.author = "degen_dan".to_string();
        db.upsert_content(&item).unwrap();
        db.upsert_content(&content("67890", None)).unwrap();
        let app = router(state_with(db));

        let (_, body) = get_json(app.clone(), "/api/content?limit=1&offset=0").await;
        assert_eq!(body["count"], 2);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (_, body) = get_json(app, "/api/content?search=degen").await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["id"], "12345");
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(state_with(test_db()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_poll_changes_emits_once_per_change() {
        let db = test_db();
        db.upsert_content(&content("1", None)).unwrap();
        let state = state_with(db);
        let mut cursor = RelayCursor::default();

        assert!(poll_changes(&state, &mut cursor).is_some());
        assert_eq!(cursor.latest_content.as_deref(), Some("1"));
        assert!(poll_changes(&state, &mut cursor).is_none());
    }
}
