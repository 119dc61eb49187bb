//! HTTP routes with response caching
//!
//! Every handler parses the shared query parameters, then runs a cached
//! lookup keyed by database id, endpoint and parameters.

use axum::{
    extract::{Query, State},
    Json,
};
use cached::proc_macro::cached;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::AppState;
use crate::db::charts::{self, Chart, DailyPoint, SeriesPoint};
use crate::db::discovery::{
    self, AsnSummary, AvailableDates, CountrySummary, HourlyPattern, IpSummary, UsernameSummary,
};
use crate::db::query::{DateRange, Filters};
use crate::db::Database;
use crate::error::{AppError, Result};

/// Query string accepted by every `/api` endpoint
#[derive(Debug, Default, Deserialize)]
pub struct ApiQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub country: Option<String>,
    pub asn: Option<String>,
    pub ip: Option<String>,
    pub username: Option<String>,
    pub limit: Option<String>,
}

impl ApiQuery {
    fn range(&self, state: &AppState) -> Result<DateRange> {
        DateRange::parse(self.start.as_deref(), self.end.as_deref(), &state.config)
    }

    fn filters(&self) -> Filters {
        Filters {
            country: self.country.clone(),
            asn: self.asn.clone(),
            ip: self.ip.clone(),
            username: self.username.clone(),
        }
        .normalized()
    }

    fn limit(&self) -> Result<Option<u32>> {
        match self.limit.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                AppError::InvalidParameter(format!("limit must be a positive integer, got '{}'", raw))
            }),
        }
    }
}

const ENDPOINTS: [(&str, &str); 15] = [
    ("/api/date_range", "Available dates"),
    ("/api/total_attacks", "Total attacks over time"),
    ("/api/country_attacks", "Top countries"),
    ("/api/unusual_countries", "Volatile countries"),
    ("/api/ip_attacks", "Top IPs"),
    ("/api/ip_attacks_volatile", "Most volatile IPs"),
    ("/api/username_attacks", "Top usernames"),
    ("/api/username_attacks_volatile", "Most volatile usernames"),
    ("/api/asn_attacks", "Top ASNs"),
    ("/api/asn_attacks_volatile", "Most volatile ASNs"),
    ("/api/country_summary", "Per-country discovery metrics"),
    ("/api/asn_summary", "Per-ASN discovery metrics"),
    ("/api/ip_summary", "Per-IP discovery metrics"),
    ("/api/username_summary", "Per-username discovery metrics"),
    ("/api/hourly_patterns", "Attacks by hour of day"),
];

/// API documentation and status
pub async fn index() -> Json<Value> {
    let endpoints: serde_json::Map<String, Value> = ENDPOINTS
        .iter()
        .map(|(path, description)| (path.to_string(), Value::from(*description)))
        .collect();
    Json(json!({
        "name": "Attack Data Visualization API",
        "status": "running",
        "endpoints": endpoints,
        "note": "Uses only summary tables",
    }))
}

/// Cached chart series - 5 minute TTL, oldest entries evicted past 500
#[cached(
    time = 300,
    size = 500,
    key = "String",
    convert = r#"{ format!("{}:{:?}:{:?}:{:?}:{}", db.id(), chart, range, filters, top_n) }"#,
    result = true
)]
async fn get_cached_series(
    db: Database,
    chart: Chart,
    range: DateRange,
    filters: Filters,
    top_n: u32,
) -> Result<Vec<SeriesPoint>> {
    db.run(move |conn| charts::top_series(conn, chart, &range, &filters, top_n))
        .await
}

/// Cached daily totals - 5 minute TTL
#[cached(
    time = 300,
    size = 500,
    key = "String",
    convert = r#"{ format!("{}:total:{:?}:{:?}", db.id(), range, filters) }"#,
    result = true
)]
async fn get_cached_totals(db: Database, range: DateRange, filters: Filters) -> Result<Vec<DailyPoint>> {
    db.run(move |conn| charts::total_attacks(conn, &range, &filters))
        .await
}

#[cached(
    time = 300,
    size = 500,
    key = "String",
    convert = r#"{ format!("{}:date_range", db.id()) }"#,
    result = true
)]
async fn get_cached_dates(db: Database) -> Result<AvailableDates> {
    db.run(discovery::date_range).await
}

#[cached(
    time = 300,
    size = 500,
    key = "String",
    convert = r#"{ format!("{}:country_summary:{:?}", db.id(), range) }"#,
    result = true
)]
async fn get_cached_country_summary(db: Database, range: DateRange) -> Result<Vec<CountrySummary>> {
    db.run(move |conn| discovery::country_summary(conn, &range)).await
}

#[cached(
    time = 300,
    size = 500,
    key = "String",
    convert = r#"{ format!("{}:asn_summary:{:?}", db.id(), range) }"#,
    result = true
)]
async fn get_cached_asn_summary(db: Database, range: DateRange) -> Result<Vec<AsnSummary>> {
    db.run(move |conn| discovery::asn_summary(conn, &range)).await
}

#[cached(
    time = 300,
    size = 500,
    key = "String",
    convert = r#"{ format!("{}:ip_summary:{:?}:{:?}", db.id(), range, limit) }"#,
    result = true
)]
async fn get_cached_ip_summary(db: Database, range: DateRange, limit: Option<u32>) -> Result<Vec<IpSummary>> {
    db.run(move |conn| discovery::ip_summary(conn, &range, limit)).await
}

#[cached(
    time = 300,
    size = 500,
    key = "String",
    convert = r#"{ format!("{}:username_summary:{:?}:{:?}", db.id(), range, limit) }"#,
    result = true
)]
async fn get_cached_username_summary(
    db: Database,
    range: DateRange,
    limit: Option<u32>,
) -> Result<Vec<UsernameSummary>> {
    db.run(move |conn| discovery::username_summary(conn, &range, limit))
        .await
}

#[cached(
    time = 300,
    size = 500,
    key = "String",
    convert = r#"{ format!("{}:hourly_patterns", db.id()) }"#,
    result = true
)]
async fn get_cached_hourly(db: Database) -> Result<Vec<HourlyPattern>> {
    db.run(discovery::hourly_patterns).await
}

async fn series(state: &AppState, query: &ApiQuery, chart: Chart) -> Result<Json<Vec<SeriesPoint>>> {
    let range = query.range(state)?;
    let points = get_cached_series(state.db.clone(), chart, range, query.filters(), state.config.top_n).await?;
    Ok(Json(points))
}

/// API: first and last day with data
pub async fn api_date_range(State(state): State<Arc<AppState>>) -> Result<Json<AvailableDates>> {
    Ok(Json(get_cached_dates(state.db.clone()).await?))
}

/// API: attacks per day. A username filter combines with every other
/// filter, otherwise the ip, asn/country or country filter applies.
pub async fn api_total_attacks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<Vec<DailyPoint>>> {
    let range = query.range(&state)?;
    Ok(Json(get_cached_totals(state.db.clone(), range, query.filters()).await?))
}

pub async fn api_country_attacks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<Vec<SeriesPoint>>> {
    series(&state, &query, Chart::Countries).await
}

pub async fn api_unusual_countries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<Vec<SeriesPoint>>> {
    series(&state, &query, Chart::UnusualCountries).await
}

pub async fn api_ip_attacks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<Vec<SeriesPoint>>> {
    series(&state, &query, Chart::Ips).await
}

pub async fn api_ip_attacks_volatile(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<Vec<SeriesPoint>>> {
    series(&state, &query, Chart::IpsVolatile).await
}

pub async fn api_username_attacks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<Vec<SeriesPoint>>> {
    series(&state, &query, Chart::Usernames).await
}

pub async fn api_username_attacks_volatile(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<Vec<SeriesPoint>>> {
    series(&state, &query, Chart::UsernamesVolatile).await
}

pub async fn api_asn_attacks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<Vec<SeriesPoint>>> {
    series(&state, &query, Chart::Asns).await
}

pub async fn api_asn_attacks_volatile(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<Vec<SeriesPoint>>> {
    series(&state, &query, Chart::AsnsVolatile).await
}

pub async fn api_country_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<Vec<CountrySummary>>> {
    let range = query.range(&state)?;
    Ok(Json(get_cached_country_summary(state.db.clone(), range).await?))
}

pub async fn api_asn_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<Vec<AsnSummary>>> {
    let range = query.range(&state)?;
    Ok(Json(get_cached_asn_summary(state.db.clone(), range).await?))
}

pub async fn api_ip_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<Vec<IpSummary>>> {
    let range = query.range(&state)?;
    let limit = query.limit()?;
    Ok(Json(get_cached_ip_summary(state.db.clone(), range, limit).await?))
}

pub async fn api_username_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApiQuery>,
) -> Result<Json<Vec<UsernameSummary>>> {
    let range = query.range(&state)?;
    let limit = query.limit()?;
    Ok(Json(get_cached_username_summary(state.db.clone(), range, limit).await?))
}

/// API: attacks by hour of day over the whole data set
pub async fn api_hourly_patterns(State(state): State<Arc<AppState>>) -> Result<Json<Vec<HourlyPattern>>> {
    Ok(Json(get_cached_hourly(state.db.clone()).await?))
}

/// Warm the cache for the default date range (called on startup)
pub async fn warm_cache(state: &AppState) {
    let range = match DateRange::parse(None, None, &state.config) {
        Ok(range) => range,
        Err(e) => {
            tracing::warn!("Skipping cache warm-up: {}", e);
            return;
        }
    };
    let db = &state.db;
    let filters = Filters::default();
    let top_n = state.config.top_n;

    tracing::info!("Warming cache for {} to {}...", range.start, range.end);

    let charts = [
        Chart::Countries,
        Chart::UnusualCountries,
        Chart::Ips,
        Chart::IpsVolatile,
        Chart::Usernames,
        Chart::UsernamesVolatile,
        Chart::Asns,
        Chart::AsnsVolatile,
    ];
    let series = futures::future::join_all(
        charts
            .into_iter()
            .map(|chart| get_cached_series(db.clone(), chart, range, filters.clone(), top_n)),
    );

    let (series, totals, dates, countries, asns) = tokio::join!(
        series,
        get_cached_totals(db.clone(), range, filters.clone()),
        get_cached_dates(db.clone()),
        get_cached_country_summary(db.clone(), range),
        get_cached_asn_summary(db.clone(), range)
    );

    let failures = series.iter().filter(|r| r.is_err()).count()
        + [totals.is_err(), dates.is_err(), countries.is_err(), asns.is_err()]
            .iter()
            .filter(|failed| **failed)
            .count();
    if failures > 0 {
        tracing::warn!("Cache warm-up finished with {} failed queries", failures);
    } else {
        tracing::info!("Cache warmed successfully");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use crate::db::testing;
    use crate::web::router;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    fn app() -> axum::Router {
        let state = Arc::new(AppState {
            db: testing::seeded(),
            config: ApiConfig {
                default_start: "2022-11-01".to_string(),
                default_end: "2022-11-03".to_string(),
                top_n: 10,
            },
        });
        router(state, None)
    }

    async fn get(app: axum::Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn index_lists_endpoints() {
        let (status, body) = get(app(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["endpoints"].as_object().unwrap().len(), ENDPOINTS.len());
    }

    #[tokio::test]
    async fn total_attacks_uses_default_range() {
        let (status, body) = get(app(), "/api/total_attacks").await;
        assert_eq!(status, StatusCode::OK);
        let attacks: Vec<i64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["attacks"].as_i64().unwrap())
            .collect();
        assert_eq!(attacks, vec![100, 150, 60]);
    }

    #[tokio::test]
    async fn country_filter_narrows_total() {
        let (_, body) = get(app(), "/api/total_attacks?country=China&start=2022-11-02&end=2022-11-03").await;
        let points = body.as_array().unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0]["date"], "2022-11-02");
        assert_eq!(points[0]["attacks"], 50);
    }

    #[tokio::test]
    async fn ip_rows_use_uppercase_key() {
        let (status, body) = get(app(), "/api/ip_attacks?start=2022-11-01&end=2022-11-01").await;
        assert_eq!(status, StatusCode::OK);
        let first = &body.as_array().unwrap()[0];
        assert_eq!(first["IP"], "1.1.1.1");
        assert_eq!(first["country"], "China");
        assert!(first.get("pct_change").is_none());
    }

    #[tokio::test]
    async fn volatile_rows_carry_pct_change() {
        let (status, body) = get(app(), "/api/asn_attacks_volatile").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().iter().all(|p| p.get("pct_change").is_some()));
    }

    #[tokio::test]
    async fn reversed_range_is_bad_request() {
        let (status, body) = get(app(), "/api/country_attacks?start=2022-11-03&end=2022-11-01").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_PARAMETER");
    }

    #[tokio::test]
    async fn bad_limit_is_bad_request() {
        let (status, _) = get(app(), "/api/ip_summary?limit=ten").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get(app(), "/api/ip_summary?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn date_range_and_hourly_patterns() {
        let (_, dates) = get(app(), "/api/date_range").await;
        assert_eq!(dates["min_date"], "2022-11-01");
        assert_eq!(dates["max_date"], "2022-11-03");

        let (_, hours) = get(app(), "/api/hourly_patterns").await;
        assert_eq!(hours.as_array().unwrap().len(), 2);
        assert_eq!(hours[0]["hour"], 0);
    }

    #[tokio::test]
    async fn api_responses_are_cacheable() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/api/date_range")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.headers().contains_key(header::CACHE_CONTROL));
        assert!(response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn cache_is_bounded_under_distinct_filters() {
        use cached::Cached;

        let db = testing::seeded();
        let range = DateRange::parse(Some("2022-11-01"), Some("2022-11-03"), &ApiConfig::default()).unwrap();
        for i in 0..600 {
            let filters = Filters {
                country: Some(format!("country-{}", i)),
                ..Default::default()
            };
            get_cached_totals(db.clone(), range, filters).await.unwrap();
        }
        assert!(GET_CACHED_TOTALS.lock().await.cache_size() <= 500);
    }

    #[tokio::test]
    async fn warm_cache_fills_default_range() {
        let state = AppState {
            db: testing::seeded(),
            config: ApiConfig {
                default_start: "2022-11-01".to_string(),
                default_end: "2022-11-03".to_string(),
                top_n: 5,
            },
        };
        warm_cache(&state).await;

        // Dropping the tables proves the next call is served from the cache
        let conn = state.db.connection().unwrap();
        conn.execute_batch("DROP TABLE daily_country_attacks").unwrap();
        let range = DateRange::parse(None, None, &state.config).unwrap();
        let countries = get_cached_country_summary(state.db.clone(), range)
            .await
            .unwrap();
        assert!(!countries.is_empty());
    }
}
