use crate::cache::{cached_run, ResultCache};
use crate::config::AppConfig;
use crate::data::Sources;
use crate::error::Notice;
use crate::filter::{Filter, LocalityFilter, RankRange, ALL_LOCALITIES};
use crate::geometry::{dissolve_localities, BoundaryLayer};
use crate::lookup::ZoneLocator;
use crate::pipeline::{Analysis, Request};
use crate::ranking::RankShift;
use crate::report::TableRow;
use crate::selection::GroupSelection;
use crate::summary::{top, LocalitySummary, Summary};
use crate::types::Group;
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use geojson::FeatureCollection;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

const CACHE_CAPACITY: usize = 64;
const TOP_ZONES: usize = 10;

pub struct AppState {
    pub sources: Sources,
    pub config: AppConfig,
    pub locator: Option<ZoneLocator>,
    pub boundaries: Option<BoundaryLayer>,
    pub cache: Mutex<ResultCache>,
}

impl AppState {
    pub fn new(config: AppConfig, sources: Sources) -> Self {
        let locator = sources.geometry.as_deref().map(|g| ZoneLocator::build(g));
        let boundaries = sources
            .geometry
            .as_deref()
            .map(|g| dissolve_localities(g, &sources.dataset.zones));
        AppState {
            sources,
            config,
            locator,
            boundaries,
            cache: Mutex::new(ResultCache::new(CACHE_CAPACITY)),
        }
    }

    /// Builds the request, substituting the default selection when the
    /// requested one is invalid.
    fn request(&self, params: &AnalysisParams) -> (Request, Vec<Notice>) {
        let dataset = &self.sources.dataset;
        let (selection, notice) =
            GroupSelection::resolve(params.groups.as_deref(), &dataset.available_groups);
        let filter = Filter {
            locality: LocalityFilter::parse(params.locality.as_deref()),
            rank_range: RankRange::resolve(
                params.rank_min,
                params.rank_max,
                dataset.len(),
                self.config.processing.rank_window(),
            ),
        };
        (Request { selection, filter }, notice.into_iter().collect())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalysisParams {
    groups: Option<String>,
    locality: Option<String>,
    rank_min: Option<u32>,
    rank_max: Option<u32>,
}

#[derive(Deserialize)]
pub struct PointParams {
    lat: f64,
    lon: f64,
    groups: Option<String>,
}

#[derive(Serialize)]
pub struct GroupInfo {
    group: Group,
    description: &'static str,
    available: bool,
    default: bool,
}

#[derive(Serialize)]
pub struct LocalitiesResponse {
    all: &'static str,
    localities: Vec<String>,
}

#[derive(Serialize)]
pub struct RankingResponse {
    selection: GroupSelection,
    filter: Filter,
    rows: Vec<TableRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rank_shift: Option<RankShift>,
    notices: Vec<Notice>,
}

#[derive(Serialize)]
pub struct SummaryResponse {
    selection: GroupSelection,
    summary: Summary,
    localities: Vec<LocalitySummary>,
    top: Vec<TableRow>,
    notices: Vec<Notice>,
}

#[derive(Serialize)]
pub struct MapResponse {
    available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    features: Option<FeatureCollection>,
    dropped: usize,
    unmatched: usize,
    notices: Vec<Notice>,
}

#[derive(Serialize)]
pub struct ZoneResponse {
    selection: GroupSelection,
    zone: TableRow,
    notices: Vec<Notice>,
}

/// Runs the request on the blocking pool; the cache lock is only held for
/// lookup and insert.
async fn analyze(state: &Arc<AppState>, request: Request) -> Result<Arc<Analysis>, StatusCode> {
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || cached_run(&state.cache, &state.sources, &request))
        .await
        .map_err(|e| {
            error!("Analysis task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

fn merge_notices(analysis: &Analysis, extra: Vec<Notice>) -> Vec<Notice> {
    analysis.notices.iter().cloned().chain(extra).collect()
}

pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/api/groups", get(groups_handler))
        .route("/api/localities", get(localities_handler))
        .route("/api/ranking", get(ranking_handler))
        .route("/api/summary", get(summary_handler))
        .route("/api/map", get(map_handler))
        .route("/api/boundaries", get(boundaries_handler))
        .route("/api/zone", get(zone_handler));

    if let Some(dir) = &state.config.server.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(CorsLayer::permissive()).with_state(state)
}

pub async fn start_server(config: AppConfig, sources: Sources) -> Result<()> {
    let port = config.server.port;
    let state = Arc::new(AppState::new(config, sources));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting server on http://{}", addr);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn groups_handler(State(state): State<Arc<AppState>>) -> Json<Vec<GroupInfo>> {
    let available = &state.sources.dataset.available_groups;
    let default = GroupSelection::default_for(available);
    Json(
        Group::ALL
            .into_iter()
            .map(|g| GroupInfo {
                group: g,
                description: g.description(),
                available: available.contains(&g),
                default: default.contains(g),
            })
            .collect(),
    )
}

async fn localities_handler(State(state): State<Arc<AppState>>) -> Json<LocalitiesResponse> {
    Json(LocalitiesResponse {
        all: ALL_LOCALITIES,
        localities: state.sources.dataset.localities(),
    })
}

async fn ranking_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AnalysisParams>,
) -> Result<Json<RankingResponse>, StatusCode> {
    let (request, notices) = state.request(&params);
    let analysis = analyze(&state, request).await?;
    Ok(Json(RankingResponse {
        selection: analysis.selection.clone(),
        filter: analysis.filter.clone(),
        rows: analysis.rows.iter().map(TableRow::from).collect(),
        rank_shift: analysis.rank_shift,
        notices: merge_notices(&analysis, notices),
    }))
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AnalysisParams>,
) -> Result<Json<SummaryResponse>, StatusCode> {
    let (request, notices) = state.request(&params);
    let analysis = analyze(&state, request).await?;
    Ok(Json(SummaryResponse {
        selection: analysis.selection.clone(),
        summary: analysis.summary.clone(),
        localities: analysis.localities.clone(),
        top: top(&analysis.rows, TOP_ZONES).iter().map(TableRow::from).collect(),
        notices: merge_notices(&analysis, notices),
    }))
}

async fn map_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AnalysisParams>,
) -> Result<Json<MapResponse>, StatusCode> {
    let (request, notices) = state.request(&params);
    let analysis = analyze(&state, request).await?;
    let notices = merge_notices(&analysis, notices);
    Ok(Json(match &analysis.map {
        Some(layer) => MapResponse {
            available: true,
            features: Some(layer.features.clone()),
            dropped: layer.dropped,
            unmatched: layer.unmatched,
            notices,
        },
        None => MapResponse {
            available: false,
            features: None,
            dropped: 0,
            unmatched: 0,
            notices,
        },
    }))
}

async fn boundaries_handler(State(state): State<Arc<AppState>>) -> Json<Option<FeatureCollection>> {
    Json(state.boundaries.as_ref().map(|b| b.features.clone()))
}

async fn zone_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PointParams>,
) -> Result<Json<Option<ZoneResponse>>, StatusCode> {
    let Some(code) = state.locator.as_ref().and_then(|l| l.locate(params.lon, params.lat)) else {
        return Ok(Json(None));
    };

    // Unfiltered, so the zone is present whatever its rank.
    let (selection, notice) = GroupSelection::resolve(
        params.groups.as_deref(),
        &state.sources.dataset.available_groups,
    );
    let analysis = analyze(
        &state,
        Request {
            selection,
            filter: Filter::default(),
        },
    )
    .await?;

    Ok(Json(
        analysis
            .rows
            .iter()
            .find(|row| row.ranked.code() == code)
            .map(|row| ZoneResponse {
                selection: analysis.selection.clone(),
                zone: TableRow::from(row),
                notices: merge_notices(&analysis, notice.into_iter().collect()),
            }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::BeneficiaryTable;
    use crate::geometry::tests::square;
    use crate::geometry::NativeGeometry;
    use crate::ranking::tests::zone;
    use crate::types::ZoneDataset;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    fn state(with_optional: bool) -> Arc<AppState> {
        let mut zones = vec![
            zone(101, [50, 30, 20, 10]),
            zone(102, [5, 5, 5, 5]),
            zone(103, [1, 1, 1, 300]),
        ];
        zones[1].locality = "Bosa".into();
        let mut sources = Sources::new(
            ZoneDataset {
                zones,
                available_groups: Group::ALL.into_iter().collect(),
            },
            "v1",
        );
        if with_optional {
            let mut geometry = NativeGeometry::default();
            geometry.insert(101, None, square(0.0, 0.0));
            geometry.insert(102, None, square(1.0, 0.0));
            let served: BeneficiaryTable = [(101, 40), (102, 20)].into_iter().collect();
            sources = sources.with_geometry(geometry).with_beneficiaries(served);
        } else {
            sources.notices.push(Notice::missing(
                crate::error::SourceName::Geometry,
                "no geometry source configured",
            ));
        }
        let config: AppConfig = toml::from_str("[input]\nzones_csv = \"zones.csv\"\n").unwrap();
        Arc::new(AppState::new(config, sources))
    }

    async fn get_json(state: Arc<AppState>, uri: &str) -> serde_json::Value {
        let response = router(state)
            .oneshot(HttpRequest::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ranking_uses_requested_groups() {
        let body = get_json(state(true), "/api/ranking?groups=A,B,C,D").await;
        assert_eq!(body["selection"], serde_json::json!(["A", "B", "C", "D"]));
        assert_eq!(body["rows"][0]["code"], 103);
        assert_eq!(body["rows"][0]["rank"], 1);
        assert_eq!(body["rows"][1]["priority_tier"], "Critica");
        assert_eq!(body["notices"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn invalid_groups_fall_back_with_notice() {
        let body = get_json(state(true), "/api/ranking?groups=Z").await;
        assert_eq!(body["selection"], serde_json::json!(["A", "B", "C"]));
        assert_eq!(body["notices"][0]["kind"], "selection_substituted");
        assert_eq!(body["rows"][0]["code"], 101);
    }

    #[tokio::test]
    async fn locality_and_rank_filters_apply() {
        let body = get_json(state(true), "/api/ranking?locality=Bosa").await;
        let rows = body["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["code"], 102);

        let body = get_json(state(true), "/api/ranking?rank_min=2&rank_max=2").await;
        let rows = body["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["rank"], 2);
    }

    #[tokio::test]
    async fn map_disabled_without_geometry() {
        let body = get_json(state(false), "/api/map").await;
        assert_eq!(body["available"], false);
        assert_eq!(body["notices"][0]["kind"], "missing_source");
        assert_eq!(body["notices"][0]["source"], "geometry");

        let ranking = get_json(state(false), "/api/ranking").await;
        assert_eq!(ranking["rows"].as_array().unwrap().len(), 3);
        assert!(ranking["rows"][0]["coverage_rate"].is_null());
    }

    #[tokio::test]
    async fn map_features_keyed_by_code() {
        let body = get_json(state(true), "/api/map").await;
        assert_eq!(body["available"], true);
        assert_eq!(body["features"]["features"][0]["id"], "101");
        assert_eq!(body["unmatched"], 1);
    }

    #[tokio::test]
    async fn summary_and_localities() {
        let body = get_json(state(true), "/api/summary").await;
        assert_eq!(body["summary"]["zones"], 3);
        assert_eq!(body["localities"][0]["locality"], "Kennedy");
        assert_eq!(body["top"].as_array().unwrap().len(), 3);

        let body = get_json(state(true), "/api/localities").await;
        assert_eq!(body["localities"], serde_json::json!(["Bosa", "Kennedy"]));
    }

    #[tokio::test]
    async fn point_lookup_returns_ranked_row() {
        let body = get_json(state(true), "/api/zone?lon=1.5&lat=0.5&groups=D").await;
        assert_eq!(body["zone"]["code"], 102);
        assert_eq!(body["zone"]["rank"], 3);
        assert_eq!(body["selection"], serde_json::json!(["D"]));

        let body = get_json(state(true), "/api/zone?lon=9&lat=9").await;
        assert!(body.is_null());
    }

    #[tokio::test]
    async fn point_lookup_reports_substituted_selection() {
        let body = get_json(state(true), "/api/zone?lon=1.5&lat=0.5&groups=Z").await;
        assert_eq!(body["selection"], serde_json::json!(["A", "B", "C"]));
        assert_eq!(body["zone"]["code"], 102);
        assert_eq!(body["notices"][0]["kind"], "selection_substituted");
        assert_eq!(body["notices"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_requests_reuse_cached_result() {
        let state = state(true);
        get_json(Arc::clone(&state), "/api/ranking?groups=A").await;
        get_json(Arc::clone(&state), "/api/summary?groups=A").await;
        assert_eq!(state.cache.lock().unwrap().len(), 1);
        get_json(Arc::clone(&state), "/api/ranking?groups=B").await;
        assert_eq!(state.cache.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn boundaries_dissolved_once() {
        let body = get_json(state(true), "/api/boundaries").await;
        let features = body["features"].as_array().unwrap();
        assert_eq!(features.len(), 2);
    }
}
