//! API Service - Read-only access to the fishing statistics
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /regioni, /produttivita, /occupazione, /economia - Registry and raw facts
//! - GET /prod_aree, /prod_totale, /media_valore_aggiunto,
//!   /media_variazione_occupazione_nazionale, /media_variazione_occupazione_aree
//!   - Derived series, `?da_anno=&a_anno=`
//! - GET /specie, /media_specie - Species dataset, `?da_anno=&a_anno=`
//! - GET /dati_brutti?tabella=&colonne=&da_anno=&a_anno= - Any allow-listed table

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use store::{query, StoreError, StoreKind, Table, YearRange};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pesca: SqlitePool,
    species: SqlitePool,
}

impl AppState {
    fn pool(&self, table: Table) -> &SqlitePool {
        match table.store() {
            StoreKind::Pesca => &self.pesca,
            StoreKind::Species => &self.species,
        }
    }
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    species_db_url: String,
    bind: String,
    max_connections: u32,
}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        let max_connections = match std::env::var("DB_MAX_CONNECTIONS") {
            Ok(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("DB_MAX_CONNECTIONS must be a number, got '{}'", raw))?,
            Err(_) => 10,
        };
        Ok(Self {
            db_url: std::env::var("DB_URL").unwrap_or_else(|_| "sqlite:pesca.db".to_string()),
            species_db_url: std::env::var("SPECIES_DB_URL")
                .unwrap_or_else(|_| "sqlite:specie.db".to_string()),
            bind: std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            max_connections,
        })
    }
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorResponse { error: message })).into_response()
}

/// Caller mistakes are 400. A known table the pipeline has not produced yet
/// is 404; only storage failures are 500.
fn store_error_response(err: StoreError) -> Response {
    if err.is_client_error() {
        warn!(error = %err, "rejected request");
        error_response(StatusCode::BAD_REQUEST, err.to_string())
    } else if let StoreError::MissingTable { table } = &err {
        warn!(table = %table, "requested table not populated yet");
        error_response(
            StatusCode::NOT_FOUND,
            format!("table '{}' has no data yet", table),
        )
    } else {
        error!(error = %err, "query failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct RangeQuery {
    da_anno: Option<i64>,
    a_anno: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDataQuery {
    tabella: Option<String>,
    colonne: Option<String>,
    da_anno: Option<i64>,
    a_anno: Option<i64>,
}

const DEFAULT_RAW_TABLE: &str = "economia";

/// Fixed routes: path, table, whether `da_anno`/`a_anno` apply.
const TABLE_ROUTES: &[(&str, Table, bool)] = &[
    ("/regioni", Table::Regioni, false),
    ("/produttivita", Table::Produttivita, false),
    ("/occupazione", Table::Occupazione, false),
    ("/economia", Table::Economia, false),
    ("/prod_aree", Table::ProduttivitaTotaleAree, true),
    ("/prod_totale", Table::ProduttivitaTotaleNazionale, true),
    ("/media_valore_aggiunto", Table::MediaValoreAggiuntoAree, true),
    (
        "/media_variazione_occupazione_nazionale",
        Table::MediaVariazioneOccupazioneNazionale,
        true,
    ),
    (
        "/media_variazione_occupazione_aree",
        Table::MediaVariazioneOccupazioneAree,
        true,
    ),
    ("/specie", Table::Specie, true),
    ("/media_specie", Table::MediaSpecie, true),
];

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn query_table(
    state: &AppState,
    table: Table,
    columns: &[String],
    range: Option<YearRange>,
) -> Response {
    let mut conn = match state.pool(table).acquire().await {
        Ok(conn) => conn,
        Err(e) => return store_error_response(e.into()),
    };

    match query(&mut conn, table, columns, range).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn table_handler(
    state: Arc<AppState>,
    table: Table,
    ranged: bool,
    params: Result<Query<RangeQuery>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let range = if ranged {
        YearRange::from_bounds(params.da_anno, params.a_anno)
    } else {
        None
    };
    query_table(&state, table, &[], range).await
}

async fn raw_data_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<RawDataQuery>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let table = match Table::from_name(params.tabella.as_deref().unwrap_or(DEFAULT_RAW_TABLE)) {
        Ok(table) => table,
        Err(e) => return store_error_response(e),
    };
    let columns: Vec<String> = params
        .colonne
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();

    let range = YearRange::from_bounds(params.da_anno, params.a_anno);
    query_table(&state, table, &columns, range).await
}

fn app(state: AppState) -> Router {
    let state = Arc::new(state);

    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/dati_brutti", get(raw_data_handler));

    for &(path, table, ranged) in TABLE_ROUTES {
        router = router.route(
            path,
            get(
                move |State(state): State<Arc<AppState>>,
                      params: Result<Query<RangeQuery>, QueryRejection>| async move {
                    table_handler(state, table, ranged, params).await
                },
            ),
        );
    }

    router.layer(cors).with_state(state)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let pesca = store::db::connect(&config.db_url, config.max_connections)
        .await
        .context("Failed to connect to main store")?;
    let species = store::db::connect(&config.species_db_url, config.max_connections)
        .await
        .context("Failed to connect to species store")?;
    info!(db_url = %config.db_url, species_db_url = %config.species_db_url, "stores connected");

    let app = app(AppState { pesca, species });

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(bind = %config.bind, routes = TABLE_ROUTES.len() + 2, "API listening");

    axum::serve(listener, app).await?;

    Ok(())
}
