use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use mfrec::{init_tracing, AppState, Config, MfError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Deserialize)]
struct RecommendationQuery {
    top_k: Option<usize>,
    exclude: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PredictQuery {
    user_id: String,
    item_id: String,
}

#[derive(Debug, Deserialize)]
struct RateRequest {
    user_id: String,
    item_id: String,
    rating: f64,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct Prediction {
    user_id: String,
    item_id: String,
    score: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    message: String,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: "Success".to_string(),
        }
    }

    fn empty(message: String) -> Self {
        Self {
            success: true,
            data: None,
            message,
        }
    }

    fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message,
        }
    }
}

struct ApiError(MfError);

impl From<MfError> for ApiError {
    fn from(e: MfError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MfError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            MfError::UnknownUser(_) | MfError::UnknownItem(_) => StatusCode::NOT_FOUND,
            MfError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            MfError::SnapshotConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(ApiResponse::<()>::error(self.0.to_string()))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HashMap<String, String>>> {
    let check = |ok: bool| if ok { "up" } else { "down" }.to_string();

    let mut status = HashMap::new();
    status.insert("service".to_string(), "mfrec-recommendation".to_string());
    status.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
    status.insert(
        "model".to_string(),
        if state.model.read().await.is_some() { "loaded" } else { "missing" }.to_string(),
    );
    let (log, identity) = futures::future::join(
        state.persistence.rating_log.ping(),
        state.persistence.identity_store.ping(),
    )
    .await;
    status.insert("rating_log".to_string(), check(log.is_ok()));
    // reachable but missing bindings since a failed write
    let identity_status = if identity.is_ok() && state.persistence.mirror_degraded() {
        "degraded".to_string()
    } else {
        check(identity.is_ok())
    };
    status.insert("identity_store".to_string(), identity_status);

    Json(ApiResponse::success(status))
}

async fn get_recommendations(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<RecommendationQuery>,
) -> ApiResult<mfrec::RecommendationResponse> {
    let top_k = params.top_k.unwrap_or(state.config.serving.default_top_k);
    let mut request = mfrec::RecommendationRequest::new(user_id, top_k);
    if let Some(exclude) = params.exclude {
        request = request.with_exclusions(
            exclude
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        );
    }

    let response = state.recommendation_service.recommend(&request).await?;
    Ok(Json(ApiResponse::success(response)))
}

async fn predict(
    State(state): State<AppState>,
    Query(params): Query<PredictQuery>,
) -> ApiResult<Prediction> {
    let score = state
        .recommendation_service
        .predict(&params.user_id, &params.item_id)
        .await?;
    Ok(Json(ApiResponse::success(Prediction {
        user_id: params.user_id,
        item_id: params.item_id,
        score,
    })))
}

async fn rate(State(state): State<AppState>, Json(body): Json<RateRequest>) -> ApiResult<mfrec::RateAck> {
    let event = mfrec::RatingEvent::new(
        body.user_id,
        body.item_id,
        body.rating,
        body.created_at.unwrap_or_else(Utc::now),
    );
    let ack = state.recommendation_service.rate(event).await?;
    Ok(Json(ApiResponse::success(ack)))
}

async fn batch_update(State(state): State<AppState>) -> ApiResult<mfrec::BatchUpdateReport> {
    match state.recommendation_service.batch_update().await {
        Ok(report) => Ok(Json(ApiResponse::success(report))),
        Err(e) if e.is_noop() => Ok(Json(ApiResponse::empty(e.to_string()))),
        Err(e) => Err(e.into()),
    }
}

async fn fit(State(state): State<AppState>) -> ApiResult<mfrec::FitReport> {
    let report = state.training_service.fit().await?;
    Ok(Json(ApiResponse::success(report)))
}

async fn stats(State(state): State<AppState>) -> Json<ApiResponse<mfrec::ServiceStats>> {
    Json(ApiResponse::success(state.recommendation_service.stats().await))
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/recommendations/:user_id", get(get_recommendations))
        .route("/predict", get(predict))
        .route("/ratings", post(rate))
        .route("/batch-update", post(batch_update))
        .route("/fit", post(fit))
        .route("/stats", get(stats))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = Config::load_or_default(&args.config)?;
    info!("Starting mfrec recommendation server with config: {:?}", config.server);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.workers.max(1))
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = config.server.socket_addr()?;
    let state = AppState::new(config).await?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
