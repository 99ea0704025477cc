use crate::broadcast::StateBroadcaster;
use crate::core::{CatalogOp, CatalogOutcome, ControllerHandle, SharedLibrary};
use async_stream::stream;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

use tuner_proto::catalog::{validate_name, validate_url, SourceKind, StationDraft, StationPatch};
use tuner_proto::error::RadioError;
use tuner_proto::protocol::{Broadcast, Intent, Snapshot, PROTOCOL_VERSION};
use tuner_proto::settings::SettingsPatch;

#[derive(Clone)]
pub struct HttpState {
    pub handle: ControllerHandle,
    pub broadcaster: StateBroadcaster,
    pub library: SharedLibrary,
}

/// Error body for every non-2xx response.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(RadioError);

impl From<RadioError> for ApiError {
    fn from(e: RadioError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self(RadioError::Validation(e.body_text()))
    }
}

fn status_for(e: &RadioError) -> StatusCode {
    match e {
        RadioError::Validation(_) => StatusCode::BAD_REQUEST,
        RadioError::NotFound { .. } => StatusCode::NOT_FOUND,
        RadioError::Resolution(_) | RadioError::Launch(_) | RadioError::Device(_) => {
            StatusCode::BAD_GATEWAY
        }
        RadioError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        RadioError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        debug!("HTTP API: {} ({})", self.0, status);
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/events", get(events))
        .route("/api/logs", get(get_logs))
        .route("/api/control/station", post(control_station))
        .route("/api/control/power", post(control_power))
        .route("/api/control/volume", post(control_volume))
        .route("/api/packs", get(list_packs).post(create_pack))
        .route("/api/packs/:id", get(get_pack).put(update_pack).delete(delete_pack))
        .route("/api/packs/:id/activate", post(activate_pack))
        .route("/api/packs/:id/stations", post(add_station))
        .route("/api/packs/:id/stations/reorder", post(reorder_stations))
        .route(
            "/api/packs/:id/stations/:sid",
            put(update_station).delete(delete_station),
        )
        .route("/api/settings", get(get_settings).put(update_settings))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: HttpState,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("HTTP server error: {}", e);
        }
    })
}

// ── state & events ───────────────────────────────────────────────────────────

async fn get_state(State(state): State<HttpState>) -> Json<Snapshot> {
    Json(state.broadcaster.latest().as_ref().clone())
}

async fn get_logs(State(state): State<HttpState>) -> Json<Vec<String>> {
    Json(state.broadcaster.log_tail())
}

async fn events(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let mut states = state.broadcaster.subscribe();
    let mut logs = state.broadcaster.subscribe_logs();
    let hello = Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        state: state.broadcaster.latest().as_ref().clone(),
    };
    debug!("HTTP API: SSE subscriber connected");

    let stream = stream! {
        yield Event::default().event("hello").json_data(&hello);
        loop {
            let msg = tokio::select! {
                snapshot = states.next() => match snapshot {
                    Some(snapshot) => Broadcast::State { data: snapshot.as_ref().clone() },
                    None => break,
                },
                line = logs.recv() => match line {
                    Ok(message) => Broadcast::Log { message },
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            };
            let name = match &msg {
                Broadcast::Log { .. } => "log",
                _ => "state",
            };
            yield Event::default().event(name).json_data(&msg);
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── control ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StationControl {
    #[serde(default)]
    index: Option<i64>,
    #[serde(default)]
    direction: Option<i8>,
}

#[derive(Deserialize)]
struct PowerControl {
    on: bool,
}

#[derive(Deserialize)]
struct VolumeControl {
    level: i64,
}

async fn control_station(
    State(state): State<HttpState>,
    body: Result<Json<StationControl>, JsonRejection>,
) -> ApiResult<Json<Snapshot>> {
    let Json(body) = body?;
    let intent = match (body.index, body.direction) {
        (Some(index), None) => Intent::SetStationIndex { index },
        (None, Some(direction)) => Intent::RotateStation { direction },
        _ => {
            return Err(RadioError::Validation(
                "expected exactly one of index or direction".into(),
            )
            .into())
        }
    };
    info!("HTTP API: {:?}", intent);
    Ok(Json(state.handle.submit(intent).await?))
}

async fn control_power(
    State(state): State<HttpState>,
    body: Result<Json<PowerControl>, JsonRejection>,
) -> ApiResult<Json<Snapshot>> {
    let Json(body) = body?;
    info!("HTTP API: Power {}", if body.on { "on" } else { "off" });
    Ok(Json(state.handle.submit(Intent::SetPower { on: body.on }).await?))
}

async fn control_volume(
    State(state): State<HttpState>,
    body: Result<Json<VolumeControl>, JsonRejection>,
) -> ApiResult<Json<Snapshot>> {
    let Json(body) = body?;
    info!("HTTP API: Set volume to {}", body.level);
    Ok(Json(
        state
            .handle
            .submit(Intent::SetVolume { level: body.level })
            .await?,
    ))
}

// ── packs ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreatePack {
    name: String,
}

#[derive(Deserialize)]
struct UpdatePack {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    stations: Option<Vec<StationDraft>>,
}

#[derive(Deserialize)]
struct AddStation {
    name: String,
    url: String,
    #[serde(default)]
    source_kind: Option<SourceKind>,
}

#[derive(Deserialize)]
struct Reorder {
    station_ids: Vec<String>,
}

async fn list_packs(State(state): State<HttpState>) -> impl IntoResponse {
    let listings = state.library.read().await.catalog.listings();
    Json(listings)
}

async fn get_pack(State(state): State<HttpState>, Path(id): Path<String>) -> ApiResult<Response> {
    let listing = state.library.read().await.catalog.listing(&id);
    listing
        .map(|l| Json(l).into_response())
        .ok_or_else(|| RadioError::pack_not_found(id).into())
}

async fn create_pack(
    State(state): State<HttpState>,
    body: Result<Json<CreatePack>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = body?;
    let name = validate_name(&body.name)?;
    info!("HTTP API: Create pack {:?}", name);
    let outcome = state.handle.mutate(CatalogOp::CreatePack { name }).await?;
    Ok((StatusCode::CREATED, outcome_json(outcome)).into_response())
}

async fn update_pack(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    body: Result<Json<UpdatePack>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = body?;
    let name = body.name.as_deref().map(validate_name).transpose()?;
    if let Some(stations) = &body.stations {
        for draft in stations {
            validate_name(&draft.name)?;
            validate_url(&draft.url)?;
        }
    }
    let op = CatalogOp::UpdatePack {
        pack_id: id,
        name,
        stations: body.stations,
    };
    Ok(outcome_json(state.handle.mutate(op).await?))
}

async fn delete_pack(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    info!("HTTP API: Delete pack {}", id);
    state.handle.mutate(CatalogOp::DeletePack { pack_id: id }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn activate_pack(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Snapshot>> {
    info!("HTTP API: Activate pack {}", id);
    Ok(Json(
        state
            .handle
            .submit(Intent::ActivatePack { pack_id: id })
            .await?,
    ))
}

async fn add_station(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    body: Result<Json<AddStation>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = body?;
    let op = CatalogOp::AddStation {
        pack_id: id,
        name: validate_name(&body.name)?,
        url: validate_url(&body.url)?,
        source_kind: body.source_kind,
    };
    let outcome = state.handle.mutate(op).await?;
    Ok((StatusCode::CREATED, outcome_json(outcome)).into_response())
}

async fn update_station(
    State(state): State<HttpState>,
    Path((id, sid)): Path<(String, String)>,
    body: Result<Json<StationPatch>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(mut patch) = body?;
    patch.name = patch.name.as_deref().map(validate_name).transpose()?;
    patch.url = patch.url.as_deref().map(validate_url).transpose()?;
    let op = CatalogOp::UpdateStation {
        pack_id: id,
        station_id: sid,
        patch,
    };
    Ok(outcome_json(state.handle.mutate(op).await?))
}

async fn delete_station(
    State(state): State<HttpState>,
    Path((id, sid)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let op = CatalogOp::DeleteStation {
        pack_id: id,
        station_id: sid,
    };
    state.handle.mutate(op).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reorder_stations(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    body: Result<Json<Reorder>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = body?;
    let op = CatalogOp::ReorderStations {
        pack_id: id,
        station_ids: body.station_ids,
    };
    Ok(outcome_json(state.handle.mutate(op).await?))
}

// ── settings ─────────────────────────────────────────────────────────────────

async fn get_settings(State(state): State<HttpState>) -> impl IntoResponse {
    let settings = state.library.read().await.settings.clone();
    Json(settings)
}

async fn update_settings(
    State(state): State<HttpState>,
    body: Result<Json<SettingsPatch>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(patch) = body?;
    info!("HTTP API: Update settings");
    Ok(outcome_json(
        state.handle.mutate(CatalogOp::UpdateSettings(patch)).await?,
    ))
}

fn outcome_json(outcome: CatalogOutcome) -> Response {
    match outcome {
        CatalogOutcome::Pack(listing) => Json(listing).into_response(),
        CatalogOutcome::Station(station) => Json(station).into_response(),
        CatalogOutcome::Settings(settings) => Json(settings).into_response(),
        CatalogOutcome::Deleted => StatusCode::NO_CONTENT.into_response(),
    }
}
