pub mod machines;
pub mod volumes;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};

use crate::auth::auth_middleware;
use crate::dto::VersionResponse;
use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    let authed = Router::new()
        // Machine lifecycle
        .route("/v1/CreateMachine", post(machines::create_machine))
        .route("/v1/DeleteMachine", post(machines::delete_machine))
        .route("/v1/GetMachineStatus", post(machines::get_machine_status))
        .route("/v1/ListMachines", post(machines::list_machines))
        .route("/v1/ShutDownMachine", post(machines::shut_down_machine))
        // Volumes
        .route("/v1/GetVolumeIDs", post(volumes::get_volume_ids))
        // Auth middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(authed)
        .route("/version", get(version))
        .with_state(state)
}

async fn version(State(state): State<AppState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        providers: state.providers.available().iter().map(|p| p.to_string()).collect(),
    })
}
