use axum::Json;
use axum::extract::State;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use mcm_provider::engine::Engine;
use mcm_provider::types::{ProviderSpec, Secrets};
use tracing::info;

use crate::dto::{
    CreateMachineResponse, ListMachinesRequest, ListMachinesResponse, MachineCallRequest,
    MachineStatusResponse, StateResponse,
};
use crate::error::ApiError;
use crate::extract::{ApiJson, CallerDeadline};
use crate::state::AppState;

/// Engine bound to the backend the provider spec names.
fn engine_for(state: &AppState, provider_spec: &[u8], secrets: &Secrets) -> Result<Engine, ApiError> {
    let spec = ProviderSpec::parse(provider_spec)?;
    let backend = state.providers.backend_for(spec.provider, secrets)?;
    Ok(Engine::new(backend, state.engine_config.clone()))
}

pub async fn create_machine(
    State(state): State<AppState>,
    CallerDeadline(deadline): CallerDeadline,
    ApiJson(body): ApiJson<MachineCallRequest>,
) -> Result<Json<CreateMachineResponse>, ApiError> {
    let req = body.into_request()?;
    let engine = engine_for(&state, &req.provider_spec, &req.secrets)?;

    let outcome = engine.create(&req, deadline).await?;
    info!(machine = %req.name, provider_id = %outcome.provider_id, "CreateMachine served");

    Ok(Json(CreateMachineResponse {
        provider_id: outcome.provider_id.to_string(),
        node_name: outcome.node_name,
        last_known_state: STANDARD.encode(&outcome.last_known_state),
    }))
}

pub async fn delete_machine(
    State(state): State<AppState>,
    CallerDeadline(deadline): CallerDeadline,
    ApiJson(body): ApiJson<MachineCallRequest>,
) -> Result<Json<StateResponse>, ApiError> {
    let req = body.into_request()?;
    let engine = engine_for(&state, &req.provider_spec, &req.secrets)?;

    let blob = engine.delete(&req, deadline).await?;
    info!(machine = %req.name, "DeleteMachine served");
    Ok(Json(StateResponse::new(&blob)))
}

pub async fn get_machine_status(
    State(state): State<AppState>,
    CallerDeadline(deadline): CallerDeadline,
    ApiJson(body): ApiJson<MachineCallRequest>,
) -> Result<Json<MachineStatusResponse>, ApiError> {
    let req = body.into_request()?;
    let engine = engine_for(&state, &req.provider_spec, &req.secrets)?;

    let record = engine.status(&req, deadline).await?;
    Ok(Json(MachineStatusResponse {
        provider_id: record.provider_id.to_string(),
        node_name: record.node_name,
    }))
}

pub async fn list_machines(
    State(state): State<AppState>,
    CallerDeadline(deadline): CallerDeadline,
    ApiJson(body): ApiJson<ListMachinesRequest>,
) -> Result<Json<ListMachinesResponse>, ApiError> {
    let (provider_spec, secrets) = body.into_parts()?;
    let engine = engine_for(&state, &provider_spec, &secrets)?;

    let machine_list = engine.list(&provider_spec, deadline).await?;
    Ok(Json(ListMachinesResponse { machine_list }))
}

pub async fn shut_down_machine(
    State(state): State<AppState>,
    CallerDeadline(deadline): CallerDeadline,
    ApiJson(body): ApiJson<MachineCallRequest>,
) -> Result<Json<StateResponse>, ApiError> {
    let req = body.into_request()?;
    let engine = engine_for(&state, &req.provider_spec, &req.secrets)?;

    let blob = engine.shutdown(&req, deadline).await?;
    info!(machine = %req.name, "ShutDownMachine served");
    Ok(Json(StateResponse::new(&blob)))
}
