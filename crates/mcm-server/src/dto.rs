use std::collections::{BTreeMap, HashMap};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use mcm_provider::types::{MachineRequest, Secrets};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

// ── Requests ───────────────────────────────────────────────────────

/// Per-machine call: create, delete, status and shutdown.
///
/// `providerSpec` is either inline JSON or a base64 string of the raw blob.
/// Secret values and `lastKnownState` are base64.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineCallRequest {
    pub name: String,
    pub provider_spec: Value,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    #[serde(default)]
    pub last_known_state: Option<String>,
}

impl MachineCallRequest {
    pub fn into_request(self) -> Result<MachineRequest, ApiError> {
        Ok(MachineRequest {
            name: self.name,
            provider_spec: blob(self.provider_spec, "providerSpec")?,
            secrets: secrets(self.secrets)?,
            last_known_state: self
                .last_known_state
                .filter(|s| !s.is_empty())
                .map(|s| decode_base64(&s, "lastKnownState"))
                .transpose()?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMachinesRequest {
    pub provider_spec: Value,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

impl ListMachinesRequest {
    pub fn into_parts(self) -> Result<(Vec<u8>, Secrets), ApiError> {
        Ok((blob(self.provider_spec, "providerSpec")?, secrets(self.secrets)?))
    }
}

/// `pvSpecList` is an inline JSON list or a base64 string of the raw blob.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetVolumeIdsRequest {
    pub pv_spec_list: Value,
}

impl GetVolumeIdsRequest {
    pub fn into_blob(self) -> Result<Vec<u8>, ApiError> {
        blob(self.pv_spec_list, "pvSpecList")
    }
}

// ── Responses ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMachineResponse {
    pub provider_id: String,
    pub node_name: String,
    pub last_known_state: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    pub last_known_state: String,
}

impl StateResponse {
    pub fn new(state: &[u8]) -> Self {
        Self {
            last_known_state: STANDARD.encode(state),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatusResponse {
    pub provider_id: String,
    pub node_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMachinesResponse {
    pub machine_list: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetVolumeIdsResponse {
    pub volume_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    pub providers: Vec<String>,
}

// ── Decoding ───────────────────────────────────────────────────────

fn decode_base64(value: &str, field: &str) -> Result<Vec<u8>, ApiError> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| ApiError::BadRequest(format!("{field} is not valid base64: {e}")))
}

fn blob(value: Value, field: &str) -> Result<Vec<u8>, ApiError> {
    match value {
        Value::String(encoded) => decode_base64(&encoded, field),
        Value::Null => Err(ApiError::BadRequest(format!("{field} is required"))),
        other => serde_json::to_vec(&other)
            .map_err(|e| ApiError::BadRequest(format!("{field} could not be encoded: {e}"))),
    }
}

fn secrets(encoded: HashMap<String, String>) -> Result<Secrets, ApiError> {
    encoded
        .into_iter()
        .map(|(key, value)| {
            let bytes = decode_base64(&value, &format!("secret {key}"))?;
            Ok((key, bytes))
        })
        .collect()
}
