use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Machine types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateMachineRequest {
    pub name: String,
    pub region: String,
    pub config: MachineConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    pub guest: GuestConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_destroy: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuestConfig {
    pub cpus: u32,
    pub cpu_kind: String,
    pub memory_mb: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub state: String,
    pub region: String,
    #[serde(default)]
    pub config: Option<MachineConfigView>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Machine {
    /// Metadata attached at creation, empty when the API omitted the config.
    pub fn metadata(&self) -> HashMap<String, String> {
        self.config
            .as_ref()
            .map(|c| c.metadata.clone())
            .unwrap_or_default()
    }
}

/// The subset of a machine's config echoed back by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfigView {
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

// ── Volume types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub state: String,
    pub region: String,
    #[serde(default)]
    pub attached_machine_id: Option<String>,
}
