use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::{Error, ProviderName, Result};

/// Tags/labels attached to a cloud resource. Ordered so encodings are stable.
pub type Tags = BTreeMap<String, String>;

/// Credential name to secret bytes, as supplied by the orchestrator.
pub type Secrets = HashMap<String, Vec<u8>>;

/// Opaque backend-side instance identifier (e.g. Fly Machine ID or Hetzner Server ID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Ordering used to elect a single instance among duplicates.
    ///
    /// Shorter IDs sort first so numeric IDs order numerically.
    pub fn election_key(&self) -> (usize, &str) {
        (self.0.len(), self.0.as_str())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique machine identity handed to the orchestrator,
/// formatted as `<scheme>://<instance-id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderId {
    pub provider: ProviderName,
    pub instance: InstanceId,
}

impl ProviderId {
    pub fn new(provider: ProviderName, instance: InstanceId) -> Self {
        Self { provider, instance }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.provider.scheme(), self.instance)
    }
}

impl FromStr for ProviderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, instance) = s
            .split_once("://")
            .ok_or_else(|| Error::InvalidId(s.to_string()))?;
        let provider = ProviderName::from_scheme(scheme).map_err(|_| Error::InvalidId(s.to_string()))?;
        if instance.is_empty() || instance.contains('/') {
            return Err(Error::InvalidId(s.to_string()));
        }
        Ok(Self::new(provider, InstanceId(instance.to_string())))
    }
}

/// A single call from the orchestrator. Immutable for the duration of the call.
#[derive(Debug, Clone, Default)]
pub struct MachineRequest {
    /// Orchestrator-assigned machine name; may be reused after recreation.
    pub name: String,
    pub provider_spec: Vec<u8>,
    pub secrets: Secrets,
    pub last_known_state: Option<Vec<u8>>,
}

/// Machine class configuration carried in the request's provider spec blob.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    pub provider: ProviderName,
    pub machine_class: String,
    /// Immutable per-machine token assigned by the orchestrator.
    /// Required for every per-machine operation, not for listing.
    #[serde(default)]
    pub correlation_token: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_cpu_millicores")]
    pub cpu_millicores: i32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: i32,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub tags: Tags,
}

fn default_cpu_millicores() -> i32 {
    1000
}

fn default_memory_mb() -> i32 {
    2048
}

impl ProviderSpec {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let spec: Self = serde_json::from_slice(raw)
            .map_err(|e| Error::InvalidArgument(format!("malformed provider spec: {e}")))?;

        if spec.machine_class.trim().is_empty() {
            return Err(Error::InvalidArgument("provider spec has an empty machineClass".into()));
        }
        if spec.cpu_millicores <= 0 || spec.memory_mb <= 0 {
            return Err(Error::InvalidArgument(
                "provider spec cpuMillicores and memoryMb must be positive".into(),
            ));
        }
        // Backends write env into files line by line.
        for (key, value) in &spec.env {
            if key.is_empty() || key.contains('=') || key.chars().any(char::is_control) {
                return Err(Error::InvalidArgument(format!("provider spec env key {key:?} is not valid")));
            }
            if value.chars().any(char::is_control) {
                return Err(Error::InvalidArgument(format!(
                    "provider spec env value of {key} contains control characters"
                )));
            }
        }
        Ok(spec)
    }

    /// The correlation token, required to address a single machine.
    pub fn correlation_token(&self) -> Result<&str> {
        match self.correlation_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(Error::InvalidArgument(
                "provider spec is missing correlationToken".into(),
            )),
        }
    }
}

/// What a backend is asked to create.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub image: Option<String>,
    pub location: Option<String>,
    pub cpu_millicores: i32,
    pub memory_mb: i32,
    pub env: HashMap<String, String>,
    pub tags: Tags,
}

/// Instance status and metadata returned from the backend.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub state: InstanceState,
    pub tags: Tags,
    /// Backend-reported creation time, used to elect among duplicates.
    pub created_at: Option<DateTime<Utc>>,
}

/// Backend-reported instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Destroying,
    Unknown,
}

impl InstanceState {
    pub fn phase(&self) -> LifecyclePhase {
        match self {
            Self::Starting | Self::Unknown => LifecyclePhase::Pending,
            // Still powered on until the backend reports it off.
            Self::Running | Self::Stopping => LifecyclePhase::Running,
            Self::Stopped => LifecyclePhase::Stopped,
            Self::Destroying => LifecyclePhase::Terminating,
        }
    }
}

/// Lifecycle phase of a machine as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecyclePhase {
    Pending,
    Running,
    Stopped,
    Terminating,
    NotFound,
}

impl LifecyclePhase {
    /// Running and Stopped both count as an existing machine.
    pub fn exists(&self) -> bool {
        matches!(self, Self::Running | Self::Stopped)
    }
}

/// A machine re-derived from the backend. Never cached.
#[derive(Debug, Clone)]
pub struct MachineRecord {
    pub provider_id: ProviderId,
    pub node_name: String,
    pub tags: Tags,
    pub phase: LifecyclePhase,
}

impl MachineRecord {
    pub fn from_instance(provider: ProviderName, instance: Instance) -> Self {
        Self {
            phase: instance.state.phase(),
            provider_id: ProviderId::new(provider, instance.id),
            node_name: instance.name,
            tags: instance.tags,
        }
    }
}
