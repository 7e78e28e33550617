//! Codec for the last-known-state blob the orchestrator carries between calls.
//!
//! The blob is a JSON object tagged with a schema `version`. Blobs of an
//! unknown version, or without a version, decode to "no hint" so an older
//! caller never makes a newer code path misread its bytes. Bytes that are not
//! a JSON object at all, or that claim a known version but do not match it,
//! are corruption.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::IdentityTags;
use crate::types::{LifecyclePhase, MachineRecord, ProviderId};
use crate::{Error, Result};

pub const STATE_VERSION: u64 = 1;

/// Progress recorded in the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatePhase {
    /// Pre-commit marker: provisioning was issued, not yet observed running.
    Creating,
    Running,
    Stopping,
    Stopped,
    Deleting,
    Absent,
}

impl From<LifecyclePhase> for StatePhase {
    fn from(phase: LifecyclePhase) -> Self {
        match phase {
            LifecyclePhase::Pending => Self::Creating,
            LifecyclePhase::Running => Self::Running,
            LifecyclePhase::Stopped => Self::Stopped,
            LifecyclePhase::Terminating => Self::Deleting,
            LifecyclePhase::NotFound => Self::Absent,
        }
    }
}

/// Decoded contents of the blob. A hint, never an authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastKnownState {
    pub phase: StatePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Identity tag value of the machine this blob describes.
    pub identity: String,
    /// When the operation recorded in `phase` was first issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl LastKnownState {
    pub fn new(phase: StatePhase, tags: &IdentityTags) -> Self {
        Self {
            phase,
            provider_id: None,
            identity: tags.identity().to_string(),
            started_at: None,
        }
    }

    pub fn for_record(record: &MachineRecord, tags: &IdentityTags) -> Self {
        Self::new(record.phase.into(), tags).provider(&record.provider_id)
    }

    pub fn provider(mut self, id: &ProviderId) -> Self {
        self.provider_id = Some(id.to_string());
        self
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    /// Parsed provider ID. An unparseable ID in a known-version blob is corruption.
    pub fn provider_id(&self) -> Result<Option<ProviderId>> {
        self.provider_id
            .as_deref()
            .map(|raw| {
                raw.parse()
                    .map_err(|_| Error::CorruptState(format!("unparseable provider id {raw:?}")))
            })
            .transpose()
    }

    /// Start time of an operation in `phase` on the same machine, so retries
    /// keep reporting when the operation was first issued.
    pub fn started_at_if(&self, phase: StatePhase, tags: &IdentityTags) -> Option<DateTime<Utc>> {
        (self.phase == phase && self.identity == tags.identity())
            .then_some(self.started_at)
            .flatten()
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    version: u64,
    #[serde(flatten)]
    state: &'a LastKnownState,
}

#[derive(Deserialize)]
struct VersionPeek {
    #[serde(default)]
    version: Option<u64>,
}

/// Encode deterministically: equal states always produce equal bytes.
pub fn encode(state: &LastKnownState) -> Result<Vec<u8>> {
    serde_json::to_vec(&Envelope {
        version: STATE_VERSION,
        state,
    })
    .map_err(|e| Error::Internal(format!("encode last known state: {e}")))
}

/// Decode a blob. Empty or missing blobs and unknown versions yield `None`.
pub fn decode(raw: Option<&[u8]>) -> Result<Option<LastKnownState>> {
    let raw = match raw {
        Some(raw) if !raw.iter().all(u8::is_ascii_whitespace) => raw,
        _ => return Ok(None),
    };

    let peek: VersionPeek = serde_json::from_slice(raw)
        .map_err(|e| Error::CorruptState(format!("not a state envelope: {e}")))?;

    match peek.version {
        Some(STATE_VERSION) => serde_json::from_slice(raw)
            .map(Some)
            .map_err(|e| Error::CorruptState(format!("version {STATE_VERSION} blob: {e}"))),
        other => {
            tracing::debug!(version = ?other, "ignoring last known state of unknown version");
            Ok(None)
        }
    }
}
