//! Persistent volume spec to provider volume ID translation.

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{CloudBackend, Error, Result};

/// The parts of a Kubernetes `PersistentVolumeSpec` backends look at.
/// Everything else in the spec is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    #[serde(default)]
    pub csi: Option<CsiVolumeSource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsiVolumeSource {
    pub driver: String,
    pub volume_handle: String,
}

impl VolumeSpec {
    /// The CSI volume handle, if this volume is served by `driver`.
    pub fn csi_handle(&self, driver: &str) -> Option<&str> {
        self.csi
            .as_ref()
            .filter(|csi| csi.driver == driver && !csi.volume_handle.is_empty())
            .map(|csi| csi.volume_handle.as_str())
    }
}

/// Parse a serialized list of volume specs. `null` entries are kept as `None`.
pub fn parse_volume_specs(raw: &[u8]) -> Result<Vec<Option<VolumeSpec>>> {
    serde_json::from_slice(raw)
        .map_err(|e| Error::InvalidArgument(format!("malformed volume spec list: {e}")))
}

/// Volume IDs for every spec some backend can resolve, in input order.
///
/// Specs no backend recognizes and lookups that fail are skipped: a shorter
/// correct list beats failing the whole call.
pub async fn extract_volume_ids(
    backends: &[Arc<dyn CloudBackend>],
    raw: &[u8],
) -> Result<Vec<String>> {
    let specs = parse_volume_specs(raw)?;

    let lookups = specs
        .iter()
        .enumerate()
        .map(|(index, spec)| resolve_one(backends, index, spec.as_ref()));

    let ids: Vec<String> = join_all(lookups).await.into_iter().flatten().collect();
    debug!(requested = specs.len(), resolved = ids.len(), "volume ids extracted");
    Ok(ids)
}

async fn resolve_one(
    backends: &[Arc<dyn CloudBackend>],
    index: usize,
    spec: Option<&VolumeSpec>,
) -> Option<String> {
    let spec = spec?;
    for backend in backends {
        match backend.resolve_volume(spec).await {
            Ok(Some(id)) => return Some(id),
            Ok(None) => {}
            Err(e) => {
                warn!(index, provider = %backend.name(), error = %e, "volume lookup failed, skipping");
                return None;
            }
        }
    }
    None
}
