//! Identity resolution.
//!
//! A machine's identity is a tag derived from the orchestrator's correlation
//! token, never its name: names are reused after an object is recreated.
//! Tag values are truncated SHA-256 digests so they fit every cloud's label
//! charset and length limits.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::state::LastKnownState;
use crate::types::{Instance, InstanceState, MachineRecord, ProviderSpec, Tags};
use crate::{CloudBackend, Code, Error, Result};

pub const IDENTITY_TAG: &str = "mcm.provider/identity";
pub const CLASS_TAG: &str = "mcm.provider/class";

const DIGEST_HEX_LEN: usize = 40;

/// Hex digest used as a tag value.
pub fn digest(value: &str) -> String {
    let hash = Sha256::digest(value.as_bytes());
    let mut hex: String = hash.iter().map(|b| format!("{b:02x}")).collect();
    hex.truncate(DIGEST_HEX_LEN);
    hex
}

/// The tags that identify one machine and its class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityTags {
    identity: String,
    class: String,
}

impl IdentityTags {
    pub fn new(machine_class: &str, correlation_token: &str) -> Self {
        Self {
            identity: digest(correlation_token),
            class: digest(machine_class),
        }
    }

    pub fn for_spec(spec: &ProviderSpec) -> Result<Self> {
        Ok(Self::new(&spec.machine_class, spec.correlation_token()?))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Selector matching every machine of a class.
    pub fn class_selector(machine_class: &str) -> Tags {
        Tags::from([(CLASS_TAG.to_string(), digest(machine_class))])
    }

    /// Selector matching this machine only.
    pub fn selector(&self) -> Tags {
        Tags::from([(IDENTITY_TAG.to_string(), self.identity.clone())])
    }

    /// User tags merged with the identity tags. Identity tags win.
    pub fn apply(&self, user_tags: &Tags) -> Tags {
        let mut tags = user_tags.clone();
        tags.insert(IDENTITY_TAG.to_string(), self.identity.clone());
        tags.insert(CLASS_TAG.to_string(), self.class.clone());
        tags
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        instance.tags.get(IDENTITY_TAG) == Some(&self.identity)
    }
}

/// Pick the single instance the orchestrator should see among candidates
/// carrying the same identity.
///
/// Live instances beat terminating ones, then the earliest created wins so a
/// creator that already kept its instance is never outvoted by a later one.
/// Instances without a creation time sort last; the smallest ID breaks ties.
pub fn elect(candidates: impl IntoIterator<Item = Instance>) -> Option<Instance> {
    candidates.into_iter().min_by(|a, b| election_rank(a).cmp(&election_rank(b)))
}

fn election_rank(instance: &Instance) -> (bool, bool, Option<DateTime<Utc>>, (usize, &str)) {
    (
        instance.state == InstanceState::Destroying,
        instance.created_at.is_none(),
        instance.created_at,
        instance.id.election_key(),
    )
}

/// Read-only lookup of the cloud resource behind a machine.
pub struct IdentityResolver<'a> {
    backend: &'a dyn CloudBackend,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(backend: &'a dyn CloudBackend) -> Self {
        Self { backend }
    }

    /// Find the machine identified by `tags`.
    ///
    /// `Ok(None)` is a definitive answer. Any failure to get one surfaces as
    /// an error, never as absence.
    pub async fn resolve(
        &self,
        tags: &IdentityTags,
        hint: Option<&LastKnownState>,
    ) -> Result<Option<MachineRecord>> {
        let provider = self.backend.name();

        if let Some(hinted) = hint.map(LastKnownState::provider_id).transpose()?.flatten() {
            if hinted.provider != provider {
                debug!(provider_id = %hinted, "ignoring state hint from another provider");
            } else {
                let described = self
                    .backend
                    .describe_instance(&hinted.instance)
                    .await
                    .map_err(|e| match e {
                        // The blob names an ID this backend could never have issued.
                        Error::InvalidId(id) => {
                            Error::CorruptState(format!("hinted instance id {id} is not valid for {provider}"))
                        }
                        e => ambiguous(e),
                    })?;
                match described {
                    Some(instance) if tags.matches(&instance) => {
                        debug!(provider_id = %hinted, "state hint confirmed");
                        return Ok(Some(MachineRecord::from_instance(provider, instance)));
                    }
                    Some(_) => {
                        warn!(provider_id = %hinted, "state hint points at a resource with another identity");
                    }
                    None => debug!(provider_id = %hinted, "hinted resource is gone"),
                }
            }
        }

        let candidates: Vec<Instance> = self
            .backend
            .find_instances(&tags.selector())
            .await
            .map_err(ambiguous)?
            .into_iter()
            .filter(|instance| tags.matches(instance))
            .collect();

        if candidates.len() > 1 {
            warn!(
                identity = tags.identity(),
                count = candidates.len(),
                "several resources share one identity"
            );
        }

        Ok(elect(candidates).map(|instance| MachineRecord::from_instance(provider, instance)))
    }
}

/// A backend saying "not found" to a lookup that should have returned
/// `Ok(None)` is not a definitive answer.
fn ambiguous(e: Error) -> Error {
    match e.code() {
        Code::NotFound => Error::Unavailable(format!("ambiguous lookup: {e}")),
        _ => e,
    }
}
