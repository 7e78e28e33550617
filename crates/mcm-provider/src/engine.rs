//! Lifecycle operations: create, delete, status, shutdown and list.
//!
//! Every operation re-derives the machine from the backend through the
//! identity resolver and is safe to repeat or run concurrently for the same
//! machine. Long-running operations poll until a stable state or their
//! deadline; on the deadline they fail with `DeadlineExceeded` carrying the
//! state blob the orchestrator should retry with.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::identity::{self, IdentityResolver, IdentityTags};
use crate::state::{self, LastKnownState, StatePhase};
use crate::types::{
    Instance, InstanceId, InstanceSpec, InstanceState, LifecyclePhase, MachineRecord,
    MachineRequest, ProviderId, ProviderSpec,
};
use crate::{CloudBackend, Code, Error, Result};

/// Polling cadence and per-operation time limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub create_timeout: Duration,
    pub delete_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            create_timeout: Duration::from_secs(300),
            delete_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(120),
        }
    }
}

impl EngineConfig {
    /// Create from env vars, falling back to defaults for unset or unparseable values:
    ///
    /// - `MCM_POLL_INTERVAL_MS` (default: 2000)
    /// - `MCM_CREATE_TIMEOUT_SECS` (default: 300)
    /// - `MCM_DELETE_TIMEOUT_SECS` (default: 300)
    /// - `MCM_SHUTDOWN_TIMEOUT_SECS` (default: 120)
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let var = |key: &str| std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok());

        Self {
            poll_interval: var("MCM_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            create_timeout: var("MCM_CREATE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.create_timeout),
            delete_timeout: var("MCM_DELETE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.delete_timeout),
            shutdown_timeout: var("MCM_SHUTDOWN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
        }
    }
}

/// Result of a successful create.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub provider_id: ProviderId,
    pub node_name: String,
    pub last_known_state: Vec<u8>,
}

/// Per-call context shared by the operations.
struct Call {
    spec: ProviderSpec,
    tags: IdentityTags,
    hint: Option<LastKnownState>,
    deadline: Instant,
}

pub struct Engine {
    backend: Arc<dyn CloudBackend>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(backend: Arc<dyn CloudBackend>, config: EngineConfig) -> Self {
        Self { backend, config }
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Create the machine, or adopt it if an earlier attempt already did.
    pub async fn create(&self, req: &MachineRequest, deadline: Option<Instant>) -> Result<CreateOutcome> {
        let call = self.prepare(req, self.config.create_timeout, deadline)?;
        let started_at = call
            .hint
            .as_ref()
            .and_then(|h| h.started_at_if(StatePhase::Creating, &call.tags))
            .unwrap_or_else(Utc::now);
        let marker = LastKnownState::new(StatePhase::Creating, &call.tags).started(started_at);

        let existing = self.resolve(&call).await?;
        let id = match existing {
            Some(record) if record.phase.exists() => {
                info!(machine = %req.name, provider_id = %record.provider_id, phase = ?record.phase, "machine already exists");
                return self.create_outcome(record, &call.tags);
            }
            Some(record) if record.phase == LifecyclePhase::Terminating => {
                return Err(Error::Unavailable(format!(
                    "machine {} ({}) is still terminating",
                    req.name, record.provider_id
                )));
            }
            Some(record) => {
                info!(machine = %req.name, provider_id = %record.provider_id, "resuming provisioning");
                record.provider_id.instance
            }
            None => {
                let encoded = state::encode(&marker)?;
                self.provision(req, &call)
                    .await
                    .map_err(|e| e.with_state(encoded))?
            }
        };

        let provider_id = ProviderId::new(self.backend.name(), id);
        let marker = state::encode(&marker.provider(&provider_id))?;
        debug!(machine = %req.name, provider_id = %provider_id, "pre-commit marker recorded");

        let instance = self
            .wait_for(&provider_id.instance, call.deadline, "machine to run", |current| {
                match current {
                    Some(instance) => Ok(instance.state.phase().exists()),
                    None => Err(Error::Unavailable("machine vanished while provisioning".into())),
                }
            })
            .await
            .map_err(|e| e.with_state(marker))?;

        let record = match instance {
            Some(instance) => MachineRecord::from_instance(self.backend.name(), instance),
            None => return Err(Error::Internal("provisioned machine has no record".into())),
        };
        info!(machine = %req.name, provider_id = %record.provider_id, "machine running");
        self.create_outcome(record, &call.tags)
    }

    /// Delete the machine. A machine that is already gone counts as deleted.
    pub async fn delete(&self, req: &MachineRequest, deadline: Option<Instant>) -> Result<Vec<u8>> {
        let mut call = self.prepare(req, self.config.delete_timeout, deadline)?;
        let started_at = call
            .hint
            .as_ref()
            .and_then(|h| h.started_at_if(StatePhase::Deleting, &call.tags))
            .unwrap_or_else(Utc::now);

        // Duplicates left by an earlier racy create share the identity, so
        // keep going until the resolver finds nothing.
        let mut gone: HashSet<InstanceId> = HashSet::new();
        while let Some(record) = self.resolve(&call).await? {
            if gone.contains(&record.provider_id.instance) {
                // The listing has not caught up with a deletion we observed.
                if Instant::now() + self.config.poll_interval >= call.deadline {
                    return Err(Error::DeadlineExceeded(format!(
                        "listing still shows deleted machine {}",
                        record.provider_id
                    ))
                    .with_state(state::encode(
                        &LastKnownState::new(StatePhase::Deleting, &call.tags).started(started_at),
                    )?));
                }
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            let marker = state::encode(
                &LastKnownState::new(StatePhase::Deleting, &call.tags)
                    .provider(&record.provider_id)
                    .started(started_at),
            )?;

            if record.phase != LifecyclePhase::Terminating {
                info!(machine = %req.name, provider_id = %record.provider_id, "deleting machine");
                within(call.deadline, "delete", self.backend.delete_instance(&record.provider_id.instance))
                    .await
                    .map_err(|e| e.with_state(marker.clone()))?;
            }

            self.wait_for(&record.provider_id.instance, call.deadline, "machine to disappear", |current| {
                Ok(current.is_none())
            })
            .await
            .map_err(|e| e.with_state(marker))?;

            info!(machine = %req.name, provider_id = %record.provider_id, "machine deleted");
            gone.insert(record.provider_id.instance);
            // Nothing is left to hint at; the marker is what a failed
            // lookup hands back from here on.
            call.hint = Some(LastKnownState::new(StatePhase::Deleting, &call.tags).started(started_at));
        }

        debug!(machine = %req.name, "no machine left for identity");
        state::encode(&LastKnownState::new(StatePhase::Absent, &call.tags))
    }

    /// Current record of the machine, `NotFound` when no resource exists.
    pub async fn status(&self, req: &MachineRequest, deadline: Option<Instant>) -> Result<MachineRecord> {
        let call = self.prepare(req, self.config.create_timeout, deadline)?;
        self.resolve(&call)
            .await?
            .ok_or_else(|| Error::NotFound(format!("machine {}", req.name)))
    }

    /// Power the machine off. Already stopped or terminating machines are left alone.
    pub async fn shutdown(&self, req: &MachineRequest, deadline: Option<Instant>) -> Result<Vec<u8>> {
        let call = self.prepare(req, self.config.shutdown_timeout, deadline)?;
        let record = self
            .resolve(&call)
            .await?
            .ok_or_else(|| Error::NotFound(format!("machine {}", req.name)))?;

        if matches!(record.phase, LifecyclePhase::Stopped | LifecyclePhase::Terminating) {
            debug!(machine = %req.name, phase = ?record.phase, "nothing to shut down");
            return state::encode(&LastKnownState::for_record(&record, &call.tags));
        }

        let started_at = call
            .hint
            .as_ref()
            .and_then(|h| h.started_at_if(StatePhase::Stopping, &call.tags))
            .unwrap_or_else(Utc::now);
        let marker = state::encode(
            &LastKnownState::new(StatePhase::Stopping, &call.tags)
                .provider(&record.provider_id)
                .started(started_at),
        )?;

        info!(machine = %req.name, provider_id = %record.provider_id, "shutting down machine");
        match within(call.deadline, "stop", self.backend.stop_instance(&record.provider_id.instance)).await {
            Ok(()) => {}
            Err(e) if e.code() == Code::NotFound => {
                return state::encode(&LastKnownState::new(StatePhase::Absent, &call.tags));
            }
            Err(e) => return Err(e.with_state(marker)),
        }

        let stopped = self
            .wait_for(&record.provider_id.instance, call.deadline, "machine to stop", |current| {
                Ok(current.is_none_or(|i| matches!(i.state, InstanceState::Stopped | InstanceState::Destroying)))
            })
            .await
            .map_err(|e| e.with_state(marker))?;

        let state = match stopped {
            Some(instance) => LastKnownState::for_record(
                &MachineRecord::from_instance(self.backend.name(), instance),
                &call.tags,
            ),
            None => LastKnownState::new(StatePhase::Absent, &call.tags),
        };
        info!(machine = %req.name, provider_id = %record.provider_id, phase = ?state.phase, "machine shut down");
        state::encode(&state)
    }

    /// Every machine of the spec's class, keyed by provider ID.
    ///
    /// Freshly created machines may be missing until the backend's listing
    /// catches up.
    pub async fn list(&self, provider_spec: &[u8], deadline: Option<Instant>) -> Result<BTreeMap<String, String>> {
        let spec = self.parse_spec(provider_spec)?;
        let deadline = self.deadline(self.config.create_timeout, deadline);
        let selector = IdentityTags::class_selector(&spec.machine_class);

        let instances = within(deadline, "list", self.backend.find_instances(&selector)).await?;
        let provider = self.backend.name();

        let machines: BTreeMap<String, String> = instances
            .into_iter()
            .filter(|i| selector.iter().all(|(k, v)| i.tags.get(k) == Some(v)))
            .map(|i| (ProviderId::new(provider, i.id).to_string(), i.name))
            .collect();
        debug!(class = %spec.machine_class, count = machines.len(), "listed machines");
        Ok(machines)
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn parse_spec(&self, raw: &[u8]) -> Result<ProviderSpec> {
        let spec = ProviderSpec::parse(raw)?;
        if spec.provider != self.backend.name() {
            return Err(Error::InvalidArgument(format!(
                "provider spec targets {}, this engine serves {}",
                spec.provider,
                self.backend.name()
            )));
        }
        Ok(spec)
    }

    fn prepare(&self, req: &MachineRequest, timeout: Duration, deadline: Option<Instant>) -> Result<Call> {
        if req.name.trim().is_empty() {
            return Err(Error::InvalidArgument("machine name is empty".into()));
        }
        let spec = self.parse_spec(&req.provider_spec)?;
        let tags = IdentityTags::for_spec(&spec)?;
        let hint = state::decode(req.last_known_state.as_deref())?;
        Ok(Call {
            spec,
            tags,
            hint,
            deadline: self.deadline(timeout, deadline),
        })
    }

    /// The earlier of the operation's own limit and the caller's deadline.
    fn deadline(&self, timeout: Duration, caller: Option<Instant>) -> Instant {
        let own = Instant::now() + timeout;
        caller.map_or(own, |caller| caller.min(own))
    }

    /// Resolve the call's machine. A failed lookup hands the caller's state
    /// back so the next attempt keeps its hint.
    async fn resolve(&self, call: &Call) -> Result<Option<MachineRecord>> {
        let resolver = IdentityResolver::new(self.backend.as_ref());
        within(call.deadline, "resolve", resolver.resolve(&call.tags, call.hint.as_ref()))
            .await
            .map_err(|e| match &call.hint {
                Some(hint) if e.code() != Code::Internal => match state::encode(hint) {
                    Ok(blob) => e.with_state(blob),
                    Err(_) => e,
                },
                _ => e,
            })
    }

    fn create_outcome(&self, record: MachineRecord, tags: &IdentityTags) -> Result<CreateOutcome> {
        Ok(CreateOutcome {
            last_known_state: state::encode(&LastKnownState::for_record(&record, tags))?,
            provider_id: record.provider_id,
            node_name: record.node_name,
        })
    }

    /// Issue the create and settle any race with concurrent creators.
    async fn provision(&self, req: &MachineRequest, call: &Call) -> Result<InstanceId> {
        let spec = InstanceSpec {
            name: req.name.clone(),
            image: call.spec.image.clone(),
            location: call.spec.location.clone(),
            cpu_millicores: call.spec.cpu_millicores,
            memory_mb: call.spec.memory_mb,
            env: call.spec.env.clone(),
            tags: call.tags.apply(&call.spec.tags),
        };

        info!(machine = %req.name, identity = call.tags.identity(), "provisioning machine");
        match within(call.deadline, "create", self.backend.create_instance(&spec)).await {
            Ok(created) => Ok(self.converge(created, call).await),
            Err(Error::AlreadyExists(reason)) => {
                debug!(machine = %req.name, %reason, "create conflicted, re-resolving");
                match self.resolve(call).await? {
                    Some(record) if record.phase == LifecyclePhase::Terminating => Err(Error::Unavailable(
                        format!("machine {} ({}) is still terminating", req.name, record.provider_id),
                    )),
                    Some(record) => Ok(record.provider_id.instance),
                    None => Err(Error::AlreadyExists(format!(
                        "name {} is held by a resource with another identity ({reason})",
                        req.name
                    ))),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Make concurrent creators agree on one instance.
    ///
    /// Every creator elects the same winner among the instances carrying the
    /// identity; a creator whose own instance lost deletes it and adopts the
    /// winner. Best-effort: a failed lookup keeps our own instance.
    async fn converge(&self, created: Instance, call: &Call) -> InstanceId {
        let peers = match within(call.deadline, "list", self.backend.find_instances(&call.tags.selector())).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(instance_id = %created.id, error = %e, "could not check for duplicate machines");
                return created.id;
            }
        };

        let own = created.id.clone();
        let winner = identity::elect(
            peers
                .into_iter()
                .filter(|i| call.tags.matches(i) && i.state != InstanceState::Destroying)
                .chain(std::iter::once(created)),
        );

        match winner {
            Some(winner) if winner.id != own => {
                info!(instance_id = %own, winner = %winner.id, "lost create race, removing duplicate");
                if let Err(e) = within(call.deadline, "delete duplicate", self.backend.delete_instance(&own)).await {
                    warn!(instance_id = %own, error = %e, "failed to remove duplicate machine");
                }
                winner.id
            }
            _ => own,
        }
    }

    /// Poll the instance until `done` says so or the deadline passes.
    ///
    /// Transient backend errors are retried until the deadline.
    async fn wait_for<F>(
        &self,
        id: &InstanceId,
        deadline: Instant,
        what: &str,
        done: F,
    ) -> Result<Option<Instance>>
    where
        F: Fn(Option<&Instance>) -> Result<bool>,
    {
        loop {
            match within(deadline, what, self.backend.describe_instance(id)).await {
                Ok(current) => {
                    if done(current.as_ref())? {
                        return Ok(current);
                    }
                    debug!(instance_id = %id, state = ?current.map(|i| i.state), "waiting for {what}");
                }
                Err(e) if e.code() == Code::Unavailable => {
                    warn!(instance_id = %id, error = %e, "transient error while waiting for {what}");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() + self.config.poll_interval >= deadline {
                return Err(Error::DeadlineExceeded(format!("timed out waiting for {what}")));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

/// Run a backend call, failing with `DeadlineExceeded` once `deadline` passes.
///
/// The backend call itself is dropped, not rolled back.
async fn within<T>(deadline: Instant, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::DeadlineExceeded(format!("{what} did not finish in time"))),
    }
}
