//! In-memory backend.
//!
//! Behaves like a slow, occasionally flaky cloud: instances take a few
//! describe calls to boot, stop or disappear, creation can be made racy or
//! create-if-absent, listings can lag behind creates, and transient faults
//! can be injected. Used for local runs of the server and as the fake
//! backend in tests.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::info;

use crate::identity::IDENTITY_TAG;
use crate::types::{Instance, InstanceId, InstanceSpec, InstanceState, Tags};
use crate::volumes::VolumeSpec;
use crate::{CloudBackend, Error, ProviderName, Result};

/// CSI driver name whose volume handles this backend resolves.
pub const MEMORY_CSI_DRIVER: &str = "memory.csi.mcm.provider";

/// Whether `MCM_MEMORY_PROVIDER` asks for the in-memory backend.
pub fn enabled_from_env() -> bool {
    matches!(
        std::env::var("MCM_MEMORY_PROVIDER").as_deref(),
        Ok("1" | "true" | "yes")
    )
}

/// Tunables for simulated cloud behavior.
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Describe calls an instance spends starting before it runs.
    pub boot_polls: u32,
    /// Describe calls an instance spends stopping.
    pub stop_polls: u32,
    /// Describe calls an instance spends destroying before it is gone.
    pub destroy_polls: u32,
    /// Reject a create whose identity tag is already live.
    pub create_if_absent: bool,
    /// Delay before a create takes effect, widening the check-then-create window.
    pub create_latency: Duration,
    /// Hand out IDs that sort before earlier ones, like clouds with random IDs.
    pub descending_ids: bool,
    /// Tag lookups that miss a new instance before listings catch up.
    pub listing_lag: u32,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            boot_polls: 1,
            stop_polls: 1,
            destroy_polls: 1,
            create_if_absent: true,
            create_latency: Duration::ZERO,
            descending_ids: false,
            listing_lag: 0,
        }
    }
}

#[derive(Debug)]
struct Slot {
    instance: Instance,
    remaining_polls: u32,
    hidden_listings: u32,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    instances: BTreeMap<String, Slot>,
    volumes: HashMap<String, String>,
    faults: u32,
    creates: u32,
    hang_creates: bool,
    last_created_at: Option<DateTime<Utc>>,
}

impl Inner {
    fn take_fault(&mut self) -> Result<()> {
        if self.faults > 0 {
            self.faults -= 1;
            return Err(Error::Unavailable("injected transient fault".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    options: MemoryOptions,
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new(options: MemoryOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Fail the next `count` backend calls with a transient error.
    pub async fn inject_faults(&self, count: u32) {
        self.inner.lock().await.faults = count;
    }

    /// Keep new instances starting forever, as if provisioning stalled.
    /// Turning it off lets stalled instances finish booting.
    pub async fn hang_creates(&self, hang: bool) {
        let mut inner = self.inner.lock().await;
        inner.hang_creates = hang;
        if !hang {
            for slot in inner.instances.values_mut() {
                if slot.remaining_polls == u32::MAX {
                    slot.remaining_polls = 0;
                }
            }
        }
    }

    /// Register a volume and return its ID.
    pub async fn add_volume(&self, name: &str) -> String {
        let id = format!("vol-{}", uuid::Uuid::new_v4().simple());
        self.inner
            .lock()
            .await
            .volumes
            .insert(name.to_string(), id.clone());
        id
    }

    /// Instances that have not finished destroying.
    pub async fn instances(&self) -> Vec<Instance> {
        self.inner
            .lock()
            .await
            .instances
            .values()
            .map(|slot| slot.instance.clone())
            .collect()
    }

    /// Number of instances ever created.
    pub async fn creates(&self) -> u32 {
        self.inner.lock().await.creates
    }

    /// Remove an instance out of band, as if someone deleted it in the console.
    pub async fn evict(&self, id: &InstanceId) {
        self.inner.lock().await.instances.remove(&id.0);
    }

    fn transition(slot: &mut Slot, state: InstanceState, polls: u32) {
        slot.instance.state = state;
        slot.remaining_polls = polls;
    }
}

#[async_trait]
impl CloudBackend for MemoryBackend {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance> {
        self.inner.lock().await.take_fault()?;

        if !self.options.create_latency.is_zero() {
            tokio::time::sleep(self.options.create_latency).await;
        }

        let mut inner = self.inner.lock().await;

        if self.options.create_if_absent
            && let Some(identity) = spec.tags.get(IDENTITY_TAG)
            && inner.instances.values().any(|slot| {
                slot.instance.state != InstanceState::Destroying
                    && slot.instance.tags.get(IDENTITY_TAG) == Some(identity)
            })
        {
            return Err(Error::AlreadyExists(format!(
                "an instance with identity {identity} exists"
            )));
        }

        inner.next_id += 1;
        inner.creates += 1;
        let id = if self.options.descending_ids {
            format!("m-{:06}", 999_999 - inner.next_id)
        } else {
            format!("m-{:06}", inner.next_id)
        };

        // Strictly increasing, even when two creates share a clock tick.
        let now = Utc::now();
        let created_at = match inner.last_created_at {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };
        inner.last_created_at = Some(created_at);

        let instance = Instance {
            id: InstanceId(id.clone()),
            name: spec.name.clone(),
            state: InstanceState::Starting,
            tags: spec.tags.clone(),
            created_at: Some(created_at),
        };
        let remaining_polls = if inner.hang_creates {
            u32::MAX
        } else {
            self.options.boot_polls
        };
        inner.instances.insert(
            id.clone(),
            Slot {
                instance: instance.clone(),
                remaining_polls,
                hidden_listings: self.options.listing_lag,
            },
        );

        info!(instance_id = %id, name = %spec.name, "memory: instance created");
        Ok(instance)
    }

    async fn describe_instance(&self, id: &InstanceId) -> Result<Option<Instance>> {
        let mut inner = self.inner.lock().await;
        inner.take_fault()?;

        let Some(slot) = inner.instances.get_mut(&id.0) else {
            return Ok(None);
        };

        if slot.remaining_polls > 0 {
            if slot.remaining_polls != u32::MAX {
                slot.remaining_polls -= 1;
            }
            return Ok(Some(slot.instance.clone()));
        }

        match slot.instance.state {
            InstanceState::Starting => slot.instance.state = InstanceState::Running,
            InstanceState::Stopping => slot.instance.state = InstanceState::Stopped,
            InstanceState::Destroying => {
                inner.instances.remove(&id.0);
                return Ok(None);
            }
            _ => {}
        }
        Ok(Some(slot.instance.clone()))
    }

    async fn find_instances(&self, selector: &Tags) -> Result<Vec<Instance>> {
        let mut inner = self.inner.lock().await;
        inner.take_fault()?;

        let mut found = Vec::new();
        for slot in inner.instances.values_mut() {
            if !selector.iter().all(|(k, v)| slot.instance.tags.get(k) == Some(v)) {
                continue;
            }
            if slot.hidden_listings > 0 {
                slot.hidden_listings -= 1;
                continue;
            }
            found.push(slot.instance.clone());
        }
        Ok(found)
    }

    async fn stop_instance(&self, id: &InstanceId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.take_fault()?;

        let slot = inner
            .instances
            .get_mut(&id.0)
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;

        match slot.instance.state {
            InstanceState::Starting | InstanceState::Running | InstanceState::Unknown => {
                Self::transition(slot, InstanceState::Stopping, self.options.stop_polls);
            }
            InstanceState::Stopping | InstanceState::Stopped | InstanceState::Destroying => {}
        }
        Ok(())
    }

    async fn delete_instance(&self, id: &InstanceId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.take_fault()?;

        if let Some(slot) = inner.instances.get_mut(&id.0)
            && slot.instance.state != InstanceState::Destroying
        {
            Self::transition(slot, InstanceState::Destroying, self.options.destroy_polls);
            info!(instance_id = %id, "memory: instance destroying");
        }
        Ok(())
    }

    async fn resolve_volume(&self, volume: &VolumeSpec) -> Result<Option<String>> {
        let Some(handle) = volume.csi_handle(MEMORY_CSI_DRIVER) else {
            return Ok(None);
        };

        let mut inner = self.inner.lock().await;
        inner.take_fault()?;

        if inner.volumes.values().any(|id| id == handle) {
            return Ok(Some(handle.to_string()));
        }
        Ok(inner.volumes.get(handle).cloned())
    }

    fn name(&self) -> ProviderName {
        ProviderName::Memory
    }
}
