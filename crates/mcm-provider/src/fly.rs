use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::types::{Instance, InstanceId, InstanceSpec, InstanceState, Secrets, Tags};
use crate::volumes::VolumeSpec;
use crate::{CloudBackend, Error, ProviderName, Result, secret_str};

/// CSI driver name whose volume handles name Fly volumes.
pub const FLY_CSI_DRIVER: &str = "csi.fly.io";

const DEFAULT_APP: &str = "mcm-machines";
const DEFAULT_REGION: &str = "iad";

/// Fly.io Machines API backend.
///
/// Delegates to `fly_api::FlyClient` for all HTTP calls. Identity tags are
/// stored as machine metadata.
pub struct FlyProvider {
    client: fly_api::FlyClient,
    region: String,
}

impl FlyProvider {
    /// Create from env vars: `FLY_API_TOKEN` (required), `FLY_APP_NAME`, `FLY_REGION`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let token = std::env::var("FLY_API_TOKEN")
            .map_err(|_| Error::MissingEnv("FLY_API_TOKEN".into()))?;
        let app = std::env::var("FLY_APP_NAME").unwrap_or_else(|_| DEFAULT_APP.into());
        let region = std::env::var("FLY_REGION").unwrap_or_else(|_| DEFAULT_REGION.into());

        Ok(Self::new(token, app, region))
    }

    /// Create from request secrets: `flyApiToken`, optional `flyAppName` and `flyRegion`.
    ///
    /// Returns `None` when the secrets carry no token.
    pub fn from_secrets(secrets: &Secrets) -> Result<Option<Self>> {
        let Some(token) = secret_str(secrets, "flyApiToken")? else {
            return Ok(None);
        };
        let app = secret_str(secrets, "flyAppName")?.unwrap_or_else(|| DEFAULT_APP.into());
        let region = secret_str(secrets, "flyRegion")?.unwrap_or_else(|| DEFAULT_REGION.into());

        Ok(Some(Self::new(token, app, region)))
    }

    pub fn new(token: impl Into<String>, app: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            client: fly_api::FlyClient::new(token, app),
            region: region.into(),
        }
    }

    fn parse_state(state: &str) -> InstanceState {
        match state {
            "created" | "starting" => InstanceState::Starting,
            "started" => InstanceState::Running,
            "stopping" | "suspending" => InstanceState::Stopping,
            "stopped" | "suspended" => InstanceState::Stopped,
            "destroying" | "destroyed" => InstanceState::Destroying,
            _ => InstanceState::Unknown,
        }
    }

    /// Map CPU millicores to Fly performance preset.
    fn guest_config(cpu_millicores: i32, memory_mb: i32) -> fly_api::GuestConfig {
        let (cpus, cpu_kind) = match cpu_millicores {
            0..=1000 => (1, "shared"),
            1001..=2000 => (2, "shared"),
            2001..=4000 => (2, "performance"),
            _ => (4, "performance"),
        };
        fly_api::GuestConfig {
            cpus,
            cpu_kind: cpu_kind.into(),
            memory_mb: memory_mb as u32,
        }
    }

    fn instance(machine: fly_api::Machine) -> Instance {
        let created_at = machine
            .created_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc));

        Instance {
            state: Self::parse_state(&machine.state),
            tags: machine.metadata().into_iter().collect(),
            id: InstanceId(machine.id),
            name: machine.name,
            created_at,
        }
    }

    /// Fly reports a name clash as 409 or 422 with an "already exists" body.
    fn conflict(e: fly_api::Error) -> Error {
        match &e {
            fly_api::Error::Api { status, body, .. }
                if status.as_u16() == 409 || body.contains("already exists") =>
            {
                Error::AlreadyExists(body.clone())
            }
            _ => Error::Fly(e),
        }
    }
}

#[async_trait]
impl CloudBackend for FlyProvider {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance> {
        let machine = self
            .client
            .create_machine(&fly_api::CreateMachineRequest {
                name: spec.name.clone(),
                region: spec.location.clone().unwrap_or_else(|| self.region.clone()),
                config: fly_api::MachineConfig {
                    image: spec.image.clone().unwrap_or_else(|| "ubuntu:24.04".into()),
                    env: Some(spec.env.clone()),
                    guest: Self::guest_config(spec.cpu_millicores, spec.memory_mb),
                    metadata: Some(spec.tags.clone().into_iter().collect()),
                    auto_destroy: Some(false),
                },
            })
            .await
            .map_err(Self::conflict)?;

        info!(machine_id = %machine.id, state = %machine.state, "fly: machine created");
        Ok(Self::instance(machine))
    }

    async fn describe_instance(&self, id: &InstanceId) -> Result<Option<Instance>> {
        let machine = self.client.get_machine(&id.0).await?;
        Ok(machine
            .filter(|m| m.state != "destroyed")
            .map(Self::instance))
    }

    async fn find_instances(&self, selector: &Tags) -> Result<Vec<Instance>> {
        let filter: Vec<(&str, &str)> = selector
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let machines = self.client.list_machines(&filter).await?;
        Ok(machines
            .into_iter()
            .filter(|m| m.state != "destroyed")
            .map(Self::instance)
            .collect())
    }

    async fn stop_instance(&self, id: &InstanceId) -> Result<()> {
        match self.client.stop_machine(&id.0).await {
            Err(e) if e.status().map(|s| s.as_u16()) == Some(404) => {
                Err(Error::NotFound(format!("fly machine {id}")))
            }
            other => {
                other?;
                info!(machine_id = %id.0, "fly: machine stopping");
                Ok(())
            }
        }
    }

    async fn delete_instance(&self, id: &InstanceId) -> Result<()> {
        self.client.delete_machine(&id.0).await?;
        info!(machine_id = %id.0, "fly: machine destroyed");
        Ok(())
    }

    async fn resolve_volume(&self, volume: &VolumeSpec) -> Result<Option<String>> {
        let Some(handle) = volume.csi_handle(FLY_CSI_DRIVER) else {
            return Ok(None);
        };

        if handle.starts_with("vol_") {
            return Ok(self.client.get_volume(handle).await?.map(|v| v.id));
        }

        // Volume names are not unique on Fly; take the first one by name.
        let volumes = self.client.list_volumes().await?;
        Ok(volumes.into_iter().find(|v| v.name == handle).map(|v| v.id))
    }

    fn name(&self) -> ProviderName {
        ProviderName::Fly
    }
}
