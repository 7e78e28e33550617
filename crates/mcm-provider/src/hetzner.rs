use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hcloud::apis::configuration::Configuration;
use hcloud::apis::{servers_api, volumes_api};
use hcloud::models;
use tracing::{info, warn};

use crate::types::{Instance, InstanceId, InstanceSpec, InstanceState, Secrets, Tags};
use crate::volumes::VolumeSpec;
use crate::{CloudBackend, Error, ProviderName, Result, secret_str};

/// CSI driver name of the Hetzner Cloud CSI plugin. Its volume handles are
/// Hetzner volume IDs.
pub const HETZNER_CSI_DRIVER: &str = "csi.hetzner.cloud";

/// Hetzner Cloud backend using the `hcloud` crate.
///
/// Identity tags are stored as server labels. Server names are unique per
/// project, which makes creation create-if-absent by name.
pub struct HetznerProvider {
    config: Configuration,
    location: String,
    network_id: Option<i64>,
    firewall_id: Option<i64>,
    ssh_key_names: Vec<String>,
}

impl HetznerProvider {
    /// Create from env vars:
    ///
    /// - `HETZNER_API_TOKEN` (required)
    /// - `HETZNER_LOCATION` (default: `"fsn1"`)
    /// - `HETZNER_NETWORK_ID` (optional, integer)
    /// - `HETZNER_FIREWALL_ID` (optional, integer)
    /// - `HETZNER_SSH_KEY_NAMES` (comma-separated names, optional)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let token = std::env::var("HETZNER_API_TOKEN")
            .map_err(|_| Error::MissingEnv("HETZNER_API_TOKEN".into()))?;

        let mut provider = Self::new(token);

        if let Ok(location) = std::env::var("HETZNER_LOCATION") {
            provider.location = location;
        }

        provider.network_id = std::env::var("HETZNER_NETWORK_ID")
            .ok()
            .and_then(|s| s.parse::<i64>().ok());

        provider.firewall_id = std::env::var("HETZNER_FIREWALL_ID")
            .ok()
            .and_then(|s| s.parse::<i64>().ok());

        provider.ssh_key_names = std::env::var("HETZNER_SSH_KEY_NAMES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(provider)
    }

    /// Create from the request secret `hcloudToken`. `None` when absent.
    pub fn from_secrets(secrets: &Secrets) -> Result<Option<Self>> {
        Ok(secret_str(secrets, "hcloudToken")?.map(Self::new))
    }

    pub fn new(token: String) -> Self {
        let mut config = Configuration::new();
        config.bearer_access_token = Some(token);

        Self {
            config,
            location: "fsn1".into(),
            network_id: None,
            firewall_id: None,
            ssh_key_names: Vec::new(),
        }
    }

    fn parse_state(status: &models::server::Status) -> InstanceState {
        match status {
            models::server::Status::Running => InstanceState::Running,
            models::server::Status::Initializing | models::server::Status::Starting => {
                InstanceState::Starting
            }
            models::server::Status::Stopping => InstanceState::Stopping,
            models::server::Status::Off => InstanceState::Stopped,
            models::server::Status::Deleting => InstanceState::Destroying,
            _ => InstanceState::Unknown,
        }
    }

    /// Map CPU millicores to a Hetzner server type.
    fn server_type(cpu_millicores: i32, memory_mb: i32) -> &'static str {
        match (cpu_millicores, memory_mb) {
            (0..=1000, 0..=2048) => "cpx11",
            (0..=2000, 0..=4096) => "cpx21",
            (0..=4000, 0..=8192) => "cpx31",
            _ => "cpx41",
        }
    }

    /// Generate cloud-init user data exporting the machine's environment.
    fn cloud_init_user_data(spec: &InstanceSpec) -> String {
        let mut env_lines = String::new();
        for (k, v) in &spec.env {
            env_lines.push_str(&format!("      {k}={v}\n"));
        }

        format!(
            r#"#cloud-config
write_files:
  - path: /etc/mcm/environment
    permissions: "0600"
    content: |
{env_lines}"#
        )
    }

    /// Label selector matching every label in `tags`.
    fn label_selector(tags: &Tags) -> String {
        tags.iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn instance(server: &models::Server) -> Instance {
        Instance {
            id: InstanceId(server.id.to_string()),
            name: server.name.clone(),
            state: Self::parse_state(&server.status),
            tags: server
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            created_at: DateTime::parse_from_rfc3339(&server.created)
                .ok()
                .map(|at| at.with_timezone(&Utc)),
        }
    }

    fn parse_id(raw: &str) -> Result<i64> {
        raw.parse::<i64>()
            .map_err(|_| Error::InvalidId(raw.to_string()))
    }

    /// HTTP status of a failed API call, if the API answered at all.
    fn status<T>(e: &hcloud::apis::Error<T>) -> Option<u16> {
        match e {
            hcloud::apis::Error::ResponseError(content) => Some(content.status.as_u16()),
            _ => None,
        }
    }

    /// Classify an API failure. Anything that is not a definitive answer
    /// from the API is transient.
    fn api_error<T: std::fmt::Debug>(op: &str, e: hcloud::apis::Error<T>) -> Error {
        let msg = format!("{op}: {e}");
        match Self::status(&e) {
            Some(404) => Error::NotFound(msg),
            Some(409) => Error::AlreadyExists(msg),
            Some(400 | 401 | 403 | 422) => Error::InvalidArgument(msg),
            Some(429 | 500..=599) | None => Error::Unavailable(msg),
            Some(_) => Error::HetznerApi(msg),
        }
    }
}

#[async_trait]
impl CloudBackend for HetznerProvider {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance> {
        let server_type = Self::server_type(spec.cpu_millicores, spec.memory_mb);
        let user_data = Self::cloud_init_user_data(spec);

        let firewalls = self.firewall_id.map(|fw_id| {
            vec![models::CreateServerRequestFirewalls {
                firewall: fw_id,
            }]
        });

        let ssh_keys = if self.ssh_key_names.is_empty() {
            None
        } else {
            Some(self.ssh_key_names.clone())
        };

        let resp = servers_api::create_server(
            &self.config,
            servers_api::CreateServerParams {
                create_server_request: models::CreateServerRequest {
                    name: spec.name.clone(),
                    server_type: server_type.into(),
                    image: spec.image.clone(),
                    location: Some(spec.location.clone().unwrap_or_else(|| self.location.clone())),
                    user_data: Some(user_data),
                    networks: self.network_id.map(|id| vec![id]),
                    firewalls,
                    ssh_keys,
                    volumes: None,
                    start_after_create: Some(true),
                    automount: None,
                    datacenter: None,
                    labels: Some(spec.tags.clone().into_iter().collect()),
                    placement_group: None,
                    public_net: None,
                },
            },
        )
        .await
        .map_err(|e| match Self::status(&e) {
            // Name taken: uniqueness_error.
            Some(409) => Error::AlreadyExists(format!("server name {} is taken", spec.name)),
            _ => Self::api_error("create server", e),
        })?;

        let server = resp.server;
        info!(server_id = server.id, "hetzner: server created");
        Ok(Self::instance(&server))
    }

    async fn describe_instance(&self, id: &InstanceId) -> Result<Option<Instance>> {
        let server_id = Self::parse_id(&id.0)?;

        let resp = match servers_api::get_server(
            &self.config,
            servers_api::GetServerParams { id: server_id },
        )
        .await
        {
            Ok(resp) => resp,
            Err(e) if Self::status(&e) == Some(404) => return Ok(None),
            Err(e) => return Err(Self::api_error("get server", e)),
        };

        Ok(resp.server.map(|server| Self::instance(&server)))
    }

    async fn find_instances(&self, selector: &Tags) -> Result<Vec<Instance>> {
        let label_selector = Self::label_selector(selector);
        let mut instances = Vec::new();
        let mut page = 1;

        loop {
            let resp = servers_api::list_servers(
                &self.config,
                servers_api::ListServersParams {
                    label_selector: Some(label_selector.clone()),
                    page: Some(page),
                    per_page: Some(50),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::api_error("list servers", e))?;

            let count = resp.servers.len();
            instances.extend(resp.servers.iter().map(Self::instance));
            if count < 50 {
                break;
            }
            page += 1;
        }

        Ok(instances)
    }

    async fn stop_instance(&self, id: &InstanceId) -> Result<()> {
        let server_id = Self::parse_id(&id.0)?;

        servers_api::power_off_server(
            &self.config,
            servers_api::PowerOffServerParams { id: server_id },
        )
        .await
        .map_err(|e| Self::api_error("power off server", e))?;

        info!(server_id = %id.0, "hetzner: server powering off");
        Ok(())
    }

    async fn delete_instance(&self, id: &InstanceId) -> Result<()> {
        let server_id = Self::parse_id(&id.0)?;

        if let Err(e) = servers_api::delete_server(
            &self.config,
            servers_api::DeleteServerParams { id: server_id },
        )
        .await
        {
            if Self::status(&e) == Some(404) {
                warn!(server_id = %id.0, "hetzner: server already destroyed");
                return Ok(());
            }
            return Err(Self::api_error("delete server", e));
        }

        info!(server_id = %id.0, "hetzner: server destroyed");
        Ok(())
    }

    async fn resolve_volume(&self, volume: &VolumeSpec) -> Result<Option<String>> {
        let Some(handle) = volume.csi_handle(HETZNER_CSI_DRIVER) else {
            return Ok(None);
        };
        let Ok(volume_id) = handle.parse::<i64>() else {
            return Ok(None);
        };

        match volumes_api::get_volume(&self.config, volumes_api::GetVolumeParams { id: volume_id }).await {
            Ok(resp) => Ok(Some(resp.volume.id.to_string())),
            Err(e) if Self::status(&e) == Some(404) => Ok(None),
            Err(e) => Err(Self::api_error("get volume", e)),
        }
    }

    fn name(&self) -> ProviderName {
        ProviderName::Hetzner
    }
}
