pub mod engine;
pub mod fly;
pub mod hetzner;
pub mod identity;
pub mod memory;
pub mod state;
pub mod types;
pub mod volumes;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use types::{Instance, InstanceId, InstanceSpec, Secrets, Tags};
use volumes::VolumeSpec;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("corrupt last known state: {0}")]
    CorruptState(String),

    #[error("fly provider error: {0}")]
    Fly(#[from] fly_api::Error),

    #[error("hetzner api error: {0}")]
    HetznerApi(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// An error raised after progress was made, together with the state blob
    /// the caller should hand back on its next attempt.
    #[error("{source}")]
    WithState {
        #[source]
        source: Box<Error>,
        state: Vec<u8>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Status codes surfaced to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    Unimplemented,
    NotFound,
    InvalidArgument,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unimplemented => "Unimplemented",
            Self::NotFound => "NotFound",
            Self::InvalidArgument => "InvalidArgument",
            Self::Unavailable => "Unavailable",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::Internal => "Internal",
        }
    }

    /// Whether the orchestrator may blindly retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable | Self::DeadlineExceeded)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error into the code returned to the orchestrator.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) | Self::InvalidId(_) | Self::UnknownProvider(_) => {
                Code::InvalidArgument
            }
            Self::NotFound(_) => Code::NotFound,
            // A conflict that escapes the engine means the name is held by a
            // resource we could not adopt; the holder may still go away.
            Self::AlreadyExists(_) | Self::Unavailable(_) => Code::Unavailable,
            Self::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::Fly(e) => match e.status().map(|s| s.as_u16()) {
                _ if e.is_transient() => Code::Unavailable,
                Some(404) => Code::NotFound,
                Some(400 | 401 | 403 | 422) => Code::InvalidArgument,
                _ => Code::Internal,
            },
            Self::CorruptState(_)
            | Self::HetznerApi(_)
            | Self::MissingEnv(_)
            | Self::Internal(_) => Code::Internal,
            Self::WithState { source, .. } => source.code(),
        }
    }

    /// The state blob attached to this error, if any.
    pub fn last_known_state(&self) -> Option<&[u8]> {
        match self {
            Self::WithState { state, .. } => Some(state),
            _ => None,
        }
    }

    /// Attach a state blob, replacing any blob already attached.
    pub fn with_state(self, state: Vec<u8>) -> Self {
        let source = match self {
            Self::WithState { source, .. } => source,
            other => Box::new(other),
        };
        Self::WithState { source, state }
    }
}

/// Known cloud backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Fly,
    Hetzner,
    Memory,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fly => "fly",
            Self::Hetzner => "hetzner",
            Self::Memory => "memory",
        }
    }

    /// URI scheme used in provider IDs, matching what the node's cloud
    /// controller writes into `spec.providerID`.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Fly => "fly",
            Self::Hetzner => "hcloud",
            Self::Memory => "memory",
        }
    }

    pub fn from_scheme(scheme: &str) -> Result<Self> {
        match scheme {
            "fly" => Ok(Self::Fly),
            "hcloud" => Ok(Self::Hetzner),
            "memory" => Ok(Self::Memory),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fly" => Ok(Self::Fly),
            "hetzner" => Ok(Self::Hetzner),
            "memory" => Ok(Self::Memory),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Backend-agnostic capability interface over a cloud's machine API.
///
/// The lifecycle engine owns idempotency and retry safety; a backend only
/// translates these primitives to its API. Every method must report a
/// definitive absence as `Ok(None)` / `Error::NotFound` and anything it
/// cannot classify as an error, never as absence.
#[async_trait]
pub trait CloudBackend: Send + Sync + 'static {
    /// Create and start an instance carrying `spec.tags`.
    ///
    /// Backends with a create-if-absent primitive return
    /// `Error::AlreadyExists` when the instance is already there.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance>;

    /// Current state of an instance, `None` once it is gone.
    async fn describe_instance(&self, id: &InstanceId) -> Result<Option<Instance>>;

    /// All live instances carrying every tag in `selector`.
    async fn find_instances(&self, selector: &Tags) -> Result<Vec<Instance>>;

    /// Power off a running instance.
    async fn stop_instance(&self, _id: &InstanceId) -> Result<()> {
        Err(Error::Unimplemented(format!("{} cannot stop machines", self.name())))
    }

    /// Destroy an instance permanently. Deleting a missing instance succeeds.
    async fn delete_instance(&self, id: &InstanceId) -> Result<()>;

    /// Translate a persistent volume spec to this backend's volume ID.
    ///
    /// `Ok(None)` means the spec does not describe a volume of this backend.
    async fn resolve_volume(&self, _volume: &VolumeSpec) -> Result<Option<String>> {
        Ok(None)
    }

    /// Provider identifier.
    fn name(&self) -> ProviderName;
}

/// Registry of all configured cloud backends.
///
/// Each backend is constructed from environment variables at startup.
/// Backends whose required env vars are missing are silently skipped.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderName, Arc<dyn CloudBackend>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` under its own name, replacing any previous entry.
    pub fn with(mut self, backend: Arc<dyn CloudBackend>) -> Self {
        self.providers.insert(backend.name(), backend);
        self
    }

    /// Look up a backend by name.
    pub fn get(&self, name: ProviderName) -> Option<&Arc<dyn CloudBackend>> {
        self.providers.get(&name)
    }

    /// List the names of all available backends, in a stable order.
    pub fn available(&self) -> Vec<ProviderName> {
        let mut names: Vec<_> = self.providers.keys().copied().collect();
        names.sort();
        names
    }

    /// All configured backends, in the same order as `available()`.
    pub fn backends(&self) -> Vec<Arc<dyn CloudBackend>> {
        self.available()
            .into_iter()
            .filter_map(|name| self.providers.get(&name).cloned())
            .collect()
    }

    /// Returns `true` if no backend is configured.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// The backend serving a request for `name`.
    ///
    /// Credentials in the request secrets take precedence and produce a
    /// backend bound to them; otherwise the environment-configured backend
    /// is used.
    pub fn backend_for(&self, name: ProviderName, secrets: &Secrets) -> Result<Arc<dyn CloudBackend>> {
        let from_secrets: Option<Arc<dyn CloudBackend>> = match name {
            ProviderName::Fly => fly::FlyProvider::from_secrets(secrets)?
                .map(|p| Arc::new(p) as Arc<dyn CloudBackend>),
            ProviderName::Hetzner => hetzner::HetznerProvider::from_secrets(secrets)?
                .map(|p| Arc::new(p) as Arc<dyn CloudBackend>),
            ProviderName::Memory => None,
        };

        if let Some(backend) = from_secrets {
            return Ok(backend);
        }

        self.get(name).cloned().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "provider {name} is not configured and the request carries no credentials for it"
            ))
        })
    }
}

/// Read a secret as UTF-8, trimming surrounding whitespace.
///
/// Missing or blank secrets yield `None`; non-UTF-8 bytes are a caller error.
pub fn secret_str(secrets: &Secrets, key: &str) -> Result<Option<String>> {
    match secrets.get(key) {
        None => Ok(None),
        Some(raw) => {
            let value = std::str::from_utf8(raw)
                .map_err(|_| Error::InvalidArgument(format!("secret {key} is not valid UTF-8")))?
                .trim();
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
    }
}

/// Build all backends whose required env vars are present.
///
/// Backends with missing configuration are skipped with a debug log.
/// Returns an error only if no backend could be constructed at all.
pub fn build_providers() -> Result<ProviderRegistry> {
    dotenvy::dotenv().ok();

    let mut registry = ProviderRegistry::new();

    match fly::FlyProvider::from_env() {
        Ok(p) => {
            tracing::info!("registered Fly.io machine backend");
            registry = registry.with(Arc::new(p));
        }
        Err(e) => tracing::debug!("skipping Fly.io backend: {e}"),
    }

    match hetzner::HetznerProvider::from_env() {
        Ok(p) => {
            tracing::info!("registered Hetzner Cloud machine backend");
            registry = registry.with(Arc::new(p));
        }
        Err(e) => tracing::debug!("skipping Hetzner backend: {e}"),
    }

    if memory::enabled_from_env() {
        tracing::warn!("registered in-memory machine backend; machines are not real");
        registry = registry.with(Arc::new(memory::MemoryBackend::default()));
    }

    if registry.is_empty() {
        return Err(Error::MissingEnv(
            "no machine backends configured (set FLY_API_TOKEN, HETZNER_API_TOKEN, and/or MCM_MEMORY_PROVIDER)".into(),
        ));
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_state_wraps_once() {
        let err = Error::DeadlineExceeded("create".into())
            .with_state(b"first".to_vec())
            .with_state(b"second".to_vec());

        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert_eq!(err.last_known_state(), Some(&b"second"[..]));
        assert!(matches!(
            err,
            Error::WithState { ref source, .. } if matches!(**source, Error::DeadlineExceeded(_))
        ));
    }

    #[test]
    fn conflicts_surface_as_retryable() {
        let code = Error::AlreadyExists("node-a".into()).code();
        assert_eq!(code, Code::Unavailable);
        assert!(code.is_retryable());
        assert!(!Code::Internal.is_retryable());
    }

    #[test]
    fn provider_scheme_round_trips() {
        for name in [ProviderName::Fly, ProviderName::Hetzner, ProviderName::Memory] {
            assert_eq!(ProviderName::from_scheme(name.scheme()).unwrap(), name);
        }
        assert!(matches!(
            "gce".parse::<ProviderName>(),
            Err(Error::UnknownProvider(_))
        ));
    }

    #[test]
    fn secrets_must_be_utf8() {
        let mut secrets = Secrets::new();
        secrets.insert("token".into(), vec![0xff, 0xfe]);
        secrets.insert("blank".into(), b"  \n".to_vec());
        secrets.insert("ok".into(), b" abc \n".to_vec());

        assert!(matches!(
            secret_str(&secrets, "token"),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(secret_str(&secrets, "blank").unwrap(), None);
        assert_eq!(secret_str(&secrets, "ok").unwrap().as_deref(), Some("abc"));
        assert_eq!(secret_str(&secrets, "missing").unwrap(), None);
    }

    #[test]
    fn registry_without_backend_or_credentials_rejects() {
        let registry = ProviderRegistry::new();
        let err = registry
            .backend_for(ProviderName::Memory, &Secrets::new())
            .err()
            .unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    struct Ephemeral;

    #[async_trait]
    impl CloudBackend for Ephemeral {
        async fn create_instance(&self, _spec: &InstanceSpec) -> Result<Instance> {
            Err(Error::Internal("not used".into()))
        }
        async fn describe_instance(&self, _id: &InstanceId) -> Result<Option<Instance>> {
            Ok(None)
        }
        async fn find_instances(&self, _selector: &Tags) -> Result<Vec<Instance>> {
            Ok(Vec::new())
        }
        async fn delete_instance(&self, _id: &InstanceId) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> ProviderName {
            ProviderName::Memory
        }
    }

    #[tokio::test]
    async fn optional_capabilities_default_sensibly() {
        let backend = Ephemeral;
        let err = backend.stop_instance(&InstanceId("m-1".into())).await.unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
        assert!(backend.resolve_volume(&VolumeSpec::default()).await.unwrap().is_none());
    }

    #[test]
    fn registry_lists_backends_in_stable_order() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(memory::MemoryBackend::default()))
            .with(Arc::new(memory::MemoryBackend::default()));
        assert_eq!(registry.available(), vec![ProviderName::Memory]);
        assert_eq!(registry.backends().len(), 1);
    }
}
