//! Typed Rust client for the Fly.io Machines API.
//!
//! Covers the subset needed for managing cluster node VMs:
//! machines (create, get, list by metadata, stop, delete) and
//! volumes (list, get).

mod types;

pub use types::*;

const BASE_URL: &str = "https://api.machines.dev/v1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fly api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("fly api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
}

impl Error {
    /// HTTP status returned by the API, if the request got that far.
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            Self::Request(e) => e.status(),
            Self::Api { status, .. } => Some(*status),
        }
    }

    /// Whether retrying the same request may succeed.
    ///
    /// Connection failures, timeouts, rate limiting and 5xx responses are
    /// transient. Anything without a status is treated as transient too,
    /// since the request may never have reached Fly.
    pub fn is_transient(&self) -> bool {
        match self.status() {
            Some(status) => status.as_u16() == 429 || status.is_server_error(),
            None => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the Fly.io Machines REST API.
#[derive(Clone)]
pub struct FlyClient {
    token: String,
    app: String,
    http: reqwest::Client,
}

impl FlyClient {
    pub fn new(token: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            app: app.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    fn url(&self, path: &str) -> String {
        format!("{BASE_URL}/apps/{}{path}", self.app)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    /// Like `check` but also treats 404 as success (for delete idempotency).
    async fn check_allow_404(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    // ── Machines ─────────────────────────────────────────────────────

    pub async fn create_machine(&self, req: &CreateMachineRequest) -> Result<Machine> {
        let resp = self
            .http
            .post(self.url("/machines"))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        Self::check(resp, "create machine")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    /// Fetch a machine, returning `None` on 404.
    pub async fn get_machine(&self, machine_id: &str) -> Result<Option<Machine>> {
        let resp = self
            .http
            .get(self.url(&format!("/machines/{machine_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }

        Self::check(resp, "get machine")
            .await?
            .json()
            .await
            .map(Some)
            .map_err(Error::from)
    }

    /// List machines whose metadata contains every given key/value pair.
    ///
    /// Destroyed machines are excluded by the API.
    pub async fn list_machines(&self, metadata: &[(&str, &str)]) -> Result<Vec<Machine>> {
        let query: Vec<(String, String)> = metadata
            .iter()
            .map(|(k, v)| (format!("metadata.{k}"), v.to_string()))
            .collect();

        let resp = self
            .http
            .get(self.url("/machines"))
            .header("Authorization", self.auth())
            .query(&query)
            .send()
            .await?;

        Self::check(resp, "list machines")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn stop_machine(&self, machine_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/machines/{machine_id}/stop")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "stop machine").await?;
        Ok(())
    }

    /// Destroy a machine regardless of its state. 404 counts as done.
    pub async fn delete_machine(&self, machine_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/machines/{machine_id}")))
            .header("Authorization", self.auth())
            .query(&[("force", "true")])
            .send()
            .await?;

        Self::check_allow_404(resp, "delete machine").await?;
        Ok(())
    }

    // ── Volumes ──────────────────────────────────────────────────────

    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let resp = self
            .http
            .get(self.url("/volumes"))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "list volumes")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    /// Fetch a volume by ID, returning `None` on 404.
    pub async fn get_volume(&self, volume_id: &str) -> Result<Option<Volume>> {
        let resp = self
            .http
            .get(self.url(&format!("/volumes/{volume_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }

        Self::check(resp, "get volume")
            .await?
            .json()
            .await
            .map(Some)
            .map_err(Error::from)
    }
}
