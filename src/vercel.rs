//! Client for the hosting provider's deployment API.
//!
//! The protocol is content-addressed: every file is hashed, uploads that
//! conflict mean "already present", and deployments are created from the
//! digest manifest. Readiness is polled at a fixed interval under a hard
//! ceiling. Auth failures are collapsed into a generic misconfiguration
//! error so credential state never reaches end users.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::ServiceConfig;
use crate::errors::DeployError;
use crate::models::GeneratedFile;

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const POLL_CEILING: Duration = Duration::from_secs(120);

/// A file the provider already knows by digest.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployedFile {
    pub file: String,
    pub sha: String,
    pub size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderProject {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub url: String,
    #[serde(rename = "readyState")]
    pub ready_state: String,
}

#[derive(Debug, PartialEq)]
enum PollState {
    Ready,
    Failed,
    Pending,
}

pub struct VercelClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
    team_id: Option<String>,
}

impl VercelClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, DeployError> {
        let token = config
            .vercel_token
            .clone()
            .ok_or(DeployError::Misconfigured)?;
        Ok(Self {
            http: reqwest::Client::new(),
            api_url: config.vercel_api_url.clone(),
            token,
            team_id: config.vercel_team_id.clone(),
        })
    }

    /// Hex sha256 of a file's content — the provider's content address.
    pub fn digest(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn url(&self, path: &str) -> String {
        match &self.team_id {
            Some(team) => format!("{}{}?teamId={}", self.api_url, path, team),
            None => format!("{}{}", self.api_url, path),
        }
    }

    async fn expect_success(resp: reqwest::Response) -> Result<reqwest::Response, DeployError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(DeployError::from_status(status.as_u16(), message))
    }

    /// Create a hosting project with the given name, returning its id.
    pub async fn create_project(&self, name: &str) -> Result<ProviderProject, DeployError> {
        let resp = self
            .http
            .post(self.url("/v10/projects"))
            .bearer_auth(&self.token)
            .json(&json!({ "name": name }))
            .send()
            .await?;
        let resp = Self::expect_success(resp).await?;
        Ok(resp.json::<ProviderProject>().await?)
    }

    /// Upload the file set content-addressed. A conflict response means
    /// the blob is already present and counts as success.
    pub async fn upload_files(
        &self,
        files: &[GeneratedFile],
    ) -> Result<Vec<DeployedFile>, DeployError> {
        let mut uploaded = Vec::with_capacity(files.len());
        for file in files {
            let sha = Self::digest(&file.content);
            let resp = self
                .http
                .post(self.url("/v2/files"))
                .bearer_auth(&self.token)
                .header("x-content-digest", &sha)
                .header("Content-Type", "application/octet-stream")
                .body(file.content.clone())
                .send()
                .await?;
            let status = resp.status();
            if status == reqwest::StatusCode::CONFLICT {
                debug!("file {} already uploaded ({})", file.path, sha);
            } else {
                Self::expect_success(resp).await?;
            }
            uploaded.push(DeployedFile {
                file: file.path.clone(),
                sha,
                size: file.content.len(),
            });
        }
        Ok(uploaded)
    }

    /// Create a deployment for a project from an uploaded digest manifest.
    pub async fn create_deployment(
        &self,
        project_name: &str,
        files: &[DeployedFile],
    ) -> Result<Deployment, DeployError> {
        let manifest: Vec<_> = files
            .iter()
            .map(|f| json!({ "file": f.file, "sha": f.sha, "size": f.size }))
            .collect();
        let resp = self
            .http
            .post(self.url("/v13/deployments"))
            .bearer_auth(&self.token)
            .json(&json!({
                "name": project_name,
                "files": manifest,
                "target": "production",
            }))
            .send()
            .await?;
        let resp = Self::expect_success(resp).await?;
        Ok(resp.json::<Deployment>().await?)
    }

    /// Poll a deployment until ready. Fixed interval, hard ceiling, no
    /// backoff; retrying beyond that is the caller re-invoking publish.
    pub async fn wait_until_ready(&self, deployment_id: &str) -> Result<Deployment, DeployError> {
        let attempts = (POLL_CEILING.as_secs() / POLL_INTERVAL.as_secs()).max(1);
        for _ in 0..attempts {
            let resp = self
                .http
                .get(self.url(&format!("/v13/deployments/{}", deployment_id)))
                .bearer_auth(&self.token)
                .send()
                .await?;
            let resp = Self::expect_success(resp).await?;
            let deployment: Deployment = resp.json().await?;
            match classify_ready_state(&deployment.ready_state) {
                PollState::Ready => return Ok(deployment),
                PollState::Failed => {
                    return Err(DeployError::DeploymentFailed {
                        id: deployment.id,
                        state: deployment.ready_state,
                    })
                }
                PollState::Pending => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
        Err(DeployError::DeploymentTimeout {
            id: deployment_id.to_string(),
            seconds: POLL_CEILING.as_secs(),
        })
    }

    /// Assign a domain to a project. A conflict means the domain is
    /// already assigned, which is not an error.
    pub async fn add_domain(&self, project_id: &str, domain: &str) -> Result<(), DeployError> {
        let resp = self
            .http
            .post(self.url(&format!("/v10/projects/{}/domains", project_id)))
            .bearer_auth(&self.token)
            .json(&json!({ "name": domain }))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            debug!("domain {} already assigned to {}", domain, project_id);
            return Ok(());
        }
        Self::expect_success(resp).await?;
        Ok(())
    }

    /// Detach a domain from a project. Missing assignment is fine.
    pub async fn remove_domain(&self, project_id: &str, domain: &str) -> Result<(), DeployError> {
        let resp = self
            .http
            .delete(self.url(&format!("/v10/projects/{}/domains/{}", project_id, domain)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::expect_success(resp).await?;
        Ok(())
    }

    /// Best-effort liveness check for an existing preview URL.
    pub async fn is_reachable(&self, url: &str) -> bool {
        match self
            .http
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(resp) => resp.status().as_u16() < 500,
            Err(_) => false,
        }
    }
}

fn classify_ready_state(state: &str) -> PollState {
    match state {
        "READY" => PollState::Ready,
        "ERROR" | "CANCELED" => PollState::Failed,
        _ => PollState::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic() {
        let a = VercelClient::digest("<html></html>");
        let b = VercelClient::digest("<html></html>");
        let c = VercelClient::digest("<html>x</html>");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64); // hex sha256
    }

    #[test]
    fn test_classify_ready_state() {
        assert_eq!(classify_ready_state("READY"), PollState::Ready);
        assert_eq!(classify_ready_state("ERROR"), PollState::Failed);
        assert_eq!(classify_ready_state("CANCELED"), PollState::Failed);
        assert_eq!(classify_ready_state("BUILDING"), PollState::Pending);
        assert_eq!(classify_ready_state("QUEUED"), PollState::Pending);
    }

    #[test]
    fn test_client_requires_token() {
        let config = ServiceConfig {
            vercel_token: None,
            ..ServiceConfig::default()
        };
        assert!(matches!(
            VercelClient::new(&config),
            Err(DeployError::Misconfigured)
        ));
    }

    #[test]
    fn test_team_scoped_urls() {
        let config = ServiceConfig {
            vercel_token: Some("tok".into()),
            vercel_team_id: Some("team_1".into()),
            ..ServiceConfig::default()
        };
        let client = VercelClient::new(&config).unwrap();
        assert_eq!(
            client.url("/v2/files"),
            "https://api.vercel.com/v2/files?teamId=team_1"
        );

        let config = ServiceConfig {
            vercel_token: Some("tok".into()),
            ..ServiceConfig::default()
        };
        let client = VercelClient::new(&config).unwrap();
        assert_eq!(client.url("/v2/files"), "https://api.vercel.com/v2/files");
    }
}
