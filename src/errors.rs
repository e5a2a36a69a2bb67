//! Typed error hierarchy for the sitesmith service.
//!
//! Two top-level enums cover the two subsystems:
//! - `PipelineError` — generation, extraction, and verification failures
//! - `DeployError` — hosting provider failures during publish/preview

use thiserror::Error;

/// Errors from the generation pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The model stream produced zero usable files. Fatal: nothing may be
    /// claimed complete.
    #[error("Generation produced no files")]
    NoFilesGenerated,

    #[error("Model request failed: {0}")]
    ModelRequest(String),

    #[error("Model stream ended with error: {0}")]
    ModelStream(String),

    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("No build configuration for project {project_id}")]
    MissingBuildConfig { project_id: i64 },

    #[error("Build {id} not found")]
    BuildNotFound { id: i64 },

    #[error("A build is already running for project {project_id}")]
    BuildInProgress { project_id: i64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the hosting provider during publish/preview.
#[derive(Debug, Error)]
pub enum DeployError {
    /// 401/403 from the provider. Surfaced as a generic message so the
    /// credential state never leaks to end users.
    #[error("Hosting provider is not configured correctly")]
    Misconfigured,

    #[error("Slug '{slug}' is already taken by another project")]
    SlugTaken { slug: String },

    #[error("Invalid slug '{slug}': must be a DNS label (lowercase letters, digits, hyphens)")]
    InvalidSlug { slug: String },

    #[error("No complete build to publish for project {project_id}")]
    NothingToPublish { project_id: i64 },

    #[error("Deployment {id} did not become ready within {seconds}s")]
    DeploymentTimeout { id: String, seconds: u64 },

    #[error("Deployment {id} entered state {state}")]
    DeploymentFailed { id: String, state: String },

    #[error("Provider API error ({status}): {message}")]
    Provider { status: u16, message: String },

    #[error("Provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeployError {
    /// Map a provider status code to the right error, hiding auth detail.
    pub fn from_status(status: u16, message: String) -> Self {
        if status == 401 || status == 403 {
            Self::Misconfigured
        } else {
            Self::Provider { status, message }
        }
    }
}
