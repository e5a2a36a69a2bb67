use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

/// Target framework for a generated project.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    Nextjs,
    Vite,
    Static,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nextjs => "nextjs",
            Self::Vite => "vite",
            Self::Static => "static",
        }
    }

    /// Install command for this framework, or None when nothing needs installing.
    pub fn install_command(&self) -> Option<(&'static str, &'static [&'static str])> {
        match self {
            Self::Nextjs | Self::Vite => Some(("npm", &["install", "--no-audit", "--no-fund"])),
            Self::Static => None,
        }
    }

    /// Build command for this framework, or None when there is no build step.
    pub fn build_command(&self) -> Option<(&'static str, &'static [&'static str])> {
        match self {
            Self::Nextjs | Self::Vite => Some(("npm", &["run", "build"])),
            Self::Static => None,
        }
    }
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nextjs" => Ok(Self::Nextjs),
            "vite" => Ok(Self::Vite),
            "static" => Ok(Self::Static),
            _ => Err(format!("Invalid framework: {}", s)),
        }
    }
}

/// Per-project build configuration. One row per project, upserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub id: i64,
    pub project_id: i64,
    pub framework: Framework,
    pub styling: String,
    pub typescript: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Generating,
    Complete,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generating => "generating",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generating" => Ok(Self::Generating),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid build status: {}", s)),
        }
    }
}

/// A terminal status may never revert to `generating` for the same build.
pub fn is_valid_build_transition(from: &BuildStatus, to: &BuildStatus) -> bool {
    matches!(
        (from, to),
        (BuildStatus::Generating, BuildStatus::Complete)
            | (BuildStatus::Generating, BuildStatus::Failed)
    )
}

/// One generated source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

impl GeneratedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// One generation pipeline run: the produced source tree plus its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOutput {
    pub id: i64,
    pub project_id: i64,
    pub build_config_id: i64,
    pub status: BuildStatus,
    pub files: Vec<GeneratedFile>,
    pub error: Option<String>,
    pub preview_url: Option<String>,
    pub preview_token: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Ready,
    Deleted,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "deleted" => Ok(Self::Deleted),
            _ => Err(format!("Invalid site status: {}", s)),
        }
    }
}

/// The published deployment of a project under its stable slug subdomain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedSite {
    pub id: i64,
    pub project_id: i64,
    pub slug: String,
    pub vercel_project_id: String,
    pub deployment_id: String,
    pub url: String,
    pub build_output_id: i64,
    pub status: SiteStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// The generation brief assembled by the authoring tool: everything the
/// model needs to emit a complete project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub pages: Vec<PageSpec>,
    #[serde(default)]
    pub flows: Vec<String>,
    #[serde(default)]
    pub design_notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSpec {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub description: String,
}
