use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration for the sitesmith service.
///
/// Loaded from `sitesmith.toml` if present, then overridden by environment
/// variables. Secrets (model API key, provider token) are env-only.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Anthropic-compatible model API key. Required for builds.
    pub model_api_key: Option<String>,
    pub model_api_url: String,
    pub model: String,
    pub model_max_tokens: u32,

    /// Hosting provider token. Required for publish/preview.
    pub vercel_token: Option<String>,
    pub vercel_api_url: String,
    pub vercel_team_id: Option<String>,

    /// Apex under which published slugs live, e.g. `sites.example.app`.
    pub publish_domain: String,
    /// Public base URL of this service, queried by the preview banner.
    pub service_url: String,
    /// URL of the authoring tool, linked from the preview banner.
    pub studio_url: String,

    /// Whole-invocation wall-clock budget for one build.
    pub build_budget: Duration,
    /// Trailing margin reserved so partial results can always be persisted.
    pub deadline_margin: Duration,
    pub install_timeout: Duration,
    pub compile_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_api_key: None,
            model_api_url: "https://api.anthropic.com/v1/messages".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            model_max_tokens: 64_000,
            vercel_token: None,
            vercel_api_url: "https://api.vercel.com".to_string(),
            vercel_team_id: None,
            publish_domain: "sites.localhost".to_string(),
            service_url: "http://localhost:8080".to_string(),
            studio_url: "http://localhost:3000".to_string(),
            build_budget: Duration::from_secs(300),
            deadline_margin: Duration::from_secs(30),
            install_timeout: Duration::from_secs(180),
            compile_timeout: Duration::from_secs(300),
        }
    }
}

/// Raw TOML structure for `sitesmith.toml`.
#[derive(Debug, Deserialize)]
struct ConfigToml {
    service: Option<ServiceSection>,
}

#[derive(Debug, Deserialize)]
struct ServiceSection {
    model: Option<String>,
    model_api_url: Option<String>,
    model_max_tokens: Option<u32>,
    vercel_api_url: Option<String>,
    publish_domain: Option<String>,
    service_url: Option<String>,
    studio_url: Option<String>,
    build_budget_secs: Option<u64>,
    deadline_margin_secs: Option<u64>,
    install_timeout_secs: Option<u64>,
    compile_timeout_secs: Option<u64>,
}

impl ServiceConfig {
    /// Load config from `sitesmith.toml` in the given directory, then apply
    /// environment overrides. Missing file means defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut config = Self::default();

        let config_path = dir.join("sitesmith.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let toml: ConfigToml = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            if let Some(section) = toml.service {
                if let Some(model) = section.model {
                    config.model = model;
                }
                if let Some(url) = section.model_api_url {
                    config.model_api_url = url;
                }
                if let Some(max) = section.model_max_tokens {
                    config.model_max_tokens = max;
                }
                if let Some(url) = section.vercel_api_url {
                    config.vercel_api_url = url;
                }
                if let Some(domain) = section.publish_domain {
                    config.publish_domain = domain;
                }
                if let Some(url) = section.service_url {
                    config.service_url = url;
                }
                if let Some(url) = section.studio_url {
                    config.studio_url = url;
                }
                if let Some(secs) = section.build_budget_secs {
                    config.build_budget = Duration::from_secs(secs);
                }
                if let Some(secs) = section.deadline_margin_secs {
                    config.deadline_margin = Duration::from_secs(secs);
                }
                if let Some(secs) = section.install_timeout_secs {
                    config.install_timeout = Duration::from_secs(secs);
                }
                if let Some(secs) = section.compile_timeout_secs {
                    config.compile_timeout = Duration::from_secs(secs);
                }
            }
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            self.model_api_key = Some(key);
        }
        if let Ok(model) = std::env::var("SITESMITH_MODEL") {
            self.model = model;
        }
        if let Ok(token) = std::env::var("VERCEL_TOKEN") {
            self.vercel_token = Some(token);
        }
        if let Ok(team) = std::env::var("VERCEL_TEAM_ID") {
            self.vercel_team_id = Some(team);
        }
        if let Ok(domain) = std::env::var("SITESMITH_PUBLISH_DOMAIN") {
            self.publish_domain = domain;
        }
        if let Ok(url) = std::env::var("SITESMITH_SERVICE_URL") {
            self.service_url = url;
        }
        if let Ok(url) = std::env::var("SITESMITH_STUDIO_URL") {
            self.studio_url = url;
        }
    }
}
