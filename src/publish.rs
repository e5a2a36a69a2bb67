//! Publishing a verified build to its stable slug-based address.
//!
//! `publish` is idempotent per latest-complete-build: re-invoking without
//! a new build reuses the slug, the hosting project, and the deployment.
//! Unpublish is a soft delete — the domain is detached and the row marked
//! deleted, but the hosting project is kept so a republish is cheap.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::db::DbHandle;
use crate::errors::DeployError;
use crate::models::{BuildOutput, Project, PublishedSite, SiteStatus};
use crate::vercel::VercelClient;

/// DNS-label shape for publish subdomains.
static SLUG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9](?:[a-z0-9-]{1,46}[a-z0-9])?$").expect("slug regex is valid")
});

pub fn is_valid_slug(slug: &str) -> bool {
    SLUG_RE.is_match(slug)
}

/// Convert a project name to a URL-safe slug, limited to `max_len` chars.
pub fn slugify(name: &str, max_len: usize) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Deterministic candidate sequence for a base slug: the base itself, then
/// the base with successively longer hash suffixes of the project id.
/// Distinct projects requesting the same base diverge at the first suffix.
pub fn slug_candidates(base: &str, project_id: i64) -> Vec<String> {
    let mut hasher = Sha256::new();
    hasher.update(project_id.to_string().as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let mut candidates = vec![base.to_string()];
    for len in [4, 8, 12, 16] {
        // Keep the whole candidate inside the 48-char DNS label budget.
        let room = 48 - len - 1;
        let trimmed = if base.len() > room {
            base[..room].trim_end_matches('-')
        } else {
            base
        };
        candidates.push(format!("{}-{}", trimmed, &hash[..len]));
    }
    candidates
}

/// Staleness is derived at read time, never stored.
pub fn is_stale(site: &PublishedSite, latest_complete_build: Option<i64>) -> bool {
    matches!(latest_complete_build, Some(id) if id != site.build_output_id)
}

/// A site row together with its derived staleness.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SiteState {
    pub site: PublishedSite,
    pub stale: bool,
}

pub struct PublishManager {
    db: DbHandle,
    vercel: Arc<VercelClient>,
    publish_domain: String,
}

impl PublishManager {
    pub fn new(db: DbHandle, vercel: Arc<VercelClient>, publish_domain: String) -> Self {
        Self {
            db,
            vercel,
            publish_domain,
        }
    }

    /// Publish the project's latest complete build under its slug.
    pub async fn publish(
        &self,
        project_id: i64,
        requested_slug: Option<String>,
    ) -> Result<PublishedSite, DeployError> {
        let project = self
            .db
            .call(move |db| db.get_project(project_id))
            .await?
            .ok_or_else(|| DeployError::Other(anyhow::anyhow!("Project {} not found", project_id)))?;

        let latest = self
            .db
            .call(move |db| db.latest_complete_build(project_id))
            .await?
            .ok_or(DeployError::NothingToPublish { project_id })?;

        let existing = self.db.call(move |db| db.get_site(project_id)).await?;

        // Already live for this exact build: nothing to do.
        if let Some(site) = &existing {
            if site.status == SiteStatus::Ready && site.build_output_id == latest.id {
                return Ok(site.clone());
            }
        }

        let slug = self
            .resolve_slug(&project, existing.as_ref(), requested_slug.as_deref())
            .await?;

        let hosting_name = format!("site-p{}", project.id);
        let vercel_project_id = match &existing {
            Some(site) => site.vercel_project_id.clone(),
            None => self.vercel.create_project(&hosting_name).await?.id,
        };

        let deployment = self.deploy(&hosting_name, &latest).await?;
        let domain = format!("{}.{}", slug, self.publish_domain);
        self.vercel.add_domain(&vercel_project_id, &domain).await?;

        let url = format!("https://{}", domain);
        let build_output_id = latest.id;
        let site = self
            .db
            .call(move |db| {
                db.upsert_site(
                    project_id,
                    &slug,
                    &vercel_project_id,
                    &deployment.id,
                    &url,
                    build_output_id,
                )
            })
            .await?;
        info!("published project {} at {}", project_id, site.url);
        Ok(site)
    }

    /// Upload the build's files and create a ready deployment.
    async fn deploy(
        &self,
        hosting_name: &str,
        build: &BuildOutput,
    ) -> Result<crate::vercel::Deployment, DeployError> {
        let uploaded = self.vercel.upload_files(&build.files).await?;
        let deployment = self.vercel.create_deployment(hosting_name, &uploaded).await?;
        self.vercel.wait_until_ready(&deployment.id).await
    }

    /// Slug resolution order: reuse the live slug, then a caller-supplied
    /// candidate, then derive from the project name.
    async fn resolve_slug(
        &self,
        project: &Project,
        existing: Option<&PublishedSite>,
        requested: Option<&str>,
    ) -> Result<String, DeployError> {
        if let Some(site) = existing {
            if site.status == SiteStatus::Ready {
                return Ok(site.slug.clone());
            }
        }

        if let Some(slug) = requested {
            if !is_valid_slug(slug) {
                return Err(DeployError::InvalidSlug { slug: slug.into() });
            }
            let owned = {
                let slug = slug.to_string();
                let project_id = project.id;
                self.db
                    .call(move |db| db.slug_available(&slug, project_id))
                    .await?
            };
            if !owned {
                return Err(DeployError::SlugTaken { slug: slug.into() });
            }
            return Ok(slug.to_string());
        }

        // A soft-deleted site keeps its slug when it is still free.
        if let Some(site) = existing {
            let slug = site.slug.clone();
            let project_id = project.id;
            if self
                .db
                .call(move |db| db.slug_available(&slug, project_id))
                .await?
            {
                return Ok(site.slug.clone());
            }
        }

        let base = slugify(&project.name, 40);
        let base = if base.is_empty() {
            format!("site-{}", project.id)
        } else {
            base
        };
        for candidate in slug_candidates(&base, project.id) {
            if !is_valid_slug(&candidate) {
                continue;
            }
            let check = candidate.clone();
            let project_id = project.id;
            if self
                .db
                .call(move |db| db.slug_available(&check, project_id))
                .await?
            {
                return Ok(candidate);
            }
        }
        Err(DeployError::Other(anyhow::anyhow!(
            "Could not find a free slug for project {}",
            project.id
        )))
    }

    /// Detach the domain and soft-delete the row; the hosting project is
    /// kept for republish.
    pub async fn unpublish(&self, project_id: i64) -> Result<PublishedSite, DeployError> {
        let site = self
            .db
            .call(move |db| db.get_site(project_id))
            .await?
            .filter(|s| s.status == SiteStatus::Ready)
            .ok_or_else(|| {
                DeployError::Other(anyhow::anyhow!("Project {} is not published", project_id))
            })?;

        let domain = format!("{}.{}", site.slug, self.publish_domain);
        self.vercel
            .remove_domain(&site.vercel_project_id, &domain)
            .await?;

        let site = self
            .db
            .call(move |db| db.mark_site_deleted(project_id))
            .await?;
        info!("unpublished project {}", project_id);
        Ok(site)
    }

    /// The site row plus derived staleness, if the project has one.
    pub async fn status(&self, project_id: i64) -> Result<Option<SiteState>, DeployError> {
        let site = self.db.call(move |db| db.get_site(project_id)).await?;
        let Some(site) = site else {
            return Ok(None);
        };
        let latest = self
            .db
            .call(move |db| db.latest_complete_build(project_id))
            .await?;
        let stale = is_stale(&site, latest.map(|b| b.id));
        Ok(Some(SiteState { site, stale }))
    }
}
