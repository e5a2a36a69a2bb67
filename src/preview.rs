//! Disposable, token-gated preview deployments.
//!
//! Unlike publishing, a preview always gets a fresh randomly-named hosting
//! project and a random access token. Two scripts are injected into the
//! HTML entry point before upload: a gate that blocks render unless the
//! token matches, and a banner that queries this service's status endpoint
//! and links back to the authoring tool.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbHandle;
use crate::errors::DeployError;
use crate::models::{BuildStatus, GeneratedFile};
use crate::vercel::VercelClient;

const TOKEN_STORAGE_KEY: &str = "sitesmith_preview_token";

#[derive(Debug, Clone, Serialize)]
pub struct PreviewInfo {
    pub url: String,
    pub token: String,
}

pub struct PreviewManager {
    db: DbHandle,
    vercel: Arc<VercelClient>,
    service_url: String,
    studio_url: String,
}

impl PreviewManager {
    pub fn new(db: DbHandle, vercel: Arc<VercelClient>, service_url: String, studio_url: String) -> Self {
        Self {
            db,
            vercel,
            service_url,
            studio_url,
        }
    }

    /// Create (or return) the preview deployment for a build.
    pub async fn preview(&self, build_id: i64) -> Result<PreviewInfo, DeployError> {
        let build = self
            .db
            .call(move |db| db.get_build_output(build_id))
            .await?
            .ok_or_else(|| DeployError::Other(anyhow::anyhow!("Build {} not found", build_id)))?;
        if build.status != BuildStatus::Complete {
            return Err(DeployError::Other(anyhow::anyhow!(
                "Build {} is not complete",
                build_id
            )));
        }

        // An already-live preview is reused; a dead one is cleared first.
        if let (Some(url), Some(token)) = (&build.preview_url, &build.preview_token) {
            if self.vercel.is_reachable(url).await {
                return Ok(PreviewInfo {
                    url: url.clone(),
                    token: token.clone(),
                });
            }
            warn!("preview for build {} unreachable, regenerating", build_id);
            self.db
                .call(move |db| db.clear_build_preview(build_id))
                .await?;
        }

        let token = Uuid::new_v4().to_string();
        let mut files = build.files.clone();
        if !inject_preview_scripts(
            &mut files,
            &gate_script(&token),
            &banner_script(&self.service_url, &self.studio_url, build.project_id),
        ) {
            warn!("build {} has no HTML entry point, preview is ungated", build_id);
        }

        let hosting_name = format!("preview-{}", Uuid::new_v4().simple());
        self.vercel.create_project(&hosting_name).await?;
        let uploaded = self.vercel.upload_files(&files).await?;
        let deployment = self.vercel.create_deployment(&hosting_name, &uploaded).await?;
        let deployment = self.vercel.wait_until_ready(&deployment.id).await?;

        let url = format!("https://{}", deployment.url);
        {
            let url = url.clone();
            let token = token.clone();
            self.db
                .call(move |db| db.set_build_preview(build_id, &url, &token))
                .await?;
        }
        info!("preview for build {} at {}", build_id, url);
        Ok(PreviewInfo { url, token })
    }
}

/// Inject both scripts into the HTML entry point (index.html, or the first
/// HTML file). Returns false when the build has no HTML to inject into.
pub fn inject_preview_scripts(files: &mut [GeneratedFile], gate: &str, banner: &str) -> bool {
    let entry = files
        .iter()
        .position(|f| f.path == "index.html" || f.path == "public/index.html")
        .or_else(|| files.iter().position(|f| f.path.ends_with(".html")));
    let Some(idx) = entry else {
        return false;
    };

    let scripts = format!("{}\n{}", gate, banner);
    let html = std::mem::take(&mut files[idx].content);
    files[idx].content = match html.rfind("</body>") {
        Some(pos) => format!("{}{}\n{}", &html[..pos], scripts, &html[pos..]),
        None => format!("{}\n{}", html, scripts),
    };
    true
}

/// Blocks render unless the access token matches. The token arrives as a
/// `?t=` query param on first visit and persists in localStorage.
fn gate_script(token: &str) -> String {
    format!(
        r#"<script>
(function () {{
  var expected = "{token}";
  var params = new URLSearchParams(window.location.search);
  var supplied = params.get("t") || localStorage.getItem("{key}");
  if (supplied === expected) {{
    localStorage.setItem("{key}", supplied);
    return;
  }}
  document.documentElement.innerHTML =
    "<body style=\"font-family:sans-serif;padding:4rem;text-align:center\">" +
    "<h1>Preview locked</h1><p>This preview requires an access link.</p></body>";
}})();
</script>"#,
        token = token,
        key = TOKEN_STORAGE_KEY,
    )
}

/// Renders the publish-state banner by querying the service's status
/// endpoint, with a link back to the authoring tool.
fn banner_script(service_url: &str, studio_url: &str, project_id: i64) -> String {
    format!(
        r#"<script>
(function () {{
  fetch("{service_url}/api/projects/{project_id}/site-status")
    .then(function (r) {{ return r.json(); }})
    .then(function (s) {{
      var label = s.status === "published" ? "Published"
        : s.status === "update_available" ? "Update available"
        : "Not published";
      var bar = document.createElement("div");
      bar.style.cssText = "position:fixed;bottom:0;left:0;right:0;z-index:99999;" +
        "background:#111;color:#fff;padding:8px 16px;font:13px sans-serif;" +
        "display:flex;justify-content:space-between";
      bar.innerHTML = "<span>Preview &mdash; " + label + "</span>" +
        "<a href=\"{studio_url}/projects/{project_id}\" style=\"color:#8ab4f8\">Open in studio</a>";
      document.body.appendChild(bar);
    }})
    .catch(function () {{}});
}})();
</script>"#,
        service_url = service_url,
        studio_url = studio_url,
        project_id = project_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_into_index_html_before_body_close() {
        let mut files = vec![
            GeneratedFile::new("styles.css", "body {}"),
            GeneratedFile::new("index.html", "<html><body><h1>Hi</h1></body></html>"),
        ];
        assert!(inject_preview_scripts(&mut files, "<script>gate</script>", "<script>banner</script>"));
        let html = &files[1].content;
        assert!(html.contains("<script>gate</script>"));
        assert!(html.contains("<script>banner</script>"));
        let gate_pos = html.find("<script>gate</script>").unwrap();
        let body_close = html.rfind("</body>").unwrap();
        assert!(gate_pos < body_close);
        // CSS untouched.
        assert_eq!(files[0].content, "body {}");
    }

    #[test]
    fn test_inject_appends_when_no_body_tag() {
        let mut files = vec![GeneratedFile::new("index.html", "<h1>bare</h1>")];
        assert!(inject_preview_scripts(&mut files, "<script>g</script>", "<script>b</script>"));
        assert!(files[0].content.ends_with("<script>b</script>"));
    }

    #[test]
    fn test_inject_falls_back_to_any_html_file() {
        let mut files = vec![
            GeneratedFile::new("main.js", "console.log(1)"),
            GeneratedFile::new("pages/home.html", "<body></body>"),
        ];
        assert!(inject_preview_scripts(&mut files, "<script>g</script>", "<script>b</script>"));
        assert!(files[1].content.contains("<script>g</script>"));
    }

    #[test]
    fn test_inject_reports_missing_entry_point() {
        let mut files = vec![GeneratedFile::new("main.js", "console.log(1)")];
        assert!(!inject_preview_scripts(&mut files, "g", "b"));
        assert_eq!(files[0].content, "console.log(1)");
    }

    #[test]
    fn test_gate_script_embeds_token_and_storage_key() {
        let script = gate_script("tok-abc-123");
        assert!(script.contains("tok-abc-123"));
        assert!(script.contains(TOKEN_STORAGE_KEY));
        assert!(script.contains("params.get(\"t\")"));
    }

    #[test]
    fn test_banner_script_points_at_status_endpoint_and_studio() {
        let script = banner_script("https://api.sitesmith.test", "https://studio.test", 7);
        assert!(script.contains("https://api.sitesmith.test/api/projects/7/site-status"));
        assert!(script.contains("https://studio.test/projects/7"));
        assert!(script.contains("update_available"));
    }
}
