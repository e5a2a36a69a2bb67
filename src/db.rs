use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::models::*;

/// Async-safe handle to the service database.
///
/// Wraps `SiteDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous
/// SQLite I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SiteDb>>,
}

impl DbHandle {
    pub fn new(db: SiteDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SiteDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct SiteDb {
    conn: Connection,
}

impl SiteDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS build_configs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL UNIQUE REFERENCES projects(id) ON DELETE CASCADE,
                    framework TEXT NOT NULL,
                    styling TEXT NOT NULL DEFAULT 'css',
                    typescript INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS build_outputs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    build_config_id INTEGER NOT NULL REFERENCES build_configs(id),
                    status TEXT NOT NULL DEFAULT 'generating',
                    files TEXT NOT NULL DEFAULT '[]',
                    error TEXT,
                    preview_url TEXT,
                    preview_token TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS published_sites (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL UNIQUE REFERENCES projects(id) ON DELETE CASCADE,
                    slug TEXT NOT NULL,
                    vercel_project_id TEXT NOT NULL,
                    deployment_id TEXT NOT NULL,
                    url TEXT NOT NULL,
                    build_output_id INTEGER NOT NULL REFERENCES build_outputs(id),
                    status TEXT NOT NULL DEFAULT 'ready',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_build_outputs_project
                    ON build_outputs(project_id, status);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_published_sites_live_slug
                    ON published_sites(slug) WHERE status = 'ready';
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Projects ─────────────────────────────────────────────────────

    pub fn create_project(&self, name: &str) -> Result<Project> {
        self.conn.execute(
            "INSERT INTO projects (name) VALUES (?1)",
            params![name],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .ok_or_else(|| anyhow::anyhow!("Project {} missing after insert", id))
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, created_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to query project")
    }

    // ── Build configs ────────────────────────────────────────────────

    /// One config per project: insert on first write, update afterwards.
    pub fn upsert_build_config(
        &self,
        project_id: i64,
        framework: Framework,
        styling: &str,
        typescript: bool,
    ) -> Result<BuildConfig> {
        self.conn.execute(
            "INSERT INTO build_configs (project_id, framework, styling, typescript)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(project_id) DO UPDATE SET
                framework = excluded.framework,
                styling = excluded.styling,
                typescript = excluded.typescript,
                updated_at = datetime('now')",
            params![project_id, framework.as_str(), styling, typescript as i64],
        )?;
        self.get_build_config(project_id)?
            .ok_or_else(|| anyhow::anyhow!("Build config missing after upsert"))
    }

    pub fn get_build_config(&self, project_id: i64) -> Result<Option<BuildConfig>> {
        self.conn
            .query_row(
                "SELECT id, project_id, framework, styling, typescript, created_at, updated_at
                 FROM build_configs WHERE project_id = ?1",
                params![project_id],
                row_to_build_config,
            )
            .optional()
            .context("Failed to query build config")
    }

    // ── Build outputs ────────────────────────────────────────────────

    pub fn create_build_output(&self, project_id: i64, build_config_id: i64) -> Result<BuildOutput> {
        self.conn.execute(
            "INSERT INTO build_outputs (project_id, build_config_id) VALUES (?1, ?2)",
            params![project_id, build_config_id],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_build_output(id)?
            .ok_or_else(|| anyhow::anyhow!("Build {} missing after insert", id))
    }

    /// Overwrite the persisted file set mid-stream so a crash leaves the
    /// latest known-good set behind. Only valid while still generating.
    pub fn update_build_files(&self, id: i64, files: &[GeneratedFile]) -> Result<()> {
        let json = serde_json::to_string(files)?;
        let updated = self.conn.execute(
            "UPDATE build_outputs SET files = ?2 WHERE id = ?1 AND status = 'generating'",
            params![id, json],
        )?;
        if updated == 0 {
            anyhow::bail!("Build {} is not in generating state", id);
        }
        Ok(())
    }

    /// Transition generating→complete with the final file set.
    pub fn complete_build_output(
        &self,
        id: i64,
        files: &[GeneratedFile],
        error: Option<&str>,
    ) -> Result<BuildOutput> {
        if files.is_empty() {
            anyhow::bail!("A complete build must have at least one file");
        }
        self.transition_build(id, BuildStatus::Complete, Some(files), error)
    }

    /// Transition generating→failed.
    pub fn fail_build_output(&self, id: i64, error: &str) -> Result<BuildOutput> {
        self.transition_build(id, BuildStatus::Failed, None, Some(error))
    }

    fn transition_build(
        &self,
        id: i64,
        to: BuildStatus,
        files: Option<&[GeneratedFile]>,
        error: Option<&str>,
    ) -> Result<BuildOutput> {
        let current = self
            .get_build_output(id)?
            .ok_or_else(|| anyhow::anyhow!("Build {} not found", id))?;
        if !is_valid_build_transition(&current.status, &to) {
            anyhow::bail!(
                "Invalid build status transition {} -> {} for build {}",
                current.status,
                to,
                id
            );
        }
        match files {
            Some(files) => {
                let json = serde_json::to_string(files)?;
                self.conn.execute(
                    "UPDATE build_outputs SET status = ?2, files = ?3, error = ?4 WHERE id = ?1",
                    params![id, to.as_str(), json, error],
                )?;
            }
            None => {
                self.conn.execute(
                    "UPDATE build_outputs SET status = ?2, error = ?3 WHERE id = ?1",
                    params![id, to.as_str(), error],
                )?;
            }
        }
        self.get_build_output(id)?
            .ok_or_else(|| anyhow::anyhow!("Build {} missing after update", id))
    }

    pub fn get_build_output(&self, id: i64) -> Result<Option<BuildOutput>> {
        self.conn
            .query_row(
                "SELECT id, project_id, build_config_id, status, files, error,
                        preview_url, preview_token, created_at
                 FROM build_outputs WHERE id = ?1",
                params![id],
                row_to_build_output,
            )
            .optional()
            .context("Failed to query build output")
    }

    pub fn latest_complete_build(&self, project_id: i64) -> Result<Option<BuildOutput>> {
        self.conn
            .query_row(
                "SELECT id, project_id, build_config_id, status, files, error,
                        preview_url, preview_token, created_at
                 FROM build_outputs
                 WHERE project_id = ?1 AND status = 'complete'
                 ORDER BY id DESC LIMIT 1",
                params![project_id],
                row_to_build_output,
            )
            .optional()
            .context("Failed to query latest complete build")
    }

    pub fn set_build_preview(&self, id: i64, url: &str, token: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE build_outputs SET preview_url = ?2, preview_token = ?3 WHERE id = ?1",
            params![id, url, token],
        )?;
        Ok(())
    }

    pub fn clear_build_preview(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE build_outputs SET preview_url = NULL, preview_token = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    // ── Published sites ──────────────────────────────────────────────

    /// The project's site row, live or soft-deleted. At most one exists.
    pub fn get_site(&self, project_id: i64) -> Result<Option<PublishedSite>> {
        self.conn
            .query_row(
                "SELECT id, project_id, slug, vercel_project_id, deployment_id, url,
                        build_output_id, status, created_at, updated_at
                 FROM published_sites WHERE project_id = ?1",
                params![project_id],
                row_to_site,
            )
            .optional()
            .context("Failed to query published site")
    }

    pub fn get_live_site_by_slug(&self, slug: &str) -> Result<Option<PublishedSite>> {
        self.conn
            .query_row(
                "SELECT id, project_id, slug, vercel_project_id, deployment_id, url,
                        build_output_id, status, created_at, updated_at
                 FROM published_sites WHERE slug = ?1 AND status = 'ready'",
                params![slug],
                row_to_site,
            )
            .optional()
            .context("Failed to query site by slug")
    }

    /// A slug is free when no live site other than this project's owns it.
    pub fn slug_available(&self, slug: &str, project_id: i64) -> Result<bool> {
        Ok(match self.get_live_site_by_slug(slug)? {
            Some(site) => site.project_id == project_id,
            None => true,
        })
    }

    /// Insert or update the single site row for a project. Republish keeps
    /// the row (and hosting-project identity) stable.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_site(
        &self,
        project_id: i64,
        slug: &str,
        vercel_project_id: &str,
        deployment_id: &str,
        url: &str,
        build_output_id: i64,
    ) -> Result<PublishedSite> {
        self.conn.execute(
            "INSERT INTO published_sites
                (project_id, slug, vercel_project_id, deployment_id, url, build_output_id, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'ready')
             ON CONFLICT(project_id) DO UPDATE SET
                slug = excluded.slug,
                vercel_project_id = excluded.vercel_project_id,
                deployment_id = excluded.deployment_id,
                url = excluded.url,
                build_output_id = excluded.build_output_id,
                status = 'ready',
                updated_at = datetime('now')",
            params![
                project_id,
                slug,
                vercel_project_id,
                deployment_id,
                url,
                build_output_id
            ],
        )?;
        self.get_site(project_id)?
            .ok_or_else(|| anyhow::anyhow!("Site missing after upsert"))
    }

    /// Soft-delete: the slug is released but the row (and hosting project)
    /// stays for cheap republish.
    pub fn mark_site_deleted(&self, project_id: i64) -> Result<PublishedSite> {
        let updated = self.conn.execute(
            "UPDATE published_sites SET status = 'deleted', updated_at = datetime('now')
             WHERE project_id = ?1",
            params![project_id],
        )?;
        if updated == 0 {
            anyhow::bail!("No published site for project {}", project_id);
        }
        self.get_site(project_id)?
            .ok_or_else(|| anyhow::anyhow!("Site missing after delete"))
    }
}

// ── Row mappers ──────────────────────────────────────────────────────

fn row_to_build_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<BuildConfig> {
    let framework: String = row.get(2)?;
    Ok(BuildConfig {
        id: row.get(0)?,
        project_id: row.get(1)?,
        framework: Framework::from_str(&framework).unwrap_or(Framework::Static),
        styling: row.get(3)?,
        typescript: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_build_output(row: &rusqlite::Row<'_>) -> rusqlite::Result<BuildOutput> {
    let status: String = row.get(3)?;
    let files_json: String = row.get(4)?;
    Ok(BuildOutput {
        id: row.get(0)?,
        project_id: row.get(1)?,
        build_config_id: row.get(2)?,
        status: BuildStatus::from_str(&status).unwrap_or(BuildStatus::Failed),
        files: serde_json::from_str(&files_json).unwrap_or_default(),
        error: row.get(5)?,
        preview_url: row.get(6)?,
        preview_token: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn row_to_site(row: &rusqlite::Row<'_>) -> rusqlite::Result<PublishedSite> {
    let status: String = row.get(7)?;
    Ok(PublishedSite {
        id: row.get(0)?,
        project_id: row.get(1)?,
        slug: row.get(2)?,
        vercel_project_id: row.get(3)?,
        deployment_id: row.get(4)?,
        url: row.get(5)?,
        build_output_id: row.get(6)?,
        status: SiteStatus::from_str(&status).unwrap_or(SiteStatus::Deleted),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}
