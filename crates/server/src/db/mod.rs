use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{
    LabelConfig, PlanRecord, SandboxStatus, SessionRecord, SkillRecord, SourceConfig,
    SourceRecord, StatusConfig,
};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;

mod models;

pub use models::*;

use crate::error::AppError;

/// Durable CRUD for one workspace's entity tables. Every write is immediately
/// durable; the owning actor is the single source of truth and must survive
/// process restarts. Timestamps are always set here, never taken from clients.
#[derive(Clone)]
pub struct WorkspaceStore {
    pool: SqlitePool,
}

fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

impl WorkspaceStore {
    pub async fn open(data_dir: &Path, slug: &str) -> Result<Self, AppError> {
        let dir = data_dir.join("workspaces");
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{slug}.db"));
        let database_url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self, AppError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), AppError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                name TEXT,
                flagged INTEGER NOT NULL DEFAULT 0,
                sdk_session_id TEXT,
                meta TEXT NOT NULL DEFAULT '{}',
                messages TEXT NOT NULL DEFAULT '[]',
                message_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                slug TEXT PRIMARY KEY,
                config TEXT NOT NULL,
                guide TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS configs (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS skills (
                slug TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                meta TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS plans (
                session_id TEXT NOT NULL,
                name TEXT NOT NULL,
                content TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (session_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                repo_key TEXT PRIMARY KEY,
                repo_url TEXT NOT NULL,
                default_branch TEXT NOT NULL DEFAULT 'main',
                credential TEXT,
                credential_expires_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sandbox_sessions (
                id TEXT PRIMARY KEY,
                repo_key TEXT NOT NULL,
                host_id TEXT NOT NULL,
                branch TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                expired_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn create_session(
        &self,
        id: &str,
        name: Option<&str>,
        meta: &Value,
    ) -> Result<SessionRecord, AppError> {
        if self.get_session(id).await?.is_some() {
            return Err(AppError::Validation(format!("session '{id}' already exists")));
        }
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO sessions (id, name, meta, messages, message_count, created_at, updated_at)
            VALUES (?, ?, ?, '[]', 0, ?, ?)
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(json_object(meta))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.require_session(id).await
    }

    /// Upsert header and messages wholesale. Returns the persisted record and
    /// whether the row was created.
    pub async fn save_session(
        &self,
        id: &str,
        name: Option<&str>,
        meta: &Value,
        messages: &[Value],
    ) -> Result<(SessionRecord, bool), AppError> {
        let existing = self.get_session(id).await?;
        let created = existing.is_none();
        let now = now_ts();
        let messages_json = serde_json::to_string(messages)?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, name, meta, messages, message_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                meta = excluded.meta,
                messages = excluded.messages,
                message_count = excluded.message_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(json_object(meta))
        .bind(&messages_json)
        .bind(messages.len() as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok((self.require_session(id).await?, created))
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, AppError> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, name, flagged, sdk_session_id, meta, messages, message_count, created_at, updated_at FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SessionRow::into_record).transpose()
    }

    async fn require_session(&self, id: &str) -> Result<SessionRecord, AppError> {
        self.get_session(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session '{id}'")))
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>, AppError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT id, name, flagged, sdk_session_id, meta, messages, message_count, created_at, updated_at FROM sessions ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SessionRow::into_record).collect()
    }

    /// Partial header update; `meta` is shallow-merged into the stored object.
    pub async fn update_session_meta(
        &self,
        id: &str,
        name: Option<&str>,
        flagged: Option<bool>,
        meta: Option<&Value>,
    ) -> Result<SessionRecord, AppError> {
        let current = self.require_session(id).await?;

        let merged = match meta {
            Some(patch) => merge_meta(&current.meta, patch),
            None => current.meta.clone(),
        };
        let name = name.map(str::to_string).or(current.name);
        let flagged = flagged.unwrap_or(current.flagged);

        sqlx::query(
            "UPDATE sessions SET name = ?, flagged = ?, meta = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&name)
        .bind(flagged as i64)
        .bind(merged.to_string())
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.require_session(id).await
    }

    pub async fn update_session_sdk_id(
        &self,
        id: &str,
        sdk_session_id: &str,
    ) -> Result<SessionRecord, AppError> {
        self.require_session(id).await?;
        sqlx::query("UPDATE sessions SET sdk_session_id = ?, updated_at = ? WHERE id = ?")
            .bind(sdk_session_id)
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.require_session(id).await
    }

    pub async fn clear_session_messages(&self, id: &str) -> Result<SessionRecord, AppError> {
        self.require_session(id).await?;
        sqlx::query(
            "UPDATE sessions SET messages = '[]', message_count = 0, updated_at = ? WHERE id = ?",
        )
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.require_session(id).await
    }

    /// Delete a session and cascade to its plans. Returns false if absent.
    pub async fn delete_session(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query("DELETE FROM plans WHERE session_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------

    pub async fn create_source(
        &self,
        slug: &str,
        config: &SourceConfig,
    ) -> Result<SourceRecord, AppError> {
        if self.get_source(slug).await?.is_some() {
            return Err(AppError::Validation(format!("source '{slug}' already exists")));
        }
        let now = now_ts();
        sqlx::query(
            "INSERT INTO sources (slug, config, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(slug)
        .bind(serde_json::to_string(config)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.require_source(slug).await
    }

    pub async fn save_source_config(
        &self,
        slug: &str,
        config: &SourceConfig,
    ) -> Result<SourceRecord, AppError> {
        self.require_source(slug).await?;
        sqlx::query("UPDATE sources SET config = ?, updated_at = ? WHERE slug = ?")
            .bind(serde_json::to_string(config)?)
            .bind(now_ts())
            .bind(slug)
            .execute(&self.pool)
            .await?;
        self.require_source(slug).await
    }

    pub async fn save_source_guide(&self, slug: &str, guide: &str) -> Result<SourceRecord, AppError> {
        self.require_source(slug).await?;
        sqlx::query("UPDATE sources SET guide = ?, updated_at = ? WHERE slug = ?")
            .bind(guide)
            .bind(now_ts())
            .bind(slug)
            .execute(&self.pool)
            .await?;
        self.require_source(slug).await
    }

    pub async fn delete_source(&self, slug: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM sources WHERE slug = ?")
            .bind(slug)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_source(&self, slug: &str) -> Result<Option<SourceRecord>, AppError> {
        let row = sqlx::query_as::<_, SourceRow>(
            "SELECT slug, config, guide, created_at, updated_at FROM sources WHERE slug = ?",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SourceRow::into_record).transpose()
    }

    async fn require_source(&self, slug: &str) -> Result<SourceRecord, AppError> {
        self.get_source(slug)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("source '{slug}'")))
    }

    pub async fn list_sources(&self) -> Result<Vec<SourceRecord>, AppError> {
        let rows = sqlx::query_as::<_, SourceRow>(
            "SELECT slug, config, guide, created_at, updated_at FROM sources ORDER BY slug",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SourceRow::into_record).collect()
    }

    // ------------------------------------------------------------------
    // Singleton configs (statuses, labels)
    // ------------------------------------------------------------------

    async fn get_config_raw(&self, key: &str) -> Result<Option<String>, AppError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM configs WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn put_config_raw(&self, key: &str, value: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO configs (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Absent singletons decode to a well-defined default, never null.
    pub async fn get_statuses(&self) -> Result<StatusConfig, AppError> {
        decode_statuses(self.get_config_raw(CONFIG_STATUSES).await?)
    }

    pub async fn save_statuses(&self, config: &StatusConfig) -> Result<StatusConfig, AppError> {
        self.put_config_raw(CONFIG_STATUSES, &serde_json::to_string(config)?)
            .await?;
        self.get_statuses().await
    }

    pub async fn get_labels(&self) -> Result<LabelConfig, AppError> {
        decode_labels(self.get_config_raw(CONFIG_LABELS).await?)
    }

    pub async fn save_labels(&self, config: &LabelConfig) -> Result<LabelConfig, AppError> {
        self.put_config_raw(CONFIG_LABELS, &serde_json::to_string(config)?)
            .await?;
        self.get_labels().await
    }

    // ------------------------------------------------------------------
    // Skills
    // ------------------------------------------------------------------

    pub async fn upsert_skill(
        &self,
        slug: &str,
        content: &str,
        meta: &Value,
    ) -> Result<(SkillRecord, bool), AppError> {
        let created = self.get_skill(slug).await?.is_none();
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO skills (slug, content, meta, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(slug) DO UPDATE SET
                content = excluded.content,
                meta = excluded.meta,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(slug)
        .bind(content)
        .bind(json_object(meta))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let record = self
            .get_skill(slug)
            .await?
            .ok_or_else(|| AppError::Internal("skill vanished after upsert".into()))?;
        Ok((record, created))
    }

    pub async fn delete_skill(&self, slug: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM skills WHERE slug = ?")
            .bind(slug)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_skill(&self, slug: &str) -> Result<Option<SkillRecord>, AppError> {
        let row = sqlx::query_as::<_, SkillRow>(
            "SELECT slug, content, meta, created_at, updated_at FROM skills WHERE slug = ?",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SkillRow::into_record).transpose()
    }

    pub async fn list_skills(&self) -> Result<Vec<SkillRecord>, AppError> {
        let rows = sqlx::query_as::<_, SkillRow>(
            "SELECT slug, content, meta, created_at, updated_at FROM skills ORDER BY slug",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SkillRow::into_record).collect()
    }

    // ------------------------------------------------------------------
    // Plans
    // ------------------------------------------------------------------

    pub async fn save_plan(
        &self,
        session_id: &str,
        name: &str,
        content: &str,
    ) -> Result<(PlanRecord, bool), AppError> {
        // Plans require a live parent session.
        self.require_session(session_id).await?;

        let created = self.get_plan(session_id, name).await?.is_none();
        sqlx::query(
            r#"
            INSERT INTO plans (session_id, name, content, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(session_id, name) DO UPDATE SET
                content = excluded.content,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(name)
        .bind(content)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        let record = self
            .get_plan(session_id, name)
            .await?
            .ok_or_else(|| AppError::Internal("plan vanished after upsert".into()))?;
        Ok((record, created))
    }

    pub async fn delete_plan(&self, session_id: &str, name: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM plans WHERE session_id = ? AND name = ?")
            .bind(session_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_plan(&self, session_id: &str, name: &str) -> Result<Option<PlanRecord>, AppError> {
        let row = sqlx::query_as::<_, PlanRow>(
            "SELECT session_id, name, content, updated_at FROM plans WHERE session_id = ? AND name = ?",
        )
        .bind(session_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PlanRow::into_record).transpose()
    }

    pub async fn list_plans(&self, session_id: &str) -> Result<Vec<PlanRecord>, AppError> {
        let rows = sqlx::query_as::<_, PlanRow>(
            "SELECT session_id, name, content, updated_at FROM plans WHERE session_id = ? ORDER BY name",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PlanRow::into_record).collect()
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    /// Lazily create the project row on first contact with a repo.
    pub async fn ensure_project(&self, repo_key: &str, repo_url: &str) -> Result<ProjectRow, AppError> {
        if let Some(row) = self.get_project(repo_key).await? {
            return Ok(row);
        }
        sqlx::query(
            "INSERT INTO projects (repo_key, repo_url, default_branch, created_at) VALUES (?, ?, 'main', ?)",
        )
        .bind(repo_key)
        .bind(repo_url)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        self.get_project(repo_key)
            .await?
            .ok_or_else(|| AppError::Internal("project vanished after insert".into()))
    }

    pub async fn get_project(&self, repo_key: &str) -> Result<Option<ProjectRow>, AppError> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT repo_key, repo_url, default_branch, credential, credential_expires_at, created_at FROM projects WHERE repo_key = ?",
        )
        .bind(repo_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectRow>, AppError> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            "SELECT repo_key, repo_url, default_branch, credential, credential_expires_at, created_at FROM projects ORDER BY repo_key",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Overwrites any prior credential unconditionally.
    pub async fn set_project_credential(
        &self,
        repo_key: &str,
        ciphertext: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE projects SET credential = ?, credential_expires_at = ? WHERE repo_key = ?",
        )
        .bind(ciphertext)
        .bind(expires_at.map(|t| t.to_rfc3339()))
        .bind(repo_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_project_credential(&self, repo_key: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE projects SET credential = NULL, credential_expires_at = NULL WHERE repo_key = ?",
        )
        .bind(repo_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sandbox sessions
    // ------------------------------------------------------------------

    pub async fn insert_sandbox(
        &self,
        id: &str,
        repo_key: &str,
        host_id: &str,
        branch: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<SandboxRow, AppError> {
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO sandbox_sessions (id, repo_key, host_id, branch, status, created_at, last_activity_at, expires_at)
            VALUES (?, ?, ?, ?, 'provisioning', ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(repo_key)
        .bind(host_id)
        .bind(branch)
        .bind(&now)
        .bind(&now)
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        self.require_sandbox(id).await
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<Option<SandboxRow>, AppError> {
        let row = sqlx::query_as::<_, SandboxRow>(
            "SELECT id, repo_key, host_id, branch, status, created_at, last_activity_at, expires_at, expired_at FROM sandbox_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn require_sandbox(&self, id: &str) -> Result<SandboxRow, AppError> {
        self.get_sandbox(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("sandbox session '{id}'")))
    }

    pub async fn list_sandboxes(&self) -> Result<Vec<SandboxRow>, AppError> {
        let rows = sqlx::query_as::<_, SandboxRow>(
            "SELECT id, repo_key, host_id, branch, status, created_at, last_activity_at, expires_at, expired_at FROM sandbox_sessions ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set_sandbox_status(&self, id: &str, status: SandboxStatus) -> Result<(), AppError> {
        if status == SandboxStatus::Expired {
            sqlx::query("UPDATE sandbox_sessions SET status = ?, expired_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(now_ts())
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE sandbox_sessions SET status = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Heartbeat: extend activity and expiry, forcing idle back to ready.
    pub async fn touch_sandbox(&self, id: &str, expires_at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE sandbox_sessions
            SET last_activity_at = ?, expires_at = ?,
                status = CASE WHEN status = 'idle' THEN 'ready' ELSE status END
            WHERE id = ?
            "#,
        )
        .bind(now_ts())
        .bind(expires_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_sandbox(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM sandbox_sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Non-expired sessions whose TTL has elapsed.
    pub async fn sandboxes_past_expiry(&self, now: DateTime<Utc>) -> Result<Vec<SandboxRow>, AppError> {
        let rows = sqlx::query_as::<_, SandboxRow>(
            "SELECT id, repo_key, host_id, branch, status, created_at, last_activity_at, expires_at, expired_at FROM sandbox_sessions WHERE status != 'expired' AND expires_at <= ?",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Expired rows past the grace window, due for hard delete.
    pub async fn sandboxes_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SandboxRow>, AppError> {
        let rows = sqlx::query_as::<_, SandboxRow>(
            "SELECT id, repo_key, host_id, branch, status, created_at, last_activity_at, expires_at, expired_at FROM sandbox_sessions WHERE status = 'expired' AND expired_at IS NOT NULL AND expired_at <= ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// All session rows, expired ones included. Expired rows still need a
    /// later sweep pass to hard-delete them, so they count.
    pub async fn count_sandboxes(&self) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sandbox_sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Shallow merge of a meta patch into the stored meta object.
fn merge_meta(current: &Value, patch: &Value) -> Value {
    match (current.as_object(), patch.as_object()) {
        (Some(base), Some(patch)) => {
            let mut merged = base.clone();
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_create_save_read_delete() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();

        let created = store
            .create_session("s1", Some("Test"), &Value::Null)
            .await
            .unwrap();
        assert_eq!(created.message_count, 0);
        assert!(created.messages.is_empty());

        let msgs = vec![
            serde_json::json!({"role": "user", "content": "hi"}),
            serde_json::json!({"role": "assistant", "content": "hello"}),
        ];
        let (saved, created_now) = store
            .save_session("s1", Some("Test"), &Value::Null, &msgs)
            .await
            .unwrap();
        assert!(!created_now);
        assert_eq!(saved.name.as_deref(), Some("Test"));
        assert_eq!(saved.message_count, 2);
        assert_eq!(saved.messages, msgs);

        assert!(store.delete_session("s1").await.unwrap());
        assert!(store.get_session("s1").await.unwrap().is_none());
        assert!(!store.delete_session("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_message_count_is_server_computed() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let msgs = vec![serde_json::json!({"role": "user"})];
        // Client-submitted counts are ignored; only the saved list matters.
        let (saved, _) = store
            .save_session("s1", None, &serde_json::json!({"messageCount": 99}), &msgs)
            .await
            .unwrap();
        assert_eq!(saved.message_count, 1);
    }

    #[tokio::test]
    async fn test_update_on_deleted_session_fails() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        store.create_session("s1", None, &Value::Null).await.unwrap();
        store.delete_session("s1").await.unwrap();

        let err = store
            .update_session_meta("s1", Some("x"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = store.update_session_sdk_id("s1", "sdk-1").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_meta_merge_is_shallow() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        store
            .create_session("s1", None, &serde_json::json!({"a": 1, "b": 2}))
            .await
            .unwrap();
        let updated = store
            .update_session_meta("s1", None, None, Some(&serde_json::json!({"b": 3, "c": 4})))
            .await
            .unwrap();
        assert_eq!(updated.meta, serde_json::json!({"a": 1, "b": 3, "c": 4}));
    }

    #[tokio::test]
    async fn test_session_delete_cascades_plans() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        store.create_session("s1", None, &Value::Null).await.unwrap();
        store.save_plan("s1", "plan.md", "# Plan").await.unwrap();
        assert_eq!(store.list_plans("s1").await.unwrap().len(), 1);

        store.delete_session("s1").await.unwrap();
        assert!(store.list_plans("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plan_requires_parent_session() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let err = store.save_plan("missing", "p.md", "x").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_source_slug_is_unique() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let config: SourceConfig =
            serde_json::from_value(serde_json::json!({"name": "Docs", "type": "notion"})).unwrap();
        store.create_source("docs", &config).await.unwrap();
        let err = store.create_source("docs", &config).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_singleton_configs_default_and_replace() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        assert_eq!(store.get_statuses().await.unwrap(), StatusConfig::default());
        assert_eq!(store.get_labels().await.unwrap(), LabelConfig::default());

        let config: StatusConfig = serde_json::from_value(serde_json::json!({
            "version": 2,
            "statuses": [{"id": "open", "label": "Open"}],
            "defaultStatusId": "open",
        }))
        .unwrap();
        let first = store.save_statuses(&config).await.unwrap();
        let second = store.save_statuses(&config).await.unwrap();
        // Last-write-wins, no duplication artifacts.
        assert_eq!(first, second);
        assert_eq!(store.get_statuses().await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_skill_upsert_and_delete() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let (_, created) = store
            .upsert_skill("summarize", "Summarize the doc", &Value::Null)
            .await
            .unwrap();
        assert!(created);
        let (skill, created) = store
            .upsert_skill("summarize", "Summarize it well", &Value::Null)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(skill.content, "Summarize it well");

        assert!(store.delete_skill("summarize").await.unwrap());
        assert!(!store.delete_skill("summarize").await.unwrap());
    }

    #[tokio::test]
    async fn test_project_lazy_create_and_credential() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let row = store
            .ensure_project("o/r", "https://github.com/o/r")
            .await
            .unwrap();
        assert!(row.credential.is_none());

        store
            .set_project_credential("o/r", "ciphertext-blob", None)
            .await
            .unwrap();
        let row = store.get_project("o/r").await.unwrap().unwrap();
        assert_eq!(row.credential.as_deref(), Some("ciphertext-blob"));
        assert!(row.into_info().unwrap().has_credential);

        store.clear_project_credential("o/r").await.unwrap();
        let row = store.get_project("o/r").await.unwrap().unwrap();
        assert!(row.credential.is_none());
    }

    #[tokio::test]
    async fn test_sandbox_row_lifecycle() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let expires = Utc::now() + chrono::Duration::seconds(60);
        store
            .insert_sandbox("sb1", "o/r", "host-1", "main", expires)
            .await
            .unwrap();

        let row = store.get_sandbox("sb1").await.unwrap().unwrap();
        assert_eq!(row.status().unwrap(), SandboxStatus::Provisioning);

        store
            .set_sandbox_status("sb1", SandboxStatus::Ready)
            .await
            .unwrap();
        store
            .set_sandbox_status("sb1", SandboxStatus::Expired)
            .await
            .unwrap();
        let row = store.get_sandbox("sb1").await.unwrap().unwrap();
        assert!(row.expired_at.is_some());

        let overdue = store
            .sandboxes_expired_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(overdue.len(), 1);
        // The expired row still counts until it is hard-deleted.
        assert_eq!(store.count_sandboxes().await.unwrap(), 1);
        store.delete_sandbox("sb1").await.unwrap();
        assert_eq!(store.count_sandboxes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sandbox_past_expiry_query() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let past = Utc::now() - chrono::Duration::seconds(10);
        store
            .insert_sandbox("sb1", "o/r", "host-1", "main", past)
            .await
            .unwrap();
        let due = store.sandboxes_past_expiry(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "sb1");
    }
}
