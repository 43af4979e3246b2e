use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{
    LabelConfig, PlanRecord, ProjectInfo, SandboxSessionInfo, SandboxStatus, SessionRecord,
    SkillRecord, SourceConfig, SourceRecord, StatusConfig,
};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::AppError;

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::Internal(format!("bad timestamp in store: {e}")))
}

#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: String,
    pub name: Option<String>,
    pub flagged: i64,
    pub sdk_session_id: Option<String>,
    pub meta: String,
    pub messages: String,
    pub message_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl SessionRow {
    pub fn into_record(self) -> Result<SessionRecord, AppError> {
        Ok(SessionRecord {
            id: self.id,
            name: self.name,
            flagged: self.flagged != 0,
            sdk_session_id: self.sdk_session_id,
            meta: serde_json::from_str(&self.meta)?,
            message_count: self.message_count,
            messages: serde_json::from_str(&self.messages)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SourceRow {
    pub slug: String,
    pub config: String,
    pub guide: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl SourceRow {
    pub fn into_record(self) -> Result<SourceRecord, AppError> {
        let config: SourceConfig = serde_json::from_str(&self.config)?;
        Ok(SourceRecord {
            slug: self.slug,
            config,
            guide: self.guide,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SkillRow {
    pub slug: String,
    pub content: String,
    pub meta: String,
    pub created_at: String,
    pub updated_at: String,
}

impl SkillRow {
    pub fn into_record(self) -> Result<SkillRecord, AppError> {
        Ok(SkillRecord {
            slug: self.slug,
            content: self.content,
            meta: serde_json::from_str(&self.meta)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PlanRow {
    pub session_id: String,
    pub name: String,
    pub content: String,
    pub updated_at: String,
}

impl PlanRow {
    pub fn into_record(self) -> Result<PlanRecord, AppError> {
        Ok(PlanRecord {
            session_id: self.session_id,
            name: self.name,
            content: self.content,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Stored project row. `credential` is always ciphertext; plaintext secrets
/// never touch the store.
#[derive(Debug, Clone, FromRow)]
pub struct ProjectRow {
    pub repo_key: String,
    pub repo_url: String,
    pub default_branch: String,
    pub credential: Option<String>,
    pub credential_expires_at: Option<String>,
    pub created_at: String,
}

impl ProjectRow {
    pub fn into_info(self) -> Result<ProjectInfo, AppError> {
        let expires = match &self.credential_expires_at {
            Some(ts) => Some(parse_ts(ts)?),
            None => None,
        };
        Ok(ProjectInfo {
            has_credential: self.credential.is_some(),
            repo_key: self.repo_key,
            repo_url: self.repo_url,
            default_branch: self.default_branch,
            credential_expires_at: expires,
            created_at: parse_ts(&self.created_at)?,
        })
    }

    pub fn credential_expired(&self, now: DateTime<Utc>) -> bool {
        match &self.credential_expires_at {
            Some(ts) => parse_ts(ts).map(|t| t < now).unwrap_or(true),
            None => false,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SandboxRow {
    pub id: String,
    pub repo_key: String,
    pub host_id: String,
    pub branch: String,
    pub status: String,
    pub created_at: String,
    pub last_activity_at: String,
    pub expires_at: String,
    pub expired_at: Option<String>,
}

impl SandboxRow {
    pub fn status(&self) -> Result<SandboxStatus, AppError> {
        SandboxStatus::parse(&self.status)
            .ok_or_else(|| AppError::Internal(format!("bad sandbox status in store: {}", self.status)))
    }

    pub fn into_info(self) -> Result<SandboxSessionInfo, AppError> {
        let status = self.status()?;
        Ok(SandboxSessionInfo {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| AppError::Internal(format!("bad sandbox id in store: {e}")))?,
            repo_key: self.repo_key,
            host_id: self.host_id,
            branch: self.branch,
            status,
            created_at: parse_ts(&self.created_at)?,
            last_activity_at: parse_ts(&self.last_activity_at)?,
            expires_at: parse_ts(&self.expires_at)?,
        })
    }
}

/// Singleton configs (statuses, labels) are stored as JSON under fixed keys.
pub const CONFIG_STATUSES: &str = "statuses";
pub const CONFIG_LABELS: &str = "labels";

pub fn decode_statuses(raw: Option<String>) -> Result<StatusConfig, AppError> {
    match raw {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(StatusConfig::default()),
    }
}

pub fn decode_labels(raw: Option<String>) -> Result<LabelConfig, AppError> {
    match raw {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(LabelConfig::default()),
    }
}

pub(crate) fn json_object(v: &Value) -> String {
    if v.is_null() {
        "{}".to_string()
    } else {
        v.to_string()
    }
}
