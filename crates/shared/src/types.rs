use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Workspace entities
// ============================================================================

/// A chat session: flexible header metadata plus an ordered message list.
/// Timestamps and `message_count` are always server-computed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub flagged: bool,
    #[serde(default)]
    pub sdk_session_id: Option<String>,
    /// Flexible header fields (token usage, client flags, ...). Opaque to the
    /// server; replaced wholesale on save, merged on meta updates.
    #[serde(default)]
    pub meta: Value,
    pub message_count: i64,
    #[serde(default)]
    pub messages: Vec<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A connected data source, unique per slug.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    pub slug: String,
    pub config: SourceConfig,
    pub guide: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auth_state: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_true() -> bool {
    true
}

/// Workspace-singleton status definitions, replaced wholesale on save.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfig {
    pub version: i64,
    #[serde(default)]
    pub statuses: Vec<StatusDef>,
    #[serde(default)]
    pub default_status_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusDef {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub color: Option<String>,
}

/// Workspace-singleton label tree, replaced wholesale on save.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelConfig {
    pub version: i64,
    #[serde(default)]
    pub labels: Vec<LabelNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub children: Vec<LabelNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SkillRecord {
    pub slug: String,
    pub content: String,
    #[serde(default)]
    pub meta: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Markdown plan attached to a session; deleted with its parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanRecord {
    pub session_id: String,
    pub name: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// Linked repository as exposed on the wire. The stored credential itself
/// never leaves the server; only its presence and expiry are reported.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub repo_key: String,
    pub repo_url: String,
    pub default_branch: String,
    pub has_credential: bool,
    pub credential_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Sandbox sessions
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Provisioning,
    Cloning,
    Ready,
    Idle,
    Expired,
}

impl SandboxStatus {
    /// Status only moves forward (ready and idle are interchangeable);
    /// `expired` is terminal.
    pub fn can_transition_to(self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        match (self, next) {
            (Expired, _) => false,
            (a, b) if a == b => true,
            (Provisioning, Cloning | Ready | Expired) => true,
            (Cloning, Ready | Expired) => true,
            (Ready, Idle | Expired) => true,
            (Idle, Ready | Expired) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SandboxStatus::Provisioning => "provisioning",
            SandboxStatus::Cloning => "cloning",
            SandboxStatus::Ready => "ready",
            SandboxStatus::Idle => "idle",
            SandboxStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<SandboxStatus> {
        match s {
            "provisioning" => Some(SandboxStatus::Provisioning),
            "cloning" => Some(SandboxStatus::Cloning),
            "ready" => Some(SandboxStatus::Ready),
            "idle" => Some(SandboxStatus::Idle),
            "expired" => Some(SandboxStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSessionInfo {
    pub id: Uuid,
    pub repo_key: String,
    pub host_id: String,
    pub branch: String,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Change events
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Session,
    Source,
    Statuses,
    Labels,
    Skill,
    Plan,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
}

/// Broadcastable delta describing what a mutation did. `data` is always the
/// persisted result (server-computed fields included), never the raw input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub entity: EntityKind,
    pub action: ChangeAction,
    pub data: Value,
}
