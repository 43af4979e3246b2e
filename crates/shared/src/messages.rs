use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ChangeEvent, LabelConfig, SourceConfig, StatusConfig};

// ============================================================================
// Sync channel (client <-> workspace actor)
// ============================================================================

/// Client-to-server sync frame: `{type: "<entity>:<verb>", data: {...},
/// requestId: "..."}`. The command enum is closed so a new message kind is a
/// compile-time-visible gap in every match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncEnvelope {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(flatten)]
    pub command: SyncCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum SyncCommand {
    #[serde(rename = "session:create")]
    SessionCreate {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        meta: Value,
    },
    #[serde(rename = "session:save")]
    SessionSave {
        id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        meta: Value,
        #[serde(default)]
        messages: Vec<Value>,
    },
    #[serde(rename = "session:delete")]
    SessionDelete { id: String },
    #[serde(rename = "session:updateMeta")]
    SessionUpdateMeta {
        id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        flagged: Option<bool>,
        #[serde(default)]
        meta: Option<Value>,
    },
    #[serde(rename = "session:updateSdkId")]
    SessionUpdateSdkId {
        id: String,
        #[serde(rename = "sdkSessionId")]
        sdk_session_id: String,
    },
    #[serde(rename = "session:clearMessages")]
    SessionClearMessages { id: String },
    #[serde(rename = "source:create")]
    SourceCreate { slug: String, config: SourceConfig },
    #[serde(rename = "source:saveConfig")]
    SourceSaveConfig { slug: String, config: SourceConfig },
    #[serde(rename = "source:delete")]
    SourceDelete { slug: String },
    #[serde(rename = "source:saveGuide")]
    SourceSaveGuide { slug: String, guide: String },
    #[serde(rename = "statuses:save")]
    StatusesSave(StatusConfig),
    #[serde(rename = "labels:save")]
    LabelsSave(LabelConfig),
    #[serde(rename = "skill:save")]
    SkillSave {
        slug: String,
        content: String,
        #[serde(default)]
        meta: Value,
    },
    #[serde(rename = "skill:delete")]
    SkillDelete { slug: String },
    #[serde(rename = "plan:save")]
    PlanSave {
        #[serde(rename = "sessionId")]
        session_id: String,
        name: String,
        content: String,
    },
    #[serde(rename = "plan:delete")]
    PlanDelete {
        #[serde(rename = "sessionId")]
        session_id: String,
        name: String,
    },
}

impl SyncCommand {
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "session:create",
        "session:save",
        "session:delete",
        "session:updateMeta",
        "session:updateSdkId",
        "session:clearMessages",
        "source:create",
        "source:saveConfig",
        "source:delete",
        "source:saveGuide",
        "statuses:save",
        "labels:save",
        "skill:save",
        "skill:delete",
        "plan:save",
        "plan:delete",
    ];

    pub fn is_known_type(ty: &str) -> bool {
        Self::KNOWN_TYPES.contains(&ty)
    }
}

/// Server-to-client sync frames: a response correlated by requestId (data or
/// error, never both) or a broadcast change event from another peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncServerMessage {
    Response {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Broadcast { event: ChangeEvent },
}

impl SyncServerMessage {
    pub fn ok(request_id: impl Into<String>, data: Value) -> Self {
        Self::Response {
            request_id: request_id.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Response {
            request_id: request_id.into(),
            data: None,
            error: Some(error.into()),
        }
    }
}

// ============================================================================
// Sandbox channel (client <-> sandbox session)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxClientMessage {
    /// Synchronous single-tool execution against the cloned repo root.
    /// `name` is validated server-side so unsupported tools get a structured
    /// error rather than a parse failure.
    Tool {
        id: String,
        name: String,
        input: Value,
    },
    /// Full agent run with streaming output. The API key arrives encrypted
    /// with a key derived from (caller key, workspace slug).
    Execute {
        task: String,
        #[serde(default)]
        context: Option<String>,
        #[serde(rename = "anthropicApiKey")]
        anthropic_api_key: String,
        #[serde(rename = "tokenType", default)]
        token_type: Option<String>,
    },
    Ping,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxServerMessage {
    ToolResult {
        id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(rename = "exitCode", default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    /// One stdout line from a running agent execution, forwarded in arrival
    /// order. Ordered but not buffered: consumers must keep up or queue.
    Stream { data: String },
    Complete {
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    Error { message: String },
    HeartbeatAck,
    Pong,
}

impl SandboxServerMessage {
    pub fn tool_ok(id: impl Into<String>, output: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::ToolResult {
            id: id.into(),
            success: true,
            output: Some(output.into()),
            error: None,
            exit_code,
        }
    }

    pub fn tool_err(id: impl Into<String>, error: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::ToolResult {
            id: id.into(),
            success: false,
            output: None,
            error: Some(error.into()),
            exit_code,
        }
    }
}

// ============================================================================
// Relay control channel (bridge <-> broker)
// ============================================================================

/// Close code sent by the broker after a failed `auth` frame.
pub const RELAY_AUTH_CLOSE_CODE: u16 = 4001;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayClientMessage {
    Auth {
        #[serde(rename = "apiKey")]
        api_key: String,
    },
    Ack {
        id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    QueryResponse {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayServerMessage {
    AuthOk,
    AuthError { error: String },
    /// One-shot action delivered to authenticated bridge clients.
    Action {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Value>,
    },
    /// Read-only data pull; the broker times out unanswered queries.
    Query {
        id: String,
        resource: String,
        #[serde(rename = "workspaceSlug", default, skip_serializing_if = "Option::is_none")]
        workspace_slug: Option<String>,
    },
    HeartbeatAck,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeAction, EntityKind};

    #[test]
    fn test_sync_envelope_wire_shape() {
        let json = r#"{"type":"session:create","data":{"name":"Test"},"requestId":"r1"}"#;
        let envelope: SyncEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.request_id, "r1");
        match &envelope.command {
            SyncCommand::SessionCreate { name, id, .. } => {
                assert_eq!(name.as_deref(), Some("Test"));
                assert!(id.is_none());
            }
            _ => panic!("Expected SessionCreate"),
        }

        let back = serde_json::to_string(&envelope).unwrap();
        assert!(back.contains("\"type\":\"session:create\""));
        assert!(back.contains("\"requestId\":\"r1\""));
    }

    #[test]
    fn test_sync_command_save_with_messages() {
        let json = r#"{"type":"session:save","data":{"id":"s1","name":"Test","messages":[{"role":"user"},{"role":"assistant"}]},"requestId":"r2"}"#;
        let envelope: SyncEnvelope = serde_json::from_str(json).unwrap();
        match envelope.command {
            SyncCommand::SessionSave { id, messages, .. } => {
                assert_eq!(id, "s1");
                assert_eq!(messages.len(), 2);
            }
            _ => panic!("Expected SessionSave"),
        }
    }

    #[test]
    fn test_sync_command_statuses_save_payload_is_config() {
        let json = r#"{"type":"statuses:save","data":{"version":3,"statuses":[{"id":"open","label":"Open"}],"defaultStatusId":"open"},"requestId":"r3"}"#;
        let envelope: SyncEnvelope = serde_json::from_str(json).unwrap();
        match envelope.command {
            SyncCommand::StatusesSave(config) => {
                assert_eq!(config.version, 3);
                assert_eq!(config.default_status_id.as_deref(), Some("open"));
            }
            _ => panic!("Expected StatusesSave"),
        }
    }

    #[test]
    fn test_unknown_sync_type_is_detectable() {
        assert!(SyncCommand::is_known_type("plan:delete"));
        assert!(!SyncCommand::is_known_type("session:frobnicate"));

        let json = r#"{"type":"session:frobnicate","data":{},"requestId":"r4"}"#;
        assert!(serde_json::from_str::<SyncEnvelope>(json).is_err());
    }

    #[test]
    fn test_known_types_list_matches_enum() {
        // Every listed type must parse into a command (with a permissive body).
        for ty in SyncCommand::KNOWN_TYPES {
            let body = serde_json::json!({
                "type": ty,
                "data": {
                    "id": "x", "slug": "x", "name": "x", "content": "x",
                    "guide": "x", "sessionId": "x", "sdkSessionId": "x",
                    "config": {"name": "x", "type": "x"},
                    "version": 1, "statuses": [], "labels": [],
                },
                "requestId": "r",
            });
            serde_json::from_value::<SyncEnvelope>(body)
                .unwrap_or_else(|e| panic!("{ty} failed to parse: {e}"));
        }
    }

    #[test]
    fn test_response_never_carries_both_data_and_error() {
        let ok = SyncServerMessage::ok("r1", serde_json::json!({"id": "s1"}));
        let json = serde_json::to_string(&ok).unwrap();
        assert!(json.contains("\"data\""));
        assert!(!json.contains("\"error\""));

        let err = SyncServerMessage::error("r1", "boom");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"error\":\"boom\""));
        assert!(!json.contains("\"data\""));
    }

    #[test]
    fn test_broadcast_serialization() {
        let msg = SyncServerMessage::Broadcast {
            event: ChangeEvent {
                entity: EntityKind::Skill,
                action: ChangeAction::Deleted,
                data: serde_json::json!({"slug": "summarize"}),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"broadcast\""));
        assert!(json.contains("\"entity\":\"skill\""));
        assert!(json.contains("\"action\":\"deleted\""));
    }

    #[test]
    fn test_sandbox_tool_message() {
        let json = r#"{"type":"tool","id":"t1","name":"Bash","input":{"command":"ls"}}"#;
        let msg: SandboxClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            SandboxClientMessage::Tool { id, name, input } => {
                assert_eq!(id, "t1");
                assert_eq!(name, "Bash");
                assert_eq!(input["command"], "ls");
            }
            _ => panic!("Expected Tool"),
        }
    }

    #[test]
    fn test_sandbox_execute_message() {
        let json = r#"{"type":"execute","task":"fix the bug","anthropicApiKey":"enc-blob","tokenType":"api_key"}"#;
        let msg: SandboxClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            SandboxClientMessage::Execute {
                task,
                anthropic_api_key,
                token_type,
                context,
            } => {
                assert_eq!(task, "fix the bug");
                assert_eq!(anthropic_api_key, "enc-blob");
                assert_eq!(token_type.as_deref(), Some("api_key"));
                assert!(context.is_none());
            }
            _ => panic!("Expected Execute"),
        }
    }

    #[test]
    fn test_sandbox_server_messages_wire_names() {
        let json = serde_json::to_string(&SandboxServerMessage::tool_ok("t1", "done", Some(0))).unwrap();
        assert!(json.contains("\"type\":\"tool_result\""));
        assert!(json.contains("\"exitCode\":0"));

        let json = serde_json::to_string(&SandboxServerMessage::Stream { data: "line".into() }).unwrap();
        assert!(json.contains("\"type\":\"stream\""));

        let json = serde_json::to_string(&SandboxServerMessage::Complete { exit_code: 2 }).unwrap();
        assert!(json.contains("\"type\":\"complete\""));

        let json = serde_json::to_string(&SandboxServerMessage::HeartbeatAck).unwrap();
        assert_eq!(json, r#"{"type":"heartbeat_ack"}"#);

        let json = serde_json::to_string(&SandboxServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_relay_auth_roundtrip() {
        let json = r#"{"type":"auth","apiKey":"sk-test"}"#;
        let msg: RelayClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            RelayClientMessage::Auth {
                api_key: "sk-test".into()
            }
        );

        let json = serde_json::to_string(&RelayServerMessage::AuthOk).unwrap();
        assert_eq!(json, r#"{"type":"auth_ok"}"#);
    }

    #[test]
    fn test_relay_action_and_ack() {
        let action = RelayServerMessage::Action {
            url: "loft://session/open".into(),
            id: Some("a1".into()),
            attachments: vec![],
        };
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"action\""));
        assert!(!json.contains("attachments"));

        let ack = RelayClientMessage::Ack {
            id: "a1".into(),
            success: true,
            error: None,
        };
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains("\"type\":\"ack\""));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_relay_query_roundtrip() {
        let json = r#"{"type":"query","id":"q1","resource":"sessions","workspaceSlug":"acme"}"#;
        let msg: RelayServerMessage = serde_json::from_str(json).unwrap();
        match msg {
            RelayServerMessage::Query {
                id,
                resource,
                workspace_slug,
            } => {
                assert_eq!(id, "q1");
                assert_eq!(resource, "sessions");
                assert_eq!(workspace_slug.as_deref(), Some("acme"));
            }
            _ => panic!("Expected Query"),
        }

        let reply = RelayClientMessage::QueryResponse {
            id: "q1".into(),
            data: Some(serde_json::json!([{"id": "s1"}])),
            error: None,
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"type\":\"query_response\""));
    }
}
