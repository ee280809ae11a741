//! Typed views over relay envelopes.
//!
//! Three parties speak through the relay:
//!
//! - controlled endpoints open with [`Hello::Agent`], then send heartbeats and
//!   result reports ([`AgentFrame`]);
//! - control sessions open with [`Hello::Controller`], then send commands
//!   addressed to target identities and answer pings ([`ControlFrame`]);
//! - the relay itself only originates [`ServerMessage`]s.
//!
//! Every inbound frame is validated against these closed unions before the
//! relay acts on it, while the original [`Envelope`] is what gets forwarded.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::envelope::{ACTION_FIELD, Envelope, TYPE_FIELD};

pub const ROLE_AGENT: &str = "agent";
pub const ROLE_CONTROLLER: &str = "controller";
pub const HEARTBEAT_ACTION: &str = "heartbeat";
pub const PONG_TYPE: &str = "pong";

pub const DEFAULT_PORT: u16 = 5000;

/// Period at which controlled endpoints are expected to send heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Errors raised when a well-formed frame does not match the protocol.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("missing `{0}` discriminator")]
    MissingDiscriminator(&'static str),

    #[error("unknown {field} `{value}`")]
    UnknownDiscriminator { field: &'static str, value: String },

    #[error("invalid {context}: {source}")]
    Invalid {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("agent identity must not be empty")]
    EmptyIdentity,
}

/// Self-reported metadata of a controlled endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    pub ip: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<String>,
}

impl HostInfo {
    /// Name the endpoint chose for itself, falling back to its host name.
    #[must_use]
    pub fn reported_name(&self) -> &str {
        self.custom_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.hostname)
    }
}

/// First frame of every connection; classifies its role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Hello {
    Agent { agent_id: String, info: HostInfo },
    Controller,
}

impl Hello {
    /// Classify a first frame.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] when the role is missing or unknown, or when an
    /// agent registration lacks its identity or required metadata.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, FrameError> {
        match envelope.kind() {
            None => Err(FrameError::MissingDiscriminator(TYPE_FIELD)),
            Some(ROLE_AGENT | ROLE_CONTROLLER) => {
                let hello: Hello = envelope.parse().map_err(|source| FrameError::Invalid {
                    context: "registration",
                    source,
                })?;
                if let Hello::Agent { agent_id, .. } = &hello
                    && agent_id.trim().is_empty()
                {
                    return Err(FrameError::EmptyIdentity);
                }
                Ok(hello)
            }
            Some(other) => Err(FrameError::UnknownDiscriminator {
                field: TYPE_FIELD,
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    Low,
    Medium,
    High,
    Ultra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

fn default_clicks() -> u32 {
    1
}

/// Every action a control session may issue.
///
/// `Register` and `ListHosts` are answered by the relay; all other actions are
/// forwarded to the named targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    Register,
    ListHosts,
    Screenshot,
    StartVideo {
        quality: VideoQuality,
    },
    StopVideo,
    RunCommand {
        command: String,
        #[serde(default)]
        as_admin: bool,
    },
    MouseMove {
        x: i32,
        y: i32,
    },
    MouseClick {
        button: MouseButton,
        #[serde(default = "default_clicks")]
        clicks: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<i32>,
    },
    MouseScroll {
        dx: i32,
        dy: i32,
    },
    KeyboardPress {
        key: String,
    },
    KeyboardType {
        text: String,
    },
    GetDrives,
    ListFiles {
        path: String,
    },
    OpenFile {
        filepath: String,
    },
    DownloadFile {
        filepath: String,
    },
    UploadFile {
        filepath: String,
        content: String,
    },
    DeleteFile {
        filepath: String,
    },
    CreateFolder {
        folderpath: String,
    },
}

impl ControlCommand {
    /// Whether the relay answers this command itself instead of forwarding it.
    #[must_use]
    pub fn is_presence_request(&self) -> bool {
        matches!(self, ControlCommand::Register | ControlCommand::ListHosts)
    }

    /// Wire name of the action.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Register => "register",
            ControlCommand::ListHosts => "list_hosts",
            ControlCommand::Screenshot => "screenshot",
            ControlCommand::StartVideo { .. } => "start_video",
            ControlCommand::StopVideo => "stop_video",
            ControlCommand::RunCommand { .. } => "run_command",
            ControlCommand::MouseMove { .. } => "mouse_move",
            ControlCommand::MouseClick { .. } => "mouse_click",
            ControlCommand::MouseScroll { .. } => "mouse_scroll",
            ControlCommand::KeyboardPress { .. } => "keyboard_press",
            ControlCommand::KeyboardType { .. } => "keyboard_type",
            ControlCommand::GetDrives => "get_drives",
            ControlCommand::ListFiles { .. } => "list_files",
            ControlCommand::OpenFile { .. } => "open_file",
            ControlCommand::DownloadFile { .. } => "download_file",
            ControlCommand::UploadFile { .. } => "upload_file",
            ControlCommand::DeleteFile { .. } => "delete_file",
            ControlCommand::CreateFolder { .. } => "create_folder",
        }
    }

    /// Build the envelope a control session sends for this command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails to serialize.
    pub fn to_envelope(&self, targets: &[String]) -> Result<Envelope, serde_json::Error> {
        Ok(Envelope::from_serializable(self)?
            .with_field(TYPE_FIELD, ROLE_CONTROLLER)
            .with_field(crate::envelope::TARGETS_FIELD, targets.to_vec()))
    }
}

/// A frame received from a classified control session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Pong,
    Command {
        command: ControlCommand,
        targets: Vec<String>,
    },
}

impl ControlFrame {
    /// # Errors
    ///
    /// Returns a [`FrameError`] if the frame is neither a pong nor a valid command.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, FrameError> {
        if envelope.kind() == Some(PONG_TYPE) && envelope.action().is_none() {
            return Ok(ControlFrame::Pong);
        }
        if envelope.action().is_none() {
            return Err(FrameError::MissingDiscriminator(ACTION_FIELD));
        }
        let command: ControlCommand = envelope.parse().map_err(|source| FrameError::Invalid {
            context: "command",
            source,
        })?;
        Ok(ControlFrame::Command {
            command,
            targets: envelope.targets(),
        })
    }
}

/// Kinds of result reports a controlled endpoint may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Screenshot,
    VideoFrame,
    CommandResult,
    Error,
    DrivesList,
    FileList,
    FileOpen,
    FileDownload,
    FileUpload,
    FileDelete,
    FolderCreate,
}

impl ResultKind {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(value.to_string())).ok()
    }
}

/// A frame received from a classified controlled endpoint.
///
/// Everything that is not a heartbeat is relayed to the consoles; frames
/// outside [`ResultKind`] are kept as [`AgentFrame::Unrecognized`] so newer
/// endpoint handlers still reach them.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentFrame {
    Heartbeat,
    Report { kind: ResultKind, envelope: Envelope },
    Unrecognized(Envelope),
}

impl AgentFrame {
    #[must_use]
    pub fn from_envelope(envelope: Envelope) -> Self {
        if envelope.action() == Some(HEARTBEAT_ACTION) {
            return AgentFrame::Heartbeat;
        }
        let kind = envelope.kind().and_then(ResultKind::parse);
        match kind {
            Some(kind) => AgentFrame::Report { kind, envelope },
            None => AgentFrame::Unrecognized(envelope),
        }
    }
}

/// One row of the presence roster as sent to control sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub id: String,
    pub hostname: String,
    pub ip: String,
    pub platform: String,
    pub custom_name: String,
}

/// Messages originated by the relay itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    HostList { hosts: Vec<HostEntry> },
    Ping,
    Error { message: String },
}

impl ServerMessage {
    #[must_use]
    pub fn target_offline(target: &str) -> Self {
        ServerMessage::Error {
            message: format!("target {target} is not online"),
        }
    }

    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        // Internally tagged unit/struct variants always serialize to an object.
        Envelope::from_serializable(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: serde_json::Value) -> Envelope {
        Envelope::from_value(value).unwrap()
    }

    fn agent_hello() -> serde_json::Value {
        json!({
            "type": "agent",
            "agent_id": "office-pc_12",
            "info": {
                "hostname": "office-pc",
                "custom_name": "Front desk",
                "ip": "10.0.0.12",
                "platform": "Windows-10",
                "system": "Windows",
                "processor": "x86_64"
            }
        })
    }

    #[test]
    fn test_hello_agent() {
        let hello = Hello::from_envelope(&envelope(agent_hello())).unwrap();
        match hello {
            Hello::Agent { agent_id, info } => {
                assert_eq!(agent_id, "office-pc_12");
                assert_eq!(info.hostname, "office-pc");
                assert_eq!(info.reported_name(), "Front desk");
                assert_eq!(info.system.as_deref(), Some("Windows"));
            }
            Hello::Controller => panic!("Expected agent"),
        }
    }

    #[test]
    fn test_hello_controller_ignores_extra_fields() {
        let hello =
            Hello::from_envelope(&envelope(json!({"type": "controller", "action": "register"})))
                .unwrap();
        assert_eq!(hello, Hello::Controller);
    }

    #[test]
    fn test_hello_missing_type() {
        let err = Hello::from_envelope(&envelope(json!({"agent_id": "x"}))).unwrap_err();
        assert!(matches!(err, FrameError::MissingDiscriminator("type")));
    }

    #[test]
    fn test_hello_unknown_role() {
        let err = Hello::from_envelope(&envelope(json!({"type": "viewer"}))).unwrap_err();
        assert!(err.to_string().contains("viewer"));
    }

    #[test]
    fn test_hello_agent_requires_identity() {
        let mut value = agent_hello();
        value.as_object_mut().unwrap().remove("agent_id");
        let err = Hello::from_envelope(&envelope(value)).unwrap_err();
        assert!(matches!(err, FrameError::Invalid { .. }));

        let mut value = agent_hello();
        value["agent_id"] = json!("   ");
        let err = Hello::from_envelope(&envelope(value)).unwrap_err();
        assert!(matches!(err, FrameError::EmptyIdentity));
    }

    #[test]
    fn test_hello_agent_requires_metadata() {
        let mut value = agent_hello();
        value["info"].as_object_mut().unwrap().remove("ip");
        assert!(Hello::from_envelope(&envelope(value)).is_err());
    }

    #[test]
    fn test_reported_name_falls_back_to_hostname() {
        let info = HostInfo {
            hostname: "lab-3".to_string(),
            custom_name: Some(String::new()),
            ip: "10.0.0.3".to_string(),
            platform: "Linux".to_string(),
            system: None,
            processor: None,
        };
        assert_eq!(info.reported_name(), "lab-3");
    }

    #[test]
    fn test_control_frame_command() {
        let frame = ControlFrame::from_envelope(&envelope(json!({
            "type": "controller",
            "action": "run_command",
            "targets": ["A", "C"],
            "command": "ipconfig",
            "as_admin": true
        })))
        .unwrap();

        assert_eq!(
            frame,
            ControlFrame::Command {
                command: ControlCommand::RunCommand {
                    command: "ipconfig".to_string(),
                    as_admin: true,
                },
                targets: vec!["A".to_string(), "C".to_string()],
            }
        );
    }

    #[test]
    fn test_control_frame_pong() {
        let frame = ControlFrame::from_envelope(&envelope(json!({"type": "pong"}))).unwrap();
        assert_eq!(frame, ControlFrame::Pong);
    }

    #[test]
    fn test_control_frame_rejects_missing_fields() {
        let err = ControlFrame::from_envelope(&envelope(json!({
            "action": "mouse_move",
            "targets": ["A"],
            "x": 10
        })))
        .unwrap_err();
        assert!(matches!(err, FrameError::Invalid { context: "command", .. }));
    }

    #[test]
    fn test_control_frame_rejects_unknown_action() {
        let err = ControlFrame::from_envelope(&envelope(json!({"action": "format_disk"})))
            .unwrap_err();
        assert!(err.to_string().contains("format_disk"));
    }

    #[test]
    fn test_control_frame_without_action() {
        let err = ControlFrame::from_envelope(&envelope(json!({"type": "controller"})))
            .unwrap_err();
        assert!(matches!(err, FrameError::MissingDiscriminator("action")));
    }

    #[test]
    fn test_mouse_click_defaults() {
        let frame = ControlFrame::from_envelope(&envelope(json!({
            "action": "mouse_click",
            "button": "right"
        })))
        .unwrap();
        let ControlFrame::Command { command, targets } = frame else {
            panic!("Expected command");
        };
        assert!(targets.is_empty());
        assert_eq!(
            command,
            ControlCommand::MouseClick {
                button: MouseButton::Right,
                clicks: 1,
                x: None,
                y: None,
            }
        );
    }

    #[test]
    fn test_command_name_matches_wire_action() {
        let commands = [
            ControlCommand::ListHosts,
            ControlCommand::StartVideo {
                quality: VideoQuality::Ultra,
            },
            ControlCommand::UploadFile {
                filepath: "C:\\tmp\\a.txt".to_string(),
                content: "aGk=".to_string(),
            },
            ControlCommand::CreateFolder {
                folderpath: "/srv/new".to_string(),
            },
        ];
        for command in commands {
            let env = command.to_envelope(&[]).unwrap();
            assert_eq!(env.action(), Some(command.name()));
            assert_eq!(env.kind(), Some(ROLE_CONTROLLER));
        }
    }

    #[test]
    fn test_presence_requests() {
        assert!(ControlCommand::Register.is_presence_request());
        assert!(ControlCommand::ListHosts.is_presence_request());
        assert!(!ControlCommand::Screenshot.is_presence_request());
    }

    #[test]
    fn test_agent_frame_heartbeat() {
        let frame = AgentFrame::from_envelope(envelope(json!({"action": "heartbeat"})));
        assert_eq!(frame, AgentFrame::Heartbeat);
    }

    #[test]
    fn test_agent_frame_report() {
        let frame = AgentFrame::from_envelope(envelope(json!({
            "type": "command_result",
            "command": "whoami",
            "output": "svc"
        })));
        let AgentFrame::Report { kind, envelope } = frame else {
            panic!("Expected report");
        };
        assert_eq!(kind, ResultKind::CommandResult);
        assert_eq!(envelope.get("output"), Some(&json!("svc")));
    }

    #[test]
    fn test_agent_frame_unknown_kind_is_kept() {
        let raw = envelope(json!({"type": "telemetry", "cpu": 42}));
        let frame = AgentFrame::from_envelope(raw.clone());
        assert_eq!(frame, AgentFrame::Unrecognized(raw));

        let untyped = envelope(json!({"note": "no type"}));
        assert!(matches!(
            AgentFrame::from_envelope(untyped),
            AgentFrame::Unrecognized(_)
        ));
    }

    #[test]
    fn test_result_kind_parse() {
        assert_eq!(ResultKind::parse("video_frame"), Some(ResultKind::VideoFrame));
        assert_eq!(ResultKind::parse("folder_create"), Some(ResultKind::FolderCreate));
        assert_eq!(ResultKind::parse("nope"), None);
    }

    #[test]
    fn test_server_message_shapes() {
        let list = ServerMessage::HostList {
            hosts: vec![HostEntry {
                id: "A".to_string(),
                hostname: "a-host".to_string(),
                ip: "10.0.0.1".to_string(),
                platform: "Linux".to_string(),
                custom_name: "Alpha".to_string(),
            }],
        }
        .to_envelope();
        assert_eq!(list.kind(), Some("host_list"));
        assert_eq!(list.get("hosts").unwrap()[0]["custom_name"], "Alpha");

        assert_eq!(ServerMessage::Ping.to_envelope().kind(), Some("ping"));

        let err = ServerMessage::target_offline("C").to_envelope();
        assert_eq!(err.kind(), Some("error"));
        assert!(err.get("message").unwrap().as_str().unwrap().contains('C'));
    }

    #[test]
    fn test_server_message_parses_back() {
        let env = ServerMessage::Ping.to_envelope();
        let parsed: ServerMessage = env.parse().unwrap();
        assert_eq!(parsed, ServerMessage::Ping);
    }
}
