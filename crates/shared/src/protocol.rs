use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{
        ConnectionEpoch, DialogRequest, DialogResponse, Program, RequestId, ServerStatus,
        SidebarField, StatusSnapshot, TestItemKey, TestStatus,
    },
    error::SyncError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToConsole,
    ToOrchestrator,
}

/// Named logical streams multiplexed over the duplex link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    TestStatusUpdate,
    StatusSnapshot,
    ShowDialog,
    HideDialog,
    DialogResponse,
    TerminalOutput,
    TerminalKey,
    SidebarFieldUpdate,
    SetMachineCode,
    SetServerStatus,
    SelectProgram,
}

impl Topic {
    pub const CONSOLE_BOUND: [Topic; 6] = [
        Topic::TestStatusUpdate,
        Topic::StatusSnapshot,
        Topic::ShowDialog,
        Topic::HideDialog,
        Topic::TerminalOutput,
        Topic::SidebarFieldUpdate,
    ];

    pub const ORCHESTRATOR_BOUND: [Topic; 5] = [
        Topic::DialogResponse,
        Topic::TerminalKey,
        Topic::SetMachineCode,
        Topic::SetServerStatus,
        Topic::SelectProgram,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::TestStatusUpdate => "test-status-update",
            Topic::StatusSnapshot => "status-snapshot",
            Topic::ShowDialog => "show-dialog",
            Topic::HideDialog => "hide-dialog",
            Topic::DialogResponse => "dialog-response",
            Topic::TerminalOutput => "terminal-output",
            Topic::TerminalKey => "terminal-key",
            Topic::SidebarFieldUpdate => "sidebar-field-update",
            Topic::SetMachineCode => "set-machine-code",
            Topic::SetServerStatus => "set-server-status",
            Topic::SelectProgram => "select-program",
        }
    }

    pub fn parse(name: &str) -> Option<Topic> {
        Self::CONSOLE_BOUND
            .into_iter()
            .chain(Self::ORCHESTRATOR_BOUND)
            .find(|topic| topic.as_str() == name)
    }

    pub fn direction(self) -> Direction {
        if Self::CONSOLE_BOUND.contains(&self) {
            Direction::ToConsole
        } else {
            Direction::ToOrchestrator
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message as it travels over the link. The topic stays a raw string so
/// that unknown topics can be reported instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<ConnectionEpoch>,
    #[serde(default)]
    pub payload: Value,
}

impl WireFrame {
    pub fn new(topic: Topic, payload: Value) -> Self {
        Self {
            topic: topic.as_str().to_string(),
            epoch: None,
            payload,
        }
    }

    pub fn with_epoch(mut self, epoch: ConnectionEpoch) -> Self {
        self.epoch = Some(epoch);
        self
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|err| SyncError::malformed(self.topic.clone(), err))
    }

    pub fn decode(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text).map_err(|err| SyncError::malformed("<frame>", err))
    }

    /// Resolves the topic name, checking it flows in `expected` direction.
    pub fn topic_for(&self, expected: Direction) -> Result<Topic, SyncError> {
        let topic = Topic::parse(&self.topic)
            .ok_or_else(|| SyncError::malformed(self.topic.clone(), "unknown topic"))?;
        if topic.direction() != expected {
            return Err(SyncError::malformed(
                self.topic.clone(),
                format!("topic is not valid in direction {expected:?}"),
            ));
        }
        Ok(topic)
    }
}

fn decode_payload<T: DeserializeOwned>(topic: Topic, payload: &Value) -> Result<T, SyncError> {
    T::deserialize(payload).map_err(|err| SyncError::malformed(topic.as_str(), err))
}

fn encode_payload<T: Serialize>(topic: Topic, payload: &T) -> Result<Value, SyncError> {
    serde_json::to_value(payload).map_err(|err| SyncError::malformed(topic.as_str(), err))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub key: TestItemKey,
    pub status: TestStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusSnapshotPayload {
    pub entries: StatusSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogPrompt {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub request: DialogRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutput {
    pub sequence: u64,
    pub epoch: ConnectionEpoch,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalKey {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidebarFieldUpdate {
    pub field: SidebarField,
    pub value: String,
}

/// Everything the orchestrator pushes towards consoles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    StatusUpdate(StatusUpdate),
    StatusSnapshot(StatusSnapshotPayload),
    ShowDialog(DialogPrompt),
    HideDialog,
    TerminalOutput(TerminalOutput),
    SidebarField(SidebarFieldUpdate),
}

impl ConsoleEvent {
    pub fn topic(&self) -> Topic {
        match self {
            ConsoleEvent::StatusUpdate(_) => Topic::TestStatusUpdate,
            ConsoleEvent::StatusSnapshot(_) => Topic::StatusSnapshot,
            ConsoleEvent::ShowDialog(_) => Topic::ShowDialog,
            ConsoleEvent::HideDialog => Topic::HideDialog,
            ConsoleEvent::TerminalOutput(_) => Topic::TerminalOutput,
            ConsoleEvent::SidebarField(_) => Topic::SidebarFieldUpdate,
        }
    }

    pub fn payload(&self) -> Result<Value, SyncError> {
        let topic = self.topic();
        match self {
            ConsoleEvent::StatusUpdate(update) => encode_payload(topic, update),
            ConsoleEvent::StatusSnapshot(snapshot) => encode_payload(topic, snapshot),
            ConsoleEvent::ShowDialog(prompt) => encode_payload(topic, prompt),
            ConsoleEvent::HideDialog => Ok(Value::Null),
            ConsoleEvent::TerminalOutput(output) => encode_payload(topic, output),
            ConsoleEvent::SidebarField(update) => encode_payload(topic, update),
        }
    }

    pub fn decode(topic: Topic, payload: &Value) -> Result<Self, SyncError> {
        match topic {
            Topic::TestStatusUpdate => decode_payload(topic, payload).map(Self::StatusUpdate),
            Topic::StatusSnapshot => decode_payload(topic, payload).map(Self::StatusSnapshot),
            Topic::ShowDialog => decode_payload(topic, payload).map(Self::ShowDialog),
            Topic::HideDialog => Ok(Self::HideDialog),
            Topic::TerminalOutput => decode_payload(topic, payload).map(Self::TerminalOutput),
            Topic::SidebarFieldUpdate => decode_payload(topic, payload).map(Self::SidebarField),
            other => Err(SyncError::malformed(
                other.as_str(),
                "topic does not carry console events",
            )),
        }
    }

    pub fn to_frame(&self, epoch: Option<ConnectionEpoch>) -> Result<WireFrame, SyncError> {
        let mut frame = WireFrame::new(self.topic(), self.payload()?);
        frame.epoch = epoch;
        Ok(frame)
    }

    pub fn from_frame(frame: &WireFrame) -> Result<Self, SyncError> {
        let topic = frame.topic_for(Direction::ToConsole)?;
        Self::decode(topic, &frame.payload)
    }
}

/// Everything a console sends back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorCommand {
    DialogResponse(DialogResponse),
    TerminalKey(TerminalKey),
    SetMachineCode(String),
    SetServerStatus(ServerStatus),
    SelectProgram(Program),
}

impl OrchestratorCommand {
    pub fn topic(&self) -> Topic {
        match self {
            OrchestratorCommand::DialogResponse(_) => Topic::DialogResponse,
            OrchestratorCommand::TerminalKey(_) => Topic::TerminalKey,
            OrchestratorCommand::SetMachineCode(_) => Topic::SetMachineCode,
            OrchestratorCommand::SetServerStatus(_) => Topic::SetServerStatus,
            OrchestratorCommand::SelectProgram(_) => Topic::SelectProgram,
        }
    }

    pub fn payload(&self) -> Result<Value, SyncError> {
        let topic = self.topic();
        match self {
            OrchestratorCommand::DialogResponse(response) => encode_payload(topic, response),
            OrchestratorCommand::TerminalKey(key) => encode_payload(topic, key),
            OrchestratorCommand::SetMachineCode(code) => encode_payload(topic, code),
            OrchestratorCommand::SetServerStatus(status) => encode_payload(topic, status),
            OrchestratorCommand::SelectProgram(program) => encode_payload(topic, program),
        }
    }

    pub fn decode(topic: Topic, payload: &Value) -> Result<Self, SyncError> {
        match topic {
            Topic::DialogResponse => decode_payload(topic, payload).map(Self::DialogResponse),
            Topic::TerminalKey => decode_payload(topic, payload).map(Self::TerminalKey),
            Topic::SetMachineCode => decode_payload(topic, payload).map(Self::SetMachineCode),
            Topic::SetServerStatus => decode_payload(topic, payload).map(Self::SetServerStatus),
            Topic::SelectProgram => decode_payload(topic, payload).map(Self::SelectProgram),
            other => Err(SyncError::malformed(
                other.as_str(),
                "topic does not carry orchestrator commands",
            )),
        }
    }

    pub fn to_frame(&self, epoch: Option<ConnectionEpoch>) -> Result<WireFrame, SyncError> {
        let mut frame = WireFrame::new(self.topic(), self.payload()?);
        frame.epoch = epoch;
        Ok(frame)
    }

    pub fn from_frame(frame: &WireFrame) -> Result<Self, SyncError> {
        let topic = frame.topic_for(Direction::ToOrchestrator)?;
        Self::decode(topic, &frame.payload)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn topic_names_round_trip_through_parse() {
        for topic in Topic::CONSOLE_BOUND
            .into_iter()
            .chain(Topic::ORCHESTRATOR_BOUND)
        {
            assert_eq!(Topic::parse(topic.as_str()), Some(topic));
            let serialized = serde_json::to_value(topic).expect("serialize topic");
            assert_eq!(serialized, json!(topic.as_str()));
        }
        assert_eq!(Topic::parse("test-button-status-update"), None);
    }

    #[test]
    fn status_update_frame_decodes_into_typed_event() {
        let frame = WireFrame::decode(
            r#"{"topic":"test-status-update","epoch":3,"payload":{"key":"hdmi_capture_test","status":"testing"}}"#,
        )
        .expect("frame");
        assert_eq!(frame.epoch, Some(ConnectionEpoch(3)));

        let event = ConsoleEvent::from_frame(&frame).expect("event");
        assert_eq!(
            event,
            ConsoleEvent::StatusUpdate(StatusUpdate {
                key: TestItemKey::from("hdmi_capture_test"),
                status: TestStatus::Testing,
            })
        );
    }

    #[test]
    fn unknown_status_value_is_malformed() {
        let frame = WireFrame::new(
            Topic::TestStatusUpdate,
            json!({ "key": "usb_test", "status": "exploded" }),
        );
        let err = ConsoleEvent::from_frame(&frame).expect_err("must reject");
        assert_eq!(err.kind(), ErrorKind::MalformedPayload);
        assert!(err.to_string().contains("test-status-update"));
    }

    #[test]
    fn unknown_topic_is_malformed() {
        let frame = WireFrame {
            topic: "state-changed".to_string(),
            epoch: None,
            payload: json!({}),
        };
        let err = ConsoleEvent::from_frame(&frame).expect_err("must reject");
        assert_eq!(
            err,
            SyncError::MalformedPayload {
                topic: "state-changed".to_string(),
                reason: "unknown topic".to_string(),
            }
        );
    }

    #[test]
    fn command_topics_are_rejected_on_the_console_side() {
        let frame = OrchestratorCommand::SetMachineCode("3".to_string())
            .to_frame(None)
            .expect("frame");
        assert!(ConsoleEvent::from_frame(&frame).is_err());
        assert_eq!(
            OrchestratorCommand::from_frame(&frame).expect("command"),
            OrchestratorCommand::SetMachineCode("3".to_string())
        );
    }

    #[test]
    fn dialog_prompt_accepts_legacy_button_fields() {
        let request_id = RequestId::new();
        let frame = WireFrame::new(
            Topic::ShowDialog,
            json!({
                "request_id": request_id,
                "message": ["line one", "line two"],
                "buttons": [{ "text": "OK", "isPrimary": true }, { "label": "Cancel" }],
            }),
        );
        let ConsoleEvent::ShowDialog(prompt) = ConsoleEvent::from_frame(&frame).expect("event")
        else {
            panic!("expected show-dialog");
        };
        assert_eq!(prompt.request_id, request_id);
        assert_eq!(prompt.request.text(), "line one\nline two");
        assert!(prompt.request.buttons[0].is_primary);
        assert_eq!(prompt.request.buttons[1].label, "Cancel");
        assert!(!prompt.request.buttons[1].is_primary);
    }

    #[test]
    fn hide_dialog_ignores_payload() {
        let frame = WireFrame::new(Topic::HideDialog, json!({}));
        assert_eq!(
            ConsoleEvent::from_frame(&frame).expect("event"),
            ConsoleEvent::HideDialog
        );
        let encoded = ConsoleEvent::HideDialog
            .to_frame(Some(ConnectionEpoch(2)))
            .expect("frame")
            .encode()
            .expect("encode");
        assert_eq!(encoded, r#"{"topic":"hide-dialog","epoch":2,"payload":null}"#);
    }
}
