use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifies one testable unit on the station, e.g. `hdmi_capture_test`.
///
/// The set of keys is open: the orchestrator may introduce new keys at any
/// time and consumers store them without validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestItemKey(String);

impl TestItemKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TestItemKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TestItemKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    #[default]
    Untested,
    Testing,
    Repairing,
    Success,
    Failed,
    Hidden,
}

impl TestStatus {
    pub const ALL: [TestStatus; 6] = [
        TestStatus::Untested,
        TestStatus::Testing,
        TestStatus::Repairing,
        TestStatus::Success,
        TestStatus::Failed,
        TestStatus::Hidden,
    ];

    /// The item is busy; consoles must not let the operator interact with it.
    pub fn is_in_progress(self) -> bool {
        matches!(self, TestStatus::Testing | TestStatus::Repairing)
    }

    /// Holds until the item is retested.
    pub fn is_terminal(self) -> bool {
        matches!(self, TestStatus::Success | TestStatus::Failed)
    }

    pub fn is_visible(self) -> bool {
        self != TestStatus::Hidden
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Untested => "untested",
            TestStatus::Testing => "testing",
            TestStatus::Repairing => "repairing",
            TestStatus::Success => "success",
            TestStatus::Failed => "failed",
            TestStatus::Hidden => "hidden",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown value '{value}' for {kind}")]
pub struct ParseValueError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseValueError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl FromStr for TestStatus {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| ParseValueError::new("test status", s))
    }
}

/// Full mapping of every known test item to its latest status.
pub type StatusSnapshot = BTreeMap<TestItemKey, TestStatus>;

/// Generation counter of the duplex link; bumped on every (re)connect.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConnectionEpoch(pub u64);

impl ConnectionEpoch {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ConnectionEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogButton {
    #[serde(alias = "text")]
    pub label: String,
    #[serde(default, alias = "isPrimary")]
    pub is_primary: bool,
}

impl DialogButton {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            is_primary: false,
        }
    }

    pub fn primary(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            is_primary: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogRequest {
    pub message: Vec<String>,
    pub buttons: Vec<DialogButton>,
}

impl DialogRequest {
    /// Builds a request from free text; embedded newlines become separate lines.
    pub fn new(message: &str) -> Self {
        Self {
            message: message.lines().map(str::to_string).collect(),
            buttons: Vec::new(),
        }
    }

    pub fn button(mut self, label: impl Into<String>) -> Self {
        self.buttons.push(DialogButton::new(label));
        self
    }

    pub fn primary_button(mut self, label: impl Into<String>) -> Self {
        self.buttons.push(DialogButton::primary(label));
        self
    }

    pub fn text(&self) -> String {
        self.message.join("\n")
    }

    pub fn has_button(&self, label: &str) -> bool {
        self.buttons.iter().any(|button| button.label == label)
    }
}

/// Reserved label carried by a response when the operator dismissed the prompt.
pub const CANCEL_LABEL: &str = "__cancel__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogResponse {
    pub request_id: RequestId,
    pub button_label: String,
}

impl DialogResponse {
    pub fn new(request_id: RequestId, button_label: impl Into<String>) -> Self {
        Self {
            request_id,
            button_label: button_label.into(),
        }
    }

    pub fn cancelled(request_id: RequestId) -> Self {
        Self::new(request_id, CANCEL_LABEL)
    }

    pub fn is_cancel(&self) -> bool {
        self.button_label == CANCEL_LABEL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Online,
    #[default]
    Offline,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Online => "online",
            ServerStatus::Offline => "offline",
        }
    }
}

impl FromStr for ServerStatus {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "online" => Ok(ServerStatus::Online),
            "offline" => Ok(ServerStatus::Offline),
            other => Err(ParseValueError::new("server status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Program {
    Production,
    Post,
}

impl FromStr for Program {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "production" => Ok(Program::Production),
            "post" => Ok(Program::Post),
            other => Err(ParseValueError::new("program", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SidebarField {
    MachineCode,
    ServerStatus,
    UploadCount,
    CurrentDevice,
    SerialNumber,
    TargetIp,
}

impl SidebarField {
    pub const ALL: [SidebarField; 6] = [
        SidebarField::MachineCode,
        SidebarField::ServerStatus,
        SidebarField::UploadCount,
        SidebarField::CurrentDevice,
        SidebarField::SerialNumber,
        SidebarField::TargetIp,
    ];
}

/// Station details shown next to the test panel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SidebarInfo {
    pub machine_code: String,
    pub server_status: ServerStatus,
    pub upload_count: u32,
    pub current_device: String,
    pub serial_number: String,
    pub target_ip: String,
}

impl SidebarInfo {
    pub fn value_of(&self, field: SidebarField) -> String {
        match field {
            SidebarField::MachineCode => self.machine_code.clone(),
            SidebarField::ServerStatus => self.server_status.as_str().to_string(),
            SidebarField::UploadCount => self.upload_count.to_string(),
            SidebarField::CurrentDevice => self.current_device.clone(),
            SidebarField::SerialNumber => self.serial_number.clone(),
            SidebarField::TargetIp => self.target_ip.clone(),
        }
    }

    /// Stores `value` into `field`. Returns whether anything changed.
    pub fn set(&mut self, field: SidebarField, value: &str) -> Result<bool, ParseValueError> {
        fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
            if *slot == value {
                return false;
            }
            *slot = value;
            true
        }

        let changed = match field {
            SidebarField::MachineCode => replace(&mut self.machine_code, value.to_string()),
            SidebarField::ServerStatus => replace(&mut self.server_status, value.parse()?),
            SidebarField::UploadCount => {
                let count = value
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| ParseValueError::new("upload count", value))?;
                replace(&mut self.upload_count, count)
            }
            SidebarField::CurrentDevice => replace(&mut self.current_device, value.to_string()),
            SidebarField::SerialNumber => replace(&mut self.serial_number, value.to_string()),
            SidebarField::TargetIp => replace(&mut self.target_ip, value.to_string()),
        };
        Ok(changed)
    }
}
