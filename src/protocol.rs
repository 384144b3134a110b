//! Paths and value types shared by the phone side and the companion side.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const MESSAGE_PATH_RECORDING_STARTED: &str = "/message_path_recording_started";
pub const MESSAGE_PATH_RECORDING_STOPPED: &str = "/message_path_recording_stopped";

/// Channel the companion uses to stream a finished recording.
pub const CHANNEL_PATH_SENSOR_READING: &str = "/channel_path_sensor_reading";
pub const CHANNEL_PATH_PREDICTION: &str = "/channel_path_prediction";
pub const CHANNEL_SENSOR_NUMBER: &str = "/channel_sensor_number";

/// Fixed signal sent to companions to mark start/stop of a remote recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    RecordingStarted,
    RecordingStopped,
}

impl ControlMessage {
    pub fn path(&self) -> &'static str {
        match self {
            Self::RecordingStarted => MESSAGE_PATH_RECORDING_STARTED,
            Self::RecordingStopped => MESSAGE_PATH_RECORDING_STOPPED,
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            MESSAGE_PATH_RECORDING_STARTED => Some(Self::RecordingStarted),
            MESSAGE_PATH_RECORDING_STOPPED => Some(Self::RecordingStopped),
            _ => None,
        }
    }
}

/// Small status a companion pushes on its own channel while recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanionReport {
    /// How many sensors the companion samples
    SensorCount(usize),
    /// Latest on-device activity prediction
    Prediction(String),
}

impl CompanionReport {
    pub fn path(&self) -> &'static str {
        match self {
            Self::SensorCount(_) => CHANNEL_SENSOR_NUMBER,
            Self::Prediction(_) => CHANNEL_PATH_PREDICTION,
        }
    }

    pub fn is_report_path(path: &str) -> bool {
        matches!(path, CHANNEL_SENSOR_NUMBER | CHANNEL_PATH_PREDICTION)
    }

    /// Both reports travel as plain UTF-8 text.
    pub fn to_payload(&self) -> Vec<u8> {
        match self {
            Self::SensorCount(count) => count.to_string().into_bytes(),
            Self::Prediction(label) => label.clone().into_bytes(),
        }
    }

    pub fn from_channel(path: &str, payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?.trim();
        match path {
            CHANNEL_SENSOR_NUMBER => text.parse().ok().map(Self::SensorCount),
            CHANNEL_PATH_PREDICTION => Some(Self::Prediction(text.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for CompanionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SensorCount(count) => write!(f, "sensor number {}", count),
            Self::Prediction(label) => write!(f, "prediction {}", label),
        }
    }
}

/// A reachable peer device as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub display_name: String,
}

impl Node {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// One duplex byte-transfer session with a single peer.
///
/// The token is assigned by the transport and distinguishes two sessions
/// opened on the same path by the same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    token: String,
    path: String,
    node_id: String,
}

impl Channel {
    pub fn new(token: impl Into<String>, path: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            path: path.into(),
            node_id: node_id.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} [{}]", self.path, self.node_id, self.token)
    }
}

/// Why the input side of a channel closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// The peer finished sending.
    Normal,
    /// The connection dropped mid-stream.
    Disconnected,
    /// The peer closed the channel explicitly.
    RemoteClose,
    /// This side closed the channel.
    LocalClose,
}
