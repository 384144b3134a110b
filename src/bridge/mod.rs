//! Command surface exposed to the host application.
//!
//! `startRecording` and `stopRecording` are the only actions. Every failure
//! inside a command, panics included, ends at the command boundary and is
//! reported to the host as one generic string; the detail only goes to the log.

pub mod broadcaster;
pub mod listener;
pub mod output;
pub mod registry;

pub use broadcaster::{Broadcaster, CompletionCount};
pub use listener::{ListenerPhase, StatusCallback, TransferListener, TransferStatus};
pub use output::{output_file_name, system_clock, Clock, OutputFile, SavedRecording};
pub use registry::NodeRegistry;

use futures_util::FutureExt;
use log::{debug, error, info};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::error::{BridgeError, TransferError};
use crate::protocol::ControlMessage;
use crate::transport::ChannelTransport;

pub const RECORDING_STARTED_REPLY: &str = "Recording started!";
pub const RECORDING_SAVED_REPLY: &str = "Recording is saved!";
pub const UNEXPECTED_ERROR_REPLY: &str = "Unexpected error has occurred!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartRecording,
    StopRecording,
}

impl Command {
    pub fn action(&self) -> &'static str {
        match self {
            Self::StartRecording => "startRecording",
            Self::StopRecording => "stopRecording",
        }
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "startRecording" => Ok(Self::StartRecording),
            "stopRecording" => Ok(Self::StopRecording),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action())
    }
}

/// What the host receives back from a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum CommandResult {
    Success(&'static str),
    Error(&'static str),
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Success(message) | Self::Error(message) => message,
        }
    }
}

/// Wires the broadcaster and channel transport into the two host commands.
pub struct SensorBridge {
    broadcaster: Broadcaster,
    channels: Arc<dyn ChannelTransport>,
    receive_dir: PathBuf,
    clock: Clock,
    status_callback: Option<StatusCallback>,
    armed: Mutex<Option<Arc<TransferListener>>>,
}

impl SensorBridge {
    pub fn new(broadcaster: Broadcaster, channels: Arc<dyn ChannelTransport>, receive_dir: PathBuf) -> Self {
        Self {
            broadcaster,
            channels,
            receive_dir,
            clock: system_clock(),
            status_callback: None,
            armed: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.status_callback = Some(callback);
        self
    }

    /// Dispatches a host action by name. `None` means the action is not ours.
    pub async fn execute(&self, action: &str) -> Option<CommandResult> {
        info!("Plugin was called with: {}", action);
        match action.parse::<Command>() {
            Ok(Command::StartRecording) => Some(self.start_recording().await),
            Ok(Command::StopRecording) => Some(self.stop_recording().await),
            Err(e) => {
                debug!("{}", e);
                None
            }
        }
    }

    pub async fn start_recording(&self) -> CommandResult {
        guarded(Command::StartRecording, async {
            self.broadcaster
                .broadcast(ControlMessage::RecordingStarted)
                .await?;
            Ok::<_, BridgeError>(RECORDING_STARTED_REPLY)
        })
        .await
    }

    /// Arms the transfer listener before asking companions to stop, so a
    /// companion that answers immediately always finds someone listening.
    pub async fn stop_recording(&self) -> CommandResult {
        guarded(Command::StopRecording, async {
            self.arm_listener()?;
            self.broadcaster
                .broadcast(ControlMessage::RecordingStopped)
                .await?;
            Ok::<_, BridgeError>(RECORDING_SAVED_REPLY)
        })
        .await
    }

    /// Phase of the most recently armed listener, if any.
    pub fn listener_phase(&self) -> Option<ListenerPhase> {
        self.lock_armed().as_ref().map(|listener| listener.phase())
    }

    fn lock_armed(&self) -> std::sync::MutexGuard<'_, Option<Arc<TransferListener>>> {
        self.armed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reuses a listener that has not finished yet; repeated stops never
    /// stack registrations.
    fn arm_listener(&self) -> Result<Arc<TransferListener>, TransferError> {
        let mut armed = self.lock_armed();
        if let Some(listener) = armed.as_ref() {
            if listener.phase() != ListenerPhase::Closed {
                debug!("Transfer listener {} is still armed", listener.id());
                return Ok(listener.clone());
            }
        }

        let listener = Arc::new(
            TransferListener::new(self.channels.clone(), self.receive_dir.clone(), self.clock.clone())
                .with_status_callback(self.status_callback.clone()),
        );
        self.channels
            .register_channel_callback(listener.id(), listener.clone())?;
        debug!("Registered transfer listener {}", listener.id());

        *armed = Some(listener.clone());
        Ok(listener)
    }
}

async fn guarded<F>(command: Command, work: F) -> CommandResult
where
    F: Future<Output = Result<&'static str, BridgeError>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(reply)) => CommandResult::Success(reply),
        Ok(Err(e)) => {
            error!("{} failed: {}", command, e);
            CommandResult::Error(UNEXPECTED_ERROR_REPLY)
        }
        Err(_) => {
            error!("{} panicked", command);
            CommandResult::Error(UNEXPECTED_ERROR_REPLY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::registry::DEFAULT_DISCOVERY_TIMEOUT;
    use crate::protocol::{Channel, CloseReason, CHANNEL_PATH_SENSOR_READING, MESSAGE_PATH_RECORDING_STOPPED};
    use crate::transport::mock::{MockChannels, MockNodes, MockSender};
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    struct Harness {
        bridge: SensorBridge,
        sender: Arc<MockSender>,
        channels: Arc<MockChannels>,
        dir: tempfile::TempDir,
    }

    fn harness(nodes: Arc<MockNodes>) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let channels = MockChannels::new();
        let sender = MockSender::observing(channels.registry.clone());
        let dir = tempdir().unwrap();
        let broadcaster = Broadcaster::new(
            NodeRegistry::new(nodes, DEFAULT_DISCOVERY_TIMEOUT),
            sender.clone(),
        );
        let bridge = SensorBridge::new(broadcaster, channels.clone(), dir.path().to_path_buf());
        Harness {
            bridge,
            sender,
            channels,
            dir,
        }
    }

    #[tokio::test]
    async fn start_recording_reports_success() {
        let h = harness(MockNodes::with_nodes(2));
        let result = h.bridge.execute("startRecording").await;
        assert_eq!(result, Some(CommandResult::Success("Recording started!")));
        assert_eq!(h.sender.sent().len(), 2);
        assert!(h.channels.registry.is_empty());
    }

    #[tokio::test]
    async fn start_recording_with_no_nodes_still_succeeds() {
        let h = harness(MockNodes::failing());
        assert_eq!(
            h.bridge.start_recording().await,
            CommandResult::Success(RECORDING_STARTED_REPLY)
        );
    }

    #[tokio::test]
    async fn transport_failure_becomes_generic_error() {
        let h = harness(MockNodes::with_nodes(1));
        h.sender.shut_down.store(true, Ordering::SeqCst);

        let start = h.bridge.start_recording().await;
        assert_eq!(start, CommandResult::Error("Unexpected error has occurred!"));
        assert!(!start.is_success());

        let stop = h.bridge.stop_recording().await;
        assert_eq!(stop.message(), UNEXPECTED_ERROR_REPLY);
    }

    #[tokio::test]
    async fn stop_registers_listener_before_broadcasting() {
        let h = harness(MockNodes::with_nodes(3));
        let result = h.bridge.execute("stopRecording").await;

        assert_eq!(result, Some(CommandResult::Success("Recording is saved!")));
        assert_eq!(*h.sender.callbacks_at_send.lock().unwrap(), vec![1, 1, 1]);
        assert!(h
            .sender
            .sent()
            .iter()
            .all(|(_, path)| path == MESSAGE_PATH_RECORDING_STOPPED));
        assert_eq!(h.bridge.listener_phase(), Some(ListenerPhase::Idle));
    }

    #[tokio::test]
    async fn stop_with_no_nodes_still_reports_saved() {
        let h = harness(MockNodes::with_nodes(0));
        assert_eq!(
            h.bridge.stop_recording().await,
            CommandResult::Success(RECORDING_SAVED_REPLY)
        );
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn repeated_stops_do_not_stack_listeners() {
        let h = harness(MockNodes::with_nodes(1));
        h.bridge.stop_recording().await;
        h.bridge.stop_recording().await;
        assert_eq!(h.channels.registry.len(), 1);

        // Finish the pending transfer; the next stop arms a fresh listener
        let ch = Channel::new("t1", CHANNEL_PATH_SENSOR_READING, "node-0");
        assert_eq!(h.channels.open(&ch), 1);
        h.channels.deliver(&ch, b"readings");
        h.channels.finish(&ch, CloseReason::Normal);
        assert_eq!(h.bridge.listener_phase(), Some(ListenerPhase::Closed));
        assert!(h.channels.registry.is_empty());
        assert_eq!(std::fs::read_dir(h.dir.path()).unwrap().count(), 1);

        h.bridge.stop_recording().await;
        assert_eq!(h.channels.registry.len(), 1);
        assert_eq!(h.bridge.listener_phase(), Some(ListenerPhase::Idle));
    }

    #[tokio::test]
    async fn stop_during_transfer_keeps_the_receiving_listener() {
        let h = harness(MockNodes::with_nodes(1));
        h.bridge.stop_recording().await;

        let ch = Channel::new("t1", CHANNEL_PATH_SENSOR_READING, "node-0");
        assert_eq!(h.channels.open(&ch), 1);
        h.channels.deliver(&ch, b"first half ");
        assert_eq!(h.bridge.listener_phase(), Some(ListenerPhase::Receiving));

        assert_eq!(
            h.bridge.stop_recording().await,
            CommandResult::Success(RECORDING_SAVED_REPLY)
        );
        assert_eq!(h.bridge.listener_phase(), Some(ListenerPhase::Receiving));
        assert_eq!(h.channels.registry.len(), 1);
        assert!(h.channels.closed().is_empty());

        h.channels.deliver(&ch, b"second half");
        h.channels.finish(&ch, CloseReason::Normal);

        assert_eq!(h.bridge.listener_phase(), Some(ListenerPhase::Closed));
        assert!(h.channels.registry.is_empty());
        let saved: Vec<_> = std::fs::read_dir(h.dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(saved.len(), 1);
        assert_eq!(std::fs::read(&saved[0]).unwrap(), b"first half second half");
    }

    #[tokio::test]
    async fn registration_failure_becomes_generic_error() {
        let h = harness(MockNodes::with_nodes(2));
        h.channels.fail_register.store(true, Ordering::SeqCst);

        assert_eq!(
            h.bridge.stop_recording().await,
            CommandResult::Error(UNEXPECTED_ERROR_REPLY)
        );
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn panics_stop_at_the_command_boundary() {
        let result = guarded(Command::StartRecording, async {
            if true {
                panic!("transport bug");
            }
            Ok::<_, BridgeError>(RECORDING_STARTED_REPLY)
        })
        .await;
        assert_eq!(result, CommandResult::Error(UNEXPECTED_ERROR_REPLY));
    }

    #[tokio::test]
    async fn unknown_actions_are_not_handled() {
        let h = harness(MockNodes::with_nodes(1));
        assert_eq!(h.bridge.execute("pauseRecording").await, None);
        assert!(h.sender.sent().is_empty());
    }

    #[test]
    fn results_serialize_for_the_host() {
        let json = serde_json::to_string(&CommandResult::Success(RECORDING_SAVED_REPLY)).unwrap();
        assert_eq!(json, r#"{"status":"success","message":"Recording is saved!"}"#);
    }
}
