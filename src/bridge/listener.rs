use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::output::{Clock, OutputFile, SavedRecording};
use crate::error::TransferError;
use crate::protocol::{Channel, CloseReason};
use crate::transport::{ChannelCallback, ChannelTransport, ListenerId};

/// Status of a transfer, reported via the status callback
#[derive(Debug, Clone)]
pub enum TransferStatus {
    /// A channel was accepted and the stream into the output file started
    Started {
        channel_path: String,
        node_id: String,
        file: PathBuf,
    },
    /// The peer closed its side and the file was saved
    Completed {
        node_id: String,
        recording: SavedRecording,
        reason: CloseReason,
    },
    /// The transfer could not be started or the file could not be saved
    Failed { node_id: String, error: String },
    /// A second channel arrived while one was still in progress
    Rejected {
        channel_path: String,
        node_id: String,
    },
}

pub type StatusCallback = Arc<dyn Fn(TransferStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerPhase {
    Idle,
    Receiving,
    Closed,
}

enum State {
    Idle,
    Receiving { channel: Channel, output: OutputFile },
    Closed,
}

/// Receives one recording over one channel, then retires.
///
/// Accepts a single channel at a time; a second channel-open while a
/// transfer is in progress is closed and rejected. Once the active
/// channel's input closes the listener unregisters itself and ignores
/// everything after.
pub struct TransferListener {
    id: ListenerId,
    transport: Arc<dyn ChannelTransport>,
    receive_dir: PathBuf,
    clock: Clock,
    status_callback: Option<StatusCallback>,
    state: Mutex<State>,
}

impl TransferListener {
    pub fn new(transport: Arc<dyn ChannelTransport>, receive_dir: PathBuf, clock: Clock) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport,
            receive_dir,
            clock,
            status_callback: None,
            state: Mutex::new(State::Idle),
        }
    }

    pub fn with_status_callback(mut self, callback: Option<StatusCallback>) -> Self {
        self.status_callback = callback;
        self
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn phase(&self) -> ListenerPhase {
        match &*self.lock_state() {
            State::Idle => ListenerPhase::Idle,
            State::Receiving { .. } => ListenerPhase::Receiving,
            State::Closed => ListenerPhase::Closed,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, status: TransferStatus) {
        if let Some(callback) = &self.status_callback {
            callback(status);
        }
    }

    fn close_quietly(&self, channel: &Channel) {
        if let Err(e) = self.transport.close(channel) {
            warn!("Failed to close channel {}: {}", channel, e);
        }
    }

    fn abandon(&self, channel: &Channel, err: &TransferError) {
        error!("Could not receive from channel {}: {}", channel, err);
        self.close_quietly(channel);
        self.notify(TransferStatus::Failed {
            node_id: channel.node_id().to_string(),
            error: err.to_string(),
        });
    }
}

impl ChannelCallback for TransferListener {
    fn on_channel_opened(&self, channel: &Channel) -> Result<(), TransferError> {
        let mut state = self.lock_state();
        let busy = match &*state {
            State::Idle => None,
            State::Closed => return Err(TransferError::ListenerClosed),
            State::Receiving { channel: active, .. } => Some(TransferError::ChannelBusy {
                active: active.to_string(),
                rejected: channel.to_string(),
            }),
        };
        if let Some(err) = busy {
            drop(state);
            warn!("Rejecting channel: {}", err);
            self.close_quietly(channel);
            self.notify(TransferStatus::Rejected {
                channel_path: channel.path().to_string(),
                node_id: channel.node_id().to_string(),
            });
            return Err(err);
        }

        info!("Channel opened: {}", channel.path());
        let output = match OutputFile::create(&self.receive_dir, (self.clock)()) {
            Ok(output) => output,
            Err(e) => {
                drop(state);
                self.abandon(channel, &e);
                return Err(e);
            }
        };

        info!("Receiving data from wearable... {}", output.path().display());
        let started = output
            .writer()
            .and_then(|sink| self.transport.receive_file(channel, sink));
        if let Err(e) = started {
            drop(state);
            output.discard();
            self.abandon(channel, &e);
            return Err(e);
        }

        let file = output.path().to_path_buf();
        *state = State::Receiving {
            channel: channel.clone(),
            output,
        };
        drop(state);

        self.notify(TransferStatus::Started {
            channel_path: channel.path().to_string(),
            node_id: channel.node_id().to_string(),
            file,
        });
        Ok(())
    }

    fn on_input_closed(
        &self,
        channel: &Channel,
        reason: CloseReason,
        app_error: i32,
    ) -> Result<(), TransferError> {
        let mut state = self.lock_state();
        let (active, output) = match std::mem::replace(&mut *state, State::Closed) {
            State::Receiving { channel: active, output } if active == *channel => (active, output),
            previous => {
                let err = match previous {
                    State::Closed => TransferError::ListenerClosed,
                    _ => TransferError::UnknownChannel(channel.to_string()),
                };
                *state = previous;
                return Err(err);
            }
        };
        drop(state);

        if reason != CloseReason::Normal {
            warn!(
                "Input on {} closed with {:?} (code {}), keeping what was received",
                active, reason, app_error
            );
        }

        self.close_quietly(&active);
        if !self.transport.unregister_channel_callback(&self.id) {
            debug!("Listener {} was already unregistered", self.id);
        }

        match output.finalize() {
            Ok(recording) => {
                info!(
                    "Recording was saved! {} ({} bytes, sha256 {})",
                    recording.path.display(),
                    recording.bytes,
                    recording.sha256
                );
                self.notify(TransferStatus::Completed {
                    node_id: active.node_id().to_string(),
                    recording,
                    reason,
                });
                Ok(())
            }
            Err(e) => {
                error!("Failed to save recording from {}: {}", active, e);
                self.notify(TransferStatus::Failed {
                    node_id: active.node_id().to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CHANNEL_PATH_SENSOR_READING;
    use crate::transport::mock::MockChannels;
    use chrono::NaiveDate;
    use std::fs;
    use std::sync::atomic::Ordering;
    use tempfile::{tempdir, TempDir};

    fn fixed_clock() -> Clock {
        Arc::new(|| {
            NaiveDate::from_ymd_opt(2024, 3, 5)
                .unwrap()
                .and_hms_opt(10, 7, 0)
                .unwrap()
        })
    }

    fn armed(channels: &Arc<MockChannels>) -> (Arc<TransferListener>, TempDir, Arc<Mutex<Vec<TransferStatus>>>) {
        let dir = tempdir().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener = Arc::new(
            TransferListener::new(channels.clone(), dir.path().to_path_buf(), fixed_clock())
                .with_status_callback(Some(Arc::new(move |status| sink.lock().unwrap().push(status)))),
        );
        channels
            .register_channel_callback(listener.id(), listener.clone())
            .unwrap();
        (listener, dir, events)
    }

    fn channel(token: &str) -> Channel {
        Channel::new(token, CHANNEL_PATH_SENSOR_READING, "watch-1")
    }

    #[test]
    fn receives_one_recording_then_retires() {
        let channels = MockChannels::new();
        let (listener, dir, events) = armed(&channels);
        let ch = channel("a");

        assert_eq!(channels.open(&ch), 1);
        assert_eq!(listener.phase(), ListenerPhase::Receiving);

        channels.deliver(&ch, b"1,accel,0.1 # 0.2 # 9.8,3,3,android.sensor.accelerometer\n");
        channels.finish(&ch, CloseReason::Normal);

        assert_eq!(listener.phase(), ListenerPhase::Closed);
        assert_eq!(channels.closed(), vec![ch]);
        assert!(channels.registry.is_empty());

        let saved = dir.path().join("sensor_data_2024.03.05_10.07.txt");
        let content = fs::read_to_string(saved).unwrap();
        assert!(content.starts_with("1,accel"));

        let events = events.lock().unwrap();
        assert!(matches!(events[0], TransferStatus::Started { .. }));
        assert!(matches!(
            events[1],
            TransferStatus::Completed { reason: CloseReason::Normal, .. }
        ));
    }

    #[test]
    fn second_channel_is_rejected_while_receiving() {
        let channels = MockChannels::new();
        let (listener, _dir, events) = armed(&channels);
        let first = channel("a");
        let second = channel("b");

        listener.on_channel_opened(&first).unwrap();
        let err = listener.on_channel_opened(&second).unwrap_err();

        assert!(matches!(err, TransferError::ChannelBusy { .. }));
        assert_eq!(channels.closed(), vec![second.clone()]);
        assert_eq!(listener.phase(), ListenerPhase::Receiving);

        // The rejected channel's input-closed does not end the active transfer
        assert!(matches!(
            listener.on_input_closed(&second, CloseReason::LocalClose, 0),
            Err(TransferError::UnknownChannel(_))
        ));
        assert_eq!(listener.phase(), ListenerPhase::Receiving);

        channels.deliver(&first, b"data");
        channels.finish(&first, CloseReason::Normal);
        assert_eq!(listener.phase(), ListenerPhase::Closed);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, TransferStatus::Rejected { .. })));
    }

    #[test]
    fn nothing_is_accepted_after_close() {
        let channels = MockChannels::new();
        let (listener, _dir, _events) = armed(&channels);
        let ch = channel("a");

        listener.on_channel_opened(&ch).unwrap();
        listener.on_input_closed(&ch, CloseReason::Normal, 0).unwrap();

        assert!(matches!(
            listener.on_channel_opened(&channel("c")),
            Err(TransferError::ListenerClosed)
        ));
        assert!(matches!(
            listener.on_input_closed(&ch, CloseReason::Normal, 0),
            Err(TransferError::ListenerClosed)
        ));
        assert_eq!(channels.closed().len(), 1);
    }

    #[test]
    fn broken_stream_still_closes_channel_and_keeps_partial_data() {
        let channels = MockChannels::new();
        let (listener, dir, events) = armed(&channels);
        let ch = channel("a");

        channels.open(&ch);
        channels.deliver(&ch, b"partial");
        channels.finish(&ch, CloseReason::Disconnected);

        assert_eq!(listener.phase(), ListenerPhase::Closed);
        assert_eq!(channels.closed(), vec![ch]);
        assert!(channels.registry.is_empty());
        let saved = dir.path().join("sensor_data_2024.03.05_10.07.txt");
        assert_eq!(fs::read(saved).unwrap(), b"partial");
        assert!(matches!(
            events.lock().unwrap()[1],
            TransferStatus::Completed { reason: CloseReason::Disconnected, .. }
        ));
    }

    #[test]
    fn failed_receive_leaves_listener_armed() {
        let channels = MockChannels::new();
        channels.fail_receive.store(true, Ordering::SeqCst);
        let (listener, dir, _events) = armed(&channels);
        let ch = channel("a");

        assert!(listener.on_channel_opened(&ch).is_err());

        assert_eq!(listener.phase(), ListenerPhase::Idle);
        assert_eq!(channels.closed(), vec![ch]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(channels.registry.len(), 1);
    }

    #[test]
    fn unwritable_receive_dir_closes_channel_and_stays_idle() {
        let channels = MockChannels::new();
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("downloads");
        fs::write(&blocker, b"not a directory").unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener = Arc::new(
            TransferListener::new(channels.clone(), blocker.join("nested"), fixed_clock())
                .with_status_callback(Some(Arc::new(move |status| sink.lock().unwrap().push(status)))),
        );
        channels
            .register_channel_callback(listener.id(), listener.clone())
            .unwrap();
        let ch = channel("a");

        assert_eq!(channels.open(&ch), 0);

        assert_eq!(listener.phase(), ListenerPhase::Idle);
        assert_eq!(channels.closed(), vec![ch.clone()]);
        assert!(channels.sinks.lock().unwrap().is_empty());
        assert_eq!(channels.registry.len(), 1);
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [TransferStatus::Failed { node_id, .. }] if node_id == "watch-1"
        ));

        // A later channel into a usable directory still goes through
        fs::remove_file(&blocker).unwrap();
        let retry = channel("b");
        assert_eq!(channels.open(&retry), 1);
        assert_eq!(listener.phase(), ListenerPhase::Receiving);
    }
}
