use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{ChannelCallback, ListenerId};
use crate::protocol::{Channel, CloseReason};

/// Registered channel callbacks and fan-out of lifecycle events.
///
/// Dispatch works on a snapshot, so a callback may unregister itself (or
/// others) while being notified.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: Arc<Mutex<HashMap<ListenerId, Arc<dyn ChannelCallback>>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `id` was already registered; the existing callback is kept.
    pub fn register(&self, id: ListenerId, callback: Arc<dyn ChannelCallback>) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        if callbacks.contains_key(&id) {
            return false;
        }
        callbacks.insert(id, callback);
        true
    }

    pub fn unregister(&self, id: &ListenerId) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        callbacks.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<(ListenerId, Arc<dyn ChannelCallback>)> {
        let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        callbacks.iter().map(|(id, cb)| (*id, cb.clone())).collect()
    }

    /// Notifies every callback; returns how many accepted the channel.
    pub fn dispatch_opened(&self, channel: &Channel) -> usize {
        let mut accepted = 0;
        for (id, callback) in self.snapshot() {
            match callback.on_channel_opened(channel) {
                Ok(()) => accepted += 1,
                Err(e) => warn!("Listener {} did not accept channel {}: {}", id, channel, e),
            }
        }
        accepted
    }

    pub fn dispatch_input_closed(&self, channel: &Channel, reason: CloseReason, app_error: i32) {
        for (id, callback) in self.snapshot() {
            if let Err(e) = callback.on_input_closed(channel, reason, app_error) {
                debug!("Listener {} ignored input-closed for {}: {}", id, channel, e);
            }
        }
    }
}
