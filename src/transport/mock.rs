//! In-memory transport doubles for unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{CallbackRegistry, ChannelCallback, ChannelTransport, ListenerId, MessageSender, NodeSource};
use crate::error::{DiscoveryError, SendError, TransferError};
use crate::protocol::{Channel, CloseReason, Node};

pub enum Discovery {
    Nodes(Vec<Node>),
    Fail,
    Hang,
}

pub struct MockNodes {
    pub behavior: Mutex<Discovery>,
}

impl MockNodes {
    pub fn with_nodes(count: usize) -> Arc<Self> {
        let nodes = (0..count)
            .map(|i| Node::new(format!("node-{}", i), format!("Watch {}", i)))
            .collect();
        Arc::new(Self {
            behavior: Mutex::new(Discovery::Nodes(nodes)),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(Discovery::Fail),
        })
    }

    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(Discovery::Hang),
        })
    }
}

#[async_trait]
impl NodeSource for MockNodes {
    async fn connected_nodes(&self) -> Result<Vec<Node>, DiscoveryError> {
        let outcome = match &*self.behavior.lock().unwrap() {
            Discovery::Nodes(nodes) => Some(Ok(nodes.clone())),
            Discovery::Fail => Some(Err(DiscoveryError::Unavailable(
                "no companion service".into(),
            ))),
            Discovery::Hang => None,
        };
        match outcome {
            Some(result) => result,
            None => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
        }
    }
}

#[derive(Default)]
pub struct MockSender {
    pub sent: Mutex<Vec<(String, String)>>,
    pub failing: Mutex<HashSet<String>>,
    pub shut_down: AtomicBool,
    /// When set, records how many channel callbacks were registered at each send.
    pub observed: Option<CallbackRegistry>,
    pub callbacks_at_send: Mutex<Vec<usize>>,
}

impl MockSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn observing(registry: CallbackRegistry) -> Arc<Self> {
        Arc::new(Self {
            observed: Some(registry),
            ..Self::default()
        })
    }

    pub fn fail_node(&self, node_id: &str) {
        self.failing.lock().unwrap().insert(node_id.to_string());
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSender for MockSender {
    async fn send_message(&self, node_id: &str, path: &str, _payload: &[u8]) -> Result<(), SendError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SendError::TransportShutdown);
        }
        if let Some(registry) = &self.observed {
            self.callbacks_at_send.lock().unwrap().push(registry.len());
        }
        self.sent
            .lock()
            .unwrap()
            .push((node_id.to_string(), path.to_string()));
        if self.failing.lock().unwrap().contains(node_id) {
            return Err(SendError::Io {
                node: node_id.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockChannels {
    pub registry: CallbackRegistry,
    pub sinks: Mutex<HashMap<String, File>>,
    pub closed: Mutex<Vec<Channel>>,
    pub fail_register: AtomicBool,
    pub fail_receive: AtomicBool,
}

impl MockChannels {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self, channel: &Channel) -> usize {
        self.registry.dispatch_opened(channel)
    }

    pub fn deliver(&self, channel: &Channel, bytes: &[u8]) {
        let mut sinks = self.sinks.lock().unwrap();
        let sink = sinks.get_mut(channel.token()).expect("no sink attached");
        sink.write_all(bytes).unwrap();
    }

    pub fn finish(&self, channel: &Channel, reason: CloseReason) {
        self.sinks.lock().unwrap().remove(channel.token());
        self.registry.dispatch_input_closed(channel, reason, 0);
    }

    pub fn closed(&self) -> Vec<Channel> {
        self.closed.lock().unwrap().clone()
    }
}

impl ChannelTransport for MockChannels {
    fn register_channel_callback(
        &self,
        id: ListenerId,
        callback: Arc<dyn ChannelCallback>,
    ) -> Result<(), TransferError> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(TransferError::Registration("channel client unavailable".into()));
        }
        if !self.registry.register(id, callback) {
            return Err(TransferError::Registration(format!("{} already registered", id)));
        }
        Ok(())
    }

    fn unregister_channel_callback(&self, id: &ListenerId) -> bool {
        self.registry.unregister(id)
    }

    fn receive_file(&self, channel: &Channel, sink: File) -> Result<(), TransferError> {
        if self.fail_receive.load(Ordering::SeqCst) {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "channel input unavailable",
            )));
        }
        self.sinks
            .lock()
            .unwrap()
            .insert(channel.token().to_string(), sink);
        Ok(())
    }

    fn close(&self, channel: &Channel) -> Result<(), TransferError> {
        self.closed.lock().unwrap().push(channel.clone());
        Ok(())
    }
}
