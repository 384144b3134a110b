use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fs::File;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use super::discovery::AddressBook;
use super::wire::{read_frame, write_frame, Frame, FrameHeader, MAX_PAYLOAD_LEN};
use crate::error::{SendError, TransferError, WireError};
use crate::protocol::{Channel, CloseReason, CompanionReport, Node};
use crate::transport::{CallbackRegistry, ChannelCallback, ChannelTransport, ListenerId, MessageSender};

pub const DEFAULT_PORT: u16 = 7880;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(3);

/// A control message received from a peer
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub source_node_id: String,
    pub path: String,
    pub payload: Vec<u8>,
}

pub type MessageHandler = Arc<dyn Fn(MessageEvent) + Send + Sync>;

/// Called with the reporting node's id and the decoded report.
pub type ReportHandler = Arc<dyn Fn(&str, CompanionReport) + Send + Sync>;

struct Shared {
    local: Node,
    addresses: AddressBook,
    callbacks: CallbackRegistry,
    /// Files attached by `receive_file`, keyed by channel token
    sinks: Mutex<HashMap<String, File>>,
    /// Close signals of channels still streaming, keyed by channel token
    open: Mutex<HashMap<String, Arc<Notify>>>,
    message_handler: RwLock<Option<MessageHandler>>,
    report_handler: RwLock<Option<ReportHandler>>,
    /// How long a new connection may take to send its frame
    frame_timeout: Duration,
    reply_port: AtomicU16,
    shut_down: AtomicBool,
}

impl Shared {
    fn learn(&self, header: &FrameHeader, peer: SocketAddr) {
        if header.reply_port != 0 {
            self.addresses
                .insert(&header.source_id, SocketAddr::new(peer.ip(), header.reply_port));
        }
    }
}

/// Companion link over plain TCP: fire-and-forget messages and one-way
/// file channels on a single port.
pub struct CompanionTransport {
    shared: Arc<Shared>,
    send_timeout: Duration,
    shutdown_sender: Mutex<Option<mpsc::Sender<()>>>,
}

impl CompanionTransport {
    pub fn new(local: Node, addresses: AddressBook, send_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                local,
                addresses,
                callbacks: CallbackRegistry::new(),
                sinks: Mutex::new(HashMap::new()),
                open: Mutex::new(HashMap::new()),
                message_handler: RwLock::new(None),
                report_handler: RwLock::new(None),
                frame_timeout: send_timeout,
                reply_port: AtomicU16::new(0),
                shut_down: AtomicBool::new(false),
            }),
            send_timeout,
            shutdown_sender: Mutex::new(None),
        }
    }

    pub fn addresses(&self) -> &AddressBook {
        &self.shared.addresses
    }

    /// Installs the handler for incoming control messages.
    pub fn set_message_handler(&self, handler: MessageHandler) {
        let mut slot = self
            .shared
            .message_handler
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(handler);
    }

    /// Installs the handler for sensor-number and prediction channels. These
    /// are read whole and never reach the channel callbacks.
    pub fn set_report_handler(&self, handler: ReportHandler) {
        let mut slot = self
            .shared
            .report_handler
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(handler);
    }

    /// Starts accepting messages and channels. Returns the bound address.
    pub async fn start_server(&self, bind: SocketAddr) -> Result<SocketAddr> {
        let (tx, mut rx) = mpsc::channel(1);

        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("Failed to bind companion port {}", bind))?;
        let server_addr = listener.local_addr()?;
        self.shared.reply_port.store(server_addr.port(), Ordering::SeqCst);
        *self.shutdown_sender.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        info!("Companion server started on {}", server_addr);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    conn_result = listener.accept() => {
                        match conn_result {
                            Ok((socket, addr)) => {
                                debug!("New companion connection from {}", addr);
                                let shared = shared.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(shared, socket, addr).await {
                                        warn!("Error handling connection from {}: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => error!("Error accepting connection: {}", e),
                        }
                    }

                    _ = rx.recv() => {
                        info!("Shutting down companion server");
                        break;
                    }
                }
            }
        });

        Ok(server_addr)
    }

    /// Stops the server. Further sends fail with `TransportShutdown`.
    pub async fn stop_server(&self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);
        let sender = self
            .shutdown_sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = sender {
            let _ = tx.send(()).await;
        }
    }

    fn header(&self, path: &str) -> FrameHeader {
        FrameHeader {
            source_id: self.shared.local.id.clone(),
            reply_port: self.shared.reply_port.load(Ordering::SeqCst),
            path: path.to_string(),
        }
    }

    async fn connect(&self, node_id: &str) -> Result<TcpStream, SendError> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(SendError::TransportShutdown);
        }
        let addr = self
            .shared
            .addresses
            .get(node_id)
            .ok_or_else(|| SendError::UnknownNode(node_id.to_string()))?;

        tokio::time::timeout(self.send_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SendError::Timeout(node_id.to_string()))?
            .map_err(|source| SendError::Io {
                node: node_id.to_string(),
                source,
            })
    }

    async fn write_within_timeout(
        &self,
        node_id: &str,
        stream: &mut TcpStream,
        frame: &Frame,
    ) -> Result<(), SendError> {
        tokio::time::timeout(self.send_timeout, write_frame(stream, frame))
            .await
            .map_err(|_| SendError::Timeout(node_id.to_string()))?
            .map_err(|e| wire_send_error(node_id, e))
    }

    /// Opens a channel to `node_id`; the caller writes the stream and shuts
    /// the socket down to signal the end of input.
    pub async fn open_channel(&self, node_id: &str, path: &str) -> Result<TcpStream, SendError> {
        let mut stream = self.connect(node_id).await?;
        self.write_within_timeout(node_id, &mut stream, &Frame::Channel(self.header(path)))
            .await?;
        info!("Opened channel {} to node {}", path, node_id);
        Ok(stream)
    }

    /// Streams a local file to `node_id` over a new channel.
    pub async fn send_file(&self, node_id: &str, path: &str, file: &Path) -> Result<u64, SendError> {
        let io_error = |source: std::io::Error| SendError::Io {
            node: node_id.to_string(),
            source,
        };

        let mut source = tokio::fs::File::open(file).await.map_err(io_error)?;
        let mut stream = self.open_channel(node_id, path).await?;
        let bytes = tokio::io::copy(&mut source, &mut stream).await.map_err(io_error)?;
        stream.shutdown().await.map_err(io_error)?;

        info!("Sent {} bytes of {} to node {}", bytes, file.display(), node_id);
        Ok(bytes)
    }

    /// Writes one report on its own short-lived channel.
    pub async fn send_report(&self, node_id: &str, report: &CompanionReport) -> Result<(), SendError> {
        let mut stream = self.open_channel(node_id, report.path()).await?;
        let payload = report.to_payload();
        let written = async {
            stream.write_all(&payload).await?;
            stream.shutdown().await
        };
        tokio::time::timeout(self.send_timeout, written)
            .await
            .map_err(|_| SendError::Timeout(node_id.to_string()))?
            .map_err(|source| SendError::Io {
                node: node_id.to_string(),
                source,
            })?;
        debug!("Sent {} to node {}", report, node_id);
        Ok(())
    }
}

fn wire_send_error(node_id: &str, err: WireError) -> SendError {
    let source = match err {
        WireError::Io(e) => e,
        other => std::io::Error::new(std::io::ErrorKind::InvalidInput, other.to_string()),
    };
    SendError::Io {
        node: node_id.to_string(),
        source,
    }
}

async fn handle_connection(shared: Arc<Shared>, mut socket: TcpStream, peer: SocketAddr) -> Result<(), WireError> {
    let frame = tokio::time::timeout(shared.frame_timeout, read_frame(&mut socket))
        .await
        .map_err(|_| WireError::Timeout(shared.frame_timeout))??;

    match frame {
        Frame::Message { header, payload } => {
            shared.learn(&header, peer);
            info!("Message received: {} from {}", header.path, header.source_id);

            let handler = shared
                .message_handler
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            match handler {
                Some(handler) => handler(MessageEvent {
                    source_node_id: header.source_id,
                    path: header.path,
                    payload,
                }),
                None => debug!("No message handler installed, dropping {}", header.path),
            }
            Ok(())
        }
        Frame::Channel(header) if CompanionReport::is_report_path(&header.path) => {
            shared.learn(&header, peer);
            receive_report(&shared, socket, header).await
        }
        Frame::Channel(header) => {
            shared.learn(&header, peer);
            receive_channel(shared, socket, header).await;
            Ok(())
        }
    }
}

async fn receive_report(shared: &Shared, socket: TcpStream, header: FrameHeader) -> Result<(), WireError> {
    let mut payload = Vec::new();
    let mut limited = socket.take(MAX_PAYLOAD_LEN as u64 + 1);
    tokio::time::timeout(shared.frame_timeout, limited.read_to_end(&mut payload))
        .await
        .map_err(|_| WireError::Timeout(shared.frame_timeout))??;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::TooLong {
            field: "report",
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let Some(report) = CompanionReport::from_channel(&header.path, &payload) else {
        warn!("Unreadable report on {} from {}", header.path, header.source_id);
        return Ok(());
    };

    let handler = shared
        .report_handler
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    match handler {
        Some(handler) => handler(&header.source_id, report),
        None => debug!("No report handler installed, dropping {}", report),
    }
    Ok(())
}

/// Channel callbacks may touch the filesystem, so they run on the blocking pool.
async fn dispatch_opened(callbacks: &CallbackRegistry, channel: &Channel) -> usize {
    let callbacks = callbacks.clone();
    let channel = channel.clone();
    tokio::task::spawn_blocking(move || callbacks.dispatch_opened(&channel))
        .await
        .unwrap_or_else(|e| {
            error!("Channel-open callbacks failed: {}", e);
            0
        })
}

async fn dispatch_input_closed(callbacks: &CallbackRegistry, channel: &Channel, reason: CloseReason) {
    let callbacks = callbacks.clone();
    let channel = channel.clone();
    let dispatched =
        tokio::task::spawn_blocking(move || callbacks.dispatch_input_closed(&channel, reason, 0)).await;
    if let Err(e) = dispatched {
        error!("Input-closed callbacks failed: {}", e);
    }
}

async fn receive_channel(shared: Arc<Shared>, mut socket: TcpStream, header: FrameHeader) {
    let channel = Channel::new(Uuid::new_v4().to_string(), header.path, header.source_id);
    let close_signal = Arc::new(Notify::new());
    shared
        .open
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(channel.token().to_string(), close_signal.clone());

    let accepted = dispatch_opened(&shared.callbacks, &channel).await;
    let sink = shared
        .sinks
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(channel.token());

    let reason = match sink {
        None => {
            if accepted == 0 {
                warn!("No listener accepted channel {}", channel);
            }
            CloseReason::LocalClose
        }
        Some(file) => {
            let mut file = tokio::fs::File::from_std(file);
            let copied = tokio::select! {
                result = tokio::io::copy(&mut socket, &mut file) => Some(result),
                _ = close_signal.notified() => None,
            };
            if let Err(e) = file.flush().await {
                warn!("Failed to flush data from channel {}: {}", channel, e);
            }
            drop(file);

            match copied {
                Some(Ok(bytes)) => {
                    debug!("Channel {} delivered {} bytes", channel, bytes);
                    CloseReason::Normal
                }
                Some(Err(e)) => {
                    warn!("Channel {} broke off: {}", channel, e);
                    CloseReason::Disconnected
                }
                None => CloseReason::LocalClose,
            }
        }
    };

    shared
        .open
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(channel.token());
    drop(socket);
    dispatch_input_closed(&shared.callbacks, &channel, reason).await;
}

#[async_trait]
impl MessageSender for CompanionTransport {
    async fn send_message(&self, node_id: &str, path: &str, payload: &[u8]) -> Result<(), SendError> {
        let mut stream = self.connect(node_id).await?;
        let frame = Frame::Message {
            header: self.header(path),
            payload: payload.to_vec(),
        };
        self.write_within_timeout(node_id, &mut stream, &frame).await?;
        let _ = stream.shutdown().await;
        Ok(())
    }
}

impl ChannelTransport for CompanionTransport {
    fn register_channel_callback(
        &self,
        id: ListenerId,
        callback: Arc<dyn ChannelCallback>,
    ) -> Result<(), TransferError> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(TransferError::TransportShutdown);
        }
        if !self.shared.callbacks.register(id, callback) {
            return Err(TransferError::Registration(format!(
                "listener {} is already registered",
                id
            )));
        }
        Ok(())
    }

    fn unregister_channel_callback(&self, id: &ListenerId) -> bool {
        self.shared.callbacks.unregister(id)
    }

    fn receive_file(&self, channel: &Channel, sink: File) -> Result<(), TransferError> {
        let is_open = self
            .shared
            .open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(channel.token());
        if !is_open {
            return Err(TransferError::UnknownChannel(channel.to_string()));
        }
        self.shared
            .sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.token().to_string(), sink);
        Ok(())
    }

    fn close(&self, channel: &Channel) -> Result<(), TransferError> {
        let signal = self
            .shared
            .open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel.token());
        match signal {
            Some(signal) => {
                debug!("Closing channel {}", channel);
                signal.notify_one();
            }
            None => debug!("Channel {} already closed", channel),
        }
        Ok(())
    }
}
