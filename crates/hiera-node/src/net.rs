//! TCP transport.
//!
//! Each frame is a length-delimited JSON [`Envelope`]. Every peer gets one
//! outbound connection driven by its own task, reconnecting after failures.
//! Inbound connections are read until they close and feed a single inbox.
//!
//! The sender key in an envelope is not authenticated by the connection.
//! Consensus never trusts it for votes: every vote and proposal is checked
//! against its own signature.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use hiera_consensus::{ConsensusMessage, Envelope, Transport};
use hiera_types::PublicKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Largest accepted frame.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Frames queued per peer while its connection catches up.
pub const PEER_QUEUE: usize = 1024;

const RECONNECT_DELAY: Duration = Duration::from_millis(500);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

struct PeerLink {
    address: SocketAddr,
    queue: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// [`Transport`] over TCP connections to a fixed peer list.
pub struct TcpTransport {
    key: PublicKey,
    local_addr: SocketAddr,
    peers: RwLock<HashMap<PublicKey, PeerLink>>,
    listener: JoinHandle<()>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("key", &self.key)
            .field("local_addr", &self.local_addr)
            .field("peers", &self.peers.read().len())
            .finish()
    }
}

impl TcpTransport {
    /// Binds the listener and returns the transport with its inbox.
    ///
    /// Must be called within a tokio runtime.
    pub async fn bind(
        key: PublicKey,
        listen: SocketAddr,
        inbox_capacity: usize,
    ) -> io::Result<(Self, mpsc::Receiver<Envelope>)> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        let (inbox, receiver) = mpsc::channel(inbox_capacity.max(1));
        let listener = tokio::spawn(accept_loop(listener, inbox));
        tracing::info!(node = %key, addr = %local_addr, "transport listening");
        Ok((
            Self {
                key,
                local_addr,
                peers: RwLock::new(HashMap::new()),
                listener,
            },
            receiver,
        ))
    }

    /// Bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Adds a peer, replacing any previous address for its key.
    pub fn add_peer(&self, key: PublicKey, address: SocketAddr) {
        if key == self.key {
            return;
        }
        let (queue, outbound) = mpsc::channel(PEER_QUEUE);
        let task = tokio::spawn(drive_peer(key, address, outbound));
        self.peers.write().insert(
            key,
            PeerLink {
                address,
                queue,
                task,
            },
        );
    }

    /// Drops a peer and its connection.
    pub fn remove_peer(&self, key: &PublicKey) {
        self.peers.write().remove(key);
    }

    /// Known peers and their addresses.
    pub fn peers(&self) -> Vec<(PublicKey, SocketAddr)> {
        self.peers
            .read()
            .iter()
            .map(|(key, link)| (*key, link.address))
            .collect()
    }

    fn frame(&self, message: ConsensusMessage) -> Option<Bytes> {
        let envelope = Envelope {
            from: self.key,
            message,
        };
        match serde_json::to_vec(&envelope) {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode envelope");
                None
            }
        }
    }

    fn enqueue(to: &PublicKey, link: &PeerLink, frame: Bytes) {
        if let Err(TrySendError::Full(_)) = link.queue.try_send(frame) {
            tracing::trace!(peer = %to, "peer queue full, dropping message");
        }
    }
}

impl Transport for TcpTransport {
    fn local_key(&self) -> PublicKey {
        self.key
    }

    fn send(&self, to: &PublicKey, message: ConsensusMessage) {
        let peers = self.peers.read();
        let Some(link) = peers.get(to) else {
            tracing::trace!(peer = %to, "send to unknown peer");
            return;
        };
        if let Some(frame) = self.frame(message) {
            Self::enqueue(to, link, frame);
        }
    }

    fn broadcast(&self, message: ConsensusMessage) {
        let Some(frame) = self.frame(message) else {
            return;
        };
        for (key, link) in self.peers.read().iter() {
            Self::enqueue(key, link, frame.clone());
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn accept_loop(listener: TcpListener, inbox: mpsc::Sender<Envelope>) {
    // Dropping the set when this task is aborted closes every reader.
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(peer_addr = %addr, "inbound connection");
                    readers.spawn(read_connection(stream, addr, inbox.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
}

async fn read_connection(stream: TcpStream, addr: SocketAddr, inbox: mpsc::Sender<Envelope>) {
    let mut frames = FramedRead::new(stream, codec());
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(peer_addr = %addr, error = %e, "connection read failed");
                break;
            }
        };
        match serde_json::from_slice::<Envelope>(&frame) {
            Ok(envelope) => match inbox.try_send(envelope) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::trace!(peer_addr = %addr, "inbox full, dropping message");
                }
                Err(TrySendError::Closed(_)) => break,
            },
            Err(e) => {
                tracing::warn!(peer_addr = %addr, error = %e, "undecodable frame");
            }
        }
    }
    tracing::debug!(peer_addr = %addr, "inbound connection closed");
}

async fn drive_peer(key: PublicKey, address: SocketAddr, mut queue: mpsc::Receiver<Bytes>) {
    let mut unsent: Option<Bytes> = None;
    loop {
        let stream = match TcpStream::connect(address).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(peer = %key, addr = %address, error = %e, "connect failed");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(peer = %key, error = %e, "set_nodelay failed");
        }
        tracing::debug!(peer = %key, addr = %address, "connected");

        let mut sink = FramedWrite::new(stream, codec());
        loop {
            let frame = match unsent.take() {
                Some(frame) => frame,
                None => match queue.recv().await {
                    Some(frame) => frame,
                    None => return,
                },
            };
            if let Err(e) = sink.send(frame.clone()).await {
                tracing::debug!(peer = %key, error = %e, "write failed, reconnecting");
                unsent = Some(frame);
                break;
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
