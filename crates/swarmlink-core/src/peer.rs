//! A single logical connection to a remote node.
//!
//! Each [`Peer`] owns one TCP socket shared between an independent reader
//! task and writer task (via `Arc<TcpStream>` and tokio's `&TcpStream`
//! `AsyncRead`/`AsyncWrite` impls, rather than `into_split`), so that
//! teardown can issue a single synchronous, dual-direction shutdown on the
//! shared file descriptor and have it unblock whichever side is mid-syscall.

use crate::codec::Value;
use crate::discovery;
use crate::endpoint::Endpoint;
use crate::node::NodeShared;
use socket2::SockRef;
use std::collections::VecDeque;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::framed;

/// Direction in which a connection was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Lifecycle state of a [`Peer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Handshaking,
    Ready,
    Closing,
    Closed,
}

/// What this peer has told us about its own listening address, if anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Advertised {
    Unknown,
    Listed(Endpoint),
    Unlisted,
}

/// A connected remote node.
///
/// Shared as `Arc<Peer>` between the owning [`crate::node::Node`], the
/// reader/writer tasks, and every handler or hook callback that is handed
/// a reference to it — there is no separate handle type.
pub struct Peer {
    pub(crate) id: u64,
    socket: Arc<TcpStream>,
    remote_addr: SocketAddr,
    pub(crate) direction: Direction,
    state: Mutex<PeerState>,
    pub(crate) advertised_endpoint: Mutex<Advertised>,
    outbound_tx: mpsc::Sender<Value>,
    close_once: AtomicBool,
    closed_notify: Notify,
    connect_hook_fired: AtomicBool,
}

/// Handle type passed to handlers and connect/disconnect hooks.
///
/// An alias rather than a wrapper struct: `Arc<Peer>` already derefs to
/// `Peer`'s public methods, so there is nothing a wrapper would add.
pub type PeerHandle = Arc<Peer>;

impl Peer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The endpoint this peer advertised during its handshake, if any and
    /// if it has completed one. `None` both before the handshake completes
    /// and for peers that advertise no listen address at all.
    pub fn endpoint(&self) -> Option<Endpoint> {
        match &*self.advertised_endpoint.lock().unwrap() {
            Advertised::Listed(e) => Some(e.clone()),
            Advertised::Unknown | Advertised::Unlisted => None,
        }
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state() == PeerState::Ready
    }

    /// Enqueues `[method, payload]` for delivery. Best-effort: if the
    /// outbound queue is full or the peer is no longer writable, the
    /// message is silently dropped.
    pub fn send(&self, method: &str, payload: Value) {
        let frame = Value::list(vec![Value::bytes(method.as_bytes().to_vec()), payload]);
        match self.outbound_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(peer = self.id, method, "outbound queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(peer = self.id, method, "peer no longer writable, dropping message");
            }
        }
    }

    /// Requests that this connection be torn down. Idempotent.
    pub fn close(&self) {
        self.begin_close();
    }

    /// Performs the actual teardown exactly once. Returns whether this
    /// call was the one that triggered it.
    pub(crate) fn begin_close(&self) -> bool {
        if self.close_once.swap(true, Ordering::SeqCst) {
            return false;
        }
        let sock = SockRef::from(&*self.socket);
        if let Err(e) = sock.shutdown(Shutdown::Both) {
            debug!(peer = self.id, error = %e, "socket shutdown failed (already closed?)");
        }
        self.closed_notify.notify_waiters();
        true
    }
}

/// Spawns the reader and writer tasks for a newly accepted or dialed
/// connection, registers the peer with `shared`, and kicks off the
/// handshake by enqueueing a `getaddr`.
pub(crate) fn spawn_peer(
    shared: Arc<NodeShared>,
    stream: TcpStream,
    remote_addr: SocketAddr,
    direction: Direction,
) -> Arc<Peer> {
    let id = shared.next_peer_id();
    let (tx, rx) = mpsc::channel(shared.config.queue_depth.max(1));
    let peer = Arc::new(Peer {
        id,
        socket: Arc::new(stream),
        remote_addr,
        direction,
        state: Mutex::new(PeerState::Handshaking),
        advertised_endpoint: Mutex::new(Advertised::Unknown),
        outbound_tx: tx,
        close_once: AtomicBool::new(false),
        closed_notify: Notify::new(),
        connect_hook_fired: AtomicBool::new(false),
    });

    shared.register_peer(peer.clone());

    peer.send(discovery::GETADDR, discovery::getaddr_payload());

    let reader_peer = peer.clone();
    let reader_shared = shared.clone();
    let reader_handle = tokio::spawn(async move {
        reader_loop(reader_peer, reader_shared).await;
    });

    let writer_peer = peer.clone();
    let writer_handle = tokio::spawn(async move {
        writer_loop(writer_peer, rx).await;
    });

    shared.track_task(reader_handle);
    shared.track_task(writer_handle);

    peer
}

async fn writer_loop(peer: Arc<Peer>, mut rx: mpsc::Receiver<Value>) {
    let socket = peer.socket.clone();
    let mut writer = &*socket;
    loop {
        tokio::select! {
            maybe_value = rx.recv() => {
                match maybe_value {
                    Some(value) => {
                        if let Err(e) = framed::write_value(&mut writer, &value).await {
                            debug!(peer = peer.id, error = %e, "write failed, closing connection");
                            peer.begin_close();
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = peer.closed_notify.notified() => break,
        }
    }
}

/// Parses a decoded frame as `[method_bytes, payload]`.
fn parse_message(value: &Value) -> Option<(String, Value)> {
    let items = value.as_list()?;
    if items.len() != 2 {
        return None;
    }
    let method = std::str::from_utf8(items[0].as_bytes()?).ok()?.to_string();
    Some((method, items[1].clone()))
}

async fn reader_loop(peer: Arc<Peer>, shared: Arc<NodeShared>) {
    let socket = peer.socket.clone();
    let mut reader = &*socket;
    let mut pending: VecDeque<(String, Value)> = VecDeque::new();
    let pending_cap = shared.config.queue_depth.max(1);

    loop {
        match framed::read_value(&mut reader, shared.config.max_frame_len).await {
            Ok(value) => {
                let Some((method, payload)) = parse_message(&value) else {
                    warn!(peer = peer.id, "discarding malformed frame (not [method, payload])");
                    continue;
                };

                if method == discovery::GETADDR {
                    shared.respond_addr(&peer);
                    continue;
                }

                if method == discovery::ADDR {
                    if !peer.is_ready() {
                        let became_ready = shared.handle_addr(&peer, &payload);
                        if became_ready {
                            for (m, p) in pending.drain(..) {
                                shared.dispatch(&peer, &m, &p);
                            }
                        }
                    }
                    continue;
                }

                if peer.is_ready() {
                    shared.dispatch(&peer, &method, &payload);
                } else {
                    if pending.len() >= pending_cap {
                        pending.pop_front();
                        warn!(peer = peer.id, "pre-handshake buffer full, dropping oldest message");
                    }
                    pending.push_back((method, payload));
                }
            }
            Err(e) => {
                debug!(peer = peer.id, error = %e, "reader exiting");
                break;
            }
        }
    }

    shared.teardown_peer(&peer).await;
}

impl Peer {
    pub(crate) fn mark_connect_hook_fired(&self) {
        self.connect_hook_fired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn connect_hook_fired(&self) -> bool {
        self.connect_hook_fired.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, state: PeerState) {
        *self.state.lock().unwrap() = state;
    }
}
