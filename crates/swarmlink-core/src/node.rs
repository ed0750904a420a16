//! The node: listener, dialer, peer table, handler dispatch, broadcast.

use crate::config::NodeConfig;
use crate::discovery;
use crate::endpoint::Endpoint;
use crate::error::NodeError;
use crate::peer::{self, Advertised, Direction, Peer, PeerHandle, PeerState};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type MessageHandler = dyn Fn(&PeerHandle, &crate::codec::Value) + Send + Sync;
type HookFn = dyn Fn(&PeerHandle) + Send + Sync;

/// An embeddable peer-to-peer node.
///
/// Cloning a `Node` is not supported; instead, `Node` is a thin handle over
/// an internal `Arc<NodeShared>`, and every callback receives `&PeerHandle`
/// (itself an `Arc<Peer>`), so application code never needs its own `Arc`
/// around the node.
pub struct Node {
    shared: Arc<NodeShared>,
}

pub(crate) struct NodeShared {
    pub(crate) config: NodeConfig,
    peers: Mutex<HashMap<u64, Arc<Peer>>>,
    endpoint_index: Mutex<HashMap<Endpoint, u64>>,
    next_peer_id: AtomicU64,
    handlers: RwLock<HashMap<String, Arc<MessageHandler>>>,
    on_connect: RwLock<Vec<Arc<HookFn>>>,
    on_disconnect: RwLock<Vec<Arc<HookFn>>>,
    dialing: Mutex<HashSet<Endpoint>>,
    shutting_down: AtomicBool,
    shutdown_notify: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    bound_addr: Mutex<Option<std::net::SocketAddr>>,
}

impl Node {
    /// Creates a new node from the given configuration. Nothing happens
    /// over the network until [`Node::run`] is called.
    pub fn new(config: NodeConfig) -> Self {
        Node {
            shared: Arc::new(NodeShared {
                config,
                peers: Mutex::new(HashMap::new()),
                endpoint_index: Mutex::new(HashMap::new()),
                next_peer_id: AtomicU64::new(1),
                handlers: RwLock::new(HashMap::new()),
                on_connect: RwLock::new(Vec::new()),
                on_disconnect: RwLock::new(Vec::new()),
                dialing: Mutex::new(HashSet::new()),
                shutting_down: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
                tasks: Mutex::new(Vec::new()),
                bound_addr: Mutex::new(None),
            }),
        }
    }

    /// The address this node actually bound to, once [`Node::run`] has
    /// started listening. `None` before binding, and always `None` for a
    /// node with no `listen_addr` configured.
    ///
    /// Binding to port `0` and reading this back is how a caller finds out
    /// which port the OS assigned.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        *self.shared.bound_addr.lock().unwrap()
    }

    /// Registers a handler for `method`. Replaces any previous handler for
    /// the same name. Panics inside the handler are caught and logged; they
    /// never tear down the delivering peer.
    pub fn handler<F>(&self, method: &str, f: F)
    where
        F: Fn(&PeerHandle, &crate::codec::Value) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap()
            .insert(method.to_string(), Arc::new(f));
    }

    /// Registers a hook fired once, exactly when a peer reaches the
    /// `Ready` state (after the duplicate-connection check, if any).
    pub fn on_connect<F>(&self, f: F)
    where
        F: Fn(&PeerHandle) + Send + Sync + 'static,
    {
        self.shared.on_connect.write().unwrap().push(Arc::new(f));
    }

    /// Registers a hook fired once per peer whose connect hook previously
    /// fired, when that peer disconnects.
    pub fn on_disconnect<F>(&self, f: F)
    where
        F: Fn(&PeerHandle) + Send + Sync + 'static,
    {
        self.shared.on_disconnect.write().unwrap().push(Arc::new(f));
    }

    /// Broadcasts `[method, payload]` to every currently `Ready` peer.
    /// Safe to call re-entrantly from within a handler or hook.
    pub fn broadcast(&self, method: &str, payload: crate::codec::Value) {
        self.shared.broadcast(method, payload);
    }

    /// Number of peers currently in the `Ready` state.
    pub fn num_connected_peers(&self) -> usize {
        self.shared.num_connected_peers()
    }

    /// Binds the listener (if configured), starts dialing seeds, and runs
    /// until [`Node::shutdown`] is called. Returns once every spawned task
    /// (listener, dialers, and every peer's reader/writer tasks) has
    /// exited.
    pub async fn run(&self) -> Result<(), NodeError> {
        let shared = self.shared.clone();
        shared.shutting_down.store(false, Ordering::SeqCst);

        if let Some(listen_addr) = shared.config.listen_addr.clone() {
            let listener =
                TcpListener::bind(&listen_addr)
                    .await
                    .map_err(|e| NodeError::Bind {
                        addr: listen_addr.clone(),
                        source: e,
                    })?;
            let actual_addr = listener.local_addr().map_err(|e| NodeError::Bind {
                addr: listen_addr.clone(),
                source: e,
            })?;
            *shared.bound_addr.lock().unwrap() = Some(actual_addr);
            info!(addr = %actual_addr, "listening for inbound connections");
            let accept_shared = shared.clone();
            let handle = tokio::spawn(accept_loop(accept_shared, listener));
            shared.track_task(handle);
        }

        for seed in shared.config.seeds.clone() {
            match Endpoint::parse(&seed) {
                Some(endpoint) => shared.maybe_dial(endpoint),
                None => warn!(seed, "ignoring unparseable seed address"),
            }
        }

        loop {
            tokio::select! {
                _ = shared.shutdown_notify.notified() => break,
                _ = tokio::time::sleep(Duration::from_millis(200)) => {
                    if shared.shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }

        let handles: Vec<_> = {
            let mut tasks = shared.tasks.lock().unwrap();
            std::mem::take(&mut *tasks)
        };
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Signals shutdown and begins tearing down every connected peer.
    /// Idempotent; safe to call from within a handler.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

async fn accept_loop(shared: Arc<NodeShared>, listener: TcpListener) {
    loop {
        if shared.shutting_down.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok((stream, remote_addr)) => {
                        debug!(%remote_addr, "accepted inbound connection");
                        peer::spawn_peer(shared.clone(), stream, remote_addr, Direction::Inbound);
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            _ = shared.shutdown_notify.notified() => break,
        }
    }
}

async fn dial_task(shared: Arc<NodeShared>, endpoint: Endpoint) {
    let mut backoff = shared.config.dial_backoff_initial;

    loop {
        if shared.shutting_down.load(Ordering::SeqCst) {
            break;
        }

        if shared.has_ready_peer(&endpoint) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                _ = shared.shutdown_notify.notified() => break,
            }
            continue;
        }

        let addr_str = endpoint.to_string();
        match tokio::time::timeout(shared.config.dial_timeout, TcpStream::connect(&addr_str)).await
        {
            Ok(Ok(stream)) => {
                backoff = shared.config.dial_backoff_initial;
                let remote_addr = stream
                    .peer_addr()
                    .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
                peer::spawn_peer(shared.clone(), stream, remote_addr, Direction::Outbound);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                    _ = shared.shutdown_notify.notified() => break,
                }
                continue;
            }
            Ok(Err(e)) => debug!(addr = addr_str, error = %e, "dial failed"),
            Err(_) => debug!(addr = addr_str, "dial timed out"),
        }

        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        tokio::select! {
            _ = tokio::time::sleep(backoff + jitter) => {}
            _ = shared.shutdown_notify.notified() => break,
        }
        backoff = (backoff * 2).min(shared.config.dial_backoff_max);
    }

    shared.dialing.lock().unwrap().remove(&endpoint);
}

impl NodeShared {
    pub(crate) fn next_peer_id(&self) -> u64 {
        self.next_peer_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(handle);
    }

    pub(crate) fn register_peer(&self, peer: Arc<Peer>) {
        self.peers.lock().unwrap().insert(peer.id, peer);
    }

    pub(crate) fn has_ready_peer(&self, endpoint: &Endpoint) -> bool {
        self.endpoint_index.lock().unwrap().contains_key(endpoint)
    }

    pub(crate) fn num_connected_peers(&self) -> usize {
        self.peers
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.state() == PeerState::Ready)
            .count()
    }

    fn known_endpoints(&self) -> Vec<Endpoint> {
        self.endpoint_index.lock().unwrap().keys().cloned().collect()
    }

    /// Answers a `getaddr` with this node's own `addr` reply.
    pub(crate) fn respond_addr(self: &Arc<Self>, peer: &Arc<Peer>) {
        let own = self
            .config
            .listen_addr
            .as_deref()
            .and_then(Endpoint::parse);
        let known = self.known_endpoints();
        let payload = discovery::addr_payload(own.as_ref(), &known, self.config.max_peer_sample);
        peer.send(discovery::ADDR, payload);
    }

    /// Processes the first `addr` received from `peer`. Returns `true` if
    /// this call transitioned the peer to `Ready` and it survived the
    /// duplicate-connection check (i.e. its pending buffer should now be
    /// flushed and its on-connect hooks fired).
    pub(crate) fn handle_addr(self: &Arc<Self>, peer: &Arc<Peer>, payload: &crate::codec::Value) -> bool {
        let Some(reply) = discovery::parse_addr_payload(payload) else {
            warn!(peer = peer.id, "discarding malformed addr payload");
            return false;
        };

        {
            let adv = peer.advertised_endpoint.lock().unwrap();
            if !matches!(&*adv, Advertised::Unknown) {
                return false;
            }
        }
        *peer.advertised_endpoint.lock().unwrap() = match &reply.sender_endpoint {
            Some(e) => Advertised::Listed(e.clone()),
            None => Advertised::Unlisted,
        };
        peer.set_state(PeerState::Ready);

        if !self.resolve_duplicate(peer, reply.sender_endpoint.clone()) {
            peer.close();
            return false;
        }

        for endpoint in reply.sample {
            self.maybe_dial(endpoint);
        }

        let hooks = self.on_connect.read().unwrap().clone();
        for hook in &hooks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(peer))).is_err() {
                error!(peer = peer.id, "on_connect hook panicked");
            }
        }
        peer.mark_connect_hook_fired();

        true
    }

    /// Decides whether `new_peer` keeps its slot in the endpoint index, or
    /// is a loser in a plain-duplicate or simultaneous-mutual-dial
    /// collision and should be closed instead.
    fn resolve_duplicate(&self, new_peer: &Arc<Peer>, endpoint: Option<Endpoint>) -> bool {
        let Some(endpoint) = endpoint else {
            // No advertised endpoint: nothing to de-duplicate against.
            return true;
        };

        // Never hold endpoint_index and peers at once — teardown_peer takes
        // them in the opposite order, and a leaf lock is never nested.
        let existing_id = {
            let mut index = self.endpoint_index.lock().unwrap();
            match index.get(&endpoint).copied() {
                None => {
                    index.insert(endpoint, new_peer.id);
                    return true;
                }
                Some(id) => id,
            }
        };

        let existing = self.peers.lock().unwrap().get(&existing_id).cloned();
        let Some(existing) = existing else {
            self.endpoint_index.lock().unwrap().insert(endpoint, new_peer.id);
            return true;
        };

        if existing.id == new_peer.id {
            return true;
        }

        if existing.direction == new_peer.direction {
            debug!(peer = new_peer.id, %endpoint, "closing plain duplicate connection");
            return false;
        }

        // Simultaneous mutual dial: break the tie by comparing this node's
        // own advertised endpoint against the remote's.
        let own = self
            .config
            .listen_addr
            .as_deref()
            .and_then(Endpoint::parse);
        let outbound_survives = match &own {
            Some(own_endpoint) => *own_endpoint < endpoint,
            None => true,
        };
        let new_is_outbound = new_peer.direction == Direction::Outbound;
        let new_survives = new_is_outbound == outbound_survives;

        if new_survives {
            self.endpoint_index.lock().unwrap().insert(endpoint, new_peer.id);
            existing.close();
            true
        } else {
            false
        }
    }

    pub(crate) fn dispatch(&self, peer: &Arc<Peer>, method: &str, payload: &crate::codec::Value) {
        let handler = self.handlers.read().unwrap().get(method).cloned();
        let Some(handler) = handler else {
            return;
        };
        if std::panic::catch_unwind(AssertUnwindSafe(|| handler(peer, payload))).is_err() {
            error!(peer = peer.id, method, "handler panicked");
        }
    }

    fn broadcast(self: &Arc<Self>, method: &str, payload: crate::codec::Value) {
        let snapshot: Vec<Arc<Peer>> = {
            let peers = self.peers.lock().unwrap();
            peers
                .values()
                .filter(|p| p.state() == PeerState::Ready)
                .cloned()
                .collect()
        };
        for peer in snapshot {
            peer.send(method, payload.clone());
        }
    }

    pub(crate) fn maybe_dial(self: &Arc<Self>, endpoint: Endpoint) {
        if endpoint.is_unlisted() {
            return;
        }
        if let Some(own) = self.config.listen_addr.as_deref().and_then(Endpoint::parse) {
            if own == endpoint {
                return;
            }
        }
        if self.has_ready_peer(&endpoint) {
            return;
        }
        {
            let mut dialing = self.dialing.lock().unwrap();
            if !dialing.insert(endpoint.clone()) {
                return;
            }
        }
        let shared = self.clone();
        let handle = tokio::spawn(dial_task(shared, endpoint));
        self.track_task(handle);
    }

    pub(crate) async fn teardown_peer(self: &Arc<Self>, peer: &Arc<Peer>) {
        peer.begin_close();
        peer.set_state(PeerState::Closed);

        self.peers.lock().unwrap().remove(&peer.id);
        if let Some(endpoint) = peer.endpoint() {
            let mut index = self.endpoint_index.lock().unwrap();
            if index.get(&endpoint) == Some(&peer.id) {
                index.remove(&endpoint);
            }
        }

        if peer.connect_hook_fired() {
            let hooks = self.on_disconnect.read().unwrap().clone();
            for hook in &hooks {
                if std::panic::catch_unwind(AssertUnwindSafe(|| hook(peer))).is_err() {
                    error!(peer = peer.id, "on_disconnect hook panicked");
                }
            }
        }
    }

    fn shutdown(self: &Arc<Self>) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let peers: Vec<Arc<Peer>> = self.peers.lock().unwrap().values().cloned().collect();
        for peer in peers {
            peer.close();
        }
        self.shutdown_notify.notify_waiters();
    }
}
