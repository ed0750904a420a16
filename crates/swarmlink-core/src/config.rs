//! In-process node configuration.
//!
//! Unlike a host application's own settings, a [`NodeConfig`] is never
//! loaded from a file or environment variable — it is built up by the
//! embedding application and handed to [`crate::node::Node::new`] directly.
//! There is no persisted state for the library to own.

use std::time::Duration;

/// Configuration for a [`crate::node::Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Endpoints to dial on startup, and to redial on disconnect.
    pub seeds: Vec<String>,

    /// Local address to accept inbound connections on, e.g. `"0.0.0.0:4000"`.
    /// `None` means this node never listens and only dials out.
    pub listen_addr: Option<String>,

    /// Maximum size, in bytes, of a single decoded frame's payload.
    pub max_frame_len: usize,

    /// Capacity of each peer's outbound send queue.
    pub queue_depth: usize,

    /// Maximum number of other peers' endpoints included in one `addr`
    /// gossip reply (the `K` named in the discovery protocol).
    pub max_peer_sample: usize,

    /// Initial delay before the first redial attempt after a dial failure.
    pub dial_backoff_initial: Duration,

    /// Upper bound the doubling redial backoff saturates at.
    pub dial_backoff_max: Duration,

    /// Timeout for a single outbound connect attempt.
    pub dial_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            listen_addr: None,
            max_frame_len: 16 * 1024 * 1024,
            queue_depth: 256,
            max_peer_sample: 30,
            dial_backoff_initial: Duration::from_millis(500),
            dial_backoff_max: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

impl NodeConfig {
    /// Starts a config with no seeds and no listen address.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listen address this node accepts inbound connections on.
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Adds a seed endpoint to dial on startup.
    pub fn with_seed(mut self, addr: impl Into<String>) -> Self {
        self.seeds.push(addr.into());
        self
    }

    /// Adds multiple seed endpoints to dial on startup.
    pub fn with_seeds(mut self, addrs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.seeds.extend(addrs.into_iter().map(Into::into));
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    pub fn with_max_peer_sample(mut self, max_peer_sample: usize) -> Self {
        self.max_peer_sample = max_peer_sample;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_seeds() {
        let config = NodeConfig::new()
            .with_seed("10.0.0.1:4000")
            .with_seed("10.0.0.2:4000");
        assert_eq!(config.seeds, vec!["10.0.0.1:4000", "10.0.0.2:4000"]);
    }

    #[test]
    fn default_has_no_listen_addr() {
        assert!(NodeConfig::default().listen_addr.is_none());
    }
}
