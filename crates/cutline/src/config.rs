//! Node configuration.

/// Configuration for a [`Node`](crate::Node).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Application messages that may wait in one link's outbound lane
    /// before `send_message` starts waiting for room. Markers are never
    /// held back by this bound.
    pub lane_capacity: usize,
    /// Whether a message from an unlinked sender triggers an
    /// `unregister_link_request` back to that sender.
    pub notify_unknown_senders: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            lane_capacity: 1024,
            notify_unknown_senders: true,
        }
    }
}
