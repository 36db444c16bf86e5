use crate::types::NodeId;
use std::fmt;

/// Contract violations and environment failures
///
/// Protocol outcomes (lost arbitration, bit errors, collisions, bus-off) are
/// ordinary state transitions and never surface here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    /// Intent from a node that was never registered
    UnknownNode(NodeId),
    /// A different node already uses this numeric id
    DuplicateNode { existing: NodeId, rejected: NodeId },
    /// Frame payload longer than 8 bytes
    PayloadTooLong { node: NodeId, len: usize },
    /// The arbiter task is gone
    ChannelClosed,
    /// Invalid configuration
    Config(String),
    /// File or terminal I/O failure
    Io(String),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::UnknownNode(node) => write!(f, "Unknown node {}", node),
            SimError::DuplicateNode { existing, rejected } => write!(
                f,
                "Node id {} already registered as {}, rejected {}",
                existing.id, existing, rejected
            ),
            SimError::PayloadTooLong { node, len } => write!(
                f,
                "Payload of {} bytes from {} exceeds 8 bytes",
                len, node
            ),
            SimError::ChannelClosed => write!(f, "Bus arbiter channel closed"),
            SimError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SimError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for SimError {}

impl From<std::io::Error> for SimError {
    fn from(e: std::io::Error) -> Self {
        SimError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_mentions_node() {
        let err = SimError::PayloadTooLong {
            node: NodeId::new("ECU", 3),
            len: 9,
        };
        assert_eq!(err.to_string(), "Payload of 9 bytes from ECU#3 exceeds 8 bytes");
    }
}
