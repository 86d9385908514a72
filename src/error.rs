//! Error types for the replicated key-value store.
//!
//! Request-level failures (authentication, routing, availability) are not
//! errors in this sense: they are reported to the caller as a
//! [`StatusType`](crate::network::rpc::StatusType) in the response. The types
//! here cover the internal failures behind those statuses.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the store.
#[derive(Error, Debug)]
pub enum Error {
    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Disk storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Ring membership and node lifecycle errors.
    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    /// Coordination service errors.
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// Message authentication errors.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// The peer sent something the protocol does not allow here.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Frame exceeded the configured maximum size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Disk storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A record line could not be parsed.
    #[error("corrupt record in {file}: {reason}")]
    Corrupt { file: String, reason: String },

    /// A transferred record failed verification.
    #[error("record for key {0} failed verification")]
    Unverified(String),

    /// I/O error.
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),
}

/// Ring membership errors.
#[derive(Error, Debug)]
pub enum MembershipError {
    /// Node not found in the ring or pool.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// Node already in the ring.
    #[error("node already exists: {0}")]
    NodeAlreadyExists(String),

    /// No node left in the available pool.
    #[error("no available node to add")]
    NoAvailableNode,

    /// The node did not show up in the coordination service in time.
    #[error("join not confirmed for {0}")]
    JoinTimeout(String),

    /// The node did not leave the coordination service in time.
    #[error("leave not confirmed for {0}")]
    LeaveTimeout(String),

    /// Launching the node process failed.
    #[error("launch failed for {node}: {reason}")]
    LaunchFailed { node: String, reason: String },

    /// A control message was rejected by the node.
    #[error("control {action} rejected by {node}")]
    ControlRejected { node: String, action: String },
}

/// Coordination service errors.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinationError {
    /// Path does not exist.
    #[error("no node at {0}")]
    NoNode(String),

    /// Path already exists.
    #[error("node exists at {0}")]
    NodeExists(String),

    /// Parent path does not exist.
    #[error("parent of {0} does not exist")]
    NoParent(String),

    /// Entry still has children.
    #[error("node at {0} has children")]
    NotEmpty(String),

    /// The session has expired or was closed.
    #[error("session expired")]
    SessionExpired,
}

/// Message authentication errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The message carries no tag.
    #[error("missing tag")]
    MissingTag,

    /// The tag is not a well-formed signature.
    #[error("malformed tag")]
    MalformedTag,

    /// Signature verification failed.
    #[error("bad signature")]
    BadSignature,

    /// The tag was already seen.
    #[error("replayed tag")]
    Replayed,

    /// Sender identity is not acceptable for this message kind.
    #[error("unexpected sender: {0}")]
    UnexpectedSender(String),

    /// A key could not be decoded.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The authorizing command does not cover what the message asks for.
    #[error("not authorized: {0}")]
    OutOfScope(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(NetworkError::Io(e))
    }
}
