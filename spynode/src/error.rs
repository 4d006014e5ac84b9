//! Error types for the spynode.

use std::io;
use thiserror::Error;

use crate::wire::Hash32;

/// Main error type for the spynode.
#[derive(Debug, Error)]
pub enum SpyNodeError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Handler error: {0}")]
    Handler(#[from] crate::handler::HandlerError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Node inactive")]
    NodeInactive,

    #[error("Node not ready")]
    NotReady,

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("General error: {0}")]
    General(String),
}

impl SpyNodeError {
    /// Transient errors close the connection and trigger a reconnect instead of a full stop.
    pub fn is_transient(&self) -> bool {
        matches!(self, SpyNodeError::Network(_) | SpyNodeError::Io(_))
    }
}

/// Network-related errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Message serialization error: {0}")]
    Serialization(#[from] WireError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Address parse error: {0}")]
    AddressParse(String),
}

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Data not found: {0}")]
    NotFound(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Unsupported version {version} for {key}")]
    UnsupportedVersion { key: String, version: u32 },

    #[error("Invalid height {0}")]
    InvalidHeight(i64),

    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<WireError> for StorageError {
    fn from(err: WireError) -> Self {
        StorageError::Corruption(err.to_string())
    }
}

/// Consensus decoding errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid checksum: expected {expected:02x?}, actual {actual:02x?}")]
    InvalidChecksum { expected: [u8; 4], actual: [u8; 4] },

    #[error("Wrong network magic: expected {expected:#x}, got {actual:#x}")]
    WrongMagic { expected: u32, actual: u32 },

    #[error("Oversized payload: {0} bytes")]
    OversizedPayload(u64),

    #[error("Non-minimal varint")]
    NonMinimalVarInt,

    #[error("Invalid command string")]
    InvalidCommand,

    #[error("Parse failed: {0}")]
    ParseFailed(&'static str),

    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Block processing errors.
#[derive(Debug, Error)]
pub enum BlockError {
    /// The block does not extend the current tip.
    #[error("Not next block: {0}")]
    NotNextBlock(Hash32),

    /// The block was already added.
    #[error("Block not added: {0}")]
    NotAdded(Hash32),

    #[error("Invalid merkle root for block {0}")]
    InvalidMerkleRoot(Hash32),

    #[error("Merkle proofs do not produce header root for block {0}")]
    MerkleProofMismatch(Hash32),
}

impl BlockError {
    /// Duplicate and out of order blocks are skipped without stopping the node.
    pub fn is_benign(&self) -> bool {
        matches!(self, BlockError::NotNextBlock(_) | BlockError::NotAdded(_))
    }
}

/// Sync state errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("Wrong previous hash")]
    WrongPreviousHash,

    #[error("Headers request timed out")]
    HeadersTimeout,

    #[error("Block request timed out: {0}")]
    BlockTimeout(Hash32),

    #[error("Handshake timed out")]
    HandshakeTimeout,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid start hash: {0}")]
    InvalidStartHash(String),

    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
}

/// Logging-related errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Subscriber initialization failed: {0}")]
    SubscriberInit(String),

    #[error("Log rotation failed: {0}")]
    RotationFailed(String),
}

/// Type alias for Result with SpyNodeError.
pub type Result<T> = std::result::Result<T, SpyNodeError>;

/// Type alias for network operation results.
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

/// Type alias for storage operation results.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Type alias for consensus decoding results.
pub type WireResult<T> = std::result::Result<T, WireError>;

/// Type alias for logging operation results.
pub type LoggingResult<T> = std::result::Result<T, LoggingError>;
