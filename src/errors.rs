//! Grid Error Hierarchy
//!
//! Defines the error types of the object grid, categorized by layer:
//! infrastructure (storage, network, wire protocol), configuration, and the
//! coherence protocol surface seen by callers.

use config::ConfigError;
use tokio::task::JoinError;

use crate::ItemId;
use crate::MemberId;
use crate::NodeId;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (network, storage, serialization)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Coherence protocol outcomes surfaced to callers
    #[error(transparent)]
    Grid(#[from] GridError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failures
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Serialization failures for persisted data
    #[error(transparent)]
    BincodeError(#[from] bincode::Error),

    /// Embedded database errors
    #[error("Embedded database error: {0}")]
    DbError(String),

    /// A store transaction was aborted by the engine
    #[error("Transaction {0} aborted")]
    TransactionAborted(String),

    /// Id range reservation below the current high-water mark
    #[error("Allocation [{start}, {start}+{count}) overlaps an existing reservation")]
    AllocationOverlap { start: ItemId, count: u64 },

    /// Operation on a closed store
    #[error("Store is closed")]
    Closed,

    /// Error type for value conversion operations
    #[error("Value convert failed")]
    Convert(#[from] ConvertError),
}

/// Error type for value conversion operations
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// Invalid input length error
    ///
    /// This occurs when the input byte slice length doesn't match the expected width.
    #[error("invalid byte length: expected {expected} bytes, received {actual} bytes")]
    InvalidLength { expected: usize, actual: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// No live member serves the node group
    #[error("Node {node_id} is unreachable")]
    NodeUnreachable { node_id: NodeId },

    /// The addressed member left the group
    #[error("Member {member_id} of node {node_id} not found")]
    MemberNotFound { node_id: NodeId, member_id: MemberId },

    /// Local endpoint was disconnected from the cluster
    #[error("Endpoint of node {0} is disconnected")]
    Disconnected(NodeId),

    /// A single attempt did not complete within its deadline
    #[error("Attempt timed out after {0}ms")]
    AttemptTimeout(u64),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    #[error("{0}")]
    SignalSendFailed(String),
}

/// Wire-level failures. A malformed frame is dropped; the channel stays up.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown message type tag {0}")]
    UnknownType(u8),

    #[error("Truncated frame: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("{0} message carries no item id")]
    MissingItemId(&'static str),

    #[error("Backup packet could not be decoded: {0}")]
    BadPacket(String),

    #[error("Frame field {field} holds {len}, limit is {max}")]
    FrameTooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

/// Outcomes of grid operations that callers are expected to handle.
///
/// Cloneable so one protocol exchange can fan its result out to every
/// coalesced local waiter.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GridError {
    /// Retries exhausted without a reply from the owner
    #[error("Timed out on item {id} after {retries} retries")]
    Timeout { id: ItemId, retries: u32 },

    /// The item was deleted or never existed
    #[error("Item {0} not found")]
    RefNotFound(ItemId),

    /// This member is a slave and does not serve requests
    #[error("Node {0} is not the master of its group")]
    NotMaster(NodeId),

    /// The change is applied and visible on this member, but fewer slaves
    /// than required acknowledged it. It stays queued for them.
    #[error("Committed locally but acknowledged by {acked} of {needed} slaves")]
    NotReplicated { acked: usize, needed: usize },

    /// Transaction handle is unknown or already finished
    #[error("Transaction {0} is not active")]
    TransactionNotActive(String),

    /// Service graph errors (unknown dependency, cycle)
    #[error("Service graph error: {0}")]
    ServiceGraph(String),

    /// A storage or network failure ended a shared protocol exchange
    #[error("Operation on item {id} failed: {reason}")]
    Failed { id: ItemId, reason: String },

    /// The grid is shutting down
    #[error("Grid is shutting down")]
    Shutdown,
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::System(SystemError::Storage(e))
    }
}

impl From<NetworkError> for Error {
    fn from(e: NetworkError) -> Self {
        Error::System(SystemError::Network(e))
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::System(SystemError::Protocol(e))
    }
}

impl From<ConvertError> for Error {
    fn from(e: ConvertError) -> Self {
        Error::System(SystemError::Storage(StorageError::Convert(e)))
    }
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        StorageError::DbError(e.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        StorageError::from(e).into()
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        StorageError::BincodeError(e).into()
    }
}

impl Error {
    /// Converts any error into the cloneable form shared by coalesced waiters.
    pub(crate) fn into_grid_error(
        self,
        id: ItemId,
    ) -> GridError {
        match self {
            Error::Grid(e) => e,
            other => GridError::Failed {
                id,
                reason: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        StorageError::IoError(e).into()
    }
}
