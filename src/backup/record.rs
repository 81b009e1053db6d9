use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::ItemId;
use crate::MemberId;
use crate::ProtocolError;

/// Latest known state of one owned item, as shipped to slaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupRecord {
    Owned {
        id: ItemId,
        version: u64,
        data: Vec<u8>,
    },
    /// Ownership moved to another node or back to the store
    Released { id: ItemId },
    Deleted { id: ItemId },
}

impl BackupRecord {
    pub fn id(&self) -> ItemId {
        match self {
            BackupRecord::Owned { id, .. }
            | BackupRecord::Released { id }
            | BackupRecord::Deleted { id } => *id,
        }
    }
}

/// Unit of replication.
///
/// Packets are numbered per master member (`source`) and per slave. A
/// `full` packet replaces the slave's shadow table. Any other packet carries
/// every record that slave has not acknowledged yet, so the newest packet
/// alone brings it up to date and older ones can be skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPacket {
    pub source: MemberId,
    pub seq: u64,
    pub full: bool,
    pub records: Vec<BackupRecord>,
}

impl BackupPacket {
    pub fn encode(&self) -> crate::Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::BadPacket(e.to_string()))
    }
}
