use bytes::Bytes;

use crate::ItemId;
use crate::NodeId;
use crate::ProtocolError;

/// Protocol message kinds. The discriminant is the wire tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    /// Request a shared copy
    Get = 1,
    /// Request exclusive ownership
    GetX = 2,
    /// Shared copy grant: version and data
    Put = 3,
    /// Ownership grant: version, data and the sharers to invalidate
    PutX = 4,
    /// Drop the shared copy
    Inv = 5,
    InvAck = 6,
    /// The receiver is not the owner; `nodes` carries its best hint
    ChngdOwnr = 7,
    Del = 8,
    Ack = 9,
    /// The line is busy, retry later
    Nack = 10,
    NotFound = 11,
    /// Messenger payload, topic in `version`
    Msg = 12,
    MsgAck = 13,
    Backup = 14,
    BackupAck = 15,
}

pub(crate) const MESSAGE_TYPE_COUNT: usize = 16;

impl MessageType {
    pub const ALL: [MessageType; 15] = [
        MessageType::Get,
        MessageType::GetX,
        MessageType::Put,
        MessageType::PutX,
        MessageType::Inv,
        MessageType::InvAck,
        MessageType::ChngdOwnr,
        MessageType::Del,
        MessageType::Ack,
        MessageType::Nack,
        MessageType::NotFound,
        MessageType::Msg,
        MessageType::MsgAck,
        MessageType::Backup,
        MessageType::BackupAck,
    ];

    pub fn requires_response(self) -> bool {
        matches!(
            self,
            MessageType::Get
                | MessageType::GetX
                | MessageType::Del
                | MessageType::Inv
                | MessageType::Msg
                | MessageType::Backup
        )
    }

    pub fn is_response(self) -> bool {
        !self.requires_response()
    }

    /// Whether a message of this kind may answer a `request` kind.
    pub fn answers(
        self,
        request: MessageType,
    ) -> bool {
        use MessageType::*;
        match request {
            Get => matches!(self, Put | PutX | ChngdOwnr | NotFound | Nack),
            GetX => matches!(self, PutX | ChngdOwnr | NotFound | Nack),
            Del => matches!(self, Ack | ChngdOwnr | NotFound | Nack),
            Inv => self == InvAck,
            Msg => matches!(self, MsgAck | ChngdOwnr | NotFound | Nack),
            Backup => matches!(self, BackupAck | Nack),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Get => "GET",
            MessageType::GetX => "GETX",
            MessageType::Put => "PUT",
            MessageType::PutX => "PUTX",
            MessageType::Inv => "INV",
            MessageType::InvAck => "INVACK",
            MessageType::ChngdOwnr => "CHNGD_OWNR",
            MessageType::Del => "DEL",
            MessageType::Ack => "ACK",
            MessageType::Nack => "NACK",
            MessageType::NotFound => "NOT_FOUND",
            MessageType::Msg => "MSG",
            MessageType::MsgAck => "MSGACK",
            MessageType::Backup => "BACKUP",
            MessageType::BackupAck => "BACKUPACK",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        MessageType::ALL
            .get((tag as usize).wrapping_sub(1))
            .copied()
            .ok_or(ProtocolError::UnknownType(tag))
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub id: Option<ItemId>,
    pub from: NodeId,
    pub to: NodeId,
    /// Request sequence number of the sender, echoed by replies
    pub seq: u64,
    pub version: u64,
    pub data: Option<Bytes>,
    /// Sharers (PUTX) or owner hints (CHNGD_OWNR)
    pub nodes: Vec<NodeId>,
    /// Set on messages that arrived from the network
    pub incoming: bool,
}

impl Message {
    pub fn new(
        kind: MessageType,
        from: NodeId,
        to: NodeId,
    ) -> Self {
        Self {
            kind,
            id: None,
            from,
            to,
            seq: 0,
            version: 0,
            data: None,
            nodes: Vec::new(),
            incoming: false,
        }
    }

    /// Request about line `id`.
    pub fn line(
        kind: MessageType,
        id: ItemId,
        from: NodeId,
        to: NodeId,
    ) -> Self {
        Self::new(kind, from, to).with_id(id)
    }

    pub fn with_id(
        mut self,
        id: ItemId,
    ) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_seq(
        mut self,
        seq: u64,
    ) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_version(
        mut self,
        version: u64,
    ) -> Self {
        self.version = version;
        self
    }

    pub fn with_data(
        mut self,
        data: Bytes,
    ) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_nodes(
        mut self,
        nodes: Vec<NodeId>,
    ) -> Self {
        self.nodes = nodes;
        self
    }

    /// Reply of `kind` to this request: endpoints swapped, id and seq kept.
    pub fn reply(
        &self,
        kind: MessageType,
    ) -> Message {
        Message {
            kind,
            id: self.id,
            from: self.to,
            to: self.from,
            seq: self.seq,
            version: 0,
            data: None,
            nodes: Vec::new(),
            incoming: false,
        }
    }

    /// Structural request/reply match: kinds pair up, same item, the reply
    /// comes from the node the request went to, and the sequence is echoed.
    pub fn is_response_to(
        &self,
        request: &Message,
    ) -> bool {
        self.kind.answers(request.kind)
            && self.id == request.id
            && self.from == request.to
            && self.seq == request.seq
    }

    pub fn requires_response(&self) -> bool {
        self.kind.requires_response()
    }

    pub fn set_incoming(&mut self) {
        self.incoming = true;
    }

    /// Messenger topic of a MSG.
    pub fn topic(&self) -> crate::Topic {
        self.version as crate::Topic
    }
}

impl std::fmt::Display for Message {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(id) = self.id {
            write!(f, "({id})")?;
        }
        write!(f, " {}->{} seq={} v={}", self.from, self.to, self.seq, self.version)
    }
}
