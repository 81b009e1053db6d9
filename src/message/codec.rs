//! Wire format of [`Message`].
//!
//! ```text
//! u8 type | u8 flags | u64 id | u16 from | u16 to | u64 seq | u64 version |
//! u16 n | u16 * n nodes | u32 len | len bytes data
//! ```
//! Big-endian. Flags: bit 0 the id is present, bit 1 data is present.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use super::Message;
use super::MessageType;
use crate::ProtocolError;

const FLAG_HAS_ID: u8 = 0b01;
const FLAG_HAS_DATA: u8 = 0b10;
const HEADER_LEN: usize = 1 + 1 + 8 + 2 + 2 + 8 + 8 + 2;

fn bounded(
    field: &'static str,
    len: usize,
    max: usize,
) -> Result<usize, ProtocolError> {
    if len > max {
        return Err(ProtocolError::FrameTooLarge { field, len, max });
    }
    Ok(len)
}

/// Encodes one frame. Fails when the node list or the data do not fit
/// their length fields.
pub fn encode(msg: &Message) -> Result<Bytes, ProtocolError> {
    let node_count = bounded("nodes", msg.nodes.len(), u16::MAX as usize)?;
    let data_len = bounded("data", msg.data.as_ref().map_or(0, Bytes::len), u32::MAX as usize)?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + msg.nodes.len() * 2 + 4 + data_len);

    let mut flags = 0;
    if msg.id.is_some() {
        flags |= FLAG_HAS_ID;
    }
    if msg.data.is_some() {
        flags |= FLAG_HAS_DATA;
    }

    buf.put_u8(msg.kind as u8);
    buf.put_u8(flags);
    buf.put_u64(msg.id.unwrap_or(0));
    buf.put_u16(msg.from);
    buf.put_u16(msg.to);
    buf.put_u64(msg.seq);
    buf.put_u64(msg.version);
    buf.put_u16(node_count as u16);
    for n in &msg.nodes {
        buf.put_u16(*n);
    }
    buf.put_u32(data_len as u32);
    if let Some(data) = &msg.data {
        buf.put_slice(data);
    }
    Ok(buf.freeze())
}

fn need(
    buf: &Bytes,
    needed: usize,
) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Decodes one frame. The result is marked incoming.
pub fn decode(mut buf: Bytes) -> Result<Message, ProtocolError> {
    need(&buf, HEADER_LEN)?;
    let kind = MessageType::try_from(buf.get_u8())?;
    let flags = buf.get_u8();
    let id = buf.get_u64();
    let from = buf.get_u16();
    let to = buf.get_u16();
    let seq = buf.get_u64();
    let version = buf.get_u64();

    let n = buf.get_u16() as usize;
    need(&buf, n * 2)?;
    let nodes = (0..n).map(|_| buf.get_u16()).collect();

    need(&buf, 4)?;
    let len = buf.get_u32() as usize;
    need(&buf, len)?;
    let data = buf.split_to(len);

    Ok(Message {
        kind,
        id: (flags & FLAG_HAS_ID != 0).then_some(id),
        from,
        to,
        seq,
        version,
        data: (flags & FLAG_HAS_DATA != 0).then_some(data),
        nodes,
        incoming: true,
    })
}
