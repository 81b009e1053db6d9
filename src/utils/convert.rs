use crate::ConvertError;
use crate::Result;

/// Converts a `u64` to an 8-byte array in big-endian byte order.
///
/// Big-endian keeps sled's lexicographic key order equal to numeric order,
/// which range scans over item ids and allocation starts rely on.
///
/// # Examples
/// ```
/// use grid_engine::convert::safe_kv;
///
/// let bytes = safe_kv(0x1234_5678_9ABC_DEF0);
/// assert_eq!(bytes, [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0]);
/// ```
pub const fn safe_kv(num: u64) -> [u8; 8] {
    num.to_be_bytes()
}

/// Reverse of [`safe_kv`]; rejects anything but exactly 8 bytes.
pub fn safe_vk<K: AsRef<[u8]>>(bytes: K) -> Result<u64> {
    let bytes = bytes.as_ref();
    let array: [u8; 8] = bytes.try_into().map_err(|_| ConvertError::InvalidLength {
        expected: 8,
        actual: bytes.len(),
    })?;
    Ok(u64::from_be_bytes(array))
}

/// Two-byte big-endian form of a node id, as stored in the owner tree.
pub const fn node_kv(node: u16) -> [u8; 2] {
    node.to_be_bytes()
}

pub fn node_vk<K: AsRef<[u8]>>(bytes: K) -> Result<u16> {
    let bytes = bytes.as_ref();
    let array: [u8; 2] = bytes.try_into().map_err(|_| ConvertError::InvalidLength {
        expected: 2,
        actual: bytes.len(),
    })?;
    Ok(u16::from_be_bytes(array))
}
