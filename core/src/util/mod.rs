//! Shared byte-packing helpers used by CDB parsing, mode-page serialization
//! and image-file header parsing. All multi-byte fields on the SCSI bus are
//! big-endian; image file headers (Anex86, T98Next) are little-endian and
//! use the `_le` variants below.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Reads a big-endian 16-bit field at `offset`.
pub fn get_int16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap())
}

/// Reads a big-endian 24-bit field at `offset`, returned widened to u32.
pub fn get_int24(buf: &[u8], offset: usize) -> u32 {
    (u32::from(buf[offset]) << 16) | (u32::from(buf[offset + 1]) << 8) | u32::from(buf[offset + 2])
}

/// Reads a big-endian 32-bit field at `offset`.
pub fn get_int32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())
}

/// Reads a big-endian 64-bit field at `offset`.
pub fn get_int64(buf: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// Writes a big-endian 16-bit field at `offset`.
pub fn set_int16(buf: &mut [u8], offset: usize, val: u16) {
    buf[offset..offset + 2].copy_from_slice(&val.to_be_bytes());
}

/// Writes a big-endian 32-bit field at `offset`.
pub fn set_int32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_be_bytes());
}

/// Writes a big-endian 64-bit field at `offset`.
pub fn set_int64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_be_bytes());
}

/// Reads a little-endian 16-bit field (image file headers).
pub fn get_int16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())
}

/// Reads a little-endian 32-bit field (image file headers).
pub fn get_int32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

/// Right-pads (space) and truncates an ASCII identity field (vendor,
/// product, revision) to exactly `len` bytes, as used by INQUIRY.
pub fn pad_ascii(s: &str, len: usize) -> Vec<u8> {
    let mut out = vec![b' '; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// serialize_with helper for Arc<RwLock<T>>, used by devices whose state is
/// shared with a background I/O thread (e.g. the DaynaPort multicast list).
pub fn serialize_arc_rwlock<S, T>(val: &Arc<RwLock<T>>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize,
{
    val.read().unwrap().serialize(s)
}

/// deserialize_with helper for Arc<RwLock<T>>.
pub fn deserialize_arc_rwlock<'de, D, T>(d: D) -> Result<Arc<RwLock<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Arc::new(RwLock::new(T::deserialize(d)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_roundtrip() {
        let mut buf = [0u8; 8];
        set_int32(&mut buf, 0, 0x1234_5678);
        assert_eq!(get_int32(&buf, 0), 0x1234_5678);
        set_int16(&mut buf, 4, 0xABCD);
        assert_eq!(get_int16(&buf, 4), 0xABCD);
    }

    #[test]
    fn int24_is_big_endian() {
        let buf = [0x00, 0x01, 0x02, 0x03];
        assert_eq!(get_int24(&buf, 0), 0x0001_02);
        assert_eq!(get_int24(&buf, 1), 0x01_02_03);
    }

    #[test]
    fn pad_ascii_truncates_and_pads() {
        assert_eq!(pad_ascii("ACME", 8), b"ACME    ".to_vec());
        assert_eq!(pad_ascii("TOOLONGNAME", 4), b"TOOL".to_vec());
    }
}
