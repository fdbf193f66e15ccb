//! Framing codec for tagged messages
//!
//! Pure encode/decode functions; nothing here touches the transport.
//! Integers are 4-byte big-endian, keys are length-prefixed, and status codes
//! always fill a [`STATUS_SLOT_LEN`]-byte slot (ASCII digits, NUL padded).

use crate::error::{KvError, Result};
use crate::protocol::{Entry, MemoryRegionDescriptor, CONTINUATION_LEN, STATUS_SLOT_LEN};
use bincode::Options;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Raw UTF-8 bytes of `s`, no prefix.
pub fn encode_string(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Inverse of [`encode_string`]; rejects invalid UTF-8.
pub fn decode_string(buf: &[u8]) -> Result<String> {
    String::from_utf8(buf.to_vec()).map_err(|e| KvError::protocol(format!("invalid UTF-8: {}", e)))
}

/// 4-byte big-endian integer.
pub fn encode_i32(value: i32) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

/// Inverse of [`encode_i32`]; the buffer must be exactly 4 bytes.
pub fn decode_i32(buf: &[u8]) -> Result<i32> {
    let raw: [u8; 4] = buf
        .try_into()
        .map_err(|_| KvError::protocol(format!("expected 4-byte integer, got {} bytes", buf.len())))?;
    Ok(i32::from_be_bytes(raw))
}

fn len_prefix(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| KvError::protocol(format!("length {} exceeds i32 range", len)))
}

fn put_prefixed(out: &mut BytesMut, data: &[u8]) -> Result<()> {
    out.put_i32(len_prefix(data.len())?);
    out.put_slice(data);
    Ok(())
}

fn take_prefixed<'a>(buf: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    if buf.remaining() < 4 {
        return Err(KvError::protocol(format!("truncated {} length", what)));
    }
    let len = buf.get_i32();
    let len = usize::try_from(len)
        .map_err(|_| KvError::protocol(format!("negative {} length {}", what, len)))?;
    if buf.remaining() < len {
        return Err(KvError::protocol(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            len,
            buf.remaining()
        )));
    }
    let (data, rest) = (*buf).split_at(len);
    *buf = rest;
    Ok(data)
}

/// Key bytes behind a 4-byte big-endian length prefix.
pub fn encode_key(key: &str) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(4 + key.len());
    put_prefixed(&mut out, key.as_bytes())?;
    Ok(out.freeze())
}

/// Inverse of [`encode_key`]; trailing bytes are an error.
pub fn decode_key(buf: &[u8]) -> Result<String> {
    let mut cursor = buf;
    let data = take_prefixed(&mut cursor, "key")?;
    if !cursor.is_empty() {
        return Err(KvError::protocol(format!(
            "{} trailing bytes after key",
            cursor.len()
        )));
    }
    decode_string(data)
}

/// Decimal digits of `code`, NUL padded to [`STATUS_SLOT_LEN`] bytes.
pub fn encode_status(code: u32) -> Result<Bytes> {
    let digits = code.to_string();
    if digits.len() > STATUS_SLOT_LEN {
        return Err(KvError::protocol(format!("status {} does not fit slot", code)));
    }
    let mut out = BytesMut::zeroed(STATUS_SLOT_LEN);
    out[..digits.len()].copy_from_slice(digits.as_bytes());
    Ok(out.freeze())
}

/// Inverse of [`encode_status`]; the slot must be full width with only NUL after the digits.
pub fn decode_status(buf: &[u8]) -> Result<u32> {
    if buf.len() != STATUS_SLOT_LEN {
        return Err(KvError::protocol(format!(
            "status slot must be {} bytes, got {}",
            STATUS_SLOT_LEN,
            buf.len()
        )));
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    if buf[end..].iter().any(|&b| b != 0) {
        return Err(KvError::protocol("status slot has data after padding"));
    }
    let digits = std::str::from_utf8(&buf[..end])
        .map_err(|_| KvError::protocol("status slot is not ASCII"))?;
    digits
        .parse::<u32>()
        .map_err(|_| KvError::protocol(format!("status slot {:?} is not a number", digits)))
}

/// Serialize an entry for the remote-memory write of a PUT.
pub fn encode_entry(entry: &Entry) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(entry.encoded_len());
    put_prefixed(&mut out, entry.key.as_bytes())?;
    put_prefixed(&mut out, &entry.value)?;
    out.put_slice(&entry.continuation);
    Ok(out.freeze())
}

/// Inverse of [`encode_entry`].
pub fn decode_entry(buf: &[u8]) -> Result<Entry> {
    let mut cursor = buf;
    let key = decode_string(take_prefixed(&mut cursor, "entry key")?)?;
    let value = take_prefixed(&mut cursor, "entry value")?.to_vec();
    let continuation: [u8; CONTINUATION_LEN] = cursor
        .try_into()
        .map_err(|_| KvError::protocol(format!("continuation field is {} bytes", cursor.len())))?;
    Ok(Entry {
        key,
        value,
        continuation,
    })
}

fn descriptor_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Descriptor as big-endian fixed-width bincode.
pub fn encode_descriptor(desc: &MemoryRegionDescriptor) -> Result<Bytes> {
    descriptor_options()
        .serialize(desc)
        .map(Bytes::from)
        .map_err(|e| KvError::protocol(format!("descriptor encode: {}", e)))
}

/// Inverse of [`encode_descriptor`]; trailing bytes are an error.
pub fn decode_descriptor(buf: &[u8]) -> Result<MemoryRegionDescriptor> {
    descriptor_options()
        .deserialize(buf)
        .map_err(|e| KvError::protocol(format!("descriptor decode: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        for s in ["", "PUT", "ключ-κλειδί-鍵", "emoji 🦀"] {
            assert_eq!(decode_string(&encode_string(s)).unwrap(), s);
        }
        assert!(decode_string(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_i32_big_endian() {
        assert_eq!(&encode_i32(1)[..], &[0, 0, 0, 1]);
        assert_eq!(&encode_i32(-2)[..], &[0xff, 0xff, 0xff, 0xfe]);
        for v in [0, 1, -1, i32::MAX, i32::MIN, 4096] {
            assert_eq!(decode_i32(&encode_i32(v)).unwrap(), v);
        }
        assert!(decode_i32(&[0, 1]).is_err());
    }

    #[test]
    fn test_key_framing() {
        let encoded = encode_key("héllo").unwrap();
        assert_eq!(&encoded[..4], &[0, 0, 0, 6]);
        assert_eq!(decode_key(&encoded).unwrap(), "héllo");

        let empty = encode_key("").unwrap();
        assert_eq!(&empty[..], &[0, 0, 0, 0]);
        assert_eq!(decode_key(&empty).unwrap(), "");

        assert!(decode_key(&[0, 0, 0, 5, b'a']).is_err());
        assert!(decode_key(&[0, 0, 0, 1, b'a', b'b']).is_err());
    }

    #[test]
    fn test_status_slot() {
        let encoded = encode_status(200).unwrap();
        assert_eq!(encoded.len(), STATUS_SLOT_LEN);
        assert_eq!(&encoded[..3], b"200");
        assert!(encoded[3..].iter().all(|&b| b == 0));
        assert_eq!(decode_status(&encoded).unwrap(), 200);

        let wide = encode_status(4_000_000_000).unwrap();
        assert_eq!(decode_status(&wide).unwrap(), 4_000_000_000);

        assert!(decode_status(b"200").is_err());
        assert!(decode_status(b"2\x000\x00\x00\x00\x00\x00\x00\x00").is_err());
        assert!(decode_status(b"abc\x00\x00\x00\x00\x00\x00\x00").is_err());
    }

    #[test]
    fn test_entry_layout() {
        let entry = Entry::new("k", b"vv".to_vec());
        let encoded = encode_entry(&entry).unwrap();
        assert_eq!(encoded.len(), entry.encoded_len());
        assert_eq!(&encoded[..9], &[0, 0, 0, 1, b'k', 0, 0, 0, 2]);
        assert!(encoded[encoded.len() - CONTINUATION_LEN..].iter().all(|&b| b == 0));
        assert_eq!(decode_entry(&encoded).unwrap(), entry);

        assert!(decode_entry(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_descriptor_encoding() {
        let desc = MemoryRegionDescriptor::new(0xdead_beef, 128, &[1, 2, 3, 4]);
        let encoded = encode_descriptor(&desc).unwrap();
        assert_eq!(&encoded[..8], &0xdead_beefu64.to_be_bytes());
        assert_eq!(decode_descriptor(&encoded).unwrap(), desc);
        assert!(decode_descriptor(&encoded[..10]).is_err());
    }
}
