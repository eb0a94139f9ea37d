//! Binary wire format shared by the registry and agent protocols.
//!
//! Frame format: `[length:W][payload:length]`
//!
//! - **length**: payload size, little-endian. `W` is 2 bytes for registry
//!   frames and 8 bytes for agent frames.
//! - **payload**: `[opcode:1][body]` for requests, `[opcode:1][status:1][body]`
//!   for responses (the request opcode is echoed back).
//!
//! Body fields are little-endian integers and length-prefixed strings
//! (`u16` length) or byte strings (`u64` length).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BeamError;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to decode the next field or frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData { needed: usize, have: usize },

    /// A frame exceeds what the prefix or the receiver allows.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    /// A length-prefixed field does not fit its prefix.
    #[error("field too long: {len} bytes (max {max})")]
    FieldTooLong { len: usize, max: usize },

    /// A string field was not UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

/// Width of the length prefix in front of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPrefix {
    /// Two bytes, used by the registry protocol.
    U16,
    /// Eight bytes, used by the agent protocol.
    U64,
}

impl LengthPrefix {
    /// Number of bytes the prefix occupies.
    pub const fn width(self) -> usize {
        match self {
            Self::U16 => 2,
            Self::U64 => 8,
        }
    }

    /// Largest payload length the prefix can express.
    pub const fn max_len(self) -> u64 {
        match self {
            Self::U16 => u16::MAX as u64,
            Self::U64 => u64::MAX,
        }
    }

    fn put(self, buf: &mut BytesMut, len: u64) {
        match self {
            Self::U16 => buf.put_u16_le(len as u16),
            Self::U64 => buf.put_u64_le(len),
        }
    }

    fn decode(self, mut raw: &[u8]) -> u64 {
        match self {
            Self::U16 => raw.get_u16_le() as u64,
            Self::U64 => raw.get_u64_le(),
        }
    }
}

/// Wrap a payload in a length prefix.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the payload length does not fit the prefix.
pub fn encode_frame(prefix: LengthPrefix, payload: &[u8]) -> Result<Bytes, WireError> {
    let len = payload.len() as u64;
    if len > prefix.max_len() {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: prefix.max_len(),
        });
    }
    let mut buf = BytesMut::with_capacity(prefix.width() + payload.len());
    prefix.put(&mut buf, len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Read one frame and return its payload.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first prefix
/// byte. A stream that ends inside a prefix or payload, or a declared length
/// above `max_len`, is an error.
pub async fn read_frame<R>(
    reader: &mut R,
    prefix: LengthPrefix,
    max_len: usize,
) -> Result<Option<Bytes>, BeamError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; 8];
    let head = &mut raw[..prefix.width()];

    let first = reader.read(&mut head[..]).await?;
    if first == 0 {
        return Ok(None);
    }
    fill(reader, &mut head[first..], first).await?;

    let len = prefix.decode(head);
    if len > max_len as u64 {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: max_len as u64,
        }
        .into());
    }

    let mut body = BytesMut::zeroed(len as usize);
    fill(reader, &mut body[..], 0).await?;
    Ok(Some(body.freeze()))
}

/// Write a payload as one frame and flush it.
pub async fn write_frame<W>(
    writer: &mut W,
    prefix: LengthPrefix,
    payload: &[u8],
) -> Result<(), BeamError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(prefix, payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Fill `buf`, counting `already` bytes of the same field read earlier.
async fn fill<R>(reader: &mut R, buf: &mut [u8], already: usize) -> Result<(), BeamError>
where
    R: AsyncRead + Unpin,
{
    let needed = already + buf.len();
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => {
                return Err(WireError::InsufficientData {
                    needed,
                    have: already + filled,
                }
                .into());
            }
            n => filled += n,
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Payload builder / reader
// ---------------------------------------------------------------------------

/// Builds a payload field by field.
#[derive(Debug, Default)]
pub struct Packer {
    buf: BytesMut,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16_le(value);
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64_le(value);
        self
    }

    /// Append a string with a `u16` length prefix.
    pub fn put_str16(&mut self, value: &str) -> Result<&mut Self, WireError> {
        let len = value.len();
        if len > u16::MAX as usize {
            return Err(WireError::FieldTooLong {
                len,
                max: u16::MAX as usize,
            });
        }
        self.buf.put_u16_le(len as u16);
        self.buf.put_slice(value.as_bytes());
        Ok(self)
    }

    /// Append a byte string with a `u64` length prefix.
    pub fn put_bytes64(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_u64_le(value.len() as u64);
        self.buf.put_slice(value);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads a payload field by field; every short read is an error.
#[derive(Debug, Clone)]
pub struct Unpacker {
    buf: Bytes,
}

impl Unpacker {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn ensure(&self, needed: usize) -> Result<(), WireError> {
        if self.buf.remaining() < needed {
            return Err(WireError::InsufficientData {
                needed,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    /// Read a string with a `u16` length prefix.
    pub fn get_str16(&mut self) -> Result<String, WireError> {
        let len = self.get_u16()? as usize;
        self.ensure(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    /// Read a byte string with a `u64` length prefix.
    pub fn get_bytes64(&mut self) -> Result<Bytes, WireError> {
        let len = self.get_u64()?;
        if len > self.buf.remaining() as u64 {
            return Err(WireError::InsufficientData {
                needed: usize::try_from(len).unwrap_or(usize::MAX),
                have: self.buf.remaining(),
            });
        }
        Ok(self.buf.split_to(len as usize))
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_layout() {
        let mut packer = Packer::new();
        packer
            .put_u8(0x01)
            .put_u16(26130)
            .put_str16("agent_name")
            .unwrap()
            .put_str16("localhost")
            .unwrap();
        let frame = encode_frame(LengthPrefix::U16, &packer.finish()).unwrap();

        let mut expected = vec![];
        expected.extend_from_slice(&26u16.to_le_bytes());
        expected.push(0x01);
        expected.extend_from_slice(&26130u16.to_le_bytes());
        expected.extend_from_slice(&10u16.to_le_bytes());
        expected.extend_from_slice(b"agent_name");
        expected.extend_from_slice(&9u16.to_le_bytes());
        expected.extend_from_slice(b"localhost");
        assert_eq!(frame.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_cast_body_layout() {
        let mut packer = Packer::new();
        packer.put_u64(7).put_bytes64(b"ping");
        let body = packer.finish();
        assert_eq!(body.len(), 8 + 8 + 4);
        assert_eq!(&body[..8], &7u64.to_le_bytes());
        assert_eq!(&body[8..16], &4u64.to_le_bytes());
        assert_eq!(&body[16..], b"ping");
    }

    #[test]
    fn test_unpacker_reads_fields_in_order() {
        let mut packer = Packer::new();
        packer
            .put_u8(0x02)
            .put_u16(9190)
            .put_str16("alpha")
            .unwrap()
            .put_bytes64(&[1, 2, 3]);
        let mut unpacker = Unpacker::new(packer.finish());

        assert_eq!(unpacker.get_u8().unwrap(), 0x02);
        assert_eq!(unpacker.get_u16().unwrap(), 9190);
        assert_eq!(unpacker.get_str16().unwrap(), "alpha");
        assert_eq!(unpacker.get_bytes64().unwrap().as_ref(), &[1, 2, 3]);
        assert!(unpacker.is_empty());
    }

    #[test]
    fn test_unpacker_short_string() {
        // Declares 10 bytes but carries 3.
        let mut raw = vec![];
        raw.extend_from_slice(&10u16.to_le_bytes());
        raw.extend_from_slice(b"abc");
        let mut unpacker = Unpacker::new(Bytes::from(raw));

        assert_eq!(
            unpacker.get_str16(),
            Err(WireError::InsufficientData { needed: 10, have: 3 })
        );
    }

    #[test]
    fn test_unpacker_hostile_bytes_length() {
        let mut raw = vec![];
        raw.extend_from_slice(&u64::MAX.to_le_bytes());
        raw.extend_from_slice(b"tiny");
        let mut unpacker = Unpacker::new(Bytes::from(raw));
        assert!(matches!(
            unpacker.get_bytes64(),
            Err(WireError::InsufficientData { have: 4, .. })
        ));
    }

    #[test]
    fn test_unpacker_invalid_utf8() {
        let mut raw = vec![];
        raw.extend_from_slice(&2u16.to_le_bytes());
        raw.extend_from_slice(&[0xff, 0xfe]);
        let mut unpacker = Unpacker::new(Bytes::from(raw));
        assert_eq!(unpacker.get_str16(), Err(WireError::InvalidUtf8));
    }

    #[test]
    fn test_str16_rejects_oversized_field() {
        let long = "x".repeat(u16::MAX as usize + 1);
        let mut packer = Packer::new();
        assert!(matches!(
            packer.put_str16(&long),
            Err(WireError::FieldTooLong { .. })
        ));
    }

    #[test]
    fn test_u16_prefix_rejects_large_payload() {
        let payload = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            encode_frame(LengthPrefix::U16, &payload),
            Err(WireError::FrameTooLarge { .. })
        ));
        assert!(encode_frame(LengthPrefix::U64, &payload).is_ok());
    }

    #[tokio::test]
    async fn test_read_frame_beyond_u16_range() {
        let payload = vec![0xabu8; 100_000];
        let frame = encode_frame(LengthPrefix::U64, &payload).unwrap();
        let mut reader = frame.as_ref();

        let got = read_frame(&mut reader, LengthPrefix::U64, 1 << 20)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.len(), 100_000);
        assert!(got.iter().all(|b| *b == 0xab));
    }

    #[tokio::test]
    async fn test_read_frame_clean_eof() {
        let mut reader: &[u8] = &[];
        let got = read_frame(&mut reader, LengthPrefix::U16, 1024).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_read_frame_truncated_body() {
        let mut raw = vec![];
        raw.extend_from_slice(&5u16.to_le_bytes());
        raw.extend_from_slice(b"ab");
        let mut reader = raw.as_slice();

        let err = read_frame(&mut reader, LengthPrefix::U16, 1024)
            .await
            .unwrap_err();
        assert!(err.is_protocol());
        assert!(matches!(
            err,
            BeamError::Wire(WireError::InsufficientData { needed: 5, have: 2 })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_truncated_prefix() {
        let raw = [0x10u8, 0x00, 0x00];
        let mut reader = &raw[..];
        let err = read_frame(&mut reader, LengthPrefix::U64, 1024)
            .await
            .unwrap_err();
        assert!(err.is_protocol());
        assert!(matches!(
            err,
            BeamError::Wire(WireError::InsufficientData { needed: 8, have: 3 })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_enforces_max_len() {
        let frame = encode_frame(LengthPrefix::U64, &[0u8; 64]).unwrap();
        let mut reader = frame.as_ref();
        let err = read_frame(&mut reader, LengthPrefix::U64, 32)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BeamError::Wire(WireError::FrameTooLarge { size: 64, max: 32 })
        ));
    }

    #[tokio::test]
    async fn test_write_then_read_consecutive_frames() {
        let (mut client, mut server) = tokio::io::duplex(256);
        write_frame(&mut client, LengthPrefix::U16, b"one").await.unwrap();
        write_frame(&mut client, LengthPrefix::U16, b"two").await.unwrap();
        drop(client);

        let first = read_frame(&mut server, LengthPrefix::U16, 64).await.unwrap();
        let second = read_frame(&mut server, LengthPrefix::U16, 64).await.unwrap();
        let end = read_frame(&mut server, LengthPrefix::U16, 64).await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"one"[..]));
        assert_eq!(second.as_deref(), Some(&b"two"[..]));
        assert!(end.is_none());
    }
}
