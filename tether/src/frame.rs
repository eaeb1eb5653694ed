//! Wire framing for peer and client links.
//!
//! Every frame is a fixed 5-byte header followed by the payload:
//! `[kind: u8][len: u32 little-endian][payload bytes]`. Heartbeats carry
//! no payload; data frames carry an opaque application payload whose
//! meaning this layer never inspects.

use {
    crate::error::FrameError,
    bytes::{Buf, BufMut, Bytes, BytesMut},
};

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 5;

const KIND_HEARTBEAT: u8 = 0;
const KIND_DATA: u8 = 1;

const HEARTBEAT_BYTES: [u8; FRAME_HEADER_LEN] = [KIND_HEARTBEAT, 0, 0, 0, 0];

/// The pre-encoded heartbeat frame (header only, zero-length payload).
pub fn heartbeat_frame() -> Bytes {
    Bytes::from_static(&HEARTBEAT_BYTES)
}

/// A single decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Keepalive. Sent by endpoints, echoed back by pool peers.
    Heartbeat,
    /// Opaque application payload.
    Data(Bytes),
}

impl Frame {
    /// Short tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Heartbeat => "heartbeat",
            Frame::Data(_) => "data",
        }
    }

    /// Encode the frame, rejecting payloads over `max_frame_bytes`.
    pub fn encode(&self, max_frame_bytes: usize) -> Result<Bytes, FrameError> {
        let (kind, payload) = match self {
            Frame::Heartbeat => (KIND_HEARTBEAT, &[][..]),
            Frame::Data(payload) => (KIND_DATA, payload.as_ref()),
        };
        if payload.len() > max_frame_bytes {
            return Err(FrameError::TooLarge {
                size: payload.len(),
                max: max_frame_bytes,
            });
        }
        let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
            size: payload.len(),
            max: max_frame_bytes,
        })?;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN.saturating_add(payload.len()));
        buf.put_u8(kind);
        buf.put_u32_le(len);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }
}

/// Incremental frame decoder over a growable receive buffer.
///
/// Feed raw socket bytes in with [`extend`](Self::extend), then pull
/// complete frames out with [`next_frame`](Self::next_frame) until it
/// reports that more bytes are needed.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    /// Create a decoder enforcing the given payload size limit.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame_bytes,
        }
    }

    /// Append freshly-read socket bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to decode the next complete frame. `Ok(None)` means more bytes
    /// are needed. A decode error is a protocol violation; the caller is
    /// expected to drop the connection.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let kind = self.buf[0];
        let len = u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        match kind {
            KIND_HEARTBEAT | KIND_DATA => {}
            other => return Err(FrameError::UnknownKind(other)),
        }
        if len > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                size: len,
                max: self.max_frame_bytes,
            });
        }
        if kind == KIND_HEARTBEAT && len != 0 {
            return Err(FrameError::HeartbeatPayload(len));
        }
        let total = FRAME_HEADER_LEN.saturating_add(len);
        if self.buf.len() < total {
            return Ok(None);
        }
        let mut frame = self.buf.split_to(total);
        frame.advance(FRAME_HEADER_LEN);
        Ok(Some(match kind {
            KIND_HEARTBEAT => Frame::Heartbeat,
            _ => Frame::Data(frame.freeze()),
        }))
    }

    /// Bytes currently buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    #[test]
    fn test_encode_decode_data() {
        let frame = Frame::Data(Bytes::from_static(b"hello"));
        let wire = frame.encode(MAX).unwrap();
        assert_eq!(wire.len(), FRAME_HEADER_LEN + 5);

        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&wire);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_heartbeat_frame_is_header_only() {
        let wire = heartbeat_frame();
        assert_eq!(wire.len(), FRAME_HEADER_LEN);
        assert_eq!(wire, Frame::Heartbeat.encode(MAX).unwrap());

        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&wire);
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Heartbeat));
    }

    #[test]
    fn test_decode_across_partial_feeds() {
        let wire = Frame::Data(Bytes::from_static(b"split me up")).encode(MAX).unwrap();
        let mut decoder = FrameDecoder::new(MAX);
        // Feed one byte at a time; the frame must appear exactly once,
        // exactly when the last byte lands.
        let (last, head) = wire.split_last().unwrap();
        for byte in head {
            decoder.extend(std::slice::from_ref(byte));
            assert!(decoder.next_frame().unwrap().is_none());
        }
        decoder.extend(std::slice::from_ref(last));
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(Frame::Data(Bytes::from_static(b"split me up")))
        );
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut all = Vec::new();
        for payload in [&b"one"[..], b"two", b"three"] {
            let frame = Frame::Data(Bytes::copy_from_slice(payload));
            all.extend_from_slice(&frame.encode(MAX).unwrap());
        }
        all.extend_from_slice(&heartbeat_frame());

        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&all);
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Data(Bytes::from_static(b"one"))));
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Data(Bytes::from_static(b"two"))));
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Data(Bytes::from_static(b"three"))));
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Heartbeat));
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let frame = Frame::Data(Bytes::from(vec![0u8; MAX + 1]));
        assert_matches::assert_matches!(
            frame.encode(MAX),
            Err(FrameError::TooLarge { size, max }) if size == MAX + 1 && max == MAX
        );
    }

    #[test]
    fn test_decode_rejects_oversized_header() {
        let mut wire = BytesMut::new();
        wire.put_u8(1);
        wire.put_u32_le(u32::try_from(MAX.saturating_add(1)).unwrap());
        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&wire);
        assert_matches::assert_matches!(decoder.next_frame(), Err(FrameError::TooLarge { .. }));
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&[0x7f, 0, 0, 0, 0]);
        assert_matches::assert_matches!(decoder.next_frame(), Err(FrameError::UnknownKind(0x7f)));
    }

    #[test]
    fn test_decode_rejects_heartbeat_with_payload() {
        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&[0, 3, 0, 0, 0]);
        assert_matches::assert_matches!(decoder.next_frame(), Err(FrameError::HeartbeatPayload(3)));
    }
}
