//! Framing: length-prefix (4 bytes LE) + bincode payload for packets, and the
//! compact binary frame used for chunk responses.

use serde::{Deserialize, Serialize};

use crate::protocol::Packet;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

const TAG_PACKET: u8 = 0x01;
const TAG_BINARY: u8 = 0x02;

/// What a peer connection carries: structured packets or binary chunk frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Packet(Packet),
    Binary(Vec<u8>),
}

/// Encode a packet into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(packet).map_err(FrameEncodeError::Encode)?;
    length_prefixed(&payload)
}

fn length_prefixed(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error encoding a packet into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the packet and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Packet, usize), FrameDecodeError> {
    let (body, consumed) = split_frame(bytes)?;
    let packet: Packet = bincode::deserialize(body).map_err(FrameDecodeError::Decode)?;
    Ok((packet, consumed))
}

fn split_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, unknown tag, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("unknown payload tag {0:#04x}")]
    UnknownTag(u8),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Encode a transport payload for a byte-stream connection: one tag byte, then a length-prefixed body.
pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>, FrameEncodeError> {
    let (tag, body) = match payload {
        Payload::Packet(p) => (TAG_PACKET, encode_frame(p)?),
        Payload::Binary(b) => (TAG_BINARY, length_prefixed(b)?),
    };
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(tag);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one tagged payload from the front of `bytes`; mirrors `decode_frame`.
pub fn decode_payload(bytes: &[u8]) -> Result<(Payload, usize), FrameDecodeError> {
    let Some((&tag, rest)) = bytes.split_first() else {
        return Err(FrameDecodeError::NeedMore);
    };
    match tag {
        TAG_PACKET => {
            let (packet, n) = decode_frame(rest)?;
            Ok((Payload::Packet(packet), n + 1))
        }
        TAG_BINARY => {
            let (body, n) = split_frame(rest)?;
            Ok((Payload::Binary(body.to_vec()), n + 1))
        }
        other => Err(FrameDecodeError::UnknownTag(other)),
    }
}

/// Header of a binary chunk frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    pub request_id: u64,
    pub offset: u64,
}

/// Build a chunk frame: `[header_len: u8][bincode header][raw chunk bytes]`.
pub fn encode_chunk_frame(header: ChunkHeader, chunk: &[u8]) -> Result<Vec<u8>, ChunkFrameError> {
    let head = bincode::serialize(&header)?;
    let head_len = u8::try_from(head.len()).map_err(|_| ChunkFrameError::HeaderTooLong)?;
    let mut out = Vec::with_capacity(1 + head.len() + chunk.len());
    out.push(head_len);
    out.extend_from_slice(&head);
    out.extend_from_slice(chunk);
    Ok(out)
}

/// Split a chunk frame into its header and chunk bytes.
pub fn decode_chunk_frame(frame: &[u8]) -> Result<(ChunkHeader, &[u8]), ChunkFrameError> {
    let Some((&head_len, rest)) = frame.split_first() else {
        return Err(ChunkFrameError::Truncated);
    };
    let head_len = head_len as usize;
    if rest.len() < head_len {
        return Err(ChunkFrameError::Truncated);
    }
    let header: ChunkHeader = bincode::deserialize(&rest[..head_len])?;
    Ok((header, &rest[head_len..]))
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkFrameError {
    #[error("chunk frame truncated")]
    Truncated,
    #[error("chunk header longer than 255 bytes")]
    HeaderTooLong,
    #[error("bad chunk header: {0}")]
    Header(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerId;

    fn sample_hello() -> Packet {
        Packet::Hello {
            peer_id: PeerId::generate(),
            name: "ada".into(),
            network_id: PeerId::hub(2),
        }
    }

    #[test]
    fn roundtrip_hello() {
        let packet = sample_hello();
        let frame = encode_frame(&packet).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_hello()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut frame = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        frame.extend_from_slice(&[0u8; 8]);
        assert!(matches!(decode_frame(&frame), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn tagged_payloads_back_to_back() {
        let a = Payload::Packet(Packet::Ping);
        let b = Payload::Binary(vec![7u8; 40]);
        let mut buf = encode_payload(&a).unwrap();
        let first_len = buf.len();
        buf.extend_from_slice(&encode_payload(&b).unwrap());
        let (p1, n1) = decode_payload(&buf).unwrap();
        assert_eq!(n1, first_len);
        let (p2, n2) = decode_payload(&buf[n1..]).unwrap();
        assert_eq!(n1 + n2, buf.len());
        assert_eq!(p1, a);
        assert_eq!(p2, b);
    }

    #[test]
    fn unknown_tag_is_an_error() {
        assert!(matches!(
            decode_payload(&[0x7f, 0, 0, 0, 0]),
            Err(FrameDecodeError::UnknownTag(0x7f))
        ));
    }

    #[test]
    fn chunk_frame_layout() {
        let header = ChunkHeader {
            request_id: 9,
            offset: 512 * 1024,
        };
        let data = vec![0xabu8; 1000];
        let frame = encode_chunk_frame(header, &data).unwrap();
        let head_len = frame[0] as usize;
        assert_eq!(frame.len(), 1 + head_len + data.len());
        let (decoded, body) = decode_chunk_frame(&frame).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body, &data[..]);
    }

    #[test]
    fn chunk_frame_truncated_header() {
        assert!(matches!(decode_chunk_frame(&[]), Err(ChunkFrameError::Truncated)));
        assert!(matches!(
            decode_chunk_frame(&[16, 1, 2, 3]),
            Err(ChunkFrameError::Truncated)
        ));
    }
}
