//! On-the-wire record layout shared by every transport.
//!
//! A record is `len: u32 LE` followed by `len` bytes of bincode `Envelope`. Bodies above
//! `MAX_FRAME_LEN` are refused in both directions.

use crate::protocol::Envelope;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let body = bincode::serialize(envelope)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or(FrameEncodeError::TooLarge(body.len()))?;
    let mut frame = Vec::with_capacity(LEN_SIZE + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("cannot serialize envelope: {0}")]
    Encode(#[from] bincode::Error),
    #[error("envelope is {0} bytes, over the {max} byte frame limit", max = MAX_FRAME_LEN)]
    TooLarge(usize),
}

/// Split the first record off `bytes`, returning it with the count of bytes it used.
/// `NeedMore` means the buffer ends mid-record; keep it and retry once more has arrived.
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    let Some(prefix) = bytes.first_chunk::<LEN_SIZE>() else {
        return Err(FrameDecodeError::NeedMore);
    };
    let len = u32::from_le_bytes(*prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    let end = LEN_SIZE + len as usize;
    let body = bytes.get(LEN_SIZE..end).ok_or(FrameDecodeError::NeedMore)?;
    Ok((decode_body(body)?, end))
}

/// For readers that pull the length prefix off the stream themselves.
pub fn decode_body(body: &[u8]) -> Result<Envelope, FrameDecodeError> {
    Ok(bincode::deserialize(body)?)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("incomplete frame")]
    NeedMore,
    #[error("frame claims {0} bytes, over the {max} byte limit", max = MAX_FRAME_LEN)]
    TooLarge(u32),
    #[error("cannot deserialize envelope: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatMessage, Chunk, Control, Payload, Recipient, Tag};
    use uuid::Uuid;

    fn sample_chat() -> Envelope {
        Envelope::new(
            Payload::Chat(ChatMessage::text("user_1_aaaa", Recipient::All, "hello")),
            1,
        )
    }

    #[test]
    fn roundtrip_chat() {
        let env = sample_chat();
        let frame = encode_frame(&env).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, env);
        assert_eq!(decoded.tag, Tag::Msg);
    }

    #[test]
    fn tag_is_encoded_as_its_wire_value() {
        let env = Envelope::new(Payload::Control(Control::Leave), 3);
        let frame = encode_frame(&env).unwrap();
        // bincode lays out fields in order: payload, source (u32), tag (u8) last.
        assert_eq!(*frame.last().unwrap(), 4);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_chat()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..super::LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_prefix_rejected() {
        let mut frame = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        frame.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::TooLarge(n)) if n == MAX_FRAME_LEN + 1
        ));
    }

    #[test]
    fn oversized_envelope_is_not_framed() {
        let env = Envelope::new(
            Payload::FileChunk(Chunk {
                file_id: Uuid::new_v4(),
                filename: "big.bin".into(),
                index: 0,
                total: 1,
                payload: vec![0u8; MAX_FRAME_LEN as usize],
                to: "user_2_bbbb".into(),
            }),
            1,
        );
        match encode_frame(&env) {
            Err(FrameEncodeError::TooLarge(n)) => assert!(n > MAX_FRAME_LEN as usize),
            other => panic!("unexpected {:?}", other.map(|f| f.len())),
        }
    }

    #[test]
    fn multiple_envelopes() {
        let a = sample_chat();
        let b = Envelope::new(
            Payload::FileChunk(Chunk {
                file_id: Uuid::new_v4(),
                filename: "a.bin".into(),
                index: 0,
                total: 1,
                payload: vec![7u8; 300],
                to: "user_2_bbbb".into(),
            }),
            1,
        );
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert!(matches!(m1.payload, Payload::Chat(_)));
        assert!(matches!(m2.payload, Payload::FileChunk(_)));
    }
}
