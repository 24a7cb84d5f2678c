use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

const LENGTH_PREFIX: usize = 4;
const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// FrameCodec frames a multi-part message on a byte stream.
///
/// Layout, all integers big-endian u32:
///
/// ```text
/// | part count | len(part 0) | part 0 | len(part 1) | part 1 | ...
/// ```
///
/// Every part must be valid UTF-8. A message larger than 16 MiB is rejected as `InvalidData`,
/// which ends the connection it arrived on.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Vec<String>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let total_len = match scan_message_len(src)? {
            Some(len) => len,
            None => return Ok(None),
        };

        let mut message = src.split_to(total_len);
        let part_count = message.get_u32() as usize;
        let mut parts = Vec::with_capacity(part_count);
        for _ in 0..part_count {
            let part_len = message.get_u32() as usize;
            let part = message.split_to(part_len);
            let part = String::from_utf8(part.to_vec()).map_err(|e| invalid_data(e.to_string()))?;
            parts.push(part);
        }

        Ok(Some(parts))
    }
}

impl<S: AsRef<str>> Encoder<Vec<S>> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, parts: Vec<S>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_parts(&parts, dst)
    }
}

/// Encode `parts` into `dst`. Used directly when one encoding is fanned out to many links.
pub(crate) fn encode_parts<S: AsRef<str>>(parts: &[S], dst: &mut BytesMut) -> io::Result<()> {
    let total_len = LENGTH_PREFIX + parts.iter().map(|p| LENGTH_PREFIX + p.as_ref().len()).sum::<usize>();
    if total_len > MAX_MESSAGE_BYTES {
        return Err(invalid_data(format!(
            "Message of {} bytes exceeds limit of {} bytes",
            total_len, MAX_MESSAGE_BYTES
        )));
    }

    dst.reserve(total_len);
    dst.put_u32(parts.len() as u32);
    for part in parts {
        let part = part.as_ref().as_bytes();
        dst.put_u32(part.len() as u32);
        dst.put_slice(part);
    }

    Ok(())
}

/// Returns the byte length of the first complete message in `src`, or None if more bytes are
/// needed. Nothing is consumed.
fn scan_message_len(src: &mut BytesMut) -> io::Result<Option<usize>> {
    if src.len() < LENGTH_PREFIX {
        return Ok(None);
    }

    let part_count = read_u32_at(src, 0);
    let mut offset = LENGTH_PREFIX;
    for _ in 0..part_count {
        if src.len() < offset + LENGTH_PREFIX {
            return Ok(None);
        }
        let part_len = read_u32_at(src, offset);
        offset += LENGTH_PREFIX + part_len;
        if offset > MAX_MESSAGE_BYTES {
            return Err(invalid_data(format!(
                "Incoming message exceeds limit of {} bytes",
                MAX_MESSAGE_BYTES
            )));
        }
        if src.len() < offset {
            src.reserve(offset - src.len());
            return Ok(None);
        }
    }

    Ok(Some(offset))
}

fn read_u32_at(src: &BytesMut, offset: usize) -> usize {
    let mut be_bytes = [0u8; LENGTH_PREFIX];
    be_bytes.copy_from_slice(&src[offset..offset + LENGTH_PREFIX]);
    u32::from_be_bytes(be_bytes) as usize
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn decode_waits_for_complete_message() {
        let mut encoded = BytesMut::new();
        encode_parts(&["ALIVE", "node-1"], &mut encoded).unwrap();
        let full = encoded.clone();

        let mut codec = FrameCodec;
        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert_eq!(codec.decode(&mut partial).unwrap(), None, "cut at {}", cut);
        }

        let mut complete = full.clone();
        complete.extend_from_slice(&full[..3]);
        assert_eq!(
            codec.decode(&mut complete).unwrap(),
            Some(vec!["ALIVE".to_string(), "node-1".to_string()])
        );
        // Trailing bytes of the next message stay buffered.
        assert_eq!(complete.len(), 3);
    }

    #[test]
    fn decode_keeps_empty_parts_and_empty_messages() {
        let mut encoded = BytesMut::new();
        encode_parts(&["t", "", "x"], &mut encoded).unwrap();
        encode_parts::<&str>(&[], &mut encoded).unwrap();

        let mut codec = FrameCodec;
        assert_eq!(
            codec.decode(&mut encoded).unwrap(),
            Some(vec!["t".to_string(), "".to_string(), "x".to_string()])
        );
        assert_eq!(codec.decode(&mut encoded).unwrap(), Some(vec![]));
        assert!(encoded.is_empty());
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        let mut encoded = BytesMut::new();
        encoded.put_u32(1);
        encoded.put_u32(2);
        encoded.put_slice(&[0xC3, 0x28]);

        let err = FrameCodec.decode(&mut encoded).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn decode_rejects_oversized_message() {
        let mut encoded = BytesMut::new();
        encoded.put_u32(1);
        encoded.put_u32(MAX_MESSAGE_BYTES as u32);

        let err = FrameCodec.decode(&mut encoded).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn framed_stream_over_duplex() {
        let (writer, reader) = tokio::io::duplex(64);

        let writer_task = tokio::spawn(async move {
            let mut sink = FramedWrite::new(writer, FrameCodec);
            sink.send(vec!["topic", "sender", "a,b", "payload"]).await.unwrap();
            sink.send(vec!["ALIVE", "sender"]).await.unwrap();
        });

        let mut stream = FramedRead::new(reader, FrameCodec);
        let mut received = Vec::new();
        while let Some(parts) = stream.next().await {
            received.push(parts.unwrap());
        }
        writer_task.await.unwrap();

        assert_eq!(
            received,
            vec![
                vec!["topic", "sender", "a,b", "payload"],
                vec!["ALIVE", "sender"],
            ]
        );
    }
}
