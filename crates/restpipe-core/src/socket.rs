use restpipe_proto::{FrameHeader, HEADER_LEN, Message, decode_payload};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::PipeError;

/// Upper bound on a single payload. A peer announcing more than this is
/// treated as malformed rather than allocated for.
pub const MAX_PAYLOAD_LEN: u32 = 25 * 1024 * 1024;

/// Framing-aware read half of a connection.
///
/// The underlying stream is boxed so TLS streams and in-memory duplex
/// pipes read identically. EOF at any offset and every I/O or TLS fault
/// normalize to [`PipeError::Closed`]; only codec failures surface as
/// [`PipeError::Malformed`].
pub struct FrameReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
}

impl FrameReader {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self { inner: Box::new(reader) }
    }

    pub async fn read_frame(&mut self) -> Result<(FrameHeader, Message), PipeError> {
        let mut header_buf = [0u8; HEADER_LEN];
        self.inner
            .read_exact(&mut header_buf)
            .await
            .map_err(|_| PipeError::Closed)?;

        let header = FrameHeader::decode(&header_buf)?;
        if header.payload_len > MAX_PAYLOAD_LEN {
            return Err(PipeError::Malformed(format!(
                "payload length {} exceeds the {} byte cap",
                header.payload_len, MAX_PAYLOAD_LEN
            )));
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        if header.payload_len > 0 {
            self.inner
                .read_exact(&mut payload)
                .await
                .map_err(|_| PipeError::Closed)?;
        }

        let message = decode_payload(header.message_type, &payload)?;
        Ok((header, message))
    }
}

/// Framing-aware write half of a connection. Every frame is flushed.
pub struct FrameWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
}

impl FrameWriter {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self { inner: Box::new(writer) }
    }

    pub async fn write_frame(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<(), PipeError> {
        self.inner
            .write_all(&header.encode())
            .await
            .map_err(|_| PipeError::Closed)?;
        if !payload.is_empty() {
            self.inner
                .write_all(payload)
                .await
                .map_err(|_| PipeError::Closed)?;
        }
        self.inner.flush().await.map_err(|_| PipeError::Closed)
    }
}

/// Splits a bidirectional stream into framing-aware halves.
pub fn split_stream<S>(stream: S) -> (FrameReader, FrameWriter)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (FrameReader::new(reader), FrameWriter::new(writer))
}

#[cfg(test)]
mod tests {
    use restpipe_proto::{
        Event, FrameHeader, Heartbeat, Message, MessageType,
    };
    use tokio::io::AsyncWriteExt;

    use super::{FrameReader, FrameWriter, split_stream};
    use crate::error::PipeError;

    fn sample_event() -> Message {
        Message::Event(Event {
            version: 1,
            verb: "GET".to_string(),
            noun: "time".to_string(),
            mimetype: "application/json".to_string(),
            data: b"{}".to_vec(),
        })
    }

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let (near, far) = tokio::io::duplex(4096);
        let (_, mut writer) = split_stream(near);
        let (mut reader, _) = split_stream(far);

        let message = sample_event();
        let payload = message.encode_payload();
        let header = FrameHeader::new(
            message.message_type(),
            payload.len() as u32,
            1_111_111_111,
            false,
        );

        writer.write_frame(&header, &payload).await.expect("write frame");

        let (got_header, got_message) =
            reader.read_frame().await.expect("read frame");
        assert_eq!(got_header, header);
        assert_eq!(got_message, message);
    }

    #[tokio::test]
    async fn zero_length_payload_round_trips() {
        let (near, far) = tokio::io::duplex(4096);
        let (_, mut writer) = split_stream(near);
        let (mut reader, _) = split_stream(far);

        let message = Message::Heartbeat(Heartbeat::new());
        let payload = message.encode_payload();
        let header = FrameHeader::new(
            MessageType::Heartbeat,
            payload.len() as u32,
            1_000_000_007,
            false,
        );

        writer.write_frame(&header, &payload).await.expect("write frame");

        let (got_header, got_message) =
            reader.read_frame().await.expect("read frame");
        assert_eq!(got_header.payload_len, payload.len() as u32);
        assert_eq!(got_message, message);
    }

    #[tokio::test]
    async fn eof_inside_header_is_closed() {
        let (mut near, far) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(far);

        near.write_all(&[0x01, 0x00, 0x00]).await.expect("partial header");
        drop(near);

        match reader.read_frame().await {
            Err(PipeError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_inside_payload_is_closed() {
        let (mut near, far) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(far);

        let message = sample_event();
        let payload = message.encode_payload();
        let header = FrameHeader::new(
            message.message_type(),
            payload.len() as u32,
            1_222_222_222,
            false,
        );

        near.write_all(&header.encode()).await.expect("header");
        near.write_all(&payload[..payload.len() / 2]).await.expect("half");
        drop(near);

        match reader.read_frame().await {
            Err(PipeError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_payload_length_is_malformed() {
        let (mut near, far) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(far);

        let header = FrameHeader::new(
            MessageType::Event,
            super::MAX_PAYLOAD_LEN + 1,
            1_333_333_333,
            false,
        );
        near.write_all(&header.encode()).await.expect("header");

        match reader.read_frame().await {
            Err(PipeError::Malformed(_)) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn writer_surfaces_closed_peer() {
        let (near, far) = tokio::io::duplex(64);
        let (_, mut writer) = split_stream(near);
        drop(far);

        let message = sample_event();
        let payload = message.encode_payload();
        let header = FrameHeader::new(
            message.message_type(),
            payload.len() as u32,
            1_444_444_444,
            false,
        );

        match writer.write_frame(&header, &payload).await {
            Err(PipeError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }
}
