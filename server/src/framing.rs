//! Async reading and writing of length-prefixed messages on a stream
//!
//! [`read_message`] suits one-shot exchanges such as the handshake. A
//! connection that waits on several events at once reads through a
//! [`FrameReader`] instead, since partial frames survive a cancelled read.

use crate::error::ConnectionError;
use shared::message::FRAME_HEADER_LEN;
use shared::{decode_message, encode_frame, frame_len, Message};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads the next message, or `None` if the peer closed cleanly between frames
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = frame_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(decode_message(&payload)?))
}

const READ_CHUNK_LEN: usize = 4096;

/// Buffered message reader that is safe to use as a `select!` branch
///
/// Bytes are only ever moved from the socket into the internal buffer, so
/// dropping a pending [`FrameReader::next_message`] loses nothing.
pub struct FrameReader<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
        }
    }

    /// Reads the next message, or `None` if the peer closed cleanly between frames
    pub async fn next_message(&mut self) -> Result<Option<Message>, ConnectionError> {
        loop {
            if let Some(message) = self.take_frame()? {
                return Ok(Some(message));
            }

            let mut chunk = [0u8; READ_CHUNK_LEN];
            let read = self.reader.read(&mut chunk).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                )
                .into());
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    fn take_frame(&mut self) -> Result<Option<Message>, ConnectionError> {
        let Some(header) = self.buffer.get(..FRAME_HEADER_LEN) else {
            return Ok(None);
        };
        let mut len_bytes = [0u8; FRAME_HEADER_LEN];
        len_bytes.copy_from_slice(header);
        let len = frame_len(len_bytes)?;

        let end = FRAME_HEADER_LEN + len;
        if self.buffer.len() < end {
            return Ok(None);
        }

        let message = decode_message(&self.buffer[FRAME_HEADER_LEN..end])?;
        self.buffer.drain(..end);
        Ok(Some(message))
    }
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use shared::message::MAX_FRAME_LEN;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        assert_ok!(write_message(&mut client, &Message::name("Ada")).await);
        assert_ok!(write_message(&mut client, &Message::chat("hi")).await);

        let first = read_message(&mut server).await.unwrap().unwrap();
        let second = read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(first, Message::name("Ada"));
        assert_eq!(second, Message::chat("hi"));
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        assert!(read_message(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_transport_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        assert!(matches!(
            read_message(&mut server).await,
            Err(ConnectionError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        assert!(matches!(
            read_message(&mut server).await,
            Err(ConnectionError::Protocol(ProtocolError::Frame(_)))
        ));
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&2u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0xFF, 0xFF]).await.unwrap();

        assert!(matches!(
            read_message(&mut server).await,
            Err(ConnectionError::Protocol(ProtocolError::Frame(_)))
        ));
    }

    #[tokio::test]
    async fn test_frame_reader_reassembles_split_frames() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut frames = FrameReader::new(server);

        let mut bytes = encode_frame(&Message::name("Ada")).unwrap();
        bytes.extend(encode_frame(&Message::chat("hi")).unwrap());
        let (head, tail) = bytes.split_at(3);

        client.write_all(head).await.unwrap();
        // Nothing complete yet, so a bounded wait gives up without losing bytes
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(20), frames.next_message()).await;
        assert!(pending.is_err());

        client.write_all(tail).await.unwrap();
        assert_eq!(frames.next_message().await.unwrap(), Some(Message::name("Ada")));
        assert_eq!(frames.next_message().await.unwrap(), Some(Message::chat("hi")));

        drop(client);
        assert_eq!(frames.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_reader_eof_mid_frame_is_transport_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut frames = FrameReader::new(server);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(&[1, 2]).await.unwrap();
        drop(client);

        assert!(matches!(
            frames.next_message().await,
            Err(ConnectionError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_frame_reader_rejects_oversized_header() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut frames = FrameReader::new(server);
        client
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        assert!(matches!(
            frames.next_message().await,
            Err(ConnectionError::Protocol(ProtocolError::Frame(_)))
        ));
    }
}
