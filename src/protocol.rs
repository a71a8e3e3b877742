use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest chat text relayed to other clients, in characters.
pub const MAX_CHAT_CHARS: usize = 512;

/// Upper bound on the length prefix. Anything larger is a corrupt or hostile
/// frame, not a chat message.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// One message on the wire. Frames carry a JSON object tagged by `type`;
/// tag and field names are fixed by the protocol.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Server greeting, sent once immediately after accept.
    UsernameRequest,
    /// Chat text. Clients send `{type, text}`; the server relays
    /// `{type, username, text}` with the sender's name filled in.
    #[serde(rename = "message")]
    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        text: String,
    },
    Join {
        username: String,
    },
    Leave {
        username: String,
    },
}

/// The handshake answer to [`Message::UsernameRequest`]. It is the one
/// payload without a `type` tag, so it gets its own struct.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UsernameReply {
    pub username: String,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer ended the stream, gracefully or abruptly. Session teardown,
    /// not an application error.
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// Bad length prefix or undecodable payload. The caller must drop the
    /// connection; there is no resynchronization.
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Io(io::Error),
}

fn map_io(err: io::Error) -> ProtocolError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => ProtocolError::ConnectionClosed,
        _ => ProtocolError::Io(err),
    }
}

/// Serializes `payload` and prefixes it with its 4-byte big-endian length.
pub fn encode<T: Serialize>(payload: &T) -> Result<Bytes, ProtocolError> {
    let body = serde_json::to_vec(payload)?;
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(buf.freeze())
}

/// Reads exactly one frame and decodes its payload.
///
/// A stream that ends before a full frame has been accumulated yields
/// [`ProtocolError::ConnectionClosed`], whether the peer closed before the
/// length prefix or mid-payload. Each call consumes exactly one frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(map_io)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Malformed(format!(
            "length prefix {len} exceeds limit {MAX_FRAME_LEN}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(map_io)?;
    serde_json::from_slice(&payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encodes `payload` as one frame and writes it out fully.
pub async fn write_frame<W, T>(writer: &mut W, payload: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(payload)?;
    writer.write_all(&frame).await.map_err(map_io)?;
    writer.flush().await.map_err(map_io)?;
    Ok(())
}
