use anyhow::{Result, bail};
use tokio::net::TcpStream;
use tracing::info;

use crate::protocol::{Message, ProtocolError, UsernameReply, read_frame, write_frame};

/// A client for connecting to and interacting with the chat server.
///
/// Speaks the framed protocol: it answers the server's handshake, sends
/// chat text, and receives relayed [`Message`]s.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    /// Establishes a connection to the chat server at the given address.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        info!("connected to {}", addr);
        Ok(Client { stream })
    }

    /// Completes the username handshake: waits for the server's
    /// `username_request` and answers it with `username`.
    pub async fn handshake(&mut self, username: &str) -> Result<()> {
        match read_frame::<_, Message>(&mut self.stream).await? {
            Message::UsernameRequest => {}
            other => bail!("expected a username request, got {:?}", other),
        }
        write_frame(
            &mut self.stream,
            &UsernameReply {
                username: username.to_string(),
            },
        )
        .await?;
        info!("handshake complete as {}", username);
        Ok(())
    }

    /// Sends one chat message. The server fills in the username when
    /// relaying, so only the text goes out.
    pub async fn send_chat(&mut self, text: &str) -> Result<()> {
        write_frame(
            &mut self.stream,
            &Message::Chat {
                username: None,
                text: text.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Receives the next message from the server.
    pub async fn recv(&mut self) -> Result<Message, ProtocolError> {
        read_frame(&mut self.stream).await
    }
}
