use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

use crate::protocol::{Message, ProtocolError, UsernameReply, read_frame, write_frame};
use crate::registry::Registry;

/// Chat server: accepts connections and relays framed messages between them.
///
/// Each accepted connection gets its own session task; the only state shared
/// between sessions is the [`Registry`]. One registry per server instance,
/// so independent servers can coexist in one process.
pub struct ChatServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Requests a clean stop of the accept loop. Cloneable, usable from any task.
#[derive(Clone)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

impl ChatServer {
    /// Binds to `addr` (e.g. "127.0.0.1:55555"; port 0 picks a free port).
    pub async fn new(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!("chat server bound to {}", listener.local_addr()?);
        Ok(ChatServer {
            listener,
            registry: Arc::new(Registry::new()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Accepts connections until shutdown is requested, spawning one session
    /// task per connection. Returns `Ok(())` on a requested shutdown, which
    /// drops the listener and closes the listening socket. Session tasks are
    /// not joined; each winds down on its own transport error or disconnect.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_rx;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, addr) = accepted?;
                    info!("accepted connection from {}", addr);
                    let registry = self.registry.clone();
                    tokio::spawn(
                        handle_session(socket, registry)
                            .instrument(info_span!("session", peer = %addr)),
                    );
                }
                _ = shutdown_rx.changed() => {
                    info!("shutdown requested, closing listener");
                    return Ok(());
                }
            }
        }
    }
}

/// Drives one connection from handshake to teardown.
///
/// Generic over the transport so tests can run sessions over
/// [`tokio::io::duplex`] pairs instead of TCP sockets.
///
/// A peer that closes, misbehaves, or answers the handshake with a blank
/// username is dropped silently before registration; the rest of the room
/// never learns it existed. After registration, teardown always removes the
/// entry (idempotently) and announces the leave.
pub(crate) async fn handle_session<S>(stream: S, registry: Arc<Registry>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    if let Err(e) = write_frame(&mut writer, &Message::UsernameRequest).await {
        debug!("could not greet peer: {e}");
        return;
    }

    let username = match read_frame::<_, UsernameReply>(&mut reader).await {
        Ok(reply) => reply.username.trim().to_string(),
        Err(ProtocolError::ConnectionClosed) => {
            debug!("peer left before answering the handshake");
            return;
        }
        Err(e) => {
            debug!("handshake failed: {e}");
            return;
        }
    };
    if username.is_empty() {
        debug!("rejecting blank username");
        return;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let id = registry.register(username.clone(), outbound_tx);
    info!(%id, %username, "joined the chat");
    registry.broadcast(
        &Message::Join {
            username: username.clone(),
        },
        Some(id),
    );

    // Writer task: the registry entry holds the only sender, so removing the
    // entry lets this task drain and finish on its own.
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                debug!("outbound write failed: {e}");
                break;
            }
        }
    });

    loop {
        match read_frame::<_, Message>(&mut reader).await {
            Ok(Message::Chat { text, .. }) => {
                registry.broadcast(
                    &Message::Chat {
                        username: Some(username.clone()),
                        text,
                    },
                    Some(id),
                );
            }
            Ok(other) => {
                debug!(?other, "ignoring message type not expected from a client");
            }
            Err(ProtocolError::ConnectionClosed) => {
                debug!("peer disconnected");
                break;
            }
            Err(e) => {
                warn!("terminating session: {e}");
                break;
            }
        }
    }

    if registry.remove(id).is_some() {
        info!(%id, %username, "left the chat");
        registry.broadcast(&Message::Leave { username }, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::time::{sleep, timeout};

    async fn expect_username_request(peer: &mut DuplexStream) {
        let greeting: Message = read_frame(peer).await.unwrap();
        assert_eq!(greeting, Message::UsernameRequest);
    }

    async fn wait_for_len(registry: &Registry, len: usize) {
        timeout(Duration::from_secs(5), async {
            while registry.len() != len {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry never reached expected size");
    }

    #[tokio::test]
    async fn handshake_registers_and_disconnect_unregisters() {
        let registry = Arc::new(Registry::new());
        let (mut peer, transport) = tokio::io::duplex(1024);
        tokio::spawn(handle_session(transport, registry.clone()));

        expect_username_request(&mut peer).await;
        write_frame(
            &mut peer,
            &UsernameReply {
                username: "avery".into(),
            },
        )
        .await
        .unwrap();
        wait_for_len(&registry, 1).await;
        assert_eq!(registry.snapshot()[0].1, "avery");

        drop(peer);
        wait_for_len(&registry, 0).await;
    }

    #[tokio::test]
    async fn blank_username_is_rejected_silently() {
        let registry = Arc::new(Registry::new());
        let (mut peer, transport) = tokio::io::duplex(1024);
        let session = tokio::spawn(handle_session(transport, registry.clone()));

        expect_username_request(&mut peer).await;
        write_frame(
            &mut peer,
            &UsernameReply {
                username: "   ".into(),
            },
        )
        .await
        .unwrap();

        timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();
        assert!(registry.is_empty());

        // The transport is closed; the peer sees end of stream.
        assert!(matches!(
            read_frame::<_, Message>(&mut peer).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn malformed_handshake_reply_closes_the_session() {
        let registry = Arc::new(Registry::new());
        let (mut peer, transport) = tokio::io::duplex(1024);
        let session = tokio::spawn(handle_session(transport, registry.clone()));

        expect_username_request(&mut peer).await;
        // A chat frame is not a username reply.
        write_frame(
            &mut peer,
            &Message::Chat {
                username: None,
                text: "let me in".into(),
            },
        )
        .await
        .unwrap();

        timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn registered_peer_hears_chat_from_another_session() {
        let registry = Arc::new(Registry::new());

        let (mut listener_peer, transport) = tokio::io::duplex(1024);
        tokio::spawn(handle_session(transport, registry.clone()));
        expect_username_request(&mut listener_peer).await;
        write_frame(
            &mut listener_peer,
            &UsernameReply {
                username: "brook".into(),
            },
        )
        .await
        .unwrap();
        wait_for_len(&registry, 1).await;

        let (mut talker_peer, transport) = tokio::io::duplex(1024);
        tokio::spawn(handle_session(transport, registry.clone()));
        expect_username_request(&mut talker_peer).await;
        write_frame(
            &mut talker_peer,
            &UsernameReply {
                username: "avery".into(),
            },
        )
        .await
        .unwrap();
        wait_for_len(&registry, 2).await;

        let join: Message = read_frame(&mut listener_peer).await.unwrap();
        assert_eq!(
            join,
            Message::Join {
                username: "avery".into()
            }
        );

        write_frame(
            &mut talker_peer,
            &Message::Chat {
                username: None,
                text: "hola".into(),
            },
        )
        .await
        .unwrap();

        let relayed: Message = read_frame(&mut listener_peer).await.unwrap();
        assert_eq!(
            relayed,
            Message::Chat {
                username: Some("avery".into()),
                text: "hola".into(),
            }
        );
    }
}
