use std::fmt;

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::FrameCodec;
use crate::error::LoopError;
use crate::message::Message;

/// Frames buffered in each direction before `send` waits.
const CHANNEL_DEPTH: usize = 100;

/// A framed client connection to a control server.
///
/// Reading and writing happen on background tasks; this handle only
/// moves decoded [`Message`]s through channels.
#[derive(Debug)]
pub struct Connection {
    // User -> writer task
    tx: mpsc::Sender<Message>,
    // Reader task -> user
    rx: mpsc::Receiver<Message>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {e}");
        }
        let (mut net_writer, mut net_reader) = Framed::new(stream, FrameCodec::new()).split();

        let (user_tx, mut network_rx) = mpsc::channel::<Message>(CHANNEL_DEPTH);
        let (network_tx, user_rx) = mpsc::channel(CHANNEL_DEPTH);

        // Writer task: User -> Network
        tokio::spawn(async move {
            while let Some(message) = network_rx.recv().await {
                if let Err(e) = net_writer.send(message).await {
                    warn!("network write error: {e}");
                    break;
                }
            }
            let _ = net_writer.close().await;
        });

        // Reader task: Network -> User
        tokio::spawn(async move {
            while let Some(result) = net_reader.next().await {
                match result {
                    Ok(message) => {
                        if network_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("network read error: {e}");
                        break;
                    }
                }
            }
        });

        Self {
            tx: user_tx,
            rx: user_rx,
        }
    }

    pub async fn connect(info: &ConnectionInfo) -> Result<Self, LoopError> {
        let stream = TcpStream::connect(info.to_string()).await?;
        Ok(Self::new(stream))
    }

    pub async fn send(&self, message: Message) -> Result<(), LoopError> {
        self.tx.send(message).await.map_err(LoopError::from)
    }

    /// Next decoded frame, or `None` once the server is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.tx.clone()
    }

    /// Split into the raw sender and receiver halves.
    pub fn into_parts(self) -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        (self.tx, self.rx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for ConnectionInfo {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| LoopError::Encoding(format!("missing port in address {s:?}")))?;
        let port = port
            .parse()
            .map_err(|_| LoopError::Encoding(format!("invalid port in address {s:?}")))?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn parses_host_and_port() {
        let info: ConnectionInfo = "127.0.0.1:7300".parse().unwrap();
        assert_eq!(info.host(), "127.0.0.1");
        assert_eq!(info.port(), 7300);
        assert_eq!(info.to_string(), "127.0.0.1:7300");
        assert!("localhost".parse::<ConnectionInfo>().is_err());
    }

    #[tokio::test]
    async fn messages_cross_in_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            let msg = conn.recv().await.unwrap();
            if let Message::Ping { nonce } = msg {
                conn.send(Message::Pong { nonce }).await.unwrap();
            }
            // Keep the socket open until the client read the reply.
            conn.recv().await
        });

        let info = ConnectionInfo::new("127.0.0.1", addr.port());
        let mut client = Connection::connect(&info).await.unwrap();
        client.send(Message::Ping { nonce: 11 }).await.unwrap();
        assert_eq!(client.recv().await, Some(Message::Pong { nonce: 11 }));
        drop(client);
        assert_eq!(server.await.unwrap(), None);
    }
}
