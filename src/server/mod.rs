//! Logging server.
//!
//! Accepts client connections and serves each one from its own task; see
//! [`session`] for the per-connection protocol.

pub mod handler;
pub mod publisher;
pub mod session;

pub use handler::ConsoleHandler;
pub use publisher::{LocalPublisher, PublishEvent, PublishStream, ServiceInfo, ServicePublisher};
pub use session::{Authorization, ConnectionId, ConnectionRecord, SessionHandler, SessionTable};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::client::DEFAULT_TIMEOUT;
use crate::error::{LoggerError, Result};
use session::{serve_connection, Session};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// A response write taking longer than this fails the connection
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], crate::config::DEFAULT_PORT)),
            write_timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub struct LoggingServer {
    listener: TcpListener,
    sessions: Arc<SessionTable>,
    handler: Arc<dyn SessionHandler>,
    write_timeout: Duration,
}

impl LoggingServer {
    pub async fn bind(config: ServerConfig, handler: Arc<dyn SessionHandler>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        Ok(Self {
            listener,
            sessions: Arc::new(SessionTable::new()),
            handler,
            write_timeout: config.write_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn sessions(&self) -> Arc<SessionTable> {
        Arc::clone(&self.sessions)
    }

    /// Accept connections until `shutdown` completes, then drop every open
    /// connection.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();
        tracing::info!(addr = %self.local_addr()?, "Accepting connections");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let id = self.sessions.insert(remote);
                    tracing::info!(peer = %remote, id, "Client connected");

                    let session = Session {
                        id,
                        remote,
                        sessions: Arc::clone(&self.sessions),
                        handler: Arc::clone(&self.handler),
                        write_timeout: self.write_timeout,
                    };
                    let sessions = Arc::clone(&self.sessions);
                    connections.spawn(async move {
                        match serve_connection(stream, session).await {
                            Ok(()) => {}
                            Err(e @ LoggerError::ProtocolViolation { .. }) => tracing::error!("{}", e),
                            Err(e) => tracing::warn!(peer = %remote, "Connection failed: {}", e),
                        }
                        sessions.remove(id);
                        tracing::info!(peer = %remote, id, "Bye");
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        tracing::info!(open = connections.len(), "Shutting down");
        connections.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        encode, write_frame, Entity, FrameReader, Identity, MessageType, ReceivedEntity, Response,
        Severity, SourceType,
    };
    use std::sync::Mutex;
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct Recorder {
        entities: Mutex<Vec<ReceivedEntity>>,
    }

    impl SessionHandler for Recorder {
        fn authorize(&self, identity: &Identity) -> Authorization {
            if identity.device_id() == "blocked" {
                Authorization::Reject(Some("device blocked".into()))
            } else {
                Authorization::Accept
            }
        }

        fn on_entity(&self, entry: &ReceivedEntity, _identified_sessions: usize) {
            self.entities.lock().unwrap().push(entry.clone());
        }
    }

    async fn start(
        handler: Arc<Recorder>,
    ) -> (SocketAddr, Arc<SessionTable>, oneshot::Sender<()>) {
        let config = ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = LoggingServer::bind(config, handler).await.unwrap();
        let addr = server.local_addr().unwrap();
        let sessions = server.sessions();
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(server.run(async move {
            let _ = stopped.await;
        }));
        (addr, sessions, stop)
    }

    async fn response<R: tokio::io::AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Response {
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.message_type(), Some(MessageType::Ack));
        Response::decode(&frame.payload).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_then_entities_acked() {
        let recorder = Arc::new(Recorder::default());
        let (addr, sessions, _stop) = start(Arc::clone(&recorder)).await;

        let (read_half, mut write_half) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut reader = FrameReader::new(read_half);

        let hello = Identity::new("desk", "dev", None).encode().unwrap();
        write_frame(&mut write_half, &hello).await.unwrap();
        let reply = response(&mut reader).await;
        assert!(reply.accepted);
        assert_eq!(reply.source_type, SourceType::Hello);
        assert_eq!(sessions.identified_count(), 1);

        // Garbage and unknown frame types are skipped
        write_frame(&mut write_half, &encode(*b"ZZ", b"whatever"))
            .await
            .unwrap();
        write_frame(&mut write_half, &encode(*b"EN", b"!!"))
            .await
            .unwrap();

        for tag in [100, 101] {
            let entity = Entity::new(format!("m{}", tag), Severity::Info, tag);
            write_frame(&mut write_half, &entity.encode().unwrap())
                .await
                .unwrap();
            let ack = response(&mut reader).await;
            assert_eq!(ack.source_type, SourceType::Entity);
            assert_eq!(ack.source_tag, tag);
        }

        let received = recorder.entities.lock().unwrap().clone();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].entity.message, "m100");
        assert_eq!(received[1].identity.host_name(), "desk");
    }

    #[tokio::test]
    async fn test_rejected_identity_closes_connection() {
        let recorder = Arc::new(Recorder::default());
        let (addr, sessions, _stop) = start(recorder).await;

        let (read_half, mut write_half) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut reader = FrameReader::new(read_half);
        let hello = Identity::new("bad", "blocked", None).encode().unwrap();
        write_frame(&mut write_half, &hello).await.unwrap();

        let reply = response(&mut reader).await;
        assert!(!reply.accepted);
        assert_eq!(reply.message.as_deref(), Some("device blocked"));
        assert!(reader.read_frame().await.unwrap().is_none());

        tokio::time::timeout(Duration::from_secs(1), async {
            while !sessions.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_entity_before_identity_closes_connection() {
        let recorder = Arc::new(Recorder::default());
        let (addr, _sessions, _stop) = start(Arc::clone(&recorder)).await;

        let (read_half, mut write_half) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut reader = FrameReader::new(read_half);
        let entity = Entity::new("sneaky", Severity::Error, 100);
        write_frame(&mut write_half, &entity.encode().unwrap())
            .await
            .unwrap();

        assert!(reader.read_frame().await.unwrap().is_none());
        assert!(recorder.entities.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let recorder = Arc::new(Recorder::default());
        let config = ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = LoggingServer::bind(config, recorder).await.unwrap();
        let addr = server.local_addr().unwrap();

        server.run(async {}).await.unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
