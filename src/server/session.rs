//! Per-connection sessions.
//!
//! Each accepted socket gets a [`ConnectionRecord`] in the shared
//! [`SessionTable`] and its own task running [`serve_connection`]: one frame
//! is read at a time, decoded, and dispatched to the [`SessionHandler`].
//! Entities are only accepted once the connection's identity was approved.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::net::TcpStream;

use crate::error::{LoggerError, Result};
use crate::protocol::{
    write_frame, Entity, FrameReader, Identity, MessageType, ReceivedEntity, Response,
};

pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    /// Set once the identity handshake succeeded
    pub identity: Option<Identity>,
    pub rejected: bool,
}

/// Active connections.
#[derive(Debug, Default)]
pub struct SessionTable {
    records: Mutex<HashMap<ConnectionId, ConnectionRecord>>,
    next_id: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, remote: SocketAddr) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(
            id,
            ConnectionRecord {
                id,
                remote,
                identity: None,
                rejected: false,
            },
        );
        id
    }

    pub fn bind_identity(&self, id: ConnectionId, identity: Identity) {
        if let Some(record) = self.lock().get_mut(&id) {
            record.identity = Some(identity);
        }
    }

    pub fn mark_rejected(&self, id: ConnectionId) {
        if let Some(record) = self.lock().get_mut(&id) {
            record.rejected = true;
        }
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.lock().remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.lock().get(&id).cloned()
    }

    /// Connections whose identity has been approved.
    pub fn identified_count(&self) -> usize {
        self.lock().values().filter(|r| r.identity.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// =============================================================================
// Handler
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Accept,
    /// Rejected, with an optional reason sent back to the client
    Reject(Option<String>),
}

/// Policy and consumer hooks invoked from connection tasks.
///
/// Calls for different connections run concurrently.
pub trait SessionHandler: Send + Sync + 'static {
    /// Display name to give a device, looked up by its identity.
    fn device_alias(&self, _identity: &Identity) -> Option<String> {
        None
    }

    fn authorize(&self, _identity: &Identity) -> Authorization {
        Authorization::Accept
    }

    /// An identity was approved.
    fn on_identity(&self, _identity: &Identity) {}

    /// An entity arrived on an approved connection. `identified_sessions`
    /// counts the approved connections at that moment.
    fn on_entity(&self, _entry: &ReceivedEntity, _identified_sessions: usize) {}
}

// =============================================================================
// Connection loop
// =============================================================================

pub(crate) struct Session {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub sessions: Arc<SessionTable>,
    pub handler: Arc<dyn SessionHandler>,
    pub write_timeout: Duration,
}

/// Serve one connection until the peer disconnects, its identity is
/// rejected, or it violates the protocol.
pub(crate) async fn serve_connection(stream: TcpStream, session: Session) -> Result<()> {
    let remote = session.remote;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut identity: Option<Identity> = None;

    loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) if e.is_frame_local() => {
                tracing::warn!(peer = %remote, "Dropping malformed frame: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };

        match frame.message_type() {
            Some(MessageType::Hello) => {
                let claimed = match Identity::decode(&frame.payload) {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        tracing::warn!(peer = %remote, "Dropping identity: {}", e);
                        continue;
                    }
                };

                match session.handshake(claimed) {
                    Ok(approved) => {
                        send(&mut write_half, &Response::hello(true, None), &session).await?;
                        identity = Some(approved);
                    }
                    Err(reason) => {
                        let response = Response::hello(false, Some(reason));
                        send(&mut write_half, &response, &session).await?;
                        return Ok(());
                    }
                }
            }
            Some(MessageType::Entity) => {
                let Some(identity) = &identity else {
                    return Err(LoggerError::ProtocolViolation {
                        peer: remote,
                        reason: "entity received before identity".into(),
                    });
                };
                let entity = match Entity::decode(&frame.payload) {
                    Ok(entity) => entity,
                    Err(e) => {
                        tracing::warn!(peer = %remote, "Dropping entity: {}", e);
                        continue;
                    }
                };

                let tag = entity.tag;
                let entry = ReceivedEntity {
                    entity,
                    identity: identity.clone(),
                    device_name: None,
                };
                session
                    .handler
                    .on_entity(&entry, session.sessions.identified_count());
                send(&mut write_half, &Response::entity_ack(tag), &session).await?;
            }
            _ => {
                tracing::warn!(
                    peer = %remote,
                    tag = %frame.type_tag_lossy(),
                    "Ignoring frame of unexpected type"
                );
            }
        }
    }
}

impl Session {
    /// Alias, then authorize. Returns the (possibly renamed) identity or the
    /// rejection reason.
    fn handshake(&self, mut identity: Identity) -> std::result::Result<Identity, String> {
        if let Some(alias) = self.handler.device_alias(&identity) {
            tracing::debug!(from = identity.host_name(), to = %alias, "Applying device alias");
            identity.rename(alias);
        }

        match self.handler.authorize(&identity) {
            Authorization::Accept => {
                tracing::info!(
                    peer = %self.remote,
                    device = identity.device_id(),
                    "Accepted identity '{}'",
                    identity.host_name()
                );
                self.sessions.bind_identity(self.id, identity.clone());
                self.handler.on_identity(&identity);
                Ok(identity)
            }
            Authorization::Reject(reason) => {
                let reason = reason.unwrap_or_else(|| "not authorized".to_string());
                let err = LoggerError::AuthorizationDenied {
                    device_id: identity.device_id().to_string(),
                    reason: reason.clone(),
                };
                tracing::warn!(peer = %self.remote, "{}", err);
                self.sessions.mark_rejected(self.id);
                Err(reason)
            }
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(
    w: &mut W,
    response: &Response,
    session: &Session,
) -> Result<()> {
    let frame = response.encode()?;
    match tokio::time::timeout(session.write_timeout, write_frame(w, &frame)).await {
        Ok(result) => result,
        Err(_) => Err(LoggerError::WriteTimeout(session.remote)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_session_table_lifecycle() {
        let table = SessionTable::new();
        let a = table.insert(addr(1));
        let b = table.insert(addr(2));
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.identified_count(), 0);

        table.bind_identity(a, Identity::new("h", "d", None));
        assert_eq!(table.identified_count(), 1);
        assert_eq!(
            table.get(a).unwrap().identity.map(|i| i.host_name().to_string()),
            Some("h".to_string())
        );

        table.mark_rejected(b);
        assert!(table.get(b).unwrap().rejected);

        let removed = table.remove(a).unwrap();
        assert_eq!(removed.remote, addr(1));
        assert_eq!(table.identified_count(), 0);
        assert!(table.remove(a).is_none());
        table.remove(b);
        assert!(table.is_empty());
    }

    struct Renaming;

    impl SessionHandler for Renaming {
        fn device_alias(&self, identity: &Identity) -> Option<String> {
            (identity.device_id() == "ipad").then(|| "Kitchen iPad".to_string())
        }

        fn authorize(&self, identity: &Identity) -> Authorization {
            if identity.device_id() == "blocked" {
                Authorization::Reject(None)
            } else {
                Authorization::Accept
            }
        }
    }

    fn session(table: &Arc<SessionTable>, id: ConnectionId) -> Session {
        Session {
            id,
            remote: addr(9),
            sessions: Arc::clone(table),
            handler: Arc::new(Renaming),
            write_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_handshake_aliases_before_binding() {
        let table = Arc::new(SessionTable::new());
        let id = table.insert(addr(9));

        let approved = session(&table, id)
            .handshake(Identity::new("iPad", "ipad", None))
            .unwrap();
        assert_eq!(approved.host_name(), "Kitchen iPad");
        assert_eq!(table.get(id).unwrap().identity, Some(approved));
    }

    #[test]
    fn test_handshake_rejection_marks_record() {
        let table = Arc::new(SessionTable::new());
        let id = table.insert(addr(9));

        let reason = session(&table, id)
            .handshake(Identity::new("x", "blocked", None))
            .unwrap_err();
        assert_eq!(reason, "not authorized");
        let record = table.get(id).unwrap();
        assert!(record.rejected);
        assert!(record.identity.is_none());
    }
}
