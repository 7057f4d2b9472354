//! Logging client.
//!
//! [`LoggingClient`] queues entities and streams them to a discovered
//! server. A single driver task owns the [`ConnectionMachine`] and every
//! socket; discovery events, resolve and connect outcomes, and frames read
//! from the server all arrive at the driver over one channel, so connection
//! state is only ever touched from one place. The pending queue is the one
//! structure shared with producers, behind its own lock.
//!
//! Entities are written one at a time: the next is written only after the
//! server acknowledged the previous tag.

pub mod backoff;
pub mod discovery;
pub mod queue;
pub mod state;

pub use backoff::{Backoff, BackoffPolicy};
pub use discovery::{
    Discovery, DiscoveryEvent, DiscoveryStream, SelectionPolicy, ServiceCandidate,
    StaticDiscovery, DEFAULT_TIMEOUT, SERVICE_DOMAIN, SERVICE_TYPE,
};
pub use queue::PendingQueue;
pub use state::{Action, AttemptId, ConnectionMachine, Event, Phase};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::LoggerError;
use crate::protocol::{
    write_frame, Entity, FrameReader, Identity, MessageType, Response, Severity, SourceType,
    TagSequence,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub service_type: String,
    /// Bound on each resolve, connect and frame write
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    pub selection: SelectionPolicy,
    pub identity: Identity,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_type: SERVICE_TYPE.to_string(),
            timeout: DEFAULT_TIMEOUT,
            backoff: BackoffPolicy::default(),
            selection: SelectionPolicy::default(),
            identity: Identity::local(),
        }
    }
}

/// Snapshot of the connection, published after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub phase: Phase,
    pub peer: Option<SocketAddr>,
    /// Addresses that rejected this client's identity
    pub rejected: Vec<SocketAddr>,
}

impl ClientStatus {
    fn of(machine: &ConnectionMachine) -> Self {
        let mut rejected: Vec<SocketAddr> = machine.rejected_addresses().iter().copied().collect();
        rejected.sort();
        Self {
            phase: machine.phase(),
            peer: machine.peer(),
            rejected,
        }
    }
}

struct Shared {
    queue: Mutex<PendingQueue>,
    tags: TagSequence,
    /// Wakes the driver to attempt a dispatch
    wake: Notify,
    pending: watch::Sender<usize>,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, PendingQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct LoggingClient {
    shared: Arc<Shared>,
    stop: mpsc::UnboundedSender<()>,
    status: watch::Receiver<ClientStatus>,
    task: JoinHandle<()>,
}

impl LoggingClient {
    /// Start discovering and connecting in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: ClientConfig, discovery: Arc<dyn Discovery>) -> Self {
        let machine = ConnectionMachine::new(config.backoff);
        let (status_tx, status) = watch::channel(ClientStatus::of(&machine));
        let (pending, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            queue: Mutex::new(PendingQueue::new()),
            tags: TagSequence::new(),
            wake: Notify::new(),
            pending,
        });
        let (stop, stop_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals) = mpsc::unbounded_channel();

        let driver = Driver {
            config,
            discovery,
            machine,
            shared: Arc::clone(&shared),
            signals_tx,
            signals,
            browse: None,
            browse_at: None,
            pending_socket: None,
            connection: None,
            status: status_tx,
        };
        let task = tokio::spawn(driver.run(stop_rx));

        Self {
            shared,
            stop,
            status,
            task,
        }
    }

    /// Queue a message. Returns the tag it will be sent with.
    pub fn log(&self, message: impl Into<String>, severity: Severity) -> i64 {
        let message = message.into();
        self.enqueue(|tag| Entity::new(message, severity, tag))
    }

    pub fn log_at(
        &self,
        message: impl Into<String>,
        severity: Severity,
        filename: Option<&str>,
        line: Option<u32>,
        function: Option<&str>,
    ) -> i64 {
        let message = message.into();
        self.enqueue(|tag| {
            Entity::new(message, severity, tag).with_location(
                filename.map(str::to_string),
                line,
                function.map(str::to_string),
            )
        })
    }

    /// Queue a message made of several parts joined by single spaces.
    pub fn log_parts(&self, parts: &[&str], severity: Severity) -> i64 {
        self.log(parts.join(" "), severity)
    }

    /// Queue a prepared entity. Its tag is replaced by the next one in this
    /// client's sequence.
    pub fn log_entity(&self, mut entity: Entity) -> i64 {
        self.enqueue(|tag| {
            entity.tag = tag;
            entity
        })
    }

    /// Tags are drawn under the queue lock so queue order matches tag order.
    fn enqueue(&self, build: impl FnOnce(i64) -> Entity) -> i64 {
        let tag = {
            let mut queue = self.shared.queue();
            let tag = self.shared.tags.next_tag();
            queue.push(build(tag));
            self.shared.pending.send_replace(queue.len());
            tag
        };
        self.shared.wake.notify_one();
        tag
    }

    /// Entities queued and not yet acknowledged.
    pub fn pending(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    /// Wait until the connection reaches `phase`. `None` once the client
    /// has shut down.
    pub async fn wait_for_phase(&self, phase: Phase) -> Option<ClientStatus> {
        let mut status = self.status.clone();
        let reached = status.wait_for(|s| s.phase == phase).await.ok()?;
        Some(reached.clone())
    }

    /// Wait until every queued entity has been acknowledged.
    pub async fn wait_drained(&self) {
        let mut pending = self.shared.pending.subscribe();
        let _ = pending.wait_for(|n| *n == 0).await;
    }

    /// Stop discovery, close the connection and wait for the driver to exit.
    /// Unsent entities are discarded.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            tracing::warn!("Client driver ended abnormally: {}", e);
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

enum Signal {
    Machine(Event),
    Socket { attempt: AttemptId, stream: TcpStream },
    Ack { attempt: AttemptId, tag: i64 },
}

struct Connection {
    attempt: AttemptId,
    frames: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    authenticated: bool,
}

struct Driver {
    config: ClientConfig,
    discovery: Arc<dyn Discovery>,
    machine: ConnectionMachine,
    shared: Arc<Shared>,
    signals_tx: mpsc::UnboundedSender<Signal>,
    signals: mpsc::UnboundedReceiver<Signal>,
    browse: Option<DiscoveryStream>,
    browse_at: Option<Instant>,
    /// Connected socket waiting for the machine to accept it
    pending_socket: Option<(AttemptId, TcpStream)>,
    connection: Option<Connection>,
    status: watch::Sender<ClientStatus>,
}

impl Driver {
    async fn run(mut self, mut stop: mpsc::UnboundedReceiver<()>) {
        self.apply(Event::Start);

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                Some(signal) = self.signals.recv() => self.on_signal(signal),
                _ = self.shared.wake.notified() => self.dispatch(),
                event = next_discovery_event(&mut self.browse) => match event {
                    Some(event) => self.apply(discovery_event(event)),
                    None => self.browse = None,
                },
                _ = browse_timer(self.browse_at) => {
                    self.browse_at = None;
                    self.begin_browse();
                }
            }
        }

        self.apply(Event::Stop);
        tracing::debug!("Client driver stopped");
    }

    fn apply(&mut self, event: Event) {
        for action in self.machine.handle(event) {
            self.execute(action);
        }
        let status = ClientStatus::of(&self.machine);
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::StartBrowsing { delay } => {
                if delay.is_zero() {
                    self.begin_browse();
                } else {
                    self.browse_at = Some(Instant::now() + delay);
                }
            }
            Action::StopBrowsing => {
                self.discovery.stop_browsing();
                self.browse = None;
                self.browse_at = None;
            }
            Action::Choose(candidates) => {
                let policy = self.config.selection.clone();
                let signals = self.signals_tx.clone();
                // Selection may prompt on a terminal
                tokio::task::spawn_blocking(move || {
                    let index = policy.select(&candidates);
                    let _ = signals.send(Signal::Machine(Event::CandidateChosen(index)));
                });
            }
            Action::Resolve { attempt, name } => self.resolve(attempt, name),
            Action::Connect { attempt, addr } => self.connect(attempt, addr),
            Action::SendIdentity { attempt } => self.open_connection(attempt),
            Action::Close { attempt } => self.close(attempt),
            Action::Authenticated { attempt, addr } => {
                tracing::info!(peer = %addr, "Connected to server");
                if let Some(conn) = self.connection.as_mut().filter(|c| c.attempt == attempt) {
                    conn.authenticated = true;
                }
                self.dispatch();
            }
        }
    }

    fn begin_browse(&mut self) {
        tracing::info!(service_type = %self.config.service_type, "Browsing for servers");
        self.browse = Some(self.discovery.browse(&self.config.service_type));
    }

    fn resolve(&self, attempt: AttemptId, name: String) {
        let discovery = Arc::clone(&self.discovery);
        let signals = self.signals_tx.clone();
        let timeout = self.config.timeout;

        tokio::spawn(async move {
            let event = match tokio::time::timeout(timeout, discovery.resolve(&name)).await {
                Ok(Ok(addresses)) => Event::Resolved { attempt, addresses },
                Ok(Err(e)) => Event::ResolveFailed {
                    attempt,
                    reason: e.to_string(),
                },
                Err(_) => Event::ResolveFailed {
                    attempt,
                    reason: LoggerError::ResolutionTimeout(name).to_string(),
                },
            };
            let _ = signals.send(Signal::Machine(event));
        });
    }

    fn connect(&self, attempt: AttemptId, addr: SocketAddr) {
        let signals = self.signals_tx.clone();
        let timeout = self.config.timeout;

        tokio::spawn(async move {
            let signal = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => Signal::Socket { attempt, stream },
                Ok(Err(e)) => Signal::Machine(Event::ConnectFailed {
                    attempt,
                    reason: e.to_string(),
                }),
                Err(_) => Signal::Machine(Event::ConnectFailed {
                    attempt,
                    reason: LoggerError::ConnectTimeout(addr).to_string(),
                }),
            };
            let _ = signals.send(signal);
        });
    }

    fn on_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Machine(event) => {
                if let Event::Response { response, .. } = &event {
                    self.log_hello_response(response);
                }
                self.apply(event);
            }
            Signal::Socket { attempt, stream } => {
                let _ = stream.set_nodelay(true);
                self.pending_socket = Some((attempt, stream));
                self.apply(Event::Connected { attempt });
            }
            Signal::Ack { attempt, tag } => self.on_ack(attempt, tag),
        }
    }

    fn log_hello_response(&self, response: &Response) {
        let Some(addr) = self.machine.peer() else {
            return;
        };
        if !response.accepted {
            let err = LoggerError::HandshakeRejected {
                addr,
                message: response.message.clone().unwrap_or_default(),
            };
            tracing::warn!("{}", err);
        }
    }

    /// Split the accepted socket into reader and writer tasks and write the
    /// identity frame first.
    fn open_connection(&mut self, attempt: AttemptId) {
        let stream = match self.pending_socket.take() {
            Some((pending, stream)) if pending == attempt => stream,
            _ => return,
        };
        let Some(addr) = self.machine.peer() else {
            return;
        };

        let (read_half, write_half) = stream.into_split();
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_responses(read_half, attempt, self.signals_tx.clone()));
        let writer = tokio::spawn(write_frames(
            write_half,
            frames_rx,
            addr,
            self.config.timeout,
            attempt,
            self.signals_tx.clone(),
        ));

        match self.config.identity.encode() {
            Ok(hello) => {
                tracing::debug!(peer = %addr, "Sending identity");
                let _ = frames.send(hello);
            }
            Err(e) => {
                let _ = self.signals_tx.send(Signal::Machine(Event::Disconnected {
                    attempt,
                    reason: format!("cannot encode identity: {}", e),
                }));
            }
        }

        self.connection = Some(Connection {
            attempt,
            frames,
            reader,
            writer,
            authenticated: false,
        });
    }

    fn close(&mut self, attempt: AttemptId) {
        if matches!(self.pending_socket, Some((pending, _)) if pending == attempt) {
            self.pending_socket = None;
        }
        if self.connection.as_ref().map(|c| c.attempt) != Some(attempt) {
            return;
        }
        let Some(conn) = self.connection.take() else {
            return;
        };

        conn.reader.abort();
        conn.writer.abort();

        let mut queue = self.shared.queue();
        if let Some(lost) = queue.abandon_in_flight() {
            tracing::warn!(tag = lost.tag, "Entity in flight lost with the connection");
        }
        self.shared.pending.send_replace(queue.len());
    }

    fn on_ack(&mut self, attempt: AttemptId, tag: i64) {
        if self.connection.as_ref().map(|c| c.attempt) != Some(attempt) {
            return;
        }
        {
            let mut queue = self.shared.queue();
            if !queue.acknowledge(tag) {
                tracing::debug!(tag, "Ignoring acknowledgment for unknown tag");
                return;
            }
            tracing::trace!(tag, remaining = queue.len(), "Entity acknowledged");
            self.shared.pending.send_replace(queue.len());
        }
        self.dispatch();
    }

    /// Write the queue head if authenticated and nothing is in flight.
    fn dispatch(&mut self) {
        let Some(conn) = self.connection.as_ref() else {
            return;
        };
        let ready = conn.authenticated && self.machine.is_authenticated();
        let mut queue = self.shared.queue();

        while let Some(entity) = queue.begin_dispatch(ready) {
            match entity.encode() {
                Ok(frame) => {
                    tracing::trace!(tag = entity.tag, "Writing entity");
                    let _ = conn.frames.send(frame);
                    return;
                }
                Err(e) => {
                    tracing::error!(tag = entity.tag, "Dropping entity: {}", e);
                    queue.abandon_in_flight();
                    self.shared.pending.send_replace(queue.len());
                }
            }
        }
    }
}

fn discovery_event(event: DiscoveryEvent) -> Event {
    match event {
        DiscoveryEvent::Found { name, more_coming } => Event::ServiceFound { name, more_coming },
        DiscoveryEvent::Removed { name } => Event::ServiceRemoved { name },
    }
}

async fn next_discovery_event(browse: &mut Option<DiscoveryStream>) -> Option<DiscoveryEvent> {
    match browse {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

async fn browse_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Read server responses until the connection ends.
async fn read_responses(
    read_half: OwnedReadHalf,
    attempt: AttemptId,
    signals: mpsc::UnboundedSender<Signal>,
) {
    let mut reader = FrameReader::new(read_half);

    let reason = loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "connection closed by server".to_string(),
            Err(e) if e.is_frame_local() => {
                tracing::warn!("Dropping malformed frame: {}", e);
                continue;
            }
            Err(e) => break e.to_string(),
        };

        if frame.message_type() != Some(MessageType::Ack) {
            tracing::warn!(tag = %frame.type_tag_lossy(), "Ignoring unexpected frame");
            continue;
        }
        let signal = match Response::decode(&frame.payload) {
            Ok(response) if response.source_type == SourceType::Entity => Signal::Ack {
                attempt,
                tag: response.source_tag,
            },
            Ok(response) => Signal::Machine(Event::Response { attempt, response }),
            Err(e) => {
                tracing::warn!("Dropping malformed response: {}", e);
                continue;
            }
        };
        if signals.send(signal).is_err() {
            return;
        }
    };

    tracing::debug!(attempt, "Reader finished: {}", reason);
    let _ = signals.send(Signal::Machine(Event::Disconnected { attempt, reason }));
}

/// Write queued frames in order; a write that does not complete within
/// `timeout` fails the connection.
async fn write_frames(
    mut write_half: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    addr: SocketAddr,
    timeout: Duration,
    attempt: AttemptId,
    signals: mpsc::UnboundedSender<Signal>,
) {
    while let Some(frame) = frames.recv().await {
        let result = match tokio::time::timeout(timeout, write_frame(&mut write_half, &frame)).await
        {
            Ok(result) => result,
            Err(_) => Err(LoggerError::WriteTimeout(addr)),
        };
        if let Err(e) = result {
            let _ = signals.send(Signal::Machine(Event::Disconnected {
                attempt,
                reason: e.to_string(),
            }));
            return;
        }
    }
}
