//! Service discovery adapter.
//!
//! The connection state machine consumes discovery through [`Discovery`]:
//! a browse subscription yielding found/removed events, plus address
//! resolution for one service at a time. Multicast-DNS browsing lives
//! outside this crate; [`StaticDiscovery`] serves a fixed (or test-driven)
//! set of services.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{LoggerError, Result};

/// Service type browsed for and published.
pub const SERVICE_TYPE: &str = "_cli-logger-server._tcp.";

/// Browse domain.
pub const SERVICE_DOMAIN: &str = "local.";

/// Bound on each resolve, connect and write.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A discovered service and, once resolved, its addresses in preference
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCandidate {
    pub name: String,
    pub addresses: Vec<SocketAddr>,
}

impl ServiceCandidate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addresses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A service appeared. `more_coming` is set while the adapter knows more
    /// events are immediately queued behind this one.
    Found { name: String, more_coming: bool },
    Removed { name: String },
}

pub type DiscoveryStream = mpsc::UnboundedReceiver<DiscoveryEvent>;

#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Start browsing for `service_type`, cancelling any previous
    /// subscription.
    fn browse(&self, service_type: &str) -> DiscoveryStream;

    fn stop_browsing(&self);

    /// Resolve a found service to its addresses. Callers bound this with a
    /// timeout.
    async fn resolve(&self, name: &str) -> Result<Vec<SocketAddr>>;
}

// =============================================================================
// Candidate selection
// =============================================================================

pub type SelectFn = dyn Fn(&[ServiceCandidate]) -> Option<usize> + Send + Sync;

/// Picks one service when several are found.
#[derive(Clone, Default)]
pub enum SelectionPolicy {
    #[default]
    First,
    /// Prefer a service by name (e.g. the last one used), else the first
    PreferName(String),
    Custom(Arc<SelectFn>),
}

impl SelectionPolicy {
    /// `None` aborts the connection attempt.
    ///
    /// A single candidate is chosen without consulting the policy.
    pub fn select(&self, candidates: &[ServiceCandidate]) -> Option<usize> {
        match candidates.len() {
            0 => return None,
            1 => return Some(0),
            _ => {}
        }

        let index = match self {
            SelectionPolicy::First => Some(0),
            SelectionPolicy::PreferName(name) => Some(
                candidates
                    .iter()
                    .position(|c| &c.name == name)
                    .unwrap_or(0),
            ),
            SelectionPolicy::Custom(select) => select(candidates),
        };
        index.filter(|i| *i < candidates.len())
    }
}

impl fmt::Debug for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionPolicy::First => write!(f, "First"),
            SelectionPolicy::PreferName(name) => f.debug_tuple("PreferName").field(name).finish(),
            SelectionPolicy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

// =============================================================================
// Static discovery
// =============================================================================

#[derive(Default)]
struct StaticState {
    services: BTreeMap<String, Vec<SocketAddr>>,
    subscriber: Option<mpsc::UnboundedSender<DiscoveryEvent>>,
}

/// Discovery over a known set of services.
///
/// `announce` and `withdraw` emulate services appearing and disappearing
/// on the network.
#[derive(Clone, Default)]
pub struct StaticDiscovery {
    state: Arc<Mutex<StaticState>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(self, name: impl Into<String>, addresses: Vec<SocketAddr>) -> Self {
        self.lock().services.insert(name.into(), addresses);
        self
    }

    pub fn announce(&self, name: impl Into<String>, addresses: Vec<SocketAddr>) {
        let name = name.into();
        let mut state = self.lock();
        state.services.insert(name.clone(), addresses);
        if let Some(tx) = &state.subscriber {
            let _ = tx.send(DiscoveryEvent::Found {
                name,
                more_coming: false,
            });
        }
    }

    pub fn withdraw(&self, name: &str) {
        let mut state = self.lock();
        if state.services.remove(name).is_some() {
            if let Some(tx) = &state.subscriber {
                let _ = tx.send(DiscoveryEvent::Removed {
                    name: name.to_string(),
                });
            }
        }
    }

    pub fn is_browsing(&self) -> bool {
        self.lock()
            .subscriber
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn lock(&self) -> MutexGuard<'_, StaticState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    fn browse(&self, service_type: &str) -> DiscoveryStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        let count = state.services.len();
        for (i, name) in state.services.keys().enumerate() {
            let _ = tx.send(DiscoveryEvent::Found {
                name: name.clone(),
                more_coming: i + 1 < count,
            });
        }
        tracing::debug!(service_type, services = count, "Browsing static services");

        // Replacing the sender closes the previous subscription
        state.subscriber = Some(tx);
        rx
    }

    fn stop_browsing(&self) {
        self.lock().subscriber = None;
    }

    async fn resolve(&self, name: &str) -> Result<Vec<SocketAddr>> {
        self.lock()
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| LoggerError::ResolutionFailed {
                service: name.to_string(),
                reason: "service is no longer advertised".into(),
            })
    }
}
