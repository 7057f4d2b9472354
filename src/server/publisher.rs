//! Service advertisement.
//!
//! The server announces itself through a [`ServicePublisher`]. Multicast-DNS
//! advertisement lives outside this crate; [`LocalPublisher`] announces into
//! a [`StaticDiscovery`] so clients in the same process can find the server.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::client::{StaticDiscovery, SERVICE_DOMAIN, SERVICE_TYPE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub service_type: String,
    pub domain: String,
    pub port: u16,
    /// TXT-style metadata
    pub txt: BTreeMap<String, String>,
}

impl ServiceInfo {
    /// Service description with the default `name`, `user` and `build`
    /// metadata of this host.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        let mut txt = BTreeMap::new();
        txt.insert("name".to_string(), whoami::devicename());
        txt.insert("user".to_string(), whoami::username());
        txt.insert("build".to_string(), env!("CARGO_PKG_VERSION").to_string());

        Self {
            name: name.into(),
            service_type: SERVICE_TYPE.to_string(),
            domain: SERVICE_DOMAIN.to_string(),
            port,
            txt,
        }
    }

    /// Name used when none is configured: this host's name.
    pub fn default_name() -> String {
        whoami::devicename()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishEvent {
    Published { name: String, port: u16 },
    PublishFailed(String),
}

pub type PublishStream = mpsc::UnboundedReceiver<PublishEvent>;

pub trait ServicePublisher: Send + Sync {
    fn publish(&self, info: ServiceInfo) -> PublishStream;

    fn unpublish(&self);
}

/// Publishes into an in-process [`StaticDiscovery`].
pub struct LocalPublisher {
    discovery: StaticDiscovery,
    addresses: Vec<SocketAddr>,
    published: Mutex<Option<ServiceInfo>>,
}

impl LocalPublisher {
    /// `addresses` are what clients resolve the service to.
    pub fn new(discovery: StaticDiscovery, addresses: Vec<SocketAddr>) -> Self {
        Self {
            discovery,
            addresses,
            published: Mutex::new(None),
        }
    }

    pub fn published(&self) -> Option<ServiceInfo> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ServiceInfo>> {
        self.published.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ServicePublisher for LocalPublisher {
    fn publish(&self, info: ServiceInfo) -> PublishStream {
        let (tx, rx) = mpsc::unbounded_channel();

        let event = if info.name.trim().is_empty() {
            PublishEvent::PublishFailed("service name is empty".to_string())
        } else if info.port == 0 {
            PublishEvent::PublishFailed("service port is not bound".to_string())
        } else if self.addresses.is_empty() {
            PublishEvent::PublishFailed("no address to advertise".to_string())
        } else {
            self.discovery
                .announce(info.name.clone(), self.addresses.clone());
            tracing::info!(
                name = %info.name,
                port = info.port,
                txt = ?info.txt,
                "Published service"
            );
            let event = PublishEvent::Published {
                name: info.name.clone(),
                port: info.port,
            };
            *self.lock() = Some(info);
            event
        };

        let _ = tx.send(event);
        rx
    }

    fn unpublish(&self) {
        if let Some(info) = self.lock().take() {
            self.discovery.withdraw(&info.name);
            tracing::info!(name = %info.name, "Unpublished service");
        }
    }
}
