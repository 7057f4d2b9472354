//! Console handler: the server's policy and output, driven by the live
//! configuration.
//!
//! Each callback works on one configuration snapshot, so a reload in the
//! middle of a callback is never observed half-applied.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use super::session::{Authorization, SessionHandler};
use crate::config::{Configuration, LiveConfig};
use crate::protocol::{Identity, ReceivedEntity};
use crate::render::Renderer;
use crate::sink::{FileSink, Persistence};

/// Renderer and sink built for one configuration snapshot.
struct Outputs {
    config: Arc<Configuration>,
    renderer: Renderer,
    sink: Option<FileSink>,
}

pub struct ConsoleHandler {
    config: LiveConfig,
    color: bool,
    outputs: Mutex<Option<Arc<Outputs>>>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleHandler {
    /// Print rendered entries to stdout.
    pub fn new(config: LiveConfig, color: bool) -> Self {
        Self::with_output(config, color, Box::new(std::io::stdout()))
    }

    pub fn with_output(config: LiveConfig, color: bool, out: Box<dyn Write + Send>) -> Self {
        Self {
            config,
            color,
            outputs: Mutex::new(None),
            out: Mutex::new(out),
        }
    }

    /// Outputs for the current snapshot, rebuilt after a reload.
    fn outputs(&self) -> Option<Arc<Outputs>> {
        let config = self.config.snapshot();
        let mut cached = lock(&self.outputs);
        if let Some(outputs) = cached.as_ref().filter(|o| Arc::ptr_eq(&o.config, &config)) {
            return Some(Arc::clone(outputs));
        }

        let renderer = match Renderer::new(&config.format, self.color) {
            Ok(renderer) => renderer,
            Err(e) => {
                tracing::error!("Cannot render entries: {}", e);
                return None;
            }
        };
        let sink = config
            .logging_file
            .enabled
            .then(|| FileSink::new(&config.logging_file.directory, renderer.clone()));
        if let Some(sink) = &sink {
            tracing::debug!(directory = %sink.directory().display(), "Persisting entries");
        }

        let outputs = Arc::new(Outputs {
            config,
            renderer,
            sink,
        });
        *cached = Some(Arc::clone(&outputs));
        Some(outputs)
    }
}

impl SessionHandler for ConsoleHandler {
    fn device_alias(&self, identity: &Identity) -> Option<String> {
        self.config
            .snapshot()
            .alias_for(identity.device_id())
            .map(str::to_string)
    }

    fn authorize(&self, identity: &Identity) -> Authorization {
        match self.config.snapshot().check_identity(identity) {
            Ok(()) => Authorization::Accept,
            Err(reason) => Authorization::Reject(Some(reason)),
        }
    }

    fn on_identity(&self, identity: &Identity) {
        let Some(outputs) = self.outputs() else {
            return;
        };
        if let Some(sink) = &outputs.sink {
            if let Err(e) = sink.save_identity(identity) {
                tracing::warn!("Failed to persist identity: {}", e);
            }
        }
    }

    fn on_entity(&self, entry: &ReceivedEntity, identified_sessions: usize) {
        let Some(outputs) = self.outputs() else {
            return;
        };
        // Naming and filtering come from the same snapshot
        let entry = &ReceivedEntity {
            device_name: outputs
                .config
                .device_name(&entry.identity, identified_sessions),
            ..entry.clone()
        };

        if outputs.config.should_display(&entry.entity) {
            let line = outputs.renderer.render(entry);
            let mut out = lock(&self.out);
            if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
                tracing::warn!("Failed to print entry: {}", e);
            }
        } else {
            tracing::debug!(
                tag = entry.entity.tag,
                module = entry.entity.module().unwrap_or_default(),
                "Filtered entry"
            );
        }

        // Persisted whether or not it is displayed
        if let Some(sink) = &outputs.sink {
            if let Err(e) = sink.save_entity(entry) {
                tracing::warn!("Failed to persist entry: {}", e);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
