//! Plugin registry: load-time instantiation and validation.
//!
//! Candidates are registered explicitly (no filesystem scanning or dynamic
//! loading) and loaded in registration order, which is also the routing
//! order. A candidate whose construction fails, panics, or whose declaration
//! does not validate is logged and skipped; the rest still load.

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};

use gotapi_types::{PluginInformation, Service};
use tracing::{debug, info, warn};

use super::host::PluginHost;
use super::{EventSink, Plugin, PluginError};
use crate::Error;
use crate::channel::{MessagePort, connect};

pub type PluginFactory = Box<dyn FnOnce() -> Result<Box<dyn Plugin>, PluginError> + Send>;

struct Candidate {
    id: String,
    version: String,
    factory: PluginFactory,
}

/// A loaded plugin, bound to the router-facing end of its channel.
#[derive(Debug)]
pub struct PluginRegistration {
    pub id: String,
    pub name: String,
    pub version: String,
    pub services: Vec<Service>,
    pub port: MessagePort,
}

#[derive(Default)]
pub struct PluginRegistry {
    candidates: Vec<Candidate>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate. Construction is deferred until [`load`](Self::load).
    pub fn register<P, F>(&mut self, id: impl Into<String>, version: impl Into<String>, factory: F)
    where
        P: Plugin,
        F: FnOnce() -> Result<P, PluginError> + Send + 'static,
    {
        let id = id.into();
        debug!("Registering plugin candidate: {id}");
        self.candidates.push(Candidate {
            id,
            version: version.into(),
            factory: Box::new(move || factory().map(|p| Box::new(p) as Box<dyn Plugin>)),
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Instantiate every candidate and start its host task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn load(self) -> Vec<PluginRegistration> {
        let total = self.candidates.len();
        let loaded: Vec<_> = self
            .candidates
            .into_iter()
            .filter_map(|candidate| {
                let id = candidate.id.clone();
                match load_candidate(candidate) {
                    Ok(registration) => Some(registration),
                    Err(reason) => {
                        warn!("[{id}] Plugin skipped: {reason}");
                        None
                    }
                }
            })
            .collect();

        info!("Loaded {} of {} plugins", loaded.len(), total);
        loaded
    }
}

fn load_candidate(candidate: Candidate) -> crate::Result<PluginRegistration> {
    let Candidate {
        id,
        version,
        factory,
    } = candidate;

    let mut plugin = catch_unwind(AssertUnwindSafe(factory))
        .map_err(|_| Error::Plugin("construction panicked".to_string()))?
        .map_err(|e| Error::Plugin(format!("construction failed: {}", e.message)))?;

    let (router_port, plugin_port) = connect();
    let events = EventSink::new(id.clone(), plugin_port.sender());

    let info = catch_unwind(AssertUnwindSafe(|| plugin.init(events)))
        .map_err(|_| Error::Plugin("init panicked".to_string()))?
        .map_err(|e| Error::Plugin(format!("init failed: {}", e.message)))?;

    validate_information(&info).map_err(Error::Plugin)?;

    debug!(
        "[{id}] Loaded '{}' with {} services",
        info.name,
        info.services.len()
    );

    PluginHost::new(id.clone(), plugin, info.services.clone(), plugin_port).spawn();

    Ok(PluginRegistration {
        id,
        name: info.name,
        version,
        services: info.services,
        port: router_port,
    })
}

/// Check a plugin declaration.
///
/// The name must be non-empty; every service needs a non-empty `serviceId`
/// (unique within the plugin), a non-empty `name`, and at least one
/// non-empty scope. A plugin may declare no services.
///
/// # Errors
///
/// Returns a description of the first violation.
pub fn validate_information(info: &PluginInformation) -> Result<(), String> {
    if info.name.trim().is_empty() {
        return Err("the plugin name is empty".to_string());
    }

    let mut seen = HashSet::new();
    for (index, service) in info.services.iter().enumerate() {
        if service.service_id.is_empty() {
            return Err(format!("service #{index} has no serviceId"));
        }
        if !seen.insert(service.service_id.as_str()) {
            return Err(format!("duplicate serviceId '{}'", service.service_id));
        }
        if service.name.is_empty() {
            return Err(format!("service '{}' has no name", service.service_id));
        }
        if service.scopes.is_empty() {
            return Err(format!("service '{}' has no scopes", service.service_id));
        }
        if service.scopes.iter().any(String::is_empty) {
            return Err(format!("service '{}' has an empty scope", service.service_id));
        }
    }
    Ok(())
}
