//! Plugin interface and the plugin side of the message bus.
//!
//! A plugin is an ordinary request handler implementing [`Plugin`]. The
//! [`PluginRegistry`] instantiates and validates plugins, connects each one
//! to a fresh message channel and runs it under a host task that speaks the
//! bus protocol (discovery, client and token issuance, command dispatch).

mod host;
mod registry;

pub use registry::{PluginFactory, PluginRegistration, PluginRegistry, validate_information};

use gotapi_types::{PluginInformation, PluginMessage, Service};
use serde_json::Value;

use crate::Result;
use crate::channel::PortSender;

/// Failure returned by a plugin handler. `status` is an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({status})")]
pub struct PluginError {
    pub status: u16,
    pub message: String,
}

impl PluginError {
    #[must_use]
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(403, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }
}

/// Result of handling one command: the reply `data` (`Null` for none).
pub type PluginResult = std::result::Result<Value, PluginError>;

/// A capability provider reachable through the gateway.
///
/// Handlers run on the host task and must not block.
pub trait Plugin: Send + 'static {
    /// Declare the plugin and its services.
    ///
    /// Called once, on the runtime, before any message is delivered. The
    /// sink stays valid for the plugin's lifetime.
    ///
    /// # Errors
    ///
    /// An error rejects the plugin at load time.
    fn init(&mut self, events: EventSink) -> std::result::Result<PluginInformation, PluginError>;

    /// Answer one command.
    ///
    /// # Errors
    ///
    /// The error's status and message are returned to the app.
    fn handle(&mut self, request: &PluginMessage) -> PluginResult;

    /// Fresh service list for discovery, when services come and go.
    fn discover(&mut self) -> Option<Vec<Service>> {
        None
    }

    /// Decide whether an app, identified by its origin, may become a client.
    ///
    /// # Errors
    ///
    /// An error denies the client.
    fn approve_client(&mut self, _package: Option<&str>) -> std::result::Result<(), PluginError> {
        Ok(())
    }

    /// Decide whether a registered client may receive an access token.
    ///
    /// # Errors
    ///
    /// An error denies the token.
    fn approve_token(&mut self, _client_id: &str) -> std::result::Result<(), PluginError> {
        Ok(())
    }
}

/// Handle a plugin uses to push events towards the gateway.
#[derive(Debug, Clone)]
pub struct EventSink {
    plugin_id: String,
    sender: PortSender,
}

impl EventSink {
    #[must_use]
    pub fn new(plugin_id: impl Into<String>, sender: PortSender) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            sender,
        }
    }

    /// Push `data` as an event derived from `origin`, an earlier request.
    ///
    /// # Errors
    ///
    /// Returns an error once the gateway side of the channel is gone.
    pub fn push(&self, origin: &PluginMessage, data: Value) -> Result<()> {
        tracing::trace!(
            "[{}] Pushing event: {}/{}",
            self.plugin_id,
            origin.profile,
            origin.attribute
        );
        self.sender.send(PluginMessage::event_from(origin, data))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
