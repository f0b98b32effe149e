//! Plugin-side runtime for one message channel.
//!
//! The host owns the plugin and answers every request arriving on the
//! plugin's port. Bus housekeeping (discovery, client and token issuance,
//! token checks) happens here so plugin bodies only see real commands.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use gotapi_types::{PluginMessage, Service, attribute, profile};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{Plugin, PluginError};
use crate::channel::MessagePort;
use crate::ids;

const CLIENT_DENIED: &str = "The Plug-In denied the request for a client ID.";
const TOKEN_DENIED: &str = "The Plug-In denied the request for an access token.";
const UNKNOWN_CLIENT: &str =
    "The specified client ID has not been registered or has been expired.";
const INVALID_TOKEN: &str = "The access token is invalid.";

pub(crate) struct PluginHost {
    id: String,
    plugin: Box<dyn Plugin>,
    services: Vec<Service>,
    /// Issued client id -> origin of the app it was issued for.
    clients: HashMap<String, Option<String>>,
    /// Issued token -> client id.
    tokens: HashMap<String, String>,
    port: MessagePort,
}

impl PluginHost {
    pub(crate) fn new(
        id: String,
        plugin: Box<dyn Plugin>,
        services: Vec<Service>,
        port: MessagePort,
    ) -> Self {
        Self {
            id,
            plugin,
            services,
            clients: HashMap::new(),
            tokens: HashMap::new(),
            port,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!("[{}] Plugin host started", self.id);
        while let Some(request) = self.port.recv().await {
            trace!(
                "[{}] Received: {}/{} code={:?}",
                self.id, request.profile, request.attribute, request.request_code
            );
            let reply = self.answer(&request);
            if self.port.send(reply).is_err() {
                break;
            }
        }
        debug!("[{}] Plugin host stopped", self.id);
    }

    fn answer(&mut self, request: &PluginMessage) -> PluginMessage {
        match (request.profile.as_str(), request.attribute.as_str()) {
            (profile::NETWORK_SERVICE_DISCOVERY, attribute::GET_NETWORK_SERVICES) => {
                self.discover(request)
            }
            (profile::AUTHORIZATION, attribute::CREATE_CLIENT) => self.create_client(request),
            (profile::AUTHORIZATION, attribute::REQUEST_ACCESS_TOKEN) => {
                self.issue_token(request)
            }
            _ => self.command(request),
        }
    }

    fn discover(&mut self, request: &PluginMessage) -> PluginMessage {
        let plugin = &mut self.plugin;
        match guarded(|| plugin.discover()) {
            Ok(Some(services)) => self.services = services,
            Ok(None) => {}
            Err(e) => return PluginMessage::error_to(request, e.status, e.message),
        }
        let mut reply = PluginMessage::response_to(request);
        reply.services = Some(self.services.clone());
        reply
    }

    fn create_client(&mut self, request: &PluginMessage) -> PluginMessage {
        let package = request.package.as_deref();
        let plugin = &mut self.plugin;
        if let Err(e) = guarded(|| plugin.approve_client(package)).and_then(|r| r) {
            debug!("[{}] Client denied: {}", self.id, e.message);
            return PluginMessage::error_to(request, 403, non_empty_or(e.message, CLIENT_DENIED));
        }

        let client_id = ids::unique_id();
        self.clients
            .insert(client_id.clone(), request.package.clone());
        let mut reply = PluginMessage::response_to(request);
        reply.client_id = Some(client_id);
        reply
    }

    fn issue_token(&mut self, request: &PluginMessage) -> PluginMessage {
        let Some(client_id) = request
            .client_id
            .as_deref()
            .filter(|id| self.clients.contains_key(*id))
        else {
            return PluginMessage::error_to(request, 401, UNKNOWN_CLIENT);
        };

        let plugin = &mut self.plugin;
        if let Err(e) = guarded(|| plugin.approve_token(client_id)).and_then(|r| r) {
            debug!("[{}] Token denied: {}", self.id, e.message);
            return PluginMessage::error_to(request, 403, non_empty_or(e.message, TOKEN_DENIED));
        }

        let token = ids::unique_id();
        self.tokens.insert(token.clone(), client_id.to_string());
        let mut reply = PluginMessage::response_to(request);
        reply.client_id = Some(client_id.to_string());
        reply.access_token = Some(token);
        reply
    }

    fn command(&mut self, request: &PluginMessage) -> PluginMessage {
        let known = request
            .access_token
            .as_deref()
            .is_some_and(|t| self.tokens.contains_key(t));
        if !known {
            return PluginMessage::error_to(request, 401, INVALID_TOKEN);
        }

        let plugin = &mut self.plugin;
        match guarded(|| plugin.handle(request)).and_then(|r| r) {
            Ok(data) => {
                let mut reply = PluginMessage::response_to(request);
                if !data.is_null() {
                    reply.data = Some(data);
                }
                reply
            }
            Err(e) => PluginMessage::error_to(request, e.status, e.message),
        }
    }
}

/// Run plugin code, turning a panic into a 500 error.
fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, PluginError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let reason = panic_message(payload.as_ref());
        warn!("Plugin panicked: {reason}");
        PluginError::internal(format!("The Plug-In caused an error: {reason}"))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn non_empty_or(message: String, fallback: &str) -> String {
    if message.is_empty() {
        fallback.to_string()
    } else {
        message
    }
}
