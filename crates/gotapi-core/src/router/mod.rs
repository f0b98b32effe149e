//! Capability router and correlation engine.
//!
//! The router runs as a single task that owns every piece of mutable routing
//! state: the pending-request table, the approved-clients cache and the
//! live plugin list. It reacts to three inputs, one at a time:
//!
//! - dispatch requests from the gateway ([`RouterHandle::dispatch`])
//! - messages from plugins (one forwarding task per plugin port)
//! - the 1 second watchdog tick
//!
//! Every pending entry ends in exactly one terminal event: a matched plugin
//! response, a send failure, the watchdog, or its caller going away. An
//! abandoned request is never advanced to the next plugin exchange.
//! Responses that match no live entry are dropped.

mod approvals;
mod pending;

use std::collections::VecDeque;
use std::time::Duration;

use gotapi_types::{
    Action, Command, ErrorKind, Method, PluginMessage, Service, attribute, param,
    plugin_failure_status, profile,
};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use self::approvals::ApprovedClients;
use self::pending::{Origin, PendingRequest, PendingTable, Stage};
use crate::auth::Client;
use crate::channel::PortSender;
use crate::error::GatewayError;
use crate::ids;
use crate::plugin::PluginRegistration;

/// Interval between timeout sweeps.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

const PLUGIN_TIMEOUT: &str = "The Plug-In did not respond.";
const PLUGIN_UNAVAILABLE: &str = "The Plug-In is not available.";
const ROUTER_STOPPED: &str = "The plug-in router is not running.";
const CLIENT_DENIED: &str = "The Plug-In denied the request for a client ID.";
const TOKEN_DENIED: &str = "The Plug-In denied the request for an access token.";
const TOKEN_REJECTED: &str = "The Plug-In rejected the access token.";

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long any plugin exchange may stay unanswered.
    pub response_timeout: Duration,
    /// Stamped as `receiver` on plugin-bound messages.
    pub app_id: String,
}

/// Terminal answer for one dispatched command.
pub type Outcome = Result<RouteReply, GatewayError>;

/// Successful plugin answer, stripped of bus-only fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RouteReply {
    pub data: Option<Value>,
    pub services: Option<Vec<Service>>,
    pub extra: Map<String, Value>,
}

/// Plugin event, attributed to an app client when its token is known.
#[derive(Debug, Clone)]
pub struct RoutedEvent {
    pub plugin_id: String,
    pub client_id: Option<String>,
    pub message: PluginMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouterStats {
    pub plugins: usize,
    pub pending: usize,
    pub approvals: usize,
}

#[derive(Debug)]
enum RouterCommand {
    Dispatch {
        client: Client,
        command: Command,
        reply: oneshot::Sender<Outcome>,
    },
    Stats {
        reply: oneshot::Sender<RouterStats>,
    },
}

/// Cloneable handle to the router task. The task stops when every handle
/// is dropped.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    commands: mpsc::UnboundedSender<RouterCommand>,
}

impl RouterHandle {
    /// Route `command` for `client` and wait for its terminal answer.
    ///
    /// # Errors
    ///
    /// Any routing, handshake, plugin or timeout failure.
    pub async fn dispatch(&self, client: Client, command: Command) -> Outcome {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RouterCommand::Dispatch {
                client,
                command,
                reply,
            })
            .map_err(|_| GatewayError::internal(ROUTER_STOPPED))?;
        rx.await
            .unwrap_or_else(|_| Err(GatewayError::internal(ROUTER_STOPPED)))
    }

    /// Snapshot of the router's tables, `None` if it has stopped.
    pub async fn stats(&self) -> Option<RouterStats> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(RouterCommand::Stats { reply }).ok()?;
        rx.await.ok()
    }
}

#[derive(Debug)]
struct PluginLink {
    id: String,
    services: Vec<Service>,
    sender: PortSender,
}

pub struct Router {
    plugins: Vec<PluginLink>,
    pending: PendingTable,
    approvals: ApprovedClients,
    config: RouterConfig,
    events: mpsc::UnboundedSender<RoutedEvent>,
}

impl Router {
    /// Start the router task over the loaded plugins.
    ///
    /// Plugin order is routing order. Events are delivered on `events`.
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(
        registrations: Vec<PluginRegistration>,
        config: RouterConfig,
        events: mpsc::UnboundedSender<RoutedEvent>,
    ) -> RouterHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let mut plugins = Vec::with_capacity(registrations.len());
        for (index, registration) in registrations.into_iter().enumerate() {
            let (sender, mut receiver) = registration.port.split();
            let inbox = inbox_tx.clone();
            tokio::spawn(async move {
                while let Some(message) = receiver.recv().await {
                    if inbox.send((index, message)).is_err() {
                        break;
                    }
                }
            });
            info!(
                "[{}] Routing {} services ({} v{})",
                registration.id,
                registration.services.len(),
                registration.name,
                registration.version
            );
            plugins.push(PluginLink {
                id: registration.id,
                services: registration.services,
                sender,
            });
        }

        let router = Self {
            plugins,
            pending: PendingTable::default(),
            approvals: ApprovedClients::default(),
            config,
            events,
        };
        tokio::spawn(router.run(commands_rx, inbox_rx));

        RouterHandle {
            commands: commands_tx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RouterCommand>,
        mut inbox: mpsc::UnboundedReceiver<(usize, PluginMessage)>,
    ) {
        let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some((index, message)) = inbox.recv() => self.on_plugin_message(index, message),
                _ = watchdog.tick() => self.expire(Instant::now()),
            }
        }
        debug!("Router stopped with {} pending requests", self.pending.len());
    }

    fn handle_command(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Dispatch {
                client,
                command,
                reply,
            } => self.dispatch(Origin {
                client,
                command,
                reply,
            }),
            RouterCommand::Stats { reply } => {
                let _ = reply.send(RouterStats {
                    plugins: self.plugins.len(),
                    pending: self.pending.len(),
                    approvals: self.approvals.len(),
                });
            }
        }
    }

    fn dispatch(&mut self, origin: Origin) {
        if origin.is_abandoned() {
            debug!("Caller gone before dispatch");
            return;
        }
        let command = &origin.command;
        if command.profile.is_empty() {
            return deliver(
                origin,
                Err(GatewayError::new(
                    ErrorKind::InvalidProfile,
                    "The profile is required.",
                )),
            );
        }
        if profile::is_service_discovery(&command.profile) {
            return self.start_discovery(origin);
        }

        let service_id = command.service_id();
        if service_id.is_empty() {
            return deliver(
                origin,
                Err(GatewayError::new(
                    ErrorKind::InvalidServiceId,
                    format!("The parameter \"{}\" is required.", param::SERVICE_ID),
                )),
            );
        }

        let plugin = match self.find_target(service_id, &command.profile) {
            Ok(plugin) => plugin,
            Err(e) => return deliver(origin, Err(e)),
        };

        let code = ids::unique_id();
        let created_at = Instant::now();
        let cached = self
            .approvals
            .token(&origin.client.client_id, service_id)
            .map(String::from);
        match cached {
            Some(token) => {
                trace!("[{}] Using cached plugin token", self.plugins[plugin].id);
                self.forward(code, created_at, plugin, origin, token);
            }
            None => self.begin_handshake(code, created_at, plugin, origin),
        }
    }

    /// First plugin, in load order, whose service matches both the id and
    /// the profile.
    fn find_target(&self, service_id: &str, profile: &str) -> Result<usize, GatewayError> {
        let mut owned = false;
        for (index, plugin) in self.plugins.iter().enumerate() {
            for service in plugin.services.iter().filter(|s| s.service_id == service_id) {
                if service.supports(profile) {
                    return Ok(index);
                }
                owned = true;
            }
        }

        Err(if owned {
            GatewayError::new(
                ErrorKind::OutOfScope,
                format!("The service \"{service_id}\" does not support the profile \"{profile}\"."),
            )
        } else {
            GatewayError::new(
                ErrorKind::UnknownService,
                format!("The service \"{service_id}\" was not found."),
            )
        })
    }

    fn message_for(&self, code: &str, profile: &str, attribute: &str) -> PluginMessage {
        let mut message = PluginMessage::request(profile, attribute);
        message.request_code = Some(code.to_string());
        message.receiver = Some(self.config.app_id.clone());
        message
    }

    fn forward(
        &mut self,
        code: String,
        created_at: Instant,
        plugin: usize,
        origin: Origin,
        token: String,
    ) {
        let command = &origin.command;
        let mut message = self.message_for(&code, &command.profile, &command.attribute);
        message.method = Some(command.method);
        message.service_id = Some(command.service_id().to_string());
        message.params = command.params.clone();
        message.params.remove(param::ACCESS_TOKEN);
        message.access_token = Some(token);
        message.package.clone_from(&command.package);

        if self.plugins[plugin].sender.send(message).is_err() {
            warn!("[{}] Plugin channel closed", self.plugins[plugin].id);
            return deliver(origin, Err(GatewayError::internal(PLUGIN_UNAVAILABLE)));
        }
        debug!(
            "[{}] Forwarded {}/{}",
            self.plugins[plugin].id, command.profile, command.attribute
        );
        self.pending.insert(
            code,
            PendingRequest {
                created_at,
                plugin,
                stage: Stage::Command {
                    origin,
                    awaiting_handshake: false,
                },
            },
        );
    }

    fn begin_handshake(&mut self, code: String, created_at: Instant, plugin: usize, origin: Origin) {
        let step = ids::unique_id();
        let mut message = self.message_for(&step, profile::AUTHORIZATION, attribute::CREATE_CLIENT);
        message.service_id = Some(origin.command.service_id().to_string());
        message.package.clone_from(&origin.command.package);

        if self.plugins[plugin].sender.send(message).is_err() {
            warn!("[{}] Plugin channel closed", self.plugins[plugin].id);
            return deliver(origin, Err(GatewayError::internal(PLUGIN_UNAVAILABLE)));
        }
        debug!("[{}] Requesting plugin client id", self.plugins[plugin].id);

        self.pending.insert(
            code.clone(),
            PendingRequest {
                created_at,
                plugin,
                stage: Stage::Command {
                    origin,
                    awaiting_handshake: true,
                },
            },
        );
        self.pending.insert(
            step,
            PendingRequest {
                created_at,
                plugin,
                stage: Stage::CreateClient { origin: code },
            },
        );
    }

    fn start_discovery(&mut self, origin: Origin) {
        let remaining = (0..self.plugins.len()).collect();
        self.continue_discovery(ids::unique_id(), Instant::now(), origin, remaining, Vec::new());
    }

    /// Ask the next reachable plugin for its services, or finish.
    fn continue_discovery(
        &mut self,
        code: String,
        created_at: Instant,
        origin: Origin,
        mut remaining: VecDeque<usize>,
        services: Vec<Service>,
    ) {
        if origin.is_abandoned() {
            debug!("Discovery abandoned by its caller");
            return;
        }
        while let Some(plugin) = remaining.pop_front() {
            let mut message = self.message_for(
                &code,
                profile::NETWORK_SERVICE_DISCOVERY,
                attribute::GET_NETWORK_SERVICES,
            );
            message.method = Some(Method::Get);
            if self.plugins[plugin].sender.send(message).is_ok() {
                self.pending.insert(
                    code,
                    PendingRequest {
                        created_at,
                        plugin,
                        stage: Stage::Discovery {
                            origin,
                            remaining,
                            services,
                        },
                    },
                );
                return;
            }
            warn!("[{}] Skipped in discovery, channel closed", self.plugins[plugin].id);
        }

        debug!("Discovery finished with {} services", services.len());
        deliver(
            origin,
            Ok(RouteReply {
                services: Some(services),
                ..RouteReply::default()
            }),
        );
    }

    fn on_plugin_message(&mut self, plugin: usize, message: PluginMessage) {
        match message.action {
            Some(Action::Event) => self.push_event(plugin, message),
            Some(Action::Response) => self.on_response(plugin, message),
            None => warn!(
                "[{}] Dropping message without action: {}/{}",
                self.plugins[plugin].id, message.profile, message.attribute
            ),
        }
    }

    fn push_event(&self, plugin: usize, message: PluginMessage) {
        let client_id = message
            .access_token
            .as_deref()
            .and_then(|token| self.approvals.owner(plugin, token))
            .map(String::from);
        trace!(
            "[{}] Event {}/{} for client {:?}",
            self.plugins[plugin].id, message.profile, message.attribute, client_id
        );
        let event = RoutedEvent {
            plugin_id: self.plugins[plugin].id.clone(),
            client_id,
            message,
        };
        if self.events.send(event).is_err() {
            debug!("No event consumer, event dropped");
        }
    }

    fn on_response(&mut self, plugin: usize, message: PluginMessage) {
        let Some(code) = message.request_code.clone() else {
            debug!("[{}] Dropping response without requestCode", self.plugins[plugin].id);
            return;
        };
        let expected = self
            .pending
            .get(&code)
            .is_some_and(|entry| entry.accepts_response_from(plugin));
        if !expected {
            debug!("[{}] Dropping unmatched response {code}", self.plugins[plugin].id);
            return;
        }
        let Some(entry) = self.pending.remove(&code) else {
            return;
        };

        match entry.stage {
            Stage::Command { origin, .. } => self.finish_command(plugin, origin, message),
            Stage::Discovery {
                origin,
                remaining,
                mut services,
            } => {
                match message.services.filter(|_| message.result == 0) {
                    Some(found) => {
                        self.plugins[plugin].services.clone_from(&found);
                        services.extend(found);
                    }
                    None => warn!(
                        "[{}] Discovery failed: {:?}",
                        self.plugins[plugin].id, message.error_message
                    ),
                }
                self.continue_discovery(code, entry.created_at, origin, remaining, services);
            }
            Stage::CreateClient { origin } => self.on_client_created(plugin, origin, message),
            Stage::RequestAccessToken { origin } => {
                self.on_token_issued(plugin, origin, message);
            }
        }
    }

    fn finish_command(&mut self, plugin: usize, origin: Origin, message: PluginMessage) {
        if message.is_success() {
            return deliver(
                origin,
                Ok(RouteReply {
                    data: message.data,
                    services: message.services,
                    extra: message.extra,
                }),
            );
        }

        if status_of(&message) == Some(401) {
            let client_id = &origin.client.client_id;
            let service_id = origin.command.service_id();
            if self.approvals.revoke(client_id, service_id) {
                info!("[{}] Plugin token rejected, cache entry dropped", self.plugins[plugin].id);
            }
            let text = message.error_message.unwrap_or_else(|| TOKEN_REJECTED.to_string());
            return deliver(origin, Err(GatewayError::invalid_token(text)));
        }

        deliver(origin, Err(plugin_failure(&message)));
    }

    fn on_client_created(&mut self, plugin: usize, origin_code: String, message: PluginMessage) {
        let client_id = message.client_id.clone().filter(|_| message.is_success());
        let Some(plugin_client) = client_id else {
            let text = message
                .error_message
                .unwrap_or_else(|| CLIENT_DENIED.to_string());
            return self.fail_origin(&origin_code, GatewayError::not_authorized(text));
        };
        let Some(entry) = self.pending.get(&origin_code) else {
            debug!("Client id arrived for a finished request");
            return;
        };
        let Stage::Command { origin: ref o, .. } = entry.stage else {
            return;
        };
        if o.is_abandoned() {
            debug!("[{}] Handshake abandoned by its caller", self.plugins[plugin].id);
            self.pending.remove(&origin_code);
            return;
        }

        let step = ids::unique_id();
        let mut request = self.message_for(
            &step,
            profile::AUTHORIZATION,
            attribute::REQUEST_ACCESS_TOKEN,
        );
        request.client_id = Some(plugin_client);
        request.service_id = Some(o.command.service_id().to_string());
        request.package.clone_from(&o.command.package);

        if self.plugins[plugin].sender.send(request).is_err() {
            return self.fail_origin(&origin_code, GatewayError::internal(PLUGIN_UNAVAILABLE));
        }
        debug!("[{}] Requesting plugin access token", self.plugins[plugin].id);
        self.pending.insert(
            step,
            PendingRequest {
                created_at: Instant::now(),
                plugin,
                stage: Stage::RequestAccessToken {
                    origin: origin_code,
                },
            },
        );
    }

    fn on_token_issued(&mut self, plugin: usize, origin_code: String, message: PluginMessage) {
        let token = message.access_token.clone().filter(|_| message.is_success());
        let Some(token) = token else {
            let kind = if status_of(&message) == Some(401) {
                ErrorKind::InvalidClientId
            } else {
                ErrorKind::NotAuthorized
            };
            let text = message
                .error_message
                .unwrap_or_else(|| TOKEN_DENIED.to_string());
            return self.fail_origin(&origin_code, GatewayError::new(kind, text));
        };

        let Some(entry) = self.pending.remove(&origin_code) else {
            debug!("Plugin token arrived for a finished request");
            return;
        };
        let Stage::Command { origin, .. } = entry.stage else {
            return;
        };

        self.approvals.approve(
            &origin.client.client_id,
            origin.command.service_id(),
            plugin,
            token.clone(),
        );
        debug!("[{}] Plugin token cached", self.plugins[plugin].id);
        if origin.is_abandoned() {
            debug!("[{}] Caller gone, command not forwarded", self.plugins[plugin].id);
            return;
        }
        self.forward(origin_code, entry.created_at, plugin, origin, token);
    }

    /// Terminate the original request of a handshake step.
    fn fail_origin(&mut self, origin_code: &str, error: GatewayError) {
        debug!("Handshake failed: {error}");
        match self.pending.remove(origin_code) {
            Some(PendingRequest {
                stage: Stage::Command { origin, .. } | Stage::Discovery { origin, .. },
                ..
            }) => deliver(origin, Err(error)),
            Some(_) | None => {}
        }
    }

    /// Drop entries whose caller has gone, then time out every entry past
    /// the response window.
    fn expire(&mut self, now: Instant) {
        for code in self.pending.abandoned() {
            if let Some(entry) = self.pending.remove(&code) {
                let plugin = &self.plugins[entry.plugin].id;
                debug!("[{plugin}] Request {code} abandoned by its caller");
            }
        }
        for code in self.pending.expired(now, self.config.response_timeout) {
            let Some(entry) = self.pending.remove(&code) else {
                continue;
            };
            warn!("[{}] Request {code} timed out", self.plugins[entry.plugin].id);
            match entry.stage {
                Stage::Command { origin, .. } | Stage::Discovery { origin, .. } => {
                    deliver(origin, Err(GatewayError::timeout(PLUGIN_TIMEOUT)));
                }
                Stage::CreateClient { .. } | Stage::RequestAccessToken { .. } => {}
            }
        }
    }
}

fn deliver(origin: Origin, outcome: Outcome) {
    if origin.reply.send(outcome).is_err() {
        debug!(
            "Caller gone before {}/{} completed",
            origin.command.profile, origin.command.attribute
        );
    }
}

/// Status a failed plugin message reports, if any.
fn status_of(message: &PluginMessage) -> Option<i64> {
    message
        .error_code
        .or((message.result != 0).then_some(message.result))
}

fn plugin_failure(message: &PluginMessage) -> GatewayError {
    let (status, replacement) = plugin_failure_status(message.result, message.error_code);
    let text = match replacement {
        Some(text) => text.to_string(),
        None => message
            .error_message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "The Plug-In returned an error.".to_string()),
    };
    GatewayError::with_status(ErrorKind::Error, status, text)
}
