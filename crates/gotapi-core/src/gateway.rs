//! Gateway glue between the app-facing front ends and the router.
//!
//! [`GatewayCore::handle`] is the single entry point for commands from
//! either front end: authorization requests are answered by the session
//! authority, everything else is resolved to a client and routed. WebSocket
//! connections register as subscribers to receive plugin events for their
//! access token.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use gotapi_types::{Command, ErrorKind, PluginMessage, Reply, attribute, param, profile};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, trace};

use crate::auth::{Client, SessionAuthority};
use crate::config::Config;
use crate::error::GatewayError;
use crate::ids;
use crate::plugin::PluginRegistration;
use crate::router::{RoutedEvent, Router, RouterConfig, RouterHandle, RouterStats};

pub const PRODUCT: &str = "GotAPI Server";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const GATEWAY_TIMEOUT: &str = "The GotAPI Server did not respond.";
const TOKEN_REQUIRED: &str = "The access token is required.";
const TOKEN_NOT_AUTHORIZED: &str = "The posted access token is not authorized.";

/// Queue of replies pushed to one WebSocket connection.
pub type Subscriber = mpsc::UnboundedSender<Reply>;

pub struct GatewayCore {
    authority: RwLock<SessionAuthority>,
    router: RouterHandle,
    /// WebSocket connections by access token.
    subscribers: RwLock<HashMap<String, Subscriber>>,
    request_timeout: Duration,
    enforce_client_scope: bool,
}

impl GatewayCore {
    /// Start the router over `registrations` and the event pump.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(config: &Config, registrations: Vec<PluginRegistration>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let router = Router::spawn(
            registrations,
            RouterConfig {
                response_timeout: config.plugin_response_timeout(),
                app_id: config.gotapi_server_app_id.clone(),
            },
            events_tx,
        );

        let core = Arc::new(Self {
            authority: RwLock::new(SessionAuthority::new(config.authorization_timeout())),
            router,
            subscribers: RwLock::new(HashMap::new()),
            request_timeout: config.http_request_timeout(),
            enforce_client_scope: config.enforce_client_scope,
        });
        tokio::spawn(pump_events(Arc::downgrade(&core), events_rx));
        info!("Gateway core started");
        core
    }

    /// Answer one app command. Never fails: errors become error replies.
    pub async fn handle(&self, command: Command) -> Reply {
        trace!(
            "Handling {} {}/{}",
            command.method, command.profile, command.attribute
        );
        let mut reply = match command.profile.as_str() {
            profile::AVAILABILITY => self.availability(&command).await,
            profile::AUTHORIZATION => self.authorization(&command).await,
            _ => self.route(&command).await,
        };

        reply.profile = Some(command.profile.clone());
        reply.attribute = Some(command.attribute.clone());
        if reply.service_id.is_none() && !command.service_id().is_empty() {
            reply.service_id = Some(command.service_id().to_string());
        }
        stamp(reply)
    }

    async fn availability(&self, command: &Command) -> Reply {
        let result = self
            .authority
            .write()
            .await
            .availability(command.param(param::KEY));
        match result {
            Ok(()) => Reply::ok(),
            Err(e) => e.into(),
        }
    }

    async fn authorization(&self, command: &Command) -> Reply {
        let mut authority = self.authority.write().await;
        match command.attribute.as_str() {
            attribute::GRANT => {
                match authority.grant(command.param(param::KEY), command.nonce()) {
                    Ok(grant) => Reply {
                        client_id: Some(grant.client_id),
                        hmac: grant.hmac,
                        ..Reply::ok()
                    },
                    Err(e) => e.into(),
                }
            }
            attribute::ACCESS_TOKEN => {
                let issued = authority.access_token(
                    command.param(param::CLIENT_ID),
                    command.param(param::SCOPE),
                    command.nonce(),
                );
                match issued {
                    Ok(grant) => Reply {
                        access_token: Some(grant.client.access_token),
                        hmac: grant.hmac,
                        ..Reply::ok()
                    },
                    Err(e) => e.into(),
                }
            }
            other => GatewayError::new(
                ErrorKind::InvalidAttribute,
                format!("The attribute \"{other}\" is not supported by the authorization profile."),
            )
            .into(),
        }
    }

    async fn route(&self, command: &Command) -> Reply {
        let client = match self.resolve(command.access_token()).await {
            Ok(client) => client,
            Err(e) => return e.into(),
        };

        if self.enforce_client_scope
            && !profile::is_service_discovery(&command.profile)
            && !client.permits(&command.profile)
        {
            return GatewayError::new(
                ErrorKind::OutOfScope,
                format!(
                    "The profile \"{}\" is not in the scope of the access token.",
                    command.profile
                ),
            )
            .into();
        }

        let dispatch = self.router.dispatch(client.clone(), command.clone());
        let mut reply = match tokio::time::timeout(self.request_timeout, dispatch).await {
            Ok(Ok(routed)) => Reply {
                data: routed.data,
                services: routed.services,
                extra: routed.extra,
                ..Reply::ok()
            },
            Ok(Err(e)) => e.into(),
            Err(_) => GatewayError::timeout(GATEWAY_TIMEOUT).into(),
        };
        reply.hmac = command.nonce().and_then(|nonce| ids::sign(&client.key, nonce));
        reply
    }

    async fn resolve(&self, token: Option<&str>) -> Result<Client, GatewayError> {
        let token = token.ok_or_else(|| GatewayError::invalid_parameter(TOKEN_REQUIRED))?;
        self.authority.read().await.resolve(token).cloned()
    }

    /// Register a WebSocket connection for events of `token`.
    ///
    /// With `verify` off any frame is accepted; a connection without a token
    /// is then accepted but receives no events.
    ///
    /// # Errors
    ///
    /// Returns the `INVALID_TOKEN` reply to send before closing.
    pub async fn subscribe(
        &self,
        token: Option<&str>,
        verify: bool,
        subscriber: Subscriber,
    ) -> Result<Reply, Reply> {
        let token = token.filter(|t| !t.is_empty());
        if verify {
            let known = match token {
                Some(t) => self.authority.read().await.resolve(t).is_ok(),
                None => false,
            };
            if !known {
                let mut reply: Reply = GatewayError::invalid_token(TOKEN_NOT_AUTHORIZED).into();
                reply.profile = Some(profile::AUTHORIZATION.to_string());
                reply.attribute = Some(attribute::VERIFY.to_string());
                return Err(stamp(reply));
            }
        }

        if let Some(token) = token {
            self.subscribers
                .write()
                .await
                .insert(token.to_string(), subscriber);
            debug!("WebSocket subscriber registered");
        }

        Ok(stamp(Reply {
            profile: Some(profile::AUTHORIZATION.to_string()),
            attribute: Some(attribute::VERIFY.to_string()),
            ..Reply::ok()
        }))
    }

    /// Remove the subscription of `token` if it still belongs to `subscriber`.
    pub async fn unsubscribe(&self, token: &str, subscriber: &Subscriber) {
        let mut subscribers = self.subscribers.write().await;
        if subscribers
            .get(token)
            .is_some_and(|current| current.same_channel(subscriber))
        {
            subscribers.remove(token);
            debug!("WebSocket subscriber removed");
        }
    }

    async fn push_event(&self, event: RoutedEvent) {
        let Some(client_id) = event.client_id.as_deref() else {
            debug!("[{}] Event without a known owner dropped", event.plugin_id);
            return;
        };
        let token = self
            .authority
            .read()
            .await
            .token_for_client(client_id)
            .map(String::from);
        let Some(token) = token else {
            debug!("[{}] Event for an unknown client dropped", event.plugin_id);
            return;
        };

        let subscribers = self.subscribers.read().await;
        let Some(subscriber) = subscribers.get(&token) else {
            debug!("[{}] Event dropped, no WebSocket for its client", event.plugin_id);
            return;
        };
        if subscriber.send(event_reply(event.message)).is_err() {
            debug!("[{}] Event dropped, WebSocket closed", event.plugin_id);
        }
    }

    /// Router table sizes, `None` if the router has stopped.
    pub async fn router_stats(&self) -> Option<RouterStats> {
        self.router.stats().await
    }

    /// Number of WebSocket connections receiving events.
    pub async fn subscriptions(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Number of unfinished app authorizations.
    pub async fn pending_authorizations(&self) -> usize {
        self.authority.read().await.pending_len()
    }
}

async fn pump_events(core: Weak<GatewayCore>, mut events: mpsc::UnboundedReceiver<RoutedEvent>) {
    while let Some(event) = events.recv().await {
        let Some(core) = core.upgrade() else {
            break;
        };
        core.push_event(event).await;
    }
    debug!("Event pump stopped");
}

fn event_reply(message: PluginMessage) -> Reply {
    stamp(Reply {
        profile: Some(message.profile),
        attribute: Some(message.attribute),
        service_id: message.service_id,
        data: message.data,
        extra: message.extra,
        ..Reply::ok()
    })
}

fn stamp(mut reply: Reply) -> Reply {
    PRODUCT.clone_into(&mut reply.product);
    VERSION.clone_into(&mut reply.version);
    reply
}
