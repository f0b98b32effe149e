//! Web-app authorization chain: availability, grant, access token.
//!
//! Each availability `key` opens its own pending authorization which moves
//! `AVAILABLE -> GRANTED -> TOKENED`; the token step removes it and stores
//! the finished [`Client`]. Concurrent apps therefore never overwrite each
//! other's sequence. Clients live until the process exits.
//!
//! `key` and `nonce` follow the identifier contract: non-empty printable
//! ASCII, signed as their raw bytes.

use std::collections::HashMap;
use std::time::Duration;

use gotapi_types::{ErrorKind, param, parse_scope};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::ids;

const NOT_STARTED: &str = "The availability API has not been called yet.";
const INVALID_CLIENT_ID: &str = "The specified client ID is invalid.";
const INVALID_ACCESS_TOKEN: &str = "The specified access token is invalid.";

/// An authorized web app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub key: String,
    pub client_id: String,
    pub access_token: String,
    /// Profiles this app asked for.
    pub scope: Vec<String>,
}

impl Client {
    /// Whether `profile` is within this client's scope (case-insensitive).
    #[must_use]
    pub fn permits(&self, profile: &str) -> bool {
        self.scope.iter().any(|p| p.eq_ignore_ascii_case(profile))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub client_id: String,
    /// `HMAC-SHA256(key, nonce)` when a nonce was supplied.
    pub hmac: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub client: Client,
    pub hmac: Option<String>,
}

#[derive(Debug)]
struct PendingAuthorization {
    client_id: Option<String>,
    opened_at: Instant,
}

#[derive(Debug)]
pub struct SessionAuthority {
    /// Unfinished authorizations by availability key.
    pending: HashMap<String, PendingAuthorization>,
    /// Key of the most recently opened authorization, used by grant calls
    /// that do not name their key.
    latest: Option<String>,
    /// Live clients by access token.
    clients: HashMap<String, Client>,
    /// Access token by client id.
    tokens: HashMap<String, String>,
    pending_ttl: Duration,
}

impl SessionAuthority {
    #[must_use]
    pub fn new(pending_ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            latest: None,
            clients: HashMap::new(),
            tokens: HashMap::new(),
            pending_ttl,
        }
    }

    /// Open (or restart) the authorization for `key`.
    ///
    /// # Errors
    ///
    /// `INVALID_PARAMETER` if the key is missing or not an ASCII token.
    pub fn availability(&mut self, key: Option<&str>) -> Result<(), GatewayError> {
        let key = required(key, param::KEY)?;
        check_ascii(key, param::KEY)?;

        let now = Instant::now();
        self.prune(now);
        self.pending.insert(
            key.to_string(),
            PendingAuthorization {
                client_id: None,
                opened_at: now,
            },
        );
        self.latest = Some(key.to_string());
        debug!("Authorization opened ({} pending)", self.pending.len());
        Ok(())
    }

    /// Issue a client id for an open authorization.
    ///
    /// `key` selects the authorization; without it the most recently opened
    /// one is used. Granting again replaces the previous client id.
    ///
    /// # Errors
    ///
    /// `NOT_AUTHORIZED` if no matching authorization is open,
    /// `INVALID_PARAMETER` for a malformed nonce.
    pub fn grant(&mut self, key: Option<&str>, nonce: Option<&str>) -> Result<Grant, GatewayError> {
        if let Some(nonce) = nonce {
            check_ascii(nonce, param::NONCE)?;
        }
        self.prune(Instant::now());

        let key = match key.filter(|k| !k.is_empty()) {
            Some(key) => key.to_string(),
            None => self
                .latest
                .clone()
                .ok_or_else(|| GatewayError::not_authorized(NOT_STARTED))?,
        };
        let pending = self
            .pending
            .get_mut(&key)
            .ok_or_else(|| GatewayError::not_authorized(NOT_STARTED))?;

        let client_id = ids::unique_id();
        pending.client_id = Some(client_id.clone());
        debug!("Client id granted");

        Ok(Grant {
            client_id,
            hmac: nonce.and_then(|n| ids::sign(&key, n)),
        })
    }

    /// Finish the authorization holding `client_id` and issue an access token.
    ///
    /// # Errors
    ///
    /// `INVALID_PARAMETER` for a missing client id or empty scope,
    /// `NOT_AUTHORIZED` if no authorization is open, `INVALID_CLIENT_ID` if
    /// none holds this client id. Failures leave every authorization intact.
    pub fn access_token(
        &mut self,
        client_id: Option<&str>,
        scope: Option<&str>,
        nonce: Option<&str>,
    ) -> Result<AccessGrant, GatewayError> {
        let client_id = required(client_id, param::CLIENT_ID)?;
        if let Some(nonce) = nonce {
            check_ascii(nonce, param::NONCE)?;
        }
        self.prune(Instant::now());

        if self.pending.is_empty() {
            return Err(GatewayError::not_authorized(NOT_STARTED));
        }
        let key = self
            .pending
            .iter()
            .find(|(_, p)| p.client_id.as_deref() == Some(client_id))
            .map(|(key, _)| key.clone())
            .ok_or_else(|| GatewayError::new(ErrorKind::InvalidClientId, INVALID_CLIENT_ID))?;

        let scope = parse_scope(scope.unwrap_or_default());
        if scope.is_empty() {
            return Err(GatewayError::missing_parameter(param::SCOPE));
        }

        self.pending.remove(&key);
        if self.latest.as_deref() == Some(key.as_str()) {
            self.latest = None;
        }

        let client = Client {
            key: key.clone(),
            client_id: client_id.to_string(),
            access_token: ids::unique_id(),
            scope,
        };
        self.tokens
            .insert(client.client_id.clone(), client.access_token.clone());
        self.clients
            .insert(client.access_token.clone(), client.clone());
        info!("Access token issued for scope {:?}", client.scope);

        Ok(AccessGrant {
            hmac: nonce.and_then(|n| ids::sign(&key, n)),
            client,
        })
    }

    /// Client owning `access_token`.
    ///
    /// # Errors
    ///
    /// `INVALID_TOKEN` if the token was never issued.
    pub fn resolve(&self, access_token: &str) -> Result<&Client, GatewayError> {
        self.clients
            .get(access_token)
            .ok_or_else(|| GatewayError::invalid_token(INVALID_ACCESS_TOKEN))
    }

    /// Access token issued to `client_id`.
    #[must_use]
    pub fn token_for_client(&self, client_id: &str) -> Option<&str> {
        self.tokens.get(client_id).map(String::as_str)
    }

    /// Number of unfinished authorizations.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn prune(&mut self, now: Instant) {
        let ttl = self.pending_ttl;
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.opened_at) < ttl);
        if self
            .latest
            .as_ref()
            .is_some_and(|key| !self.pending.contains_key(key))
        {
            self.latest = None;
        }
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, GatewayError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| GatewayError::missing_parameter(name))
}

fn check_ascii(value: &str, name: &str) -> Result<(), GatewayError> {
    if ids::is_ascii_token(value) {
        Ok(())
    } else {
        Err(GatewayError::invalid_parameter(format!(
            "The parameter \"{name}\" must be printable ASCII without spaces."
        )))
    }
}
