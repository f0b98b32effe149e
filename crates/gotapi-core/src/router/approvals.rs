//! Plugin tokens obtained on behalf of app clients.

use std::collections::HashMap;

#[derive(Debug)]
struct Approval {
    plugin: usize,
    token: String,
}

/// `(client_id, service_id) -> plugin token`, plus the reverse lookup used
/// to attribute plugin events to the app that caused them.
///
/// Entries never expire; they are dropped only when a plugin rejects the
/// token. A pair approved twice (two handshakes racing) caches the newer
/// token, but both stay attributed to the client.
#[derive(Debug, Default)]
pub(crate) struct ApprovedClients {
    tokens: HashMap<(String, String), Approval>,
    owners: HashMap<(usize, String), String>,
}

impl ApprovedClients {
    pub(crate) fn token(&self, client_id: &str, service_id: &str) -> Option<&str> {
        self.tokens
            .get(&(client_id.to_string(), service_id.to_string()))
            .map(|a| a.token.as_str())
    }

    pub(crate) fn approve(&mut self, client_id: &str, service_id: &str, plugin: usize, token: String) {
        self.owners
            .insert((plugin, token.clone()), client_id.to_string());
        self.tokens.insert(
            (client_id.to_string(), service_id.to_string()),
            Approval { plugin, token },
        );
    }

    pub(crate) fn revoke(&mut self, client_id: &str, service_id: &str) -> bool {
        match self
            .tokens
            .remove(&(client_id.to_string(), service_id.to_string()))
        {
            Some(approval) => {
                self.owners.remove(&(approval.plugin, approval.token));
                true
            }
            None => false,
        }
    }

    /// App client a plugin token was issued for.
    pub(crate) fn owner(&self, plugin: usize, token: &str) -> Option<&str> {
        self.owners
            .get(&(plugin, token.to_string()))
            .map(String::as_str)
    }

    pub(crate) fn len(&self) -> usize {
        self.tokens.len()
    }
}
