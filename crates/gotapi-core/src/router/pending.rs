//! Correlation table for in-flight plugin exchanges.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use gotapi_types::{Command, Service};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::Outcome;
use crate::auth::Client;

/// The app request a chain of plugin exchanges is working for.
#[derive(Debug)]
pub(crate) struct Origin {
    pub client: Client,
    pub command: Command,
    pub reply: oneshot::Sender<Outcome>,
}

impl Origin {
    /// Whether the caller stopped waiting for the outcome.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

#[derive(Debug)]
pub(crate) enum Stage {
    /// The app command itself. While `awaiting_handshake` it has not been
    /// sent yet and the table also holds a handshake step pointing at it.
    Command {
        origin: Origin,
        awaiting_handshake: bool,
    },
    /// Sequential discovery; `plugin` of the entry is the one being asked.
    Discovery {
        origin: Origin,
        remaining: VecDeque<usize>,
        services: Vec<Service>,
    },
    CreateClient {
        origin: String,
    },
    RequestAccessToken {
        origin: String,
    },
}

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub created_at: Instant,
    /// Index of the plugin expected to answer.
    pub plugin: usize,
    pub stage: Stage,
}

impl PendingRequest {
    /// Whether a plugin response may terminate or advance this entry.
    pub(crate) fn accepts_response_from(&self, plugin: usize) -> bool {
        self.plugin == plugin
            && !matches!(
                self.stage,
                Stage::Command {
                    awaiting_handshake: true,
                    ..
                }
            )
    }
}

#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: HashMap<String, PendingRequest>,
}

impl PendingTable {
    pub(crate) fn insert(&mut self, code: String, request: PendingRequest) {
        self.entries.insert(code, request);
    }

    pub(crate) fn get(&self, code: &str) -> Option<&PendingRequest> {
        self.entries.get(code)
    }

    pub(crate) fn remove(&mut self, code: &str) -> Option<PendingRequest> {
        self.entries.remove(code)
    }

    /// Codes of entries at least `timeout` old, oldest first.
    pub(crate) fn expired(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut expired: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, r)| now.saturating_duration_since(r.created_at) >= timeout)
            .map(|(code, r)| (r.created_at, code.clone()))
            .collect();
        expired.sort();
        expired.into_iter().map(|(_, code)| code).collect()
    }

    /// Codes of entries no caller is waiting for: origins whose caller has
    /// gone, and handshake steps whose origin entry is gone or abandoned.
    pub(crate) fn abandoned(&self) -> Vec<String> {
        let origin_gone = |code: &str| {
            self.entries.get(code).is_none_or(|entry| match &entry.stage {
                Stage::Command { origin, .. } | Stage::Discovery { origin, .. } => {
                    origin.is_abandoned()
                }
                Stage::CreateClient { .. } | Stage::RequestAccessToken { .. } => true,
            })
        };
        self.entries
            .iter()
            .filter(|(code, entry)| match &entry.stage {
                Stage::Command { .. } | Stage::Discovery { .. } => origin_gone(code),
                Stage::CreateClient { origin } | Stage::RequestAccessToken { origin } => {
                    origin_gone(origin)
                }
            })
            .map(|(code, _)| code.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(created_at: Instant) -> PendingRequest {
        PendingRequest {
            created_at,
            plugin: 0,
            stage: Stage::CreateClient {
                origin: "origin".to_string(),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_orders_oldest_first() {
        let mut table = PendingTable::default();
        let start = Instant::now();
        table.insert("newer".to_string(), step(start + Duration::from_millis(500)));
        table.insert("older".to_string(), step(start));
        table.insert("fresh".to_string(), step(start + Duration::from_secs(5)));

        let expired = table.expired(start + Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(expired, vec!["older".to_string(), "newer".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_is_terminal() {
        let mut table = PendingTable::default();
        table.insert("code".to_string(), step(Instant::now()));
        assert_eq!(table.len(), 1);
        assert!(table.remove("code").is_some());
        assert!(table.remove("code").is_none());
        assert_eq!(table.len(), 0);
    }

    fn origin() -> (Origin, oneshot::Receiver<Outcome>) {
        let (reply, rx) = oneshot::channel();
        let origin = Origin {
            client: Client {
                key: "k".to_string(),
                client_id: "c".to_string(),
                access_token: "t".to_string(),
                scope: vec![],
            },
            command: Command::default(),
            reply,
        };
        (origin, rx)
    }

    fn command(origin: Origin) -> PendingRequest {
        PendingRequest {
            created_at: Instant::now(),
            plugin: 0,
            stage: Stage::Command {
                origin,
                awaiting_handshake: true,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_follows_the_caller() {
        let mut table = PendingTable::default();
        let (waiting, _waiting_rx) = origin();
        let (dropped, dropped_rx) = origin();
        table.insert("waiting".to_string(), command(waiting));
        table.insert("dropped".to_string(), command(dropped));
        table.insert(
            "step-waiting".to_string(),
            PendingRequest {
                stage: Stage::RequestAccessToken {
                    origin: "waiting".to_string(),
                },
                ..step(Instant::now())
            },
        );
        table.insert(
            "step-dropped".to_string(),
            PendingRequest {
                stage: Stage::CreateClient {
                    origin: "dropped".to_string(),
                },
                ..step(Instant::now())
            },
        );
        // Its origin entry is not in the table at all.
        table.insert("orphan".to_string(), step(Instant::now()));
        assert!(table.abandoned().contains(&"orphan".to_string()));

        drop(dropped_rx);
        let mut abandoned = table.abandoned();
        abandoned.sort();
        assert_eq!(abandoned, vec!["dropped", "orphan", "step-dropped"]);
    }

    #[test]
    fn test_awaiting_command_rejects_responses() {
        let (origin, _rx) = origin();
        let mut entry = PendingRequest {
            created_at: Instant::now(),
            plugin: 1,
            stage: Stage::Command {
                origin,
                awaiting_handshake: true,
            },
        };
        assert!(!entry.accepts_response_from(1));

        if let Stage::Command {
            awaiting_handshake, ..
        } = &mut entry.stage
        {
            *awaiting_handshake = false;
        }
        assert!(entry.accepts_response_from(1));
        assert!(!entry.accepts_response_from(0));
    }
}
