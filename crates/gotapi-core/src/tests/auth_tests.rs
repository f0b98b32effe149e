//! Tests for the app authorization chain
//!
//! Tests the session authority including:
//! - availability -> grant -> accesstoken happy path with HMAC replies
//! - Ordering violations and their error kinds
//! - Concurrent authorizations keyed by availability key
//! - Pending authorization expiry

use std::time::Duration;

use gotapi_types::ErrorKind;

use crate::auth::SessionAuthority;
use crate::ids;

const TTL: Duration = Duration::from_secs(300);

fn authority() -> SessionAuthority {
    SessionAuthority::new(TTL)
}

#[test]
fn test_full_chain_issues_token() {
    let mut auth = authority();
    auth.availability(Some("app-key")).unwrap();

    let grant = auth.grant(None, Some("n1")).unwrap();
    assert_eq!(grant.client_id.len(), 64);
    assert_eq!(grant.hmac, ids::sign("app-key", "n1"));

    let issued = auth
        .access_token(Some(&grant.client_id), Some("light, clock"), Some("n2"))
        .unwrap();
    assert_eq!(issued.hmac, ids::sign("app-key", "n2"));
    assert_eq!(issued.client.scope, vec!["light", "clock"]);
    assert_eq!(issued.client.key, "app-key");

    let client = auth.resolve(&issued.client.access_token).unwrap();
    assert_eq!(client.client_id, grant.client_id);
    assert_eq!(
        auth.token_for_client(&grant.client_id),
        Some(issued.client.access_token.as_str())
    );
    assert_eq!(auth.pending_len(), 0);
}

#[test]
fn test_no_hmac_without_nonce() {
    let mut auth = authority();
    auth.availability(Some("k")).unwrap();
    let grant = auth.grant(None, None).unwrap();
    assert!(grant.hmac.is_none());
    let issued = auth
        .access_token(Some(&grant.client_id), Some("light"), None)
        .unwrap();
    assert!(issued.hmac.is_none());
}

#[test]
fn test_availability_requires_ascii_key() {
    let mut auth = authority();
    let err = auth.availability(None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidParameter);
    assert_eq!(err.message, "The parameter \"key\" is required.");

    let err = auth.availability(Some("with space")).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidParameter);
    assert!(auth.availability(Some("schlüssel")).is_err());
    assert_eq!(auth.pending_len(), 0);
}

#[test]
fn test_grant_before_availability_is_not_authorized() {
    let mut auth = authority();
    let err = auth.grant(None, None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotAuthorized);
    assert_eq!(err.status, 403);
    assert_eq!(err.message, "The availability API has not been called yet.");
}

#[test]
fn test_access_token_before_grant() {
    let mut auth = authority();
    let err = auth
        .access_token(Some("anything"), Some("light"), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotAuthorized);

    auth.availability(Some("k")).unwrap();
    let err = auth
        .access_token(Some("anything"), Some("light"), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidClientId);
    assert_eq!(err.message, "The specified client ID is invalid.");
}

#[test]
fn test_failed_token_request_keeps_authorization() {
    let mut auth = authority();
    auth.availability(Some("k")).unwrap();
    let grant = auth.grant(None, None).unwrap();

    let err = auth
        .access_token(Some(&grant.client_id), Some(" , "), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidParameter);
    assert_eq!(err.message, "The parameter \"scope\" is required.");

    let err = auth.access_token(None, Some("light"), None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidParameter);

    assert!(
        auth.access_token(Some(&grant.client_id), Some("light"), None)
            .is_ok()
    );
}

#[test]
fn test_token_request_consumes_authorization() {
    let mut auth = authority();
    auth.availability(Some("k")).unwrap();
    let grant = auth.grant(None, None).unwrap();
    auth.access_token(Some(&grant.client_id), Some("light"), None)
        .unwrap();

    let err = auth
        .access_token(Some(&grant.client_id), Some("light"), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotAuthorized);
    assert_eq!(auth.grant(None, None).unwrap_err().kind, ErrorKind::NotAuthorized);
}

#[test]
fn test_regrant_replaces_client_id() {
    let mut auth = authority();
    auth.availability(Some("k")).unwrap();
    let old = auth.grant(None, None).unwrap();
    let new = auth.grant(None, None).unwrap();
    assert_ne!(old.client_id, new.client_id);

    let err = auth
        .access_token(Some(&old.client_id), Some("light"), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidClientId);
    assert!(
        auth.access_token(Some(&new.client_id), Some("light"), None)
            .is_ok()
    );
}

#[test]
fn test_interleaved_apps_do_not_clobber_each_other() {
    let mut auth = authority();
    auth.availability(Some("app-a")).unwrap();
    auth.availability(Some("app-b")).unwrap();

    let a = auth.grant(Some("app-a"), Some("na")).unwrap();
    let b = auth.grant(Some("app-b"), Some("nb")).unwrap();
    assert_eq!(a.hmac, ids::sign("app-a", "na"));
    assert_eq!(b.hmac, ids::sign("app-b", "nb"));

    let token_b = auth
        .access_token(Some(&b.client_id), Some("clock"), None)
        .unwrap();
    let token_a = auth
        .access_token(Some(&a.client_id), Some("light"), None)
        .unwrap();
    assert_eq!(token_a.client.key, "app-a");
    assert_eq!(token_b.client.key, "app-b");
    assert_ne!(token_a.client.access_token, token_b.client.access_token);
}

#[test]
fn test_grant_without_key_uses_latest_availability() {
    let mut auth = authority();
    auth.availability(Some("first")).unwrap();
    auth.availability(Some("second")).unwrap();
    let grant = auth.grant(None, Some("n")).unwrap();
    assert_eq!(grant.hmac, ids::sign("second", "n"));

    let err = auth.grant(Some("unknown"), None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotAuthorized);
}

#[test]
fn test_resolve_unknown_token() {
    let auth = authority();
    let err = auth.resolve("nope").unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidToken);
    assert_eq!(err.status, 401);
}

#[test]
fn test_client_scope_is_case_insensitive() {
    let mut auth = authority();
    auth.availability(Some("k")).unwrap();
    let grant = auth.grant(None, None).unwrap();
    let issued = auth
        .access_token(Some(&grant.client_id), Some("Light"), None)
        .unwrap();
    assert!(issued.client.permits("light"));
    assert!(!issued.client.permits("clock"));
}

#[tokio::test(start_paused = true)]
async fn test_pending_authorization_expires() {
    let mut auth = SessionAuthority::new(Duration::from_secs(10));
    auth.availability(Some("k")).unwrap();
    let grant = auth.grant(None, None).unwrap();

    tokio::time::advance(Duration::from_secs(11)).await;

    let err = auth
        .access_token(Some(&grant.client_id), Some("light"), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotAuthorized);
    assert_eq!(auth.pending_len(), 0);
}
