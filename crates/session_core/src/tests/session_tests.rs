use super::*;

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::test_support::{mint_access_token, session_for};

#[derive(Default)]
struct CountingObserver {
    replaced: AtomicUsize,
    cleared: AtomicUsize,
}

impl SessionObserver for CountingObserver {
    fn on_session_replaced(&self, _session: &Session) {
        self.replaced.fetch_add(1, Ordering::SeqCst);
    }

    fn on_session_cleared(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn reads_identity_from_access_token_claims() {
    let session = Session::from_tokens(mint_access_token(42, Role::Consultant, "a"), "refresh-a")
        .expect("session");
    assert_eq!(session.user_id, UserId(42));
    assert_eq!(session.role, Role::Consultant);
    assert!(session.expires_at.is_some());
    assert!(!session.is_expired_at(Utc::now()));
}

#[test]
fn rejects_tokens_that_are_not_jwts() {
    assert!(matches!(
        Session::from_tokens("not-a-token", "refresh"),
        Err(SessionError::MalformedToken(_))
    ));
}

#[test]
fn debug_output_never_contains_tokens() {
    let session = session_for(1, Role::Company, "secret-gen");
    let rendered = format!("{session:?}");
    assert!(!rendered.contains(&session.access_token));
    assert!(!rendered.contains("refresh-secret-gen"));
}

#[test]
fn replace_tokens_keeps_refresh_token_when_not_rotated() {
    let store = CredentialStore::with_session(session_for(7, Role::Company, "one"));
    let next_access = mint_access_token(7, Role::Company, "two");

    let replaced = store
        .replace_tokens(next_access.clone(), None)
        .expect("replace");

    assert_eq!(replaced.access_token, next_access);
    assert_eq!(store.access_token(), Some(next_access));
    assert_eq!(store.refresh_token(), Some("refresh-one".to_string()));
}

#[test]
fn replace_tokens_adopts_rotated_refresh_token() {
    let store = CredentialStore::with_session(session_for(7, Role::Company, "one"));
    store
        .replace_tokens(
            mint_access_token(7, Role::Company, "two"),
            Some("refresh-two".into()),
        )
        .expect("replace");
    assert_eq!(store.refresh_token(), Some("refresh-two".to_string()));
}

#[test]
fn replace_with_malformed_token_leaves_session_untouched() {
    let original = session_for(7, Role::Company, "one");
    let store = CredentialStore::with_session(original.clone());
    assert!(store.replace_tokens("garbage".into(), None).is_err());
    assert_eq!(store.snapshot(), Some(original));
}

#[test]
fn replace_after_clear_does_not_resurrect_session() {
    let store = CredentialStore::with_session(session_for(7, Role::Company, "one"));
    store.clear();
    assert!(matches!(
        store.replace_tokens(mint_access_token(7, Role::Company, "two"), None),
        Err(SessionError::Cleared)
    ));
    assert!(!store.is_authenticated());
}

#[test]
fn observers_see_login_refresh_and_clear() {
    let store = CredentialStore::new();
    let observer = Arc::new(CountingObserver::default());
    store.add_observer(observer.clone());

    store.login(session_for(3, Role::Admin, "one"));
    store
        .replace_tokens(mint_access_token(3, Role::Admin, "two"), None)
        .expect("replace");
    store.clear();
    store.clear();

    assert_eq!(observer.replaced.load(Ordering::SeqCst), 2);
    assert_eq!(observer.cleared.load(Ordering::SeqCst), 1);
    assert!(!store.is_authenticated());
    assert_eq!(store.access_token(), None);
}
