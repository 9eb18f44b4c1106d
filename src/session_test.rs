use super::*;

// =============================================================================
// MemorySessionStore
// =============================================================================

fn credential() -> Credential {
    Credential { id: "sid-1".into(), skey: "skey-1".into() }
}

#[test]
fn store_starts_empty() {
    let store = MemorySessionStore::new();
    assert_eq!(store.get(), None);
}

#[test]
fn set_then_get_returns_credential() {
    let store = MemorySessionStore::new();
    store.set(credential());
    assert_eq!(store.get(), Some(credential()));
}

#[test]
fn set_replaces_previous_credential() {
    let store = MemorySessionStore::new();
    store.set(credential());
    store.set(Credential { id: "sid-2".into(), skey: "skey-2".into() });
    assert_eq!(store.get().map(|c| c.id), Some("sid-2".to_owned()));
}

#[test]
fn clear_empties_the_store() {
    let store = MemorySessionStore::new();
    store.set(credential());
    store.clear();
    assert_eq!(store.get(), None);
}

#[test]
fn clear_on_empty_store_is_a_no_op() {
    let store = MemorySessionStore::new();
    store.clear();
    assert_eq!(store.get(), None);
}

// =============================================================================
// Credential serde
// =============================================================================

#[test]
fn credential_serde_round_trip() {
    let json = serde_json::to_string(&credential()).unwrap();
    let restored: Credential = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, credential());
}

#[test]
fn credential_deserializes_from_wire_shape() {
    let restored: Credential = serde_json::from_str(r#"{"id":"abc","skey":"def"}"#).unwrap();
    assert_eq!(restored.id, "abc");
    assert_eq!(restored.skey, "def");
}

#[test]
fn credential_rejects_missing_skey() {
    assert!(serde_json::from_str::<Credential>(r#"{"id":"abc"}"#).is_err());
}

// =============================================================================
// StaticCodeProvider
// =============================================================================

#[tokio::test]
async fn static_provider_returns_configured_code() {
    let provider = StaticCodeProvider::new("code-123");
    assert_eq!(provider.auth_code().await.unwrap(), "code-123");
}

#[tokio::test]
async fn static_provider_is_repeatable() {
    let provider = StaticCodeProvider::new("code-123");
    assert_eq!(provider.auth_code().await.unwrap(), provider.auth_code().await.unwrap());
}
