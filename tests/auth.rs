use std::sync::Arc;

use http::HeaderMap;
use turnwire::auth::{ApiKeyStore, ClientAuth, NewKey};
use turnwire::config::ClientAuthConfig;
use turnwire::error::BridgeError;

fn bearer(key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "authorization",
        format!("Bearer {key}").parse().expect("header"),
    );
    headers
}

#[test]
fn test_static_key_success() {
    let auth = ClientAuth::new(vec!["client-key".to_string()], None);
    assert!(auth.authenticate(&bearer("client-key")).is_ok());
}

#[test]
fn test_x_api_key_header_success() {
    let auth = ClientAuth::new(vec!["client-key".to_string()], None);
    let mut headers = HeaderMap::new();
    headers.insert("x-api-key", "client-key".parse().expect("header"));
    assert!(auth.authenticate(&headers).is_ok());
}

#[test]
fn test_missing_key_is_error() {
    let auth = ClientAuth::new(vec!["client-key".to_string()], None);
    let err = auth
        .authenticate(&HeaderMap::new())
        .expect_err("auth should fail");
    assert!(matches!(err, BridgeError::Auth(_)));
}

#[test]
fn test_issued_key_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("data").join("api_keys.json");

    let raw_key = {
        let store = ApiKeyStore::open(&path).expect("open store");
        store.create_key(NewKey {
            name: "ci".to_string(),
            ..NewKey::default()
        })
    };
    assert!(raw_key.starts_with("clb_"));
    assert!(path.is_file());

    let persisted = std::fs::read_to_string(&path).expect("read key file");
    assert!(!persisted.contains(&raw_key));

    let store = Arc::new(ApiKeyStore::open(&path).expect("reopen store"));
    assert_eq!(store.len(), 1);
    let auth = ClientAuth::new(Vec::new(), Some(Arc::clone(&store)));
    assert!(auth.authenticate(&bearer(&raw_key)).is_ok());

    let key_id = store.list_keys()[0].key_id.clone();
    assert!(store.get_key(&key_id).expect("record").last_used.is_some());
    assert!(store.revoke_key(&key_id));
    assert!(auth.authenticate(&bearer(&raw_key)).is_err());
}

#[test]
fn test_from_config_creates_default_key_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("api_keys.json");
    let config = ClientAuthConfig {
        allowed_keys: Vec::new(),
        keys_file: Some(path.to_string_lossy().into_owned()),
        create_default_key: true,
    };

    let first = ClientAuth::from_config(&config).expect("first start");
    assert_eq!(first.store().map(|store| store.len()), Some(1));
    let second = ClientAuth::from_config(&config).expect("second start");
    assert_eq!(second.store().map(|store| store.len()), Some(1));

    let record = &second.store().expect("store").list_keys()[0];
    assert!(record.has_permission("admin"));
}
