//! Config files feeding a store

use docstore::{ClientConfig, DocStoreError, DocumentStore, EmbeddedServer, QueryConsistency};

use crate::common::*;

#[test]
fn default_file_is_written_once_and_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(docstore::CONFIG_FILE_NAME);

    ClientConfig::write_default_if_missing(&path).unwrap();
    let config = ClientConfig::from_file(&path).unwrap();
    assert_eq!(config, ClientConfig::default());

    std::fs::write(&path, "database = \"edited\"\n").unwrap();
    ClientConfig::write_default_if_missing(&path).unwrap();
    assert_eq!(ClientConfig::from_file(&path).unwrap().database, "edited");
}

#[test]
fn written_config_drives_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(docstore::CONFIG_FILE_NAME);
    let config = ClientConfig {
        max_requests_per_session: 2,
        default_query_consistency: QueryConsistency::WaitForLastWrite,
        ..test_config()
    };
    config.write_to_file(&path).unwrap();

    let server = EmbeddedServer::new();
    let loaded = ClientConfig::from_file(&path).unwrap();
    let store = DocumentStore::new(server.commands(DB), loaded).unwrap();
    assert_eq!(store.config(), &config);

    let mut session = store.open_session();
    session.load::<Customer>("customers/1").unwrap();
    session.load::<Customer>("customers/2").unwrap();
    assert!(matches!(
        session.load::<Customer>("customers/3"),
        Err(DocStoreError::RequestBudgetExceeded { max: 2 })
    ));
}

#[test]
fn invalid_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(docstore::CONFIG_FILE_NAME);
    std::fs::write(&path, "max_requests_per_session = 0\n").unwrap();
    assert!(matches!(
        ClientConfig::from_file(&path),
        Err(DocStoreError::Config(_))
    ));
    assert!(ClientConfig::from_file(&dir.path().join("missing.toml")).is_err());
}
