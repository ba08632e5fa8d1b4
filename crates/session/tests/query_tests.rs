//! Query tests against the embedded server
//!
//! 1. **Results** - filtering, paging, terminal operations, tracking
//! 2. **Staleness** - polling, cutoffs, timeouts, non-authoritative reads
//! 3. **Guards** - query-by-id, unknown indexes, includes
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test -p docstore-session --test query_tests
//! ```

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use docstore_core::metadata::{self, Metadata};
use docstore_core::{ClientConfig, DocStoreError, Document, QueryConsistency};
use docstore_embedded::{EmbeddedServer, IndexDefinition, RequestKind};
use docstore_session::{DocumentStore, Tracked};

// ============================================================================
// Test Helpers
// ============================================================================

const DB: &str = "query-tests";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    active: bool,
}

impl Document for User {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: &str) {
        self.id = Some(id.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    #[serde(default)]
    id: Option<String>,
    customer: String,
}

impl Document for Order {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: &str) {
        self.id = Some(id.to_string());
    }
}

/// Narrow view of a user document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NameOnly {
    name: String,
}

impl Document for NameOnly {
    fn id(&self) -> Option<&str> {
        None
    }

    fn set_id(&mut self, _id: &str) {}
}

fn config() -> ClientConfig {
    ClientConfig {
        database: DB.to_string(),
        staleness_poll_interval_ms: 5,
        ..Default::default()
    }
}

fn setup_with(config: ClientConfig) -> (EmbeddedServer, DocumentStore) {
    let server = EmbeddedServer::new();
    let store = DocumentStore::new(server.commands(DB), config).unwrap();
    (server, store)
}

fn setup() -> (EmbeddedServer, DocumentStore) {
    setup_with(config())
}

fn meta(entity: &str) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert(metadata::ENTITY_NAME.to_string(), json!(entity));
    meta
}

fn seed_user(server: &EmbeddedServer, key: &str, name: &str, active: bool) {
    server
        .seed(DB, key, json!({ "id": key, "name": name, "active": active }), meta("Users"))
        .unwrap();
}

fn seed_users(server: &EmbeddedServer) {
    seed_user(server, "users/1", "Ayende", true);
    seed_user(server, "users/2", "Oren", false);
    seed_user(server, "users/3", "Ayende", false);
}

fn names(list: &[Tracked<User>]) -> Vec<String> {
    list.iter().map(|u| u.borrow().name.clone()).collect()
}

// ============================================================================
// SECTION 1: Results
// ============================================================================

mod results {
    use super::*;

    #[test]
    fn where_equals_filters_on_the_dynamic_index() {
        let (server, store) = setup();
        seed_users(&server);
        let mut session = store.open_session();

        let ayendes = session
            .query::<User>()
            .where_equals("name", "Ayende")
            .to_list()
            .unwrap();
        assert_eq!(ayendes.len(), 2);

        let active = session
            .query::<User>()
            .where_equals("name", "Ayende")
            .where_equals("active", true)
            .to_list()
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].borrow().id.as_deref(), Some("users/1"));

        let log = server.requests();
        assert!(log.iter().all(|r| r.kind != RequestKind::Query || r.detail == "dynamic/Users"));
        assert_eq!(session.number_of_requests(), 2);
    }

    #[test]
    fn query_results_join_the_identity_map() {
        let (server, store) = setup();
        seed_users(&server);
        let mut session = store.open_session();

        let list = session.query::<User>().to_list().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(session.number_of_entities_in_unit_of_work(), 3);

        let requests = server.request_count();
        let loaded = session.load::<User>("users/2").unwrap().unwrap();
        assert!(loaded.ptr_eq(&list[1]));
        assert_eq!(server.request_count(), requests);

        list[0].borrow_mut().name = "Changed".to_string();
        session.save_changes().unwrap();
        let doc = server.document(DB, "users/1").unwrap();
        assert_eq!(doc.data.get("name"), Some(&json!("Changed")));
    }

    #[test]
    fn already_tracked_entities_are_returned_as_is() {
        let (server, store) = setup();
        seed_users(&server);
        let mut session = store.open_session();
        let mine = session.load::<User>("users/1").unwrap().unwrap();
        mine.borrow_mut().name = "local edit".to_string();

        let list = session.query::<User>().to_list().unwrap();
        assert!(list[0].ptr_eq(&mine));
        assert_eq!(list[0].borrow().name, "local edit");
    }

    #[test]
    fn no_tracking_leaves_the_session_empty() {
        let (server, store) = setup();
        seed_users(&server);
        let mut session = store.open_session();

        let list = session.query::<User>().no_tracking().to_list().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(session.number_of_entities_in_unit_of_work(), 0);
    }

    #[test]
    fn paging_and_counting() {
        let (server, store) = setup();
        seed_users(&server);
        let mut session = store.open_session();

        let page = session.query::<User>().skip(1).take(1).to_list().unwrap();
        assert_eq!(names(&page), vec!["Oren".to_string()]);

        assert_eq!(session.query::<User>().count().unwrap(), 3);
        assert_eq!(session.number_of_entities_in_unit_of_work(), 1);

        let (list, stats) = session.query::<User>().take(2).query_result().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(stats.total_results, 3);
        assert_eq!(stats.index_name, "dynamic/Users");
        assert!(!stats.is_stale);
    }

    #[test]
    fn first_and_single() {
        let (server, store) = setup();
        seed_users(&server);
        let mut session = store.open_session();

        let first = session.query::<User>().where_equals("name", "Ayende").first().unwrap();
        assert_eq!(first.borrow().id.as_deref(), Some("users/1"));

        let oren = session.query::<User>().where_equals("name", "Oren").single().unwrap();
        assert_eq!(oren.borrow().id.as_deref(), Some("users/2"));

        assert!(matches!(
            session.query::<User>().where_equals("name", "Ayende").single(),
            Err(DocStoreError::InvalidOperation(_))
        ));
        assert!(matches!(
            session.query::<User>().where_equals("name", "Nobody").first(),
            Err(DocStoreError::InvalidOperation(_))
        ));
        assert!(session
            .query::<User>()
            .where_equals("name", "Nobody")
            .first_or_default()
            .unwrap()
            .is_none());
        assert!(session
            .query::<User>()
            .where_equals("name", "Nobody")
            .single_or_default()
            .unwrap()
            .is_none());
    }

    #[test]
    fn named_indexes_are_queried_by_name() {
        let (server, store) = setup();
        seed_users(&server);
        server.define_index(DB, "Users/ByName", IndexDefinition::for_entity("Users"));
        let mut session = store.open_session();

        let list = session
            .query_index::<User>("Users/ByName")
            .where_equals("name", "Oren")
            .to_list()
            .unwrap();
        assert_eq!(names(&list), vec!["Oren".to_string()]);
    }
}

// ============================================================================
// SECTION 2: Staleness
// ============================================================================

mod staleness {
    use super::*;

    #[test]
    fn stale_results_are_accepted_without_a_wait() {
        let (server, store) = setup();
        seed_users(&server);
        server.force_stale_queries(DB, 1);
        let mut session = store.open_session();

        let (list, stats) = session.query::<User>().query_result().unwrap();
        assert!(stats.is_stale);
        assert_eq!(list.len(), 3);
        assert_eq!(server.count_requests(RequestKind::Query), 1);
    }

    #[test]
    fn waiting_polls_until_the_index_is_fresh() {
        let (server, store) = setup();
        seed_users(&server);
        server.force_stale_queries(DB, 3);
        let mut session = store.open_session();

        let (list, stats) = session
            .query::<User>()
            .wait_for_non_stale_results()
            .query_result()
            .unwrap();
        assert!(!stats.is_stale);
        assert_eq!(list.len(), 3);
        assert_eq!(server.count_requests(RequestKind::Query), 4);
        assert_eq!(session.number_of_requests(), 1);
    }

    #[test]
    fn polls_are_spaced_by_the_poll_interval() {
        let (server, store) = setup_with(ClientConfig {
            staleness_poll_interval_ms: 15,
            ..config()
        });
        seed_users(&server);
        server.force_stale_queries(DB, 3);
        let mut session = store.open_session();

        session
            .query::<User>()
            .wait_for_non_stale_results()
            .to_list()
            .unwrap();

        let polls: Vec<_> = server
            .requests()
            .into_iter()
            .filter(|r| r.kind == RequestKind::Query)
            .map(|r| r.at)
            .collect();
        assert_eq!(polls.len(), 4);
        for pair in polls.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(15));
        }
    }

    #[test]
    fn non_authoritative_documents_reissue_the_query() {
        let (server, store) = setup_with(ClientConfig {
            allow_non_authoritative_information: false,
            ..config()
        });
        seed_users(&server);
        server.report_non_authoritative_per_document(DB, true);
        server.set_non_authoritative(DB, "users/1", 2);
        let mut session = store.open_session();

        let list = session.query::<User>().to_list().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(server.count_requests(RequestKind::Query), 3);
        assert_eq!(session.number_of_requests(), 1);
    }

    #[test]
    fn non_authoritative_documents_are_kept_when_allowed() {
        let (server, store) = setup();
        seed_users(&server);
        server.report_non_authoritative_per_document(DB, true);
        server.set_non_authoritative(DB, "users/1", 2);
        let mut session = store.open_session();

        let list = session.query::<User>().to_list().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(server.count_requests(RequestKind::Query), 1);
    }

    #[test]
    fn waiting_times_out_with_a_staleness_error() {
        let (server, store) = setup();
        seed_users(&server);
        server.force_stale_queries(DB, usize::MAX);
        let mut session = store.open_session();

        let err = session
            .query::<User>()
            .wait_for_non_stale_results_with_timeout(Duration::from_millis(40))
            .to_list()
            .unwrap_err();
        match err {
            DocStoreError::StalenessTimeout { index, waited } => {
                assert_eq!(index, "dynamic/Users");
                assert!(waited >= Duration::from_millis(40));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(server.count_requests(RequestKind::Query) > 1);
        assert_eq!(session.number_of_requests(), 1);
    }

    #[test]
    fn cutoff_before_the_pause_is_not_stale() {
        let (server, store) = setup();
        seed_users(&server);
        let cutoff = server.last_etag(DB);
        server.pause_indexing(DB);
        seed_user(&server, "users/4", "Late", true);
        let mut session = store.open_session();

        let (list, stats) = session
            .query::<User>()
            .wait_for_non_stale_results_as_of_etag(cutoff)
            .query_result()
            .unwrap();
        assert!(!stats.is_stale);
        assert_eq!(list.len(), 3);
        assert_eq!(server.count_requests(RequestKind::Query), 1);
    }

    #[test]
    fn as_of_last_write_waits_for_this_store_writes() {
        let (server, store) = setup();
        seed_users(&server);
        server.pause_indexing(DB);

        let mut writer = store.open_session();
        let late = Tracked::new(User {
            id: Some("users/4".to_string()),
            name: "Late".to_string(),
            active: true,
        });
        writer.store(&late).unwrap();
        writer.save_changes().unwrap();

        let resumer = {
            let server = server.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(60));
                server.resume_indexing(DB);
            })
        };

        let mut reader = store.open_session();
        let list = reader
            .query::<User>()
            .where_equals("name", "Late")
            .wait_for_non_stale_results_as_of_last_write()
            .to_list()
            .unwrap();
        resumer.join().unwrap();

        assert_eq!(list.len(), 1);
        assert!(server.count_requests(RequestKind::Query) > 1);
    }

    #[test]
    fn wait_for_last_write_can_be_the_default() {
        let (server, store) = setup_with(ClientConfig {
            default_query_consistency: QueryConsistency::WaitForLastWrite,
            query_timeout_ms: 40,
            ..config()
        });
        server.pause_indexing(DB);

        let mut session = store.open_session();
        session
            .store(&Tracked::new(User {
                id: None,
                name: "Unindexed".to_string(),
                active: false,
            }))
            .unwrap();
        session.save_changes().unwrap();

        assert!(matches!(
            session.query::<User>().to_list(),
            Err(DocStoreError::StalenessTimeout { .. })
        ));
    }

    #[test]
    fn as_of_last_write_without_writes_does_not_wait() {
        let (server, store) = setup();
        seed_users(&server);
        server.pause_indexing(DB);
        seed_user(&server, "users/4", "Late", true);
        let mut session = store.open_session();

        let list = session
            .query::<User>()
            .wait_for_non_stale_results_as_of_last_write()
            .to_list()
            .unwrap();
        assert_eq!(list.len(), 3);
    }
}

// ============================================================================
// SECTION 3: Guards and includes
// ============================================================================

mod guards {
    use super::*;

    #[test]
    fn querying_by_id_on_a_dynamic_index_is_blocked() {
        let (server, store) = setup();
        seed_users(&server);
        let mut session = store.open_session();

        let err = session
            .query::<User>()
            .where_raw("__document_id:users/1")
            .to_list()
            .unwrap_err();
        assert!(matches!(err, DocStoreError::InvalidOperation(_)));
        assert_eq!(server.count_requests(RequestKind::Query), 0);
        assert_eq!(session.number_of_requests(), 0);

        let combined = session
            .query::<User>()
            .where_raw("__document_id:users/1")
            .where_equals("name", "Ayende")
            .to_list()
            .unwrap();
        assert_eq!(combined.len(), 1);
    }

    #[test]
    fn querying_by_id_can_be_allowed() {
        let (server, store) = setup_with(ClientConfig {
            allow_queries_on_id: true,
            ..config()
        });
        seed_users(&server);
        let mut session = store.open_session();

        let list = session
            .query::<User>()
            .where_equals("__document_id", "users/2")
            .to_list()
            .unwrap();
        assert_eq!(names(&list), vec!["Oren".to_string()]);
    }

    #[test]
    fn unknown_index_is_a_server_error() {
        let (_server, store) = setup();
        let mut session = store.open_session();
        assert!(matches!(
            session.query_index::<User>("Missing/Index").to_list(),
            Err(DocStoreError::Server { status: 404, .. })
        ));
    }

    #[test]
    fn included_documents_are_served_from_the_session() {
        let (server, store) = setup();
        seed_users(&server);
        server
            .seed(DB, "orders/1", json!({ "id": "orders/1", "customer": "users/2" }), meta("Orders"))
            .unwrap();
        let mut session = store.open_session();

        let orders = session.query::<Order>().include("customer").to_list().unwrap();
        assert_eq!(orders.len(), 1);
        assert!(session.is_loaded("users/2"));

        let requests = server.request_count();
        let customer = session.load::<User>("users/2").unwrap().unwrap();
        assert_eq!(customer.borrow().name, "Oren");
        assert_eq!(server.request_count(), requests);
    }

    #[test]
    fn other_shapes_can_read_an_index() {
        let (server, store) = setup();
        seed_users(&server);
        let mut session = store.open_session();

        let list = session
            .query_index::<NameOnly>("dynamic/Users")
            .where_equals("name", "Oren")
            .to_list()
            .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].borrow().name, "Oren");
        // results carry @id, so they are tracked under their keys
        assert!(session.is_loaded("users/2"));
    }
}
