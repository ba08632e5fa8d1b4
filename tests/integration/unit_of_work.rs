//! Store, query and update through several short sessions

use std::collections::HashSet;

use docstore::{DocStoreError, RequestKind};

use crate::common::*;

#[test]
fn order_workflow_across_sessions() {
    let (server, store) = client();

    let customer_key = {
        let mut session = store.open_session();
        let acme = customer("Acme");
        session.store(&acme).unwrap();
        let key = session.get_document_id(&acme).unwrap();
        for total in [10, 20, 30] {
            session.store(&order(&key, total)).unwrap();
        }
        session.save_changes().unwrap();
        key
    };
    assert_eq!(customer_key, "customers/1");
    assert_eq!(server.count_requests(RequestKind::Batch), 1);

    let mut session = store.open_session();
    let orders = session
        .query::<Order>()
        .where_equals("customer", customer_key.as_str())
        .include("customer")
        .wait_for_non_stale_results_as_of_last_write()
        .to_list()
        .unwrap();
    assert_eq!(orders.len(), 3);

    let acme = session.load::<Customer>(&customer_key).unwrap().unwrap();
    assert_eq!(acme.borrow().name, "Acme");
    assert_eq!(session.number_of_requests(), 1);

    for order in &orders {
        order.borrow_mut().shipped = true;
    }
    session.save_changes().unwrap();

    let mut check = store.open_session();
    let shipped = check
        .query::<Order>()
        .where_equals("shipped", true)
        .wait_for_non_stale_results_as_of_last_write()
        .count()
        .unwrap();
    assert_eq!(shipped, 3);
}

#[test]
fn deleting_and_reloading() {
    let (server, store) = client();
    let key = {
        let mut session = store.open_session();
        let doomed = customer("Doomed");
        session.store(&doomed).unwrap();
        session.save_changes().unwrap();
        session.get_document_id(&doomed).unwrap()
    };

    let mut session = store.open_session();
    session.delete_by_key(&key).unwrap();
    assert!(session.has_changes().unwrap());
    session.save_changes().unwrap();
    assert!(server.document(DB, &key).is_none());

    let mut fresh = store.open_session();
    assert!(fresh.load::<Customer>(&key).unwrap().is_none());
}

#[test]
fn optimistic_writers_detect_each_other() {
    let (_server, store) = client();
    let key = {
        let mut session = store.open_session();
        let shared = customer("Shared");
        session.store(&shared).unwrap();
        session.save_changes().unwrap();
        session.get_document_id(&shared).unwrap()
    };

    let mut first = store.open_session();
    let mut second = store.open_session();
    first.set_use_optimistic_concurrency(true);
    second.set_use_optimistic_concurrency(true);

    let a = first.load::<Customer>(&key).unwrap().unwrap();
    let b = second.load::<Customer>(&key).unwrap().unwrap();
    a.borrow_mut().name = "first".to_string();
    b.borrow_mut().name = "second".to_string();

    first.save_changes().unwrap();
    assert!(matches!(
        second.save_changes(),
        Err(DocStoreError::ConcurrencyConflict { .. })
    ));
}

#[test]
fn sessions_on_other_databases_keep_their_own_keys() {
    let (server, store) = client();

    let mut main = store.open_session();
    let mut other = store.open_session_for("archive");
    main.store(&customer("main")).unwrap();
    other.store(&customer("archived")).unwrap();
    main.save_changes().unwrap();
    other.save_changes().unwrap();

    assert!(server.document(DB, "customers/1").is_some());
    let archived = server.document("archive", "customers/1").unwrap();
    assert_eq!(archived.data.get("name"), Some(&serde_json::json!("archived")));
    assert_eq!(other.database(), "archive");

    let databases: HashSet<String> = server
        .requests()
        .into_iter()
        .filter(|r| r.kind == RequestKind::Batch)
        .map(|r| r.database)
        .collect();
    assert_eq!(databases.len(), 2);
}
