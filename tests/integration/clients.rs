//! Several client stores sharing one server

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use parking_lot::Mutex;

use crate::common::*;

#[test]
fn stores_hand_out_disjoint_keys() {
    let (server, first) = client();
    let second = second_client(&server);

    let mut a = first.open_session();
    let mut b = second.open_session();
    let mut keys = Vec::new();
    for i in 0..3 {
        let x = customer(&format!("a{}", i));
        let y = customer(&format!("b{}", i));
        a.store(&x).unwrap();
        b.store(&y).unwrap();
        keys.push(a.get_document_id(&x).unwrap());
        keys.push(b.get_document_id(&y).unwrap());
    }
    a.save_changes().unwrap();
    b.save_changes().unwrap();

    let unique: HashSet<&String> = keys.iter().collect();
    assert_eq!(unique.len(), keys.len());
    assert!(keys.contains(&"customers/1".to_string()));
    // the second store reserved the range after the first one
    assert!(keys.contains(&"customers/9".to_string()));
}

#[test]
fn concurrent_clients_never_collide() {
    let server = docstore::EmbeddedServer::new();
    let clients = 4;
    let per_client = 25;
    let barrier = Arc::new(Barrier::new(clients));
    let keys = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..clients)
        .map(|c| {
            let store = second_client(&server);
            let barrier = Arc::clone(&barrier);
            let keys = Arc::clone(&keys);
            thread::spawn(move || {
                barrier.wait();
                let mut session = store.open_session();
                for i in 0..per_client {
                    let c = customer(&format!("client{}-{}", c, i));
                    session.store(&c).unwrap();
                    keys.lock().push(session.get_document_id(&c).unwrap());
                }
                session.save_changes().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let keys = keys.lock();
    let unique: HashSet<&String> = keys.iter().collect();
    assert_eq!(keys.len(), clients * per_client);
    assert_eq!(unique.len(), keys.len());
    assert_eq!(server.document_count(DB), clients * per_client + 1);
}
