//! Shared helpers for the facade-level integration tests

#![allow(dead_code)]

use serde::{Deserialize, Serialize};

use docstore::{ClientConfig, Document, DocumentStore, EmbeddedServer};

pub const DB: &str = "integration";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
}

impl Document for Customer {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: &str) {
        self.id = Some(id.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(default)]
    pub id: Option<String>,
    pub customer: String,
    pub total: u64,
    #[serde(default)]
    pub shipped: bool,
}

impl Document for Order {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: &str) {
        self.id = Some(id.to_string());
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        database: DB.to_string(),
        hilo_capacity: 8,
        staleness_poll_interval_ms: 5,
        lazy_retry_interval_ms: 5,
        ..Default::default()
    }
}

/// A server and one client store pointed at it
pub fn client() -> (EmbeddedServer, DocumentStore) {
    let server = EmbeddedServer::new();
    let store = second_client(&server);
    (server, store)
}

/// Another client store against the same server
pub fn second_client(server: &EmbeddedServer) -> DocumentStore {
    DocumentStore::new(server.commands(DB), test_config()).unwrap()
}

pub fn customer(name: &str) -> docstore::Tracked<Customer> {
    docstore::Tracked::new(Customer {
        id: None,
        name: name.to_string(),
    })
}

pub fn order(customer: &str, total: u64) -> docstore::Tracked<Order> {
    docstore::Tracked::new(Order {
        id: None,
        customer: customer.to_string(),
        total,
        shipped: false,
    })
}
