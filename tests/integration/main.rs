//! Integration Tests
//!
//! End-to-end scenarios through the `docstore` facade:
//! - Unit of work: store, load, modify and save across sessions
//! - Clients: several stores sharing one server
//! - Configuration: config files feeding a store

#[path = "../common/mod.rs"]
mod common;

mod clients;
mod configuration;
mod unit_of_work;
