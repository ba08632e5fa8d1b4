//! Per-call operation state shared by the eager and lazy code paths
//!
//! Each operation knows how to judge a server answer (accept it, or ask
//! for a retry) and how to fold an accepted answer into the session.

mod load;
mod query;

pub(crate) use load::{LoadOperation, MultiLoadOperation};
pub(crate) use query::QueryOperation;
