//! Storage backends and the traits they implement.
//!
//! - [`traits`] - the seams: `DocumentStore`, `TokenProvider`, `StateStore`
//! - [`rest`] - HTTP client for the collaborative document store
//! - [`sqlite`] - durable local state (queue, anchor, acknowledgements)
//! - [`memory`] - in-memory backends for tests and ephemeral runs

pub mod memory;
pub mod rest;
pub mod sqlite;
pub mod traits;
