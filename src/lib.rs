//! inboxos — operational intelligence for your inbox.
//!
//! The core is three subsystems sharing one set of contracts:
//! a tiered classifier (type mapper → learned rules → LLM → verifier),
//! a seven-stage digest pipeline over a validated DAG, and a learning
//! loop that turns corrections into per-sender rules. Everything is
//! tenancy-scoped by `user_id` in a single SQLite store.

pub mod classify;
pub mod clock;
pub mod config;
pub mod db;
pub mod digest;
pub mod error;
pub mod hygiene;
pub mod learning;
pub mod limiter;
pub mod llm;
pub mod migrations;
pub mod server;
pub mod state;
pub mod types;

pub use clock::Clock;
pub use error::CoreError;
pub use state::ServiceState;
