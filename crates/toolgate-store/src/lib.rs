//! toolgate-store: durable state for the gateway
//!
//! One SQLite database holds the tool-server registry, API keys and policy
//! rules, and the append-only call log.

pub mod call_log;
pub mod db;
pub mod policy;
pub mod registry;

pub use call_log::CallLog;
pub use db::Database;
pub use policy::{Policy, resource_matches};
pub use registry::Registry;
