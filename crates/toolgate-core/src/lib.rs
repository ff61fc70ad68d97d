//! toolgate-core: types shared by every toolgate crate
//!
//! Holds the persisted data model, the caller-facing error taxonomy,
//! configuration loading, and the contract native (in-process) tools implement.

pub mod config;
pub mod error;
pub mod native;
pub mod types;

pub use config::{AppConfig, GatewaySettings, PolicyEvaluation, PolicySettings};
pub use error::GatewayError;
pub use native::{NativeCatalog, NativeTool, ToolSchema};
pub use types::*;
