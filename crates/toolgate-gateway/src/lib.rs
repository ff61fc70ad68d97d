//! toolgate-gateway: routing core and HTTP surface for toolgate
//!
//! Agents open an SSE session, post JSON-RPC messages into it, and the
//! gateway resolves each tool call to its owning server, checks the caller's
//! role against the policy, dispatches with retry and timeout through a shared
//! connection pool, and records one audit row per call.

pub mod admin;
pub mod auth;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod session;

#[cfg(test)]
mod testing;

pub use error::ApiError;
pub use gateway::{Gateway, Registration, RetryPolicy};
pub use pool::ConnectionPool;
pub use server::{AppState, GatewayServer};
pub use session::{SessionError, SessionManager};
