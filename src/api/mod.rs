//! Control API
//!
//! HTTP surface over the extension manager:
//! - routing and request handling
//! - per-request trace ids
//! - JSON error responses

pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use middleware::{trace_id_middleware, TraceId, TRACE_ID_HEADER};
pub use server::ApiServer;
