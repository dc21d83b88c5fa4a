//! http-ingest - non-blocking HTTP ingestion layer for a database server
//!
//! This crate owns one connection's lifecycle from socket readiness to a
//! completed (or retried, or failed) request, including multipart/form-data
//! bodies streamed across arbitrarily many partial socket reads and requests
//! suspended mid-parse by backend resource contention.

pub mod http;
pub mod net;
