//! HTTP API Module
//!
//! REST admin surface for links and the primary's source log.

mod http;

pub use http::{AppState, ErrorResponse, HttpServer};
