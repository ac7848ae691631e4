//! HTTP API Module
//!
//! Federation endpoints used by mirrors and the management API used by
//! operators.

mod error;
mod http;

pub use error::{ApiError, ErrorResponse};
pub use http::{AppState, HttpServer};
