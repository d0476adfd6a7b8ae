//! The `transport` module exposes the broker over HTTP.
//!
//! Requests and responses are JSON bodies (`message`); `http` builds the
//! axum router, parses bodies into the DTOs and maps broker errors to
//! plain-text responses.

pub mod http;
pub mod message;

pub use http::build_router;
