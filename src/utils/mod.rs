//! The `utils` module provides shared definitions used across the `relaymq`
//! broker: the error taxonomy every pipeline reports through, and the
//! tracing initialisation used by the binary and by tests.

pub mod error;
pub mod logging;
