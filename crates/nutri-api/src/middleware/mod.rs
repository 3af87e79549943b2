//! # HTTP Middleware
//!
//! Authentication lives in [`crate::auth`]; this module holds the
//! cross-cutting layers that do not need application state.

pub mod metrics;
