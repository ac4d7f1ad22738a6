//! Infrastructure layer modules
//!
//! - `auth`: session authentication (JWT)
//! - `config`: application settings
//! - `error`: HTTP-facing error type
//! - `metrics`: Prometheus metrics helpers

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
