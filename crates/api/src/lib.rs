// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps BillingError conversions
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Tunnelshop API Library
//!
//! Provider webhooks, checkout and trial for the bot front-end, manual
//! payment checks and the operator surface.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
