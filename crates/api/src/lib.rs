// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Stacker API Library
//!
//! HTTP surface for the billing core: provider webhooks, the cron-triggered
//! billing cycle, and the merchant-facing billing endpoints.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{Config, ConfigError, UserTokenKey};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
