//! Stacker Shared
//!
//! Database plumbing and money helpers used by every Stacker crate.

pub mod db;
pub mod money;

pub use db::{create_pool, run_migrations, DbError};
pub use money::{cents_to_dollars, dollars_to_cents, percent_of_cents, format_cents};
