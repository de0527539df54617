//! TeamRide Shared Types and Utilities
//!
//! This crate contains types, errors, and database utilities shared across the
//! TeamRide billing services.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
