//! RLS Common Types and Utilities
//!
//! Shared types, configuration, and error handling for the row level security engine.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod types;

pub use config::RlsConfig;
pub use error::{Error, Result};
pub use types::{Operation, Row, TokenClaims};
