//! Shared database schema, migrations, and query builders.
//!
//! Every builder that touches an owned row takes the owner's `user_id` and
//! filters on it; there is no unscoped read or write path for user data.

pub mod courses;
pub mod flashcards;
pub mod lessons;
pub mod materials;
pub mod migrations;
pub mod tables;
pub mod users;

pub use tables::*;

/// A built statement: SQL text plus bound values.
pub type Built = (String, sea_query::Values);
