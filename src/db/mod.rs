//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: flat row records and the JSON column helpers.
//! - `repo`: SQL-only functions that map rows into domain entities.
//!
//! External modules should import from `ringmark::db` — we re-export the
//! repository API for convenience.

pub mod model;
pub mod repo;

pub use repo::*;
