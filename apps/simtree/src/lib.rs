//! # simtree
//!
//! Server and CLI for the Simtree history store. The binary in `main.rs`
//! is a thin wrapper; everything here is reusable from integration tests.

pub mod api;
pub mod cli;
pub mod error;
pub mod settings;

pub use error::AppError;
pub use settings::Settings;
