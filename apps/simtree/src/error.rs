//! # Application Errors

use crate::settings::SettingsError;
use simtree_core::SimtreeError;

/// Errors surfaced by CLI commands and the server.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] SimtreeError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    /// Bad command-line input.
    #[error("{0}")]
    Usage(String),
}

impl AppError {
    /// Adapter for `map_err` on I/O results.
    pub fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }

    /// Process exit code for this error.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) | Self::Settings(_) => 2,
            _ => 1,
        }
    }
}
