//! Error types for the srcmirror system.

use std::path::PathBuf;

/// Result type alias for srcmirror operations.
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Main error type for the srcmirror system.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Name-mapping errors
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Archive errors
    #[error("Archive error: {0}")]
    Archive(String),

    /// Monitor errors
    #[error("Monitor error: {0}")]
    Monitor(String),

    /// A directory nested inside an already-monitored directory was added
    #[error("{} is a subdirectory of monitored directory {}", path.display(), parent.display())]
    NestedDirectory { path: PathBuf, parent: PathBuf },

    /// A directory that must never be monitored (filesystem root, the
    /// monitor's own storage root)
    #[error("directory cannot be monitored: {} ({reason})", path.display())]
    ForbiddenDirectory { path: PathBuf, reason: String },

    /// Artifact generation failed for a source file
    #[error("artifact generation failed for {}", path.display())]
    Generation {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Wrapped anyhow errors for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MirrorError {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new mapping error
    pub fn mapping(msg: impl Into<String>) -> Self {
        Self::Mapping(msg.into())
    }

    /// Create a new archive error
    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    /// Create a new monitor error
    pub fn monitor(msg: impl Into<String>) -> Self {
        Self::Monitor(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a generation error wrapping the underlying cause
    pub fn generation(path: impl Into<PathBuf>, source: impl Into<anyhow::Error>) -> Self {
        Self::Generation {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Check if this is a nested-directory configuration error
    pub fn is_nested_directory(&self) -> bool {
        matches!(self, Self::NestedDirectory { .. })
    }

    /// Check if this is a generation error
    pub fn is_generation(&self) -> bool {
        matches!(self, Self::Generation { .. })
    }
}
