use thiserror::Error;

#[derive(Error, Debug)]
pub enum MiniCloudError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Content was committed but the metadata index was not updated.
    #[error("Partial write for {key}: {size} bytes stored but index update failed: {source}")]
    PartialWrite {
        key: String,
        size: u64,
        integrity_tag: String,
        #[source]
        source: Box<MiniCloudError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// The coarse failure classes callers are expected to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidKey,
    NotFound,
    Io,
    PartialWrite,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidKey => "invalid_key",
            Self::NotFound => "not_found",
            Self::Io => "io",
            Self::PartialWrite => "partial_write",
        }
    }
}

impl MiniCloudError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidKey(_) => ErrorKind::InvalidKey,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PartialWrite { .. } => ErrorKind::PartialWrite,
            Self::Io(_)
            | Self::Database(_)
            | Self::Config(_)
            | Self::Internal(_) => ErrorKind::Io,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

pub type Result<T> = std::result::Result<T, MiniCloudError>;
