use thiserror::Error;

/// Fatal pipeline outcomes. Everything else degrades into a check.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("enrichment cancelled")]
    Cancelled,
    /// Strict mode only.
    #[error("LSP output missing chunkUid for {symbol} in {virtual_path}")]
    MissingChunkUid {
        virtual_path: String,
        symbol: String,
    },
    #[error("hover cache IO failed: {0}")]
    Io(#[from] std::io::Error),
}

impl EnrichError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
