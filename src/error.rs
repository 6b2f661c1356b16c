use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid magic number in cache file header")]
    InvalidMagic,

    #[error("Unsupported cache format version: {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Cache file game version {found} does not match {expected}")]
    GameVersionMismatch { found: u32, expected: u32 },

    #[error("Cache file platform {found} does not match {expected}")]
    PlatformMismatch { found: u8, expected: u8 },

    #[error("Corrupt table of contents: {0}")]
    CorruptToc(String),

    #[error("Pipeline descriptor failed verification")]
    InvalidDescriptor,

    #[error("Pipeline hash {0} was never recorded in this cache")]
    UnknownPipeline(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// True for header mismatches that mean "not our file" rather than damage.
    ///
    /// A mismatching file is treated as absent and the cache opens empty;
    /// a corrupt TOC is different and makes the file eligible for deletion.
    pub fn is_format_mismatch(&self) -> bool {
        matches!(
            self,
            CacheError::InvalidMagic
                | CacheError::UnsupportedVersion { .. }
                | CacheError::GameVersionMismatch { .. }
                | CacheError::PlatformMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mismatch_classification() {
        assert!(CacheError::InvalidMagic.is_format_mismatch());
        assert!(CacheError::UnsupportedVersion {
            found: 99,
            expected: 1
        }
        .is_format_mismatch());
        assert!(!CacheError::CorruptToc("missing EOF marker".into()).is_format_mismatch());
        assert!(!CacheError::UnknownPipeline(42).is_format_mismatch());
    }
}
