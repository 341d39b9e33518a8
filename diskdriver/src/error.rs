use crate::bitmap::BitmapError;
use crate::io::BlockNumber;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("block {block} out of range for disk of {num_blocks} blocks")]
    OutOfRange {
        block: BlockNumber,
        num_blocks: usize,
    },
    #[error("block {0} is not allocated")]
    Unallocated(BlockNumber),
    #[error("allocation bitmap update failed")]
    Bitmap(#[from] BitmapError),
    #[error("no free block at or after block {0}")]
    NotFound(BlockNumber),
    #[error("buffer of {0} bytes does not match the block size")]
    BufferSize(usize),
    #[error("failed to sync disk image")]
    SyncFailed(#[source] std::io::Error),

    #[error("failed to open disk image")]
    Open(#[source] std::io::Error),
    #[error("failed to map disk image")]
    Map(#[source] std::io::Error),
    #[error("invalid disk geometry: {0}")]
    InvalidGeometry(String),
    #[error("existing disk has {found} blocks, expected {expected}")]
    GeometryMismatch { expected: usize, found: usize },
    #[error("disk header is corrupt: {0}")]
    CorruptHeader(String),
    #[error("disk image is {found} bytes, expected at least {expected}")]
    Truncated { expected: u64, found: u64 },
    #[error("allocation state is inconsistent: {0}")]
    Inconsistent(String),
}

impl DiskError {
    /// Fatal errors mean the image cannot be used safely with the geometry the
    /// caller asked for. The driver never exits the process itself; callers
    /// must stop using the image when this returns true.
    pub fn is_fatal(&self) -> bool {
        match self {
            DiskError::OutOfRange { .. }
            | DiskError::Unallocated(_)
            | DiskError::Bitmap(_)
            | DiskError::NotFound(_)
            | DiskError::BufferSize(_)
            | DiskError::SyncFailed(_) => false,
            DiskError::Open(_)
            | DiskError::Map(_)
            | DiskError::InvalidGeometry(_)
            | DiskError::GeometryMismatch { .. }
            | DiskError::CorruptHeader(_)
            | DiskError::Truncated { .. }
            | DiskError::Inconsistent(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_misuse_is_recoverable() {
        assert!(!DiskError::Unallocated(3).is_fatal());
        assert!(!DiskError::OutOfRange {
            block: 8,
            num_blocks: 8
        }
        .is_fatal());
        assert!(!DiskError::from(BitmapError::OutOfRange {
            index: 8,
            num_bits: 8
        })
        .is_fatal());
    }

    #[test]
    fn setup_failures_are_fatal() {
        assert!(DiskError::GeometryMismatch {
            expected: 8,
            found: 16
        }
        .is_fatal());
        assert!(DiskError::Open(std::io::Error::from(std::io::ErrorKind::NotFound)).is_fatal());
    }

    #[test]
    fn messages_name_the_block() {
        let err = DiskError::OutOfRange {
            block: 8,
            num_blocks: 8,
        };
        assert_eq!(err.to_string(), "block 8 out of range for disk of 8 blocks");
    }
}
