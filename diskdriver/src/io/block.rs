use std::path::Path;

use crate::error::DiskError;

/// The block number to access ranging from 0 (the first block) to n - 1 (the last
/// block) where n is number of blocks available.
pub type BlockNumber = usize;

/// The allocator primitives a file system layer builds on. Implementations
/// own both the block contents and the record of which blocks hold data, so
/// callers never see the bitmap or compute block addresses themselves.
pub trait BlockStorage {
    /// Opens the disk at `path`, formatting it with `nblocks` free blocks if it
    /// does not exist yet.
    ///
    /// # Errors
    ///
    /// Every error returned here is fatal for the image, see [`DiskError::is_fatal`].
    fn open_disk<P: AsRef<Path>>(path: P, nblocks: usize) -> Result<Self, DiskError>
    where
        Self: std::marker::Sized;
    /// Reads disk block number into provided buffer.
    ///
    /// # Errors
    ///
    /// Attempting to read a block out of range, or one that holds no data, will
    /// return an error.
    fn read_block(&self, blocknr: BlockNumber, buf: &mut [u8]) -> Result<(), DiskError>;
    /// Writes provided buffer into the specified block number, marking the block
    /// as holding data.
    ///
    /// # Errors
    ///
    /// Attempting to write a block out of range will return an error.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> Result<(), DiskError>;
    /// Releases a block. Its contents stay on disk but can no longer be read.
    fn free_block(&mut self, blocknr: BlockNumber) -> Result<(), DiskError>;
    /// Returns the first free block at or after `start` without reserving it.
    fn find_free_block(&self, start: BlockNumber) -> Result<BlockNumber, DiskError>;
    /// Flush any buffered disk IO from memory. This is useful if it must guaranteed
    /// the disk writes actually occurred, for instance, if being re-read from
    /// disk.
    fn sync_disk(&mut self) -> Result<(), DiskError>;
}
