//! Block allocation for a user space emulated disk.
//!
//! A disk is a single file mapped into memory and split into a fixed header, a
//! bitmap with one bit per block, and the blocks themselves. [`DiskDriver`]
//! keeps the bitmap and the header counters in step with block writes and
//! frees, so a file system built on top only deals in block numbers.
//!
//! ```no_run
//! use diskdriver::{DiskDriver, BLOCK_SIZE};
//!
//! let mut disk = DiskDriver::open("disk.img", 1024)?;
//! let block = disk.allocate_block(&[0x2a; BLOCK_SIZE])?;
//! let mut buf = [0; BLOCK_SIZE];
//! disk.read_block(block, &mut buf)?;
//! disk.flush()?;
//! # Ok::<(), diskdriver::DiskError>(())
//! ```
pub mod bitmap;
mod error;
pub mod io;
pub mod layout;

pub use crate::error::DiskError;
pub use crate::io::{BlockNumber, BlockStorage, DiskDriver, DiskDriverBuilder};

/// Size in bytes of every block. Images written with another block size are
/// not compatible.
pub const BLOCK_SIZE: usize = 512;
