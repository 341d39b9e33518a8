mod block;
mod disk;

pub use block::{BlockNumber, BlockStorage};
pub use disk::{DiskDriver, DiskDriverBuilder};
