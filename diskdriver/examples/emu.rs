use std::env;

use diskdriver::{DiskDriver, BLOCK_SIZE};

pub fn main() {
    let dir = tempfile::tempdir().unwrap();
    let path = env::args()
        .nth(1)
        .map(Into::into)
        .unwrap_or_else(|| dir.path().join("disk.img"));

    // Create (or reopen) a 64 block disk and fill the first free block.
    let mut disk = DiskDriver::open(&path, 64).expect("Could not open disk image.");
    let block = disk
        .allocate_block(&[0x55; BLOCK_SIZE])
        .expect("disk is full");
    disk.flush().unwrap();

    let header = disk.header().unwrap();
    println!(
        "{}: wrote block {}, {} of {} blocks free, next free block {}",
        path.display(),
        block,
        header.free_blocks(),
        header.num_blocks(),
        header.first_free_block()
    );
}
