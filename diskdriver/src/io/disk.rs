use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, error, info, trace, warn};
use memmap2::{MmapMut, MmapOptions};
use zerocopy::IntoBytes;

use crate::bitmap::State;
use crate::error::DiskError;
use crate::io::{BlockNumber, BlockStorage};
use crate::layout::{DiskHeader, Geometry, Region, RegionMut, HEADER_SIZE};
use crate::BLOCK_SIZE;

/// Emulates a block device in userspace on top of a single memory mapped file
/// holding a header, an allocation bitmap and the blocks themselves.
///
/// The mapping is shared, so writes land in the file without an explicit
/// write call and are visible to anyone else mapping it. Nothing coordinates
/// concurrent writers: one process must own an image at a time. Durability is
/// only guaranteed after [`DiskDriver::flush`].
pub struct DiskDriver {
    path: PathBuf,
    // Dropped in declaration order, so the region is unmapped before the file
    // is closed.
    mmap: MmapMut,
    fd: File,
}

impl DiskDriver {
    /// Opens the disk image at `path`, creating and formatting it with
    /// `num_blocks` free blocks if it does not exist or is empty.
    ///
    /// # Errors
    ///
    /// Opening an existing image with a different block count fails with
    /// [`DiskError::GeometryMismatch`] before any of its data is touched. Every
    /// error from this call is fatal for the image.
    pub fn open<P: AsRef<Path>>(path: P, num_blocks: usize) -> Result<Self, DiskError> {
        DiskDriverBuilder::from(path.as_ref())
            .with_num_blocks(num_blocks)
            .build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copies `BLOCK_SIZE` bytes of `blocknr` into the front of `buf`.
    ///
    /// # Errors
    ///
    /// Blocks that were never written, or were freed since, hold no data and
    /// fail with [`DiskError::Unallocated`] even if stale bytes remain on disk.
    pub fn read_block(&self, blocknr: BlockNumber, buf: &mut [u8]) -> Result<(), DiskError> {
        let region = self.region()?;
        region.geometry.check_block(blocknr)?;
        if buf.len() < BLOCK_SIZE {
            return Err(DiskError::BufferSize(buf.len()));
        }
        if region.bitmap.state(blocknr)? == State::Free {
            return Err(DiskError::Unallocated(blocknr));
        }

        buf[..BLOCK_SIZE].copy_from_slice(region.block(blocknr)?);
        trace!("Read block {} from {}.", blocknr, self.path.display());
        Ok(())
    }

    /// Writes exactly one block of data to `blocknr` and marks it allocated.
    /// Writing an allocated block overwrites it in place.
    pub fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> Result<(), DiskError> {
        let mut region = self.region_mut()?;
        region.geometry.check_block(blocknr)?;
        if buf.len() != BLOCK_SIZE {
            return Err(DiskError::BufferSize(buf.len()));
        }

        // The bitmap is updated first so data never lands in a block the
        // bitmap does not record as used.
        let previous = region.bitmap.state(blocknr)?;
        region.bitmap.set(blocknr, State::Used)?;
        if previous == State::Free {
            let free = region.header.free_blocks();
            region.header.set_free_blocks(free.saturating_sub(1));
        }

        if blocknr == region.header.first_free_block() {
            let next = region
                .bitmap
                .get(blocknr, State::Free)
                .unwrap_or_else(|| region.geometry.num_blocks());
            debug!("Allocation hint moved from block {} to {}.", blocknr, next);
            region.header.set_first_free_block(next);
        }

        region.block_mut(blocknr)?.copy_from_slice(buf);
        trace!("Wrote block {} to {}.", blocknr, self.path.display());
        Ok(())
    }

    /// Marks `blocknr` free. The block contents are left as they are.
    pub fn free_block(&mut self, blocknr: BlockNumber) -> Result<(), DiskError> {
        let mut region = self.region_mut()?;
        region.geometry.check_block(blocknr)?;

        let previous = region.bitmap.state(blocknr)?;
        region.bitmap.set(blocknr, State::Free)?;
        if previous == State::Used {
            let free = region.header.free_blocks();
            region
                .header
                .set_free_blocks((free + 1).min(region.geometry.num_blocks()));
        }
        if blocknr < region.header.first_free_block() {
            region.header.set_first_free_block(blocknr);
        }

        debug!("Freed block {} on {}.", blocknr, self.path.display());
        Ok(())
    }

    /// Returns the first free block at or after `start`. Nothing is reserved,
    /// callers allocate by writing the block.
    pub fn find_free_block(&self, start: BlockNumber) -> Result<BlockNumber, DiskError> {
        let region = self.region()?;
        region.geometry.check_block(start)?;
        region
            .bitmap
            .get(start, State::Free)
            .ok_or(DiskError::NotFound(start))
    }

    /// Writes `buf` to the first free block, searching from the allocation hint
    /// and falling back to a full scan in case the hint is stale.
    pub fn allocate_block(&mut self, buf: &[u8]) -> Result<BlockNumber, DiskError> {
        if buf.len() != BLOCK_SIZE {
            return Err(DiskError::BufferSize(buf.len()));
        }

        let blocknr = {
            let region = self.region()?;
            let hint = region.header.first_free_block();
            region
                .bitmap
                .get(hint, State::Free)
                .or_else(|| region.bitmap.get(0, State::Free))
                .ok_or(DiskError::NotFound(0))?
        };
        self.write_block(blocknr, buf)?;
        Ok(blocknr)
    }

    /// Forces the header, bitmap and every block to the backing file.
    pub fn flush(&self) -> Result<(), DiskError> {
        // A header too damaged to describe the region still gets the whole
        // mapping written out.
        let len = self
            .region()
            .map(|region| region.geometry.region_len())
            .unwrap_or_else(|_| self.mmap.len());
        self.mmap
            .flush_range(0, len)
            .map_err(DiskError::SyncFailed)
    }

    /// Flushes the image, including file metadata, and releases the mapping
    /// and file.
    pub fn close(self) -> Result<(), DiskError> {
        self.flush()?;
        self.fd.sync_all().map_err(DiskError::SyncFailed)?;
        info!("Closed disk {}.", self.path.display());
        Ok(())
    }

    /// A copy of the on-disk header.
    pub fn header(&self) -> Result<DiskHeader, DiskError> {
        Ok(*self.region()?.header)
    }

    pub fn num_blocks(&self) -> Result<usize, DiskError> {
        Ok(self.region()?.geometry.num_blocks())
    }

    pub fn free_blocks(&self) -> Result<usize, DiskError> {
        Ok(self.region()?.header.free_blocks())
    }

    pub fn first_free_block(&self) -> Result<BlockNumber, DiskError> {
        Ok(self.region()?.header.first_free_block())
    }

    /// Number of blocks the bitmap records as holding data.
    pub fn allocated_blocks(&self) -> Result<usize, DiskError> {
        Ok(self.region()?.bitmap.count(State::Used))
    }

    pub fn is_allocated(&self, blocknr: BlockNumber) -> Result<bool, DiskError> {
        Ok(self.region()?.bitmap.state(blocknr)? == State::Used)
    }

    /// Checks that the free block counter agrees with the bitmap.
    pub fn verify(&self) -> Result<(), DiskError> {
        let region = self.region()?;
        let used = region.bitmap.count(State::Used);
        let free = region.header.free_blocks();
        if used + free != region.geometry.num_blocks() {
            return Err(DiskError::Inconsistent(format!(
                "{} blocks recorded free but {} of {} are marked used",
                free,
                used,
                region.geometry.num_blocks()
            )));
        }
        Ok(())
    }

    fn region(&self) -> Result<Region<'_>, DiskError> {
        Region::split(&self.mmap)
    }

    fn region_mut(&mut self) -> Result<RegionMut<'_>, DiskError> {
        RegionMut::split(&mut self.mmap)
    }

    fn format(path: PathBuf, fd: File, geometry: Geometry) -> Result<Self, DiskError> {
        fd.set_len(geometry.region_len() as u64)
            .map_err(DiskError::Open)?;
        let mut mmap = match map(&fd, &geometry) {
            Ok(mmap) => mmap,
            Err(err) => {
                // Leave the file empty so the next open formats it again.
                if let Err(reset) = fd.set_len(0) {
                    warn!("Could not reset {}: {}.", path.display(), reset);
                }
                return Err(err);
            }
        };

        mmap[..HEADER_SIZE].copy_from_slice(DiskHeader::new(&geometry).as_bytes());
        let mut disk = DiskDriver { path, mmap, fd };
        disk.region_mut()?.bitmap.clear();

        info!(
            "Created disk {} with {} blocks of {} bytes.",
            disk.path.display(),
            geometry.num_blocks(),
            BLOCK_SIZE
        );
        Ok(disk)
    }

    fn load(path: PathBuf, fd: File, geometry: Geometry, len: u64) -> Result<Self, DiskError> {
        let mut buf = [0; HEADER_SIZE];
        if len < HEADER_SIZE as u64 {
            return Err(DiskError::Truncated {
                expected: geometry.region_len() as u64,
                found: len,
            });
        }
        (&fd).read_exact(&mut buf).map_err(DiskError::Open)?;

        let header = DiskHeader::parse(&buf)?;
        if header.num_blocks() != geometry.num_blocks() {
            return Err(DiskError::GeometryMismatch {
                expected: geometry.num_blocks(),
                found: header.num_blocks(),
            });
        }
        header.geometry()?;
        if len < geometry.region_len() as u64 {
            return Err(DiskError::Truncated {
                expected: geometry.region_len() as u64,
                found: len,
            });
        }

        let mmap = map(&fd, &geometry)?;
        let disk = DiskDriver { path, mmap, fd };
        if let Err(err) = disk.verify() {
            warn!("Disk {} opened with {}.", disk.path.display(), err);
        }

        info!(
            "Opened disk {} with {} of {} blocks free.",
            disk.path.display(),
            header.free_blocks(),
            geometry.num_blocks()
        );
        Ok(disk)
    }
}

fn map(fd: &File, geometry: &Geometry) -> Result<MmapMut, DiskError> {
    // Safety: the file is sized to at least the region before mapping, and the
    // single owner of an image is the only one allowed to modify or resize it.
    unsafe { MmapOptions::new().len(geometry.region_len()).map_mut(fd) }
        .map_err(DiskError::Map)
}

impl BlockStorage for DiskDriver {
    fn open_disk<P: AsRef<Path>>(path: P, nblocks: usize) -> Result<Self, DiskError>
    where
        Self: std::marker::Sized,
    {
        DiskDriver::open(path, nblocks)
    }

    fn read_block(&self, blocknr: BlockNumber, buf: &mut [u8]) -> Result<(), DiskError> {
        DiskDriver::read_block(self, blocknr, buf)
    }

    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> Result<(), DiskError> {
        DiskDriver::write_block(self, blocknr, buf)
    }

    fn free_block(&mut self, blocknr: BlockNumber) -> Result<(), DiskError> {
        DiskDriver::free_block(self, blocknr)
    }

    fn find_free_block(&self, start: BlockNumber) -> Result<BlockNumber, DiskError> {
        DiskDriver::find_free_block(self, start)
    }

    fn sync_disk(&mut self) -> Result<(), DiskError> {
        self.flush()
    }
}

/// Configures how a disk image is opened.
pub struct DiskDriverBuilder {
    path: PathBuf,
    num_blocks: usize,
    create: bool,
}

impl From<PathBuf> for DiskDriverBuilder {
    fn from(path: PathBuf) -> Self {
        DiskDriverBuilder {
            path,
            num_blocks: 0,
            create: true,
        }
    }
}

impl From<&Path> for DiskDriverBuilder {
    fn from(path: &Path) -> Self {
        DiskDriverBuilder::from(path.to_path_buf())
    }
}

impl DiskDriverBuilder {
    /// Sets the number of blocks on the disk. An existing image must have been
    /// created with the same count.
    pub fn with_num_blocks(mut self, blocks: usize) -> Self {
        self.num_blocks = blocks;
        self
    }

    /// Whether a missing image file is created. Defaults to true.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Opens the image, formatting it if the file is new or empty. Failures
    /// release everything acquired so far before returning.
    pub fn build(self) -> Result<DiskDriver, DiskError> {
        let path = self.path.clone();
        self.open().map_err(|err| {
            error!("Cannot use disk {}: {}.", path.display(), err);
            err
        })
    }

    fn open(self) -> Result<DiskDriver, DiskError> {
        let geometry = Geometry::new(self.num_blocks)?;
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(self.create)
            .open(&self.path)
            .map_err(DiskError::Open)?;

        let len = fd.metadata().map_err(DiskError::Open)?.len();
        if len == 0 {
            DiskDriver::format(self.path, fd, geometry)
        } else {
            DiskDriver::load(self.path, fd, geometry, len)
        }
    }
}
