use std::mem::size_of;
use std::ops::Range;

use zerocopy::byteorder::native_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::bitmap::{bytes_for, Bitmap};
use crate::error::DiskError;
use crate::io::BlockNumber;
use crate::BLOCK_SIZE;

/// Size in bytes of the header stored at the start of every disk image.
pub const HEADER_SIZE: usize = size_of::<DiskHeader>();

/// The first bytes of the disk image describing its geometry and allocation
/// counters. The header is read and updated in place inside the mapping, so
/// it is the single source of truth for every offset in the image.
///
/// # Layout
/// =========================================================================
/// | Header | Bitmap (ceil(n / 8) bytes) | Block 0 | Block 1 | .. | Block n-1 |
/// =========================================================================
#[repr(C)]
#[derive(
    FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy, PartialEq, Eq,
)]
pub struct DiskHeader {
    /// Total blocks on the disk. Fixed when the image is created.
    num_blocks: U32,
    /// Always equal to `num_blocks`; kept so existing images stay readable.
    bitmap_blocks: U32,
    /// Length of the bitmap region in bytes.
    bitmap_entries: U32,
    /// Blocks not currently holding data.
    free_blocks: U32,
    /// Lowest block known to be free. A starting point for searches only, it
    /// may lag behind the bitmap. Equals `num_blocks` when the disk is full.
    first_free_block: U32,
}

impl DiskHeader {
    /// A header for a freshly formatted disk with every block free.
    pub fn new(geometry: &Geometry) -> Self {
        let num_blocks = to_u32(geometry.num_blocks());
        Self {
            num_blocks,
            bitmap_blocks: num_blocks,
            bitmap_entries: to_u32(geometry.bitmap_entries()),
            free_blocks: num_blocks,
            first_free_block: U32::new(0),
        }
    }

    /// Reads a header copy from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, DiskError> {
        DiskHeader::read_from_prefix(buf)
            .map(|(header, _)| header)
            .map_err(|_| DiskError::Truncated {
                expected: HEADER_SIZE as u64,
                found: buf.len() as u64,
            })
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks.get() as usize
    }

    pub fn bitmap_entries(&self) -> usize {
        self.bitmap_entries.get() as usize
    }

    pub fn free_blocks(&self) -> usize {
        self.free_blocks.get() as usize
    }

    pub fn first_free_block(&self) -> BlockNumber {
        self.first_free_block.get() as usize
    }

    pub(crate) fn set_free_blocks(&mut self, count: usize) {
        self.free_blocks = to_u32(count);
    }

    pub(crate) fn set_first_free_block(&mut self, block: BlockNumber) {
        self.first_free_block = to_u32(block);
    }

    /// Derives the geometry this header describes, rejecting headers whose
    /// fields disagree with each other.
    pub fn geometry(&self) -> Result<Geometry, DiskError> {
        let geometry = Geometry::new(self.num_blocks())?;
        if self.bitmap_blocks.get() != self.num_blocks.get() {
            return Err(DiskError::CorruptHeader(format!(
                "bitmap covers {} blocks, disk has {}",
                self.bitmap_blocks.get(),
                self.num_blocks.get()
            )));
        }
        if self.bitmap_entries() != geometry.bitmap_entries() {
            return Err(DiskError::CorruptHeader(format!(
                "bitmap is {} bytes, expected {}",
                self.bitmap_entries(),
                geometry.bitmap_entries()
            )));
        }
        if self.free_blocks() > geometry.num_blocks() {
            return Err(DiskError::CorruptHeader(format!(
                "{} free blocks on a disk of {}",
                self.free_blocks(),
                geometry.num_blocks()
            )));
        }
        if self.first_free_block() > geometry.num_blocks() {
            return Err(DiskError::CorruptHeader(format!(
                "first free block {} past the end of the disk",
                self.first_free_block()
            )));
        }
        Ok(geometry)
    }
}

// Header counters never exceed `num_blocks`, which `Geometry::new` bounds to u32.
fn to_u32(value: usize) -> U32 {
    U32::new(value as u32)
}

/// Block count and bitmap length of a disk, from which every byte offset in
/// the image is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    num_blocks: usize,
    bitmap_entries: usize,
    region_len: usize,
}

impl Geometry {
    pub fn new(num_blocks: usize) -> Result<Self, DiskError> {
        if num_blocks == 0 {
            return Err(DiskError::InvalidGeometry(
                "a disk needs at least one block".to_string(),
            ));
        }
        if u32::try_from(num_blocks).is_err() {
            return Err(DiskError::InvalidGeometry(format!(
                "{} blocks exceeds the header limit of {}",
                num_blocks,
                u32::MAX
            )));
        }

        let bitmap_entries = bytes_for(num_blocks);
        let region_len = num_blocks
            .checked_mul(BLOCK_SIZE)
            .and_then(|blocks| blocks.checked_add(HEADER_SIZE + bitmap_entries))
            .ok_or_else(|| {
                DiskError::InvalidGeometry(format!(
                    "{} blocks do not fit in the address space",
                    num_blocks
                ))
            })?;

        Ok(Self {
            num_blocks,
            bitmap_entries,
            region_len,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn bitmap_entries(&self) -> usize {
        self.bitmap_entries
    }

    /// Total bytes of header, bitmap and blocks.
    pub fn region_len(&self) -> usize {
        self.region_len
    }

    pub fn bitmap_range(&self) -> Range<usize> {
        HEADER_SIZE..HEADER_SIZE + self.bitmap_entries
    }

    /// Byte offset of `block` from the start of the image. Does not check the
    /// block number.
    pub fn block_offset(&self, block: BlockNumber) -> usize {
        self.bitmap_range().end + block * BLOCK_SIZE
    }

    pub fn check_block(&self, block: BlockNumber) -> Result<(), DiskError> {
        if block >= self.num_blocks {
            return Err(DiskError::OutOfRange {
                block,
                num_blocks: self.num_blocks,
            });
        }
        Ok(())
    }

    fn blocks_len(&self) -> usize {
        self.num_blocks * BLOCK_SIZE
    }

    fn block_range(&self, block: BlockNumber) -> Result<Range<usize>, DiskError> {
        self.check_block(block)?;
        let start = block * BLOCK_SIZE;
        Ok(start..start + BLOCK_SIZE)
    }
}

/// Read-only view of a mapped disk image split into its three regions.
pub struct Region<'a> {
    pub header: &'a DiskHeader,
    pub bitmap: Bitmap<&'a [u8]>,
    pub geometry: Geometry,
    blocks: &'a [u8],
}

impl<'a> Region<'a> {
    pub fn split(bytes: &'a [u8]) -> Result<Self, DiskError> {
        let len = bytes.len();
        let (header, rest) =
            DiskHeader::ref_from_prefix(bytes).map_err(|_| truncated(HEADER_SIZE, len))?;
        let geometry = header.geometry()?;
        if len < geometry.region_len() {
            return Err(truncated(geometry.region_len(), len));
        }

        let (bitmap, blocks) = rest.split_at(geometry.bitmap_entries());
        Ok(Self {
            header,
            bitmap: Bitmap::new(bitmap, geometry.num_blocks())?,
            geometry,
            blocks: &blocks[..geometry.blocks_len()],
        })
    }

    pub fn block(&self, block: BlockNumber) -> Result<&'a [u8], DiskError> {
        let range = self.geometry.block_range(block)?;
        Ok(&self.blocks[range])
    }
}

/// Mutable view of a mapped disk image split into its three regions.
pub struct RegionMut<'a> {
    pub header: &'a mut DiskHeader,
    pub bitmap: Bitmap<&'a mut [u8]>,
    pub geometry: Geometry,
    blocks: &'a mut [u8],
}

impl<'a> RegionMut<'a> {
    pub fn split(bytes: &'a mut [u8]) -> Result<Self, DiskError> {
        let len = bytes.len();
        let (header, rest) =
            DiskHeader::mut_from_prefix(bytes).map_err(|_| truncated(HEADER_SIZE, len))?;
        let geometry = header.geometry()?;
        if len < geometry.region_len() {
            return Err(truncated(geometry.region_len(), len));
        }

        let (bitmap, blocks) = rest.split_at_mut(geometry.bitmap_entries());
        Ok(Self {
            header,
            bitmap: Bitmap::new(bitmap, geometry.num_blocks())?,
            geometry,
            blocks: &mut blocks[..geometry.blocks_len()],
        })
    }

    pub fn block_mut(&mut self, block: BlockNumber) -> Result<&mut [u8], DiskError> {
        let range = self.geometry.block_range(block)?;
        Ok(&mut self.blocks[range])
    }
}

fn truncated(expected: usize, found: usize) -> DiskError {
    DiskError::Truncated {
        expected: expected as u64,
        found: found as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::State;

    fn formatted(num_blocks: usize) -> Vec<u8> {
        let geometry = Geometry::new(num_blocks).unwrap();
        let mut image = vec![0; geometry.region_len()];
        image[..HEADER_SIZE].copy_from_slice(DiskHeader::new(&geometry).as_bytes());
        image
    }

    #[test]
    fn header_is_five_native_words() {
        assert_eq!(HEADER_SIZE, 20);

        let header = DiskHeader::new(&Geometry::new(10).unwrap());
        let bytes = header.as_bytes();
        assert_eq!(&bytes[0..4], &10_u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &10_u32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &2_u32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &10_u32.to_ne_bytes());
        assert_eq!(&bytes[16..20], &0_u32.to_ne_bytes());
    }

    #[test]
    fn can_encode_and_decode_headers() {
        let mut header = DiskHeader::new(&Geometry::new(56).unwrap());
        header.set_free_blocks(50);
        header.set_first_free_block(3);

        let parsed = DiskHeader::parse(header.as_bytes()).unwrap();

        assert_eq!(parsed, header);
        assert_eq!(parsed.free_blocks(), 50);
        assert_eq!(parsed.first_free_block(), 3);
    }

    #[test]
    fn parsing_short_buffer_fails() {
        let result = DiskHeader::parse(&[0; 12]);
        assert!(matches!(
            result,
            Err(DiskError::Truncated {
                expected: 20,
                found: 12
            })
        ));
    }

    #[test]
    fn geometry_computes_region_offsets() {
        let geometry = Geometry::new(9).unwrap();

        assert_eq!(geometry.bitmap_entries(), 2);
        assert_eq!(geometry.bitmap_range(), 20..22);
        assert_eq!(geometry.block_offset(0), 22);
        assert_eq!(geometry.block_offset(1), 22 + BLOCK_SIZE);
        assert_eq!(geometry.region_len(), 22 + 9 * BLOCK_SIZE);
    }

    #[test]
    fn empty_or_oversized_geometry_is_invalid() {
        assert!(matches!(Geometry::new(0), Err(DiskError::InvalidGeometry(_))));
        assert!(matches!(
            Geometry::new(u32::MAX as usize + 1),
            Err(DiskError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn inconsistent_header_is_corrupt() {
        let mut image = formatted(8);
        // bitmap_entries claims two bytes for eight blocks.
        image[8..12].copy_from_slice(&2_u32.to_ne_bytes());

        let header = DiskHeader::parse(&image).unwrap();
        assert!(matches!(header.geometry(), Err(DiskError::CorruptHeader(_))));
    }

    #[test]
    fn region_views_split_at_header_and_bitmap() {
        let mut image = formatted(8);

        {
            let mut region = RegionMut::split(&mut image).unwrap();
            region.bitmap.set(2, State::Used).unwrap();
            region.block_mut(2).unwrap().fill(0xaa);
            region.header.set_free_blocks(7);
        }

        let geometry = Geometry::new(8).unwrap();
        assert_eq!(image[geometry.bitmap_range()], [0b0000_0100]);
        let offset = geometry.block_offset(2);
        assert!(image[offset..offset + BLOCK_SIZE].iter().all(|&b| b == 0xaa));

        let region = Region::split(&image).unwrap();
        assert_eq!(region.header.free_blocks(), 7);
        assert_eq!(region.bitmap.state(2).unwrap(), State::Used);
        assert_eq!(region.block(2).unwrap(), &[0xaa; BLOCK_SIZE][..]);
        assert_eq!(region.block(1).unwrap(), &[0; BLOCK_SIZE][..]);
    }

    #[test]
    fn block_access_is_range_checked() {
        let image = formatted(4);
        let region = Region::split(&image).unwrap();

        assert!(matches!(
            region.block(4),
            Err(DiskError::OutOfRange {
                block: 4,
                num_blocks: 4
            })
        ));
    }

    #[test]
    fn short_region_is_truncated() {
        let mut image = formatted(4);
        image.truncate(HEADER_SIZE + 1 + 3 * BLOCK_SIZE);

        assert!(matches!(
            Region::split(&image),
            Err(DiskError::Truncated { .. })
        ));
    }
}
