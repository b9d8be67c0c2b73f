//! Host memory behind headless buffers and images

use crate::render::error::{DriverError, DriverResult};
use crate::render::resources::{Buffer, Image};
use crate::render::types::{BufferImageCopyRegion, ImageCopyRegion, ImageFormat, ImageSubresourceLayers};

/// Device memory budget shared by buffers and images
#[derive(Debug, Clone, Copy)]
pub struct MemoryBudget {
    limit: u64,
    used: u64,
}

impl MemoryBudget {
    pub fn new(limit: u64) -> Self {
        Self { limit, used: 0 }
    }

    /// Reserve `bytes`, failing when the budget would be exceeded
    pub fn reserve(&mut self, bytes: u64) -> DriverResult<()> {
        match self.used.checked_add(bytes) {
            Some(total) if total <= self.limit => {
                self.used = total;
                Ok(())
            }
            _ => Err(DriverError::OutOfDeviceMemory { requested: bytes }),
        }
    }

    pub fn release(&mut self, bytes: u64) {
        self.used = self.used.saturating_sub(bytes);
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

pub struct BufferStorage {
    pub buffer: Buffer,
    pub data: Vec<u8>,
}

pub struct ImageStorage {
    pub image: Image,
    pub data: Vec<u8>,
    pub mapped: bool,
    /// Owned by a swapchain rather than the client
    pub swapchain_owned: bool,
}

/// Byte span of one row of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSpan {
    pub offset: usize,
    pub len: usize,
}

/// Rows of blocks covered by a region of one subresource layer set
///
/// Rows are yielded layer by layer, slice by slice, top to bottom, matching
/// the tight packing used for buffer-image copies.
pub fn image_rows(
    format: &ImageFormat,
    layers: &ImageSubresourceLayers,
    offset: [u32; 3],
    extent: [u32; 3],
) -> Vec<RowSpan> {
    let (bw, bh) = format.format.block_extent();
    let block_size = u64::from(format.format.block_size());
    let [mip_w, mip_h, _] = format.mip_extent(layers.mip_level);
    let row_pitch = u64::from(mip_w.div_ceil(bw)) * block_size;
    let slice_pitch = row_pitch * u64::from(mip_h.div_ceil(bh));

    let first_block_x = u64::from(offset[0] / bw);
    let first_block_y = offset[1] / bh;
    let row_blocks = u64::from(extent[0].div_ceil(bw));
    let rows = extent[1].div_ceil(bh);
    let len = (row_blocks * block_size) as usize;

    let mut spans = Vec::with_capacity((layers.layer_count * extent[2] * rows) as usize);
    for layer in layers.base_layer..layers.base_layer + layers.layer_count {
        let base = format.subresource_offset(layer, layers.mip_level);
        for z in offset[2]..offset[2] + extent[2] {
            for y in first_block_y..first_block_y + rows {
                let start = base
                    + u64::from(z) * slice_pitch
                    + u64::from(y) * row_pitch
                    + first_block_x * block_size;
                spans.push(RowSpan {
                    offset: start as usize,
                    len,
                });
            }
        }
    }
    spans
}

/// Copy a buffer region into image storage
pub fn copy_buffer_to_image(src: &[u8], dst: &mut ImageStorage, region: &BufferImageCopyRegion) {
    let format = dst.image.format;
    let mut cursor = region.buffer_offset as usize;
    for row in image_rows(&format, &region.subresources, region.image_offset, region.image_extent) {
        dst.data[row.offset..row.offset + row.len].copy_from_slice(&src[cursor..cursor + row.len]);
        cursor += row.len;
    }
}

/// Copy an image region into buffer storage
pub fn copy_image_to_buffer(src: &ImageStorage, dst: &mut [u8], region: &BufferImageCopyRegion) {
    let format = src.image.format;
    let mut cursor = region.buffer_offset as usize;
    for row in image_rows(&format, &region.subresources, region.image_offset, region.image_extent) {
        dst[cursor..cursor + row.len].copy_from_slice(&src.data[row.offset..row.offset + row.len]);
        cursor += row.len;
    }
}

/// Copy a region between the storage of two images
pub fn copy_image_region(
    src_format: &ImageFormat,
    src: &[u8],
    dst_format: &ImageFormat,
    dst: &mut [u8],
    region: &ImageCopyRegion,
) {
    let src_rows = image_rows(src_format, &region.src_subresources, region.src_offset, region.extent);
    let dst_rows = image_rows(dst_format, &region.dst_subresources, region.dst_offset, region.extent);
    for (from, to) in src_rows.iter().zip(&dst_rows) {
        dst[to.offset..to.offset + to.len].copy_from_slice(&src[from.offset..from.offset + from.len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::flags::ImageUsage;
    use crate::render::types::DataFormat;

    #[test]
    fn test_memory_budget() {
        let mut budget = MemoryBudget::new(100);
        budget.reserve(60).unwrap();
        assert!(matches!(
            budget.reserve(41),
            Err(DriverError::OutOfDeviceMemory { requested: 41 })
        ));
        budget.release(60);
        budget.reserve(100).unwrap();
        assert_eq!(budget.used(), 100);
    }

    #[test]
    fn test_rows_of_a_sub_rectangle() {
        let format = ImageFormat::new_2d(DataFormat::R8G8B8A8Unorm, 4, 4, ImageUsage::SAMPLING);
        let rows = image_rows(&format, &ImageSubresourceLayers::color(0), [1, 2, 0], [2, 2, 1]);
        assert_eq!(
            rows,
            vec![
                RowSpan { offset: 2 * 16 + 4, len: 8 },
                RowSpan { offset: 3 * 16 + 4, len: 8 },
            ]
        );
    }

    #[test]
    fn test_rows_of_compressed_blocks() {
        let format = ImageFormat::new_2d(DataFormat::Bc1RgbaUnormBlock, 8, 8, ImageUsage::SAMPLING);
        let rows = image_rows(&format, &ImageSubresourceLayers::color(0), [4, 0, 0], [4, 8, 1]);
        // Two block rows of one 8-byte block each, starting at block column 1
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], RowSpan { offset: 8, len: 8 });
        assert_eq!(rows[1], RowSpan { offset: 16 + 8, len: 8 });
    }

    #[test]
    fn test_rows_of_second_layer_and_mip() {
        let format = ImageFormat::new_2d(DataFormat::R8Unorm, 4, 4, ImageUsage::SAMPLING)
            .with_mipmaps(2)
            .with_layers(2);
        let layers = ImageSubresourceLayers {
            mip_level: 1,
            base_layer: 1,
            ..ImageSubresourceLayers::color(0)
        };
        let rows = image_rows(&format, &layers, [0, 0, 0], [2, 2, 1]);
        // layer size 16 + 4, mip 1 starts after the 16-byte mip 0
        assert_eq!(rows[0], RowSpan { offset: 20 + 16, len: 2 });
        assert_eq!(rows[1], RowSpan { offset: 20 + 16 + 2, len: 2 });
    }
}
