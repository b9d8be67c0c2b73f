//! Recorded command lists and their execution
//!
//! Commands are validated when recorded and replayed against host memory when
//! their command buffer is submitted.

use log::debug;
use slotmap::SlotMap;

use super::storage::{self, BufferStorage, ImageStorage};
use crate::render::error::{DriverError, DriverResult};
use crate::render::handles::{BufferId, ImageId};
use crate::render::types::{
    BufferCopyRegion, BufferImageCopyRegion, ImageCopyRegion, ImageSubresourceRange,
};

#[derive(Debug, Clone)]
pub enum RecordedCommand {
    Barrier,
    ClearBuffer {
        buffer: BufferId,
        offset: u64,
        size: u64,
    },
    CopyBuffer {
        src: BufferId,
        dst: BufferId,
        regions: Vec<BufferCopyRegion>,
    },
    CopyImage {
        src: ImageId,
        dst: ImageId,
        regions: Vec<ImageCopyRegion>,
    },
    ClearColor {
        image: ImageId,
        texel: Vec<u8>,
        range: ImageSubresourceRange,
    },
    CopyBufferToImage {
        src: BufferId,
        dst: ImageId,
        regions: Vec<BufferImageCopyRegion>,
    },
    CopyImageToBuffer {
        src: ImageId,
        dst: BufferId,
        regions: Vec<BufferImageCopyRegion>,
    },
    BeginLabel(String),
    EndLabel,
}

impl RecordedCommand {
    /// Fail if a resource the command uses was destroyed after recording
    pub fn check_handles(
        &self,
        buffers: &SlotMap<BufferId, BufferStorage>,
        images: &SlotMap<ImageId, ImageStorage>,
    ) -> DriverResult<()> {
        let (used_buffers, used_images) = match self {
            Self::Barrier | Self::BeginLabel(_) | Self::EndLabel => (vec![], vec![]),
            Self::ClearBuffer { buffer, .. } => (vec![*buffer], vec![]),
            Self::CopyBuffer { src, dst, .. } => (vec![*src, *dst], vec![]),
            Self::CopyImage { src, dst, .. } => (vec![], vec![*src, *dst]),
            Self::ClearColor { image, .. } => (vec![], vec![*image]),
            Self::CopyBufferToImage { src, dst, .. } => (vec![*src], vec![*dst]),
            Self::CopyImageToBuffer { src, dst, .. } => (vec![*dst], vec![*src]),
        };
        if used_buffers.iter().any(|id| !buffers.contains_key(*id)) {
            return Err(DriverError::InvalidHandle { kind: "buffer" });
        }
        if used_images.iter().any(|id| !images.contains_key(*id)) {
            return Err(DriverError::InvalidHandle { kind: "image" });
        }
        Ok(())
    }
}

/// Resources a command list executes against
pub struct ExecutionContext<'a> {
    pub buffers: &'a mut SlotMap<BufferId, BufferStorage>,
    pub images: &'a mut SlotMap<ImageId, ImageStorage>,
}

impl ExecutionContext<'_> {
    fn buffer(&mut self, id: BufferId) -> DriverResult<&mut BufferStorage> {
        self.buffers
            .get_mut(id)
            .ok_or(DriverError::InvalidHandle { kind: "buffer" })
    }

    fn image(&mut self, id: ImageId) -> DriverResult<&mut ImageStorage> {
        self.images
            .get_mut(id)
            .ok_or(DriverError::InvalidHandle { kind: "image" })
    }

    /// Replay one command
    ///
    /// Callers run [`RecordedCommand::check_handles`] over a whole batch
    /// first; a missing resource here still surfaces as an invalid handle.
    pub fn execute(&mut self, command: &RecordedCommand) -> DriverResult<()> {
        match command {
            RecordedCommand::Barrier | RecordedCommand::EndLabel => {}
            RecordedCommand::BeginLabel(name) => debug!("label: {name}"),
            RecordedCommand::ClearBuffer {
                buffer,
                offset,
                size,
            } => {
                let storage = self.buffer(*buffer)?;
                let start = *offset as usize;
                storage.data[start..start + *size as usize].fill(0);
            }
            RecordedCommand::CopyBuffer { src, dst, regions } => {
                let source = self.buffer(*src)?.data.clone();
                let target = self.buffer(*dst)?;
                for region in regions {
                    let from = region.src_offset as usize;
                    let to = region.dst_offset as usize;
                    let len = region.size as usize;
                    target.data[to..to + len].copy_from_slice(&source[from..from + len]);
                }
            }
            RecordedCommand::CopyImage { src, dst, regions } => {
                let (src_format, source) = {
                    let storage = self.image(*src)?;
                    (storage.image.format, storage.data.clone())
                };
                let target = self.image(*dst)?;
                let dst_format = target.image.format;
                for region in regions {
                    storage::copy_image_region(
                        &src_format,
                        &source,
                        &dst_format,
                        &mut target.data,
                        region,
                    );
                }
            }
            RecordedCommand::ClearColor {
                image,
                texel,
                range,
            } => {
                let target = self.image(*image)?;
                let format = target.image.format;
                for (layer, mip) in range.subresources() {
                    let start = format.subresource_offset(layer, mip) as usize;
                    let len = format.subresource_size(mip) as usize;
                    for chunk in target.data[start..start + len].chunks_exact_mut(texel.len()) {
                        chunk.copy_from_slice(texel);
                    }
                }
            }
            RecordedCommand::CopyBufferToImage { src, dst, regions } => {
                let source = self.buffer(*src)?.data.clone();
                let target = self.image(*dst)?;
                for region in regions {
                    storage::copy_buffer_to_image(&source, target, region);
                }
            }
            RecordedCommand::CopyImageToBuffer { src, dst, regions } => {
                let images = &*self.images;
                let source = images
                    .get(*src)
                    .ok_or(DriverError::InvalidHandle { kind: "image" })?;
                let target = self
                    .buffers
                    .get_mut(*dst)
                    .ok_or(DriverError::InvalidHandle { kind: "buffer" })?;
                for region in regions {
                    storage::copy_image_to_buffer(source, &mut target.data, region);
                }
            }
        }
        Ok(())
    }
}
