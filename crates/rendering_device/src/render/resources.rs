//! Resource handles with their creation metadata
//!
//! Host access and transfer capabilities are expressed as traits rather than
//! buffer subtypes: [`Mappable`] for CPU access, [`Transferable`] for copy
//! commands. Backends consult them before touching memory.

use super::error::{DriverError, DriverResult};
use super::flags::{BufferUsage, ImageUsage};
use super::handles::{BufferId, ImageId};
use super::types::{BufferDescription, ImageFormat, ImageView, MemoryAccess};

/// A device buffer
///
/// The size is fixed at creation. Destroying a buffer that pending GPU work
/// still references is undefined behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    /// Backend handle
    pub id: BufferId,
    /// Allowed operations
    pub usage: BufferUsage,
    /// Element count
    pub count: u64,
    /// Bytes per element
    pub stride: u64,
    /// Memory placement
    pub memory: MemoryAccess,
}

impl Buffer {
    /// Handle for a buffer created from `desc`
    pub const fn from_description(id: BufferId, desc: &BufferDescription) -> Self {
        Self {
            id,
            usage: desc.usage,
            count: desc.count,
            stride: desc.stride,
            memory: desc.memory,
        }
    }

    /// Size in bytes, `count * stride`
    pub const fn size(&self) -> u64 {
        self.count * self.stride
    }

    /// Check a non-empty device-side range lies inside the buffer
    pub fn check_range(&self, offset: u64, size: u64) -> DriverResult<()> {
        let total = self.size();
        match offset.checked_add(size) {
            Some(end) if size > 0 && end <= total => Ok(()),
            _ => Err(DriverError::OutOfBounds {
                offset,
                length: size,
                size: total,
            }),
        }
    }
}

/// A device image and the view it is accessed through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Image {
    /// Backend handle
    pub id: ImageId,
    /// Storage description
    pub format: ImageFormat,
    /// View description
    pub view: ImageView,
}

impl Image {
    /// Allowed operations
    pub const fn usage(&self) -> ImageUsage {
        self.format.usage
    }

    /// Fail for formats copy commands cannot address as a whole
    pub fn ensure_copyable_format(&self) -> DriverResult<()> {
        if self.format.format.has_stencil() {
            return Err(DriverError::unsupported(
                "copies of combined depth/stencil formats",
            ));
        }
        Ok(())
    }
}

/// CPU access to resource memory
pub trait Mappable {
    /// Whether the memory can be mapped
    fn host_visible(&self) -> bool;

    /// Bytes reachable through a mapping
    fn mapped_size(&self) -> u64;

    /// Check a host access of `length` bytes at `offset`
    fn check_host_range(&self, offset: u64, length: u64) -> DriverResult<()> {
        if !self.host_visible() {
            return Err(DriverError::NotHostVisible);
        }
        let size = self.mapped_size();
        match offset.checked_add(length) {
            Some(end) if end <= size => Ok(()),
            _ => Err(DriverError::OutOfBounds {
                offset,
                length,
                size,
            }),
        }
    }
}

/// Participation in copy commands
pub trait Transferable {
    /// Whether copy commands may read from the resource
    fn can_copy_from(&self) -> bool;

    /// Whether copy, clear and resolve commands may write to the resource
    fn can_copy_to(&self) -> bool;

    /// Fail unless the resource is a valid copy source
    fn ensure_copy_source(&self) -> DriverResult<()> {
        if self.can_copy_from() {
            Ok(())
        } else {
            Err(DriverError::contract("resource was not created as a copy source"))
        }
    }

    /// Fail unless the resource is a valid copy destination
    fn ensure_copy_destination(&self) -> DriverResult<()> {
        if self.can_copy_to() {
            Ok(())
        } else {
            Err(DriverError::contract(
                "resource was not created as a copy destination",
            ))
        }
    }
}

impl Mappable for Buffer {
    fn host_visible(&self) -> bool {
        self.memory == MemoryAccess::HostVisible
    }

    fn mapped_size(&self) -> u64 {
        self.size()
    }
}

impl Transferable for Buffer {
    fn can_copy_from(&self) -> bool {
        self.usage.contains(BufferUsage::COPY_SOURCE)
    }

    fn can_copy_to(&self) -> bool {
        self.usage.contains(BufferUsage::COPY_DESTINATION)
    }
}

impl Mappable for Image {
    fn host_visible(&self) -> bool {
        self.usage().contains(ImageUsage::CPU_READ)
    }

    fn mapped_size(&self) -> u64 {
        self.format.total_size()
    }
}

impl Transferable for Image {
    fn can_copy_from(&self) -> bool {
        self.usage().contains(ImageUsage::COPY_SOURCE)
    }

    fn can_copy_to(&self) -> bool {
        self.usage().contains(ImageUsage::COPY_DESTINATION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::types::DataFormat;
    use slotmap::SlotMap;

    fn buffer(desc: &BufferDescription) -> Buffer {
        let mut ids: SlotMap<BufferId, ()> = SlotMap::with_key();
        Buffer::from_description(ids.insert(()), desc)
    }

    #[test]
    fn test_buffer_bounds() {
        let vb = buffer(&BufferDescription::new(BufferUsage::VERTEX, 4, 12));
        assert_eq!(vb.size(), 48);
        assert!(vb.check_host_range(0, 48).is_ok());
        assert!(matches!(
            vb.check_host_range(48, 4),
            Err(DriverError::OutOfBounds { offset: 48, length: 4, size: 48 })
        ));
        assert!(vb.check_host_range(u64::MAX, 2).is_err());
        assert!(vb.check_range(44, 4).is_ok());
        assert!(vb.check_range(0, 0).is_err());
    }

    #[test]
    fn test_gpu_only_buffer_is_not_mappable() {
        let b = buffer(&BufferDescription::new(BufferUsage::STORAGE, 1, 16).gpu_only());
        assert!(matches!(b.check_host_range(0, 1), Err(DriverError::NotHostVisible)));
    }

    #[test]
    fn test_transfer_capabilities() {
        let staging = buffer(&BufferDescription::new(BufferUsage::COPY_SOURCE, 1, 4));
        assert!(staging.ensure_copy_source().is_ok());
        assert!(staging.ensure_copy_destination().is_err());

        let mut ids: SlotMap<ImageId, ()> = SlotMap::with_key();
        let format = ImageFormat::new_2d(
            DataFormat::R8Unorm,
            2,
            2,
            ImageUsage::COPY_DESTINATION | ImageUsage::CPU_READ,
        );
        let image = Image {
            id: ids.insert(()),
            format,
            view: ImageView::new(DataFormat::R8Unorm),
        };
        assert!(image.ensure_copy_destination().is_ok());
        assert!(image.ensure_copy_source().is_err());
        assert!(image.host_visible());
        assert_eq!(image.mapped_size(), 4);
    }
}
