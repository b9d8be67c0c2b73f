//! Pipeline barriers and image layout tracking
//!
//! Barriers are declarative and live only as arguments to
//! `command_pipeline_barrier`. [`LayoutTracker`] holds the layout every image
//! subresource is in once all submitted work has run. Each command buffer
//! records its own transitions into a [`LayoutOverlay`], checked against the
//! committed layouts with the overlay on top: a barrier's old layout must
//! match (or be `Undefined`, which discards contents), and copies must declare
//! the layout the image is actually in. Overlays are committed at submission
//! and dropped when their command buffer is reset, so a buffer that is never
//! submitted leaves no trace. Nothing is auto-corrected.

use std::collections::HashMap;

use super::error::{DriverError, DriverResult};
use super::flags::BarrierAccess;
use super::handles::{BufferId, ImageId};
use super::resources::{Buffer, Image};
use super::types::{ImageFormat, ImageSubresourceRange};

/// Memory arrangement of an image subresource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    /// Contents undefined, valid only as a barrier's old layout
    #[default]
    Undefined,
    /// Any access, lowest performance
    General,
    /// Color render target
    ColorAttachmentOptimal,
    /// Depth/stencil render target
    DepthStencilAttachmentOptimal,
    /// Read-only depth/stencil
    DepthStencilReadOnlyOptimal,
    /// Sampled or input attachment reads
    ShaderReadOnlyOptimal,
    /// Source of copies and resolves
    TransferSrcOptimal,
    /// Destination of copies, clears and resolves
    TransferDstOptimal,
    /// Host-written linear data, valid only as a barrier's old layout
    Preinitialized,
    /// Ready for presentation
    PresentSrc,
}

impl ImageLayout {
    /// Accesses usually performed on an image in this layout
    pub fn typical_access(self) -> BarrierAccess {
        match self {
            Self::Undefined | Self::PresentSrc => BarrierAccess::empty(),
            Self::General => BarrierAccess::MEMORY_READ | BarrierAccess::MEMORY_WRITE,
            Self::ColorAttachmentOptimal => {
                BarrierAccess::COLOR_ATTACHMENT_READ | BarrierAccess::COLOR_ATTACHMENT_WRITE
            }
            Self::DepthStencilAttachmentOptimal => {
                BarrierAccess::DEPTH_STENCIL_ATTACHMENT_READ
                    | BarrierAccess::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            Self::DepthStencilReadOnlyOptimal => BarrierAccess::DEPTH_STENCIL_ATTACHMENT_READ,
            Self::ShaderReadOnlyOptimal => BarrierAccess::SHADER_READ,
            Self::TransferSrcOptimal => BarrierAccess::TRANSFER_READ,
            Self::TransferDstOptimal => BarrierAccess::TRANSFER_WRITE,
            Self::Preinitialized => BarrierAccess::HOST_WRITE,
        }
    }

    /// Whether copies and resolves may read from this layout
    pub const fn allows_transfer_source(self) -> bool {
        matches!(self, Self::TransferSrcOptimal | Self::General)
    }

    /// Whether copies, clears and resolves may write to this layout
    pub const fn allows_transfer_destination(self) -> bool {
        matches!(self, Self::TransferDstOptimal | Self::General)
    }
}

/// Global memory dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier {
    /// Accesses made available
    pub src_access: BarrierAccess,
    /// Accesses made visible
    pub dst_access: BarrierAccess,
}

/// Dependency on a byte range of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    /// Buffer guarded
    pub buffer: BufferId,
    /// Accesses made available
    pub src_access: BarrierAccess,
    /// Accesses made visible
    pub dst_access: BarrierAccess,
    /// Start of the range
    pub offset: u64,
    /// Length of the range
    pub size: u64,
}

impl BufferBarrier {
    /// Barrier covering all of `buffer`
    pub fn whole(buffer: &Buffer, src_access: BarrierAccess, dst_access: BarrierAccess) -> Self {
        Self {
            buffer: buffer.id,
            src_access,
            dst_access,
            offset: 0,
            size: buffer.size(),
        }
    }
}

/// Dependency on image subresources, with a layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    /// Image guarded
    pub image: ImageId,
    /// Accesses made available
    pub src_access: BarrierAccess,
    /// Accesses made visible
    pub dst_access: BarrierAccess,
    /// Layout the subresources are in
    pub old_layout: ImageLayout,
    /// Layout they move to
    pub new_layout: ImageLayout,
    /// Subresources affected
    pub subresources: ImageSubresourceRange,
}

impl ImageBarrier {
    /// Whole-image transition with access masks derived from the layouts
    pub fn transition(image: &Image, old_layout: ImageLayout, new_layout: ImageLayout) -> Self {
        Self {
            image: image.id,
            src_access: old_layout.typical_access(),
            dst_access: new_layout.typical_access(),
            old_layout,
            new_layout,
            subresources: ImageSubresourceRange::whole(&image.format),
        }
    }

    /// Restrict the transition to `range`
    pub const fn with_range(mut self, range: ImageSubresourceRange) -> Self {
        self.subresources = range;
        self
    }
}

#[derive(Debug, Clone)]
struct TrackedImage {
    mipmaps: u32,
    layers: u32,
    layouts: Vec<ImageLayout>,
}

impl TrackedImage {
    fn index(&self, layer: u32, mip: u32) -> DriverResult<usize> {
        if layer < self.layers && mip < self.mipmaps {
            Ok((layer * self.mipmaps + mip) as usize)
        } else {
            Err(DriverError::contract(format!(
                "subresource layer {layer} mip {mip} outside image with {} layers and {} mips",
                self.layers, self.mipmaps
            )))
        }
    }
}

/// One image subresource: image, array layer, mip level
type Subresource = (ImageId, u32, u32);

/// Layout changes recorded into one command buffer and not yet submitted
#[derive(Debug, Clone, Default)]
pub struct LayoutOverlay {
    /// Layout a subresource must be in when the buffer starts executing
    entry: HashMap<Subresource, ImageLayout>,
    /// Layout a subresource is left in when the buffer finishes
    exit: HashMap<Subresource, ImageLayout>,
}

impl LayoutOverlay {
    /// Create an empty overlay
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every recorded change
    pub fn clear(&mut self) {
        self.entry.clear();
        self.exit.clear();
    }

    /// Whether the buffer touched no image layout
    pub fn is_empty(&self) -> bool {
        self.entry.is_empty() && self.exit.is_empty()
    }

    /// Remember what a recorded command expects to find at submission
    pub fn record(&mut self, used: LayoutUse) {
        for key in used.assumed {
            self.entry.entry(key).or_insert(used.layout);
        }
    }
}

/// Subresources a recorded command expects in a layout the overlay has not set
#[must_use]
#[derive(Debug)]
pub struct LayoutUse {
    assumed: Vec<Subresource>,
    layout: ImageLayout,
}

/// Layouts a submission leaves behind, checked but not yet committed
#[derive(Debug, Default)]
pub struct StagedLayouts {
    layouts: HashMap<Subresource, ImageLayout>,
}

/// Committed layout of every image subresource
#[derive(Debug, Clone, Default)]
pub struct LayoutTracker {
    images: HashMap<ImageId, TrackedImage>,
}

impl LayoutTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an image with every subresource in `initial`
    pub fn register(&mut self, image: ImageId, format: &ImageFormat, initial: ImageLayout) {
        let count = (format.array_layers * format.mipmaps) as usize;
        self.images.insert(
            image,
            TrackedImage {
                mipmaps: format.mipmaps,
                layers: format.array_layers,
                layouts: vec![initial; count],
            },
        );
    }

    /// Stop tracking an image
    pub fn forget(&mut self, image: ImageId) {
        self.images.remove(&image);
    }

    /// Committed layout of one subresource
    pub fn layout(&self, image: ImageId, layer: u32, mip: u32) -> Option<ImageLayout> {
        self.committed((image, layer, mip)).ok()
    }

    /// Layout of one subresource as seen from inside a command buffer
    pub fn recorded_layout(
        &self,
        overlay: &LayoutOverlay,
        image: ImageId,
        layer: u32,
        mip: u32,
    ) -> Option<ImageLayout> {
        let committed = self.layout(image, layer, mip)?;
        Some(overlay.exit.get(&(image, layer, mip)).copied().unwrap_or(committed))
    }

    fn tracked(&self, image: ImageId) -> DriverResult<&TrackedImage> {
        self.images
            .get(&image)
            .ok_or(DriverError::InvalidHandle { kind: "image" })
    }

    fn committed(&self, (image, layer, mip): Subresource) -> DriverResult<ImageLayout> {
        let tracked = self.tracked(image)?;
        Ok(tracked.layouts[tracked.index(layer, mip)?])
    }

    /// Record the transitions of one barrier command into `overlay`
    ///
    /// Every subresource in a barrier's range must currently be in its
    /// `old_layout`, unless that is `Undefined`. Later barriers in the slice
    /// see the transitions of earlier ones. On error `overlay` is unchanged.
    pub fn transition(
        &self,
        overlay: &mut LayoutOverlay,
        barriers: &[ImageBarrier],
    ) -> DriverResult<()> {
        let mut staged: HashMap<Subresource, ImageLayout> = HashMap::new();
        let mut assumed = Vec::new();

        for barrier in barriers {
            if matches!(
                barrier.new_layout,
                ImageLayout::Undefined | ImageLayout::Preinitialized
            ) {
                return Err(DriverError::contract(format!(
                    "cannot transition an image to {:?}",
                    barrier.new_layout
                )));
            }
            let tracked = self.tracked(barrier.image)?;

            for (layer, mip) in barrier.subresources.subresources() {
                let index = tracked.index(layer, mip)?;
                let key = (barrier.image, layer, mip);
                if barrier.old_layout != ImageLayout::Undefined {
                    let current = match staged.get(&key).or_else(|| overlay.exit.get(&key)) {
                        Some(layout) => *layout,
                        None => {
                            assumed.push((key, barrier.old_layout));
                            tracked.layouts[index]
                        }
                    };
                    if current != barrier.old_layout {
                        return Err(DriverError::contract(format!(
                            "barrier declares layer {layer} mip {mip} in {:?} but it is in {current:?}",
                            barrier.old_layout
                        )));
                    }
                }
                staged.insert(key, barrier.new_layout);
            }
        }

        for (key, layout) in assumed {
            overlay.entry.entry(key).or_insert(layout);
        }
        overlay.exit.extend(staged);
        Ok(())
    }

    /// Check a command's declared layout against the one it will find
    ///
    /// Nothing is recorded until the returned [`LayoutUse`] is handed to
    /// [`LayoutOverlay::record`], so a command failing a later check leaves
    /// the overlay untouched.
    pub fn expect(
        &self,
        overlay: &LayoutOverlay,
        image: ImageId,
        range: &ImageSubresourceRange,
        declared: ImageLayout,
        operation: &str,
    ) -> DriverResult<LayoutUse> {
        let tracked = self.tracked(image)?;
        let mut assumed = Vec::new();

        for (layer, mip) in range.subresources() {
            let index = tracked.index(layer, mip)?;
            let key = (image, layer, mip);
            let current = match overlay.exit.get(&key) {
                Some(layout) => *layout,
                None => {
                    assumed.push(key);
                    tracked.layouts[index]
                }
            };
            if current != declared {
                return Err(DriverError::contract(format!(
                    "{operation} declares layer {layer} mip {mip} in {declared:?} but it is in {current:?}"
                )));
            }
        }

        Ok(LayoutUse {
            assumed,
            layout: declared,
        })
    }

    /// Check overlays, in submission order, against the committed layouts
    ///
    /// Each buffer must find its images in the layouts it was recorded
    /// against, after the buffers before it in the batch have run.
    pub fn stage<'a>(
        &self,
        overlays: impl IntoIterator<Item = &'a LayoutOverlay>,
    ) -> DriverResult<StagedLayouts> {
        let mut staged = StagedLayouts::default();
        for overlay in overlays {
            for (&key, &expected) in &overlay.entry {
                let current = staged.current(self, key)?;
                if current != expected {
                    let (_, layer, mip) = key;
                    return Err(DriverError::contract(format!(
                        "submitted work expects layer {layer} mip {mip} in {expected:?} but it is in {current:?}"
                    )));
                }
            }
            for (&key, &layout) in &overlay.exit {
                self.committed(key)?;
                staged.layouts.insert(key, layout);
            }
        }
        Ok(staged)
    }

    /// Check a layout as it will be once `staged` is committed
    pub fn expect_staged(
        &self,
        staged: &StagedLayouts,
        image: ImageId,
        range: &ImageSubresourceRange,
        declared: ImageLayout,
        operation: &str,
    ) -> DriverResult<()> {
        for (layer, mip) in range.subresources() {
            let current = staged.current(self, (image, layer, mip))?;
            if current != declared {
                return Err(DriverError::contract(format!(
                    "{operation} declares layer {layer} mip {mip} in {declared:?} but it is in {current:?}"
                )));
            }
        }
        Ok(())
    }

    /// Apply the layouts of a checked submission
    pub fn commit(&mut self, staged: StagedLayouts) {
        for ((image, layer, mip), layout) in staged.layouts {
            if let Some(tracked) = self.images.get_mut(&image) {
                if let Ok(index) = tracked.index(layer, mip) {
                    tracked.layouts[index] = layout;
                }
            }
        }
    }
}

impl StagedLayouts {
    fn current(&self, tracker: &LayoutTracker, key: Subresource) -> DriverResult<ImageLayout> {
        match self.layouts.get(&key) {
            Some(layout) => Ok(*layout),
            None => tracker.committed(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::flags::{ImageAspect, ImageUsage};
    use crate::render::types::{DataFormat, ImageView};
    use slotmap::SlotMap;

    fn image(mipmaps: u32, layers: u32) -> Image {
        let mut ids: SlotMap<ImageId, ()> = SlotMap::with_key();
        let format = ImageFormat::new_2d(DataFormat::R8G8B8A8Unorm, 8, 8, ImageUsage::SAMPLING)
            .with_mipmaps(mipmaps)
            .with_layers(layers);
        Image {
            id: ids.insert(()),
            format,
            view: ImageView::new(format.format),
        }
    }

    fn submit(tracker: &mut LayoutTracker, overlay: &LayoutOverlay) {
        let staged = tracker.stage([overlay]).unwrap();
        tracker.commit(staged);
    }

    #[test]
    fn test_transition_updates_recorded_layout() {
        let img = image(1, 1);
        let mut tracker = LayoutTracker::new();
        tracker.register(img.id, &img.format, ImageLayout::Undefined);
        let mut overlay = LayoutOverlay::new();

        tracker
            .transition(
                &mut overlay,
                &[ImageBarrier::transition(&img, ImageLayout::Undefined, ImageLayout::TransferDstOptimal)],
            )
            .unwrap();
        tracker
            .transition(
                &mut overlay,
                &[ImageBarrier::transition(
                    &img,
                    ImageLayout::TransferDstOptimal,
                    ImageLayout::ShaderReadOnlyOptimal,
                )],
            )
            .unwrap();
        assert_eq!(
            tracker.recorded_layout(&overlay, img.id, 0, 0),
            Some(ImageLayout::ShaderReadOnlyOptimal)
        );
        assert_eq!(tracker.layout(img.id, 0, 0), Some(ImageLayout::Undefined));

        submit(&mut tracker, &overlay);
        assert_eq!(tracker.layout(img.id, 0, 0), Some(ImageLayout::ShaderReadOnlyOptimal));
    }

    #[test]
    fn test_mismatched_old_layout_is_rejected() {
        let img = image(1, 1);
        let mut tracker = LayoutTracker::new();
        tracker.register(img.id, &img.format, ImageLayout::General);
        let mut overlay = LayoutOverlay::new();

        let wrong = ImageBarrier::transition(
            &img,
            ImageLayout::TransferSrcOptimal,
            ImageLayout::ShaderReadOnlyOptimal,
        );
        assert!(matches!(
            tracker.transition(&mut overlay, &[wrong]),
            Err(DriverError::ContractViolation(_))
        ));
        assert!(overlay.is_empty());
    }

    #[test]
    fn test_barrier_batch_is_atomic() {
        let img = image(1, 1);
        let mut tracker = LayoutTracker::new();
        tracker.register(img.id, &img.format, ImageLayout::Undefined);
        let mut overlay = LayoutOverlay::new();

        // Second barrier sees the first; the third one is wrong
        let result = tracker.transition(
            &mut overlay,
            &[
                ImageBarrier::transition(&img, ImageLayout::Undefined, ImageLayout::TransferDstOptimal),
                ImageBarrier::transition(
                    &img,
                    ImageLayout::TransferDstOptimal,
                    ImageLayout::TransferSrcOptimal,
                ),
                ImageBarrier::transition(&img, ImageLayout::TransferSrcOptimal, ImageLayout::Undefined),
            ],
        );
        assert!(matches!(result, Err(DriverError::ContractViolation(_))));
        assert!(overlay.is_empty());
        assert_eq!(
            tracker.recorded_layout(&overlay, img.id, 0, 0),
            Some(ImageLayout::Undefined)
        );
    }

    #[test]
    fn test_partial_range_transition() {
        let img = image(2, 2);
        let mut tracker = LayoutTracker::new();
        tracker.register(img.id, &img.format, ImageLayout::Undefined);
        let mut overlay = LayoutOverlay::new();

        let range = ImageSubresourceRange {
            aspect: ImageAspect::COLOR,
            base_mip: 1,
            mip_count: 1,
            base_layer: 1,
            layer_count: 1,
        };
        tracker
            .transition(
                &mut overlay,
                &[ImageBarrier::transition(&img, ImageLayout::Undefined, ImageLayout::TransferSrcOptimal)
                    .with_range(range)],
            )
            .unwrap();

        assert_eq!(
            tracker.recorded_layout(&overlay, img.id, 1, 1),
            Some(ImageLayout::TransferSrcOptimal)
        );
        assert_eq!(
            tracker.recorded_layout(&overlay, img.id, 0, 1),
            Some(ImageLayout::Undefined)
        );
        assert!(tracker
            .expect(&overlay, img.id, &range, ImageLayout::TransferSrcOptimal, "copy")
            .is_ok());
        assert!(tracker
            .expect(
                &overlay,
                img.id,
                &ImageSubresourceRange::whole(&img.format),
                ImageLayout::TransferSrcOptimal,
                "copy"
            )
            .is_err());
    }

    #[test]
    fn test_discarded_overlay_leaves_committed_layout() {
        let img = image(1, 1);
        let mut tracker = LayoutTracker::new();
        tracker.register(img.id, &img.format, ImageLayout::TransferDstOptimal);
        let mut overlay = LayoutOverlay::new();

        tracker
            .transition(
                &mut overlay,
                &[ImageBarrier::transition(
                    &img,
                    ImageLayout::TransferDstOptimal,
                    ImageLayout::TransferSrcOptimal,
                )],
            )
            .unwrap();
        overlay.clear();

        assert_eq!(tracker.layout(img.id, 0, 0), Some(ImageLayout::TransferDstOptimal));
        tracker
            .transition(
                &mut overlay,
                &[ImageBarrier::transition(
                    &img,
                    ImageLayout::TransferDstOptimal,
                    ImageLayout::ShaderReadOnlyOptimal,
                )],
            )
            .unwrap();
    }

    #[test]
    fn test_stage_checks_entry_layouts_in_submission_order() {
        let img = image(1, 1);
        let mut tracker = LayoutTracker::new();
        tracker.register(img.id, &img.format, ImageLayout::TransferDstOptimal);

        // Both recorded against the committed TransferDst layout
        let mut first = LayoutOverlay::new();
        tracker
            .transition(
                &mut first,
                &[ImageBarrier::transition(
                    &img,
                    ImageLayout::TransferDstOptimal,
                    ImageLayout::TransferSrcOptimal,
                )],
            )
            .unwrap();
        let mut second = LayoutOverlay::new();
        let clear = tracker
            .expect(
                &second,
                img.id,
                &ImageSubresourceRange::whole(&img.format),
                ImageLayout::TransferDstOptimal,
                "clear",
            )
            .unwrap();
        second.record(clear);

        // Running the second after the first finds the image moved away
        assert!(matches!(
            tracker.stage([&first, &second]),
            Err(DriverError::ContractViolation(_))
        ));
        let staged = tracker.stage([&second, &first]).unwrap();
        assert!(tracker
            .expect_staged(
                &staged,
                img.id,
                &ImageSubresourceRange::whole(&img.format),
                ImageLayout::TransferSrcOptimal,
                "present"
            )
            .is_ok());
        assert_eq!(tracker.layout(img.id, 0, 0), Some(ImageLayout::TransferDstOptimal));
        tracker.commit(staged);
        assert_eq!(tracker.layout(img.id, 0, 0), Some(ImageLayout::TransferSrcOptimal));
    }

    #[test]
    fn test_transition_to_undefined_is_rejected() {
        let img = image(1, 1);
        let mut tracker = LayoutTracker::new();
        tracker.register(img.id, &img.format, ImageLayout::General);
        assert!(tracker
            .transition(
                &mut LayoutOverlay::new(),
                &[ImageBarrier::transition(&img, ImageLayout::General, ImageLayout::Undefined)]
            )
            .is_err());
    }

    #[test]
    fn test_forgotten_image_is_unknown() {
        let img = image(1, 1);
        let mut tracker = LayoutTracker::new();
        tracker.register(img.id, &img.format, ImageLayout::Undefined);
        let mut overlay = LayoutOverlay::new();
        tracker
            .transition(
                &mut overlay,
                &[ImageBarrier::transition(&img, ImageLayout::Undefined, ImageLayout::General)],
            )
            .unwrap();
        tracker.forget(img.id);

        assert!(tracker.layout(img.id, 0, 0).is_none());
        assert!(matches!(
            tracker.stage([&overlay]),
            Err(DriverError::InvalidHandle { .. })
        ));
    }
}
