//! Frame loop demo
//!
//! Drives the headless rendering device through a full frame loop: resource
//! upload, per-frame descriptor allocation, layout transitions, submission,
//! presentation and swapchain recreation after a surface resize.
//!
//! Usage: `frame_demo [config.toml|config.ron] [frame count]`

use rendering_device::config::ConfigError;
use rendering_device::foundation::logging;
use rendering_device::prelude::*;
use rendering_device::render::{
    CommandBufferId, CommandPoolId, CommandQueueId, DescriptorSetLayoutBuilder,
    DescriptorSetLayoutId, FenceId, PresentOutcome, SamplerId, ShaderStages, SurfaceId,
    SwapchainFrame, SwapchainId,
};
use thiserror::Error;

const INITIAL_EXTENT: (u32, u32) = (320, 240);
const RESIZED_EXTENT: (u32, u32) = (640, 360);
const TEXTURE_SIZE: u32 = 8;
const DEFAULT_FRAMES: u64 = 120;

#[derive(Error, Debug)]
enum DemoError {
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid argument: {0}")]
    Argument(String),
}

struct FrameDemo {
    driver: HeadlessDriver,
    queue: CommandQueueId,
    pool: CommandPoolId,
    cb: CommandBufferId,
    fence: FenceId,
    surface: SurfaceId,
    swapchain: SwapchainId,
    desired_images: u32,
    descriptors: DescriptorPoolExpanding,
    layout: DescriptorSetLayoutId,
    uniforms: Buffer,
    texture: Image,
    sampler: SamplerId,
    dropped_frames: u64,
}

impl FrameDemo {
    fn new(config: &DriverConfig) -> Result<Self, DemoError> {
        let mut driver = HeadlessDriver::new(config)?;
        let info = driver.device_info();
        log::info!(
            "Using '{}' ({:?}) with {} queue families",
            info.name,
            info.backend,
            info.queue_families.len()
        );

        let (width, height) = INITIAL_EXTENT;
        let surface = driver.create_surface(&SurfaceTarget::Offscreen { width, height })?;
        let family = driver.get_queue_family(
            QueueFamilyFlags::GRAPHICS | QueueFamilyFlags::TRANSFER,
            Some(surface),
        )?;
        let queue = driver.create_command_queue(family)?;
        let pool = driver.create_command_pool(family, CommandBufferType::Primary)?;
        let cb = driver.create_command_buffer(pool)?;
        let fence = driver.create_fence()?;
        let swapchain = driver.create_swapchain(surface)?;

        let descriptors = DescriptorPoolExpanding::from_config(&mut driver, &config.descriptors)?;
        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, ShaderStages::VERTEX | ShaderStages::FRAGMENT)
            .add_combined_image_sampler(1, ShaderStages::FRAGMENT)
            .build(&mut driver)?;
        let uniforms = driver.create_buffer(&BufferDescription::new(BufferUsage::UNIFORM, 1, 64))?;
        let texture = driver.create_image(
            &ImageFormat::new_2d(
                DataFormat::R8G8B8A8Srgb,
                TEXTURE_SIZE,
                TEXTURE_SIZE,
                ImageUsage::SAMPLING | ImageUsage::COPY_DESTINATION,
            ),
            &ImageView::new(DataFormat::R8G8B8A8Srgb),
        )?;
        let sampler = driver.create_sampler(&SamplerState::linear_repeat())?;

        let mut demo = Self {
            driver,
            queue,
            pool,
            cb,
            fence,
            surface,
            swapchain,
            desired_images: config.swapchain.desired_image_count,
            descriptors,
            layout,
            uniforms,
            texture,
            sampler,
            dropped_frames: 0,
        };
        demo.upload_texture()?;
        Ok(demo)
    }

    /// Fill the texture with a checkerboard through a staging buffer
    fn upload_texture(&mut self) -> Result<(), DemoError> {
        let texels = u64::from(TEXTURE_SIZE * TEXTURE_SIZE);
        let staging = self
            .driver
            .create_buffer(&BufferDescription::new(BufferUsage::COPY_SOURCE, texels, 4))?;
        let pixels: Vec<u8> = (0..TEXTURE_SIZE * TEXTURE_SIZE)
            .flat_map(|i| {
                let (x, y) = (i % TEXTURE_SIZE, i / TEXTURE_SIZE);
                if (x + y) % 2 == 0 {
                    [255, 255, 255, 255]
                } else {
                    [32, 32, 32, 255]
                }
            })
            .collect();
        self.driver.write_buffer(&staging, 0, &pixels)?;

        let cb = self.cb;
        let texture = self.texture;
        self.driver.begin_command_buffer(cb)?;
        self.driver.command_begin_label(cb, "texture upload", [0.8, 0.6, 0.2, 1.0])?;
        self.transition(&texture, ImageLayout::Undefined, ImageLayout::TransferDstOptimal)?;
        self.driver.command_copy_buffer_to_image(
            cb,
            &staging,
            &texture,
            ImageLayout::TransferDstOptimal,
            &[BufferImageCopyRegion {
                buffer_offset: 0,
                subresources: ImageSubresourceLayers::color(0),
                image_offset: [0; 3],
                image_extent: [TEXTURE_SIZE, TEXTURE_SIZE, 1],
            }],
        )?;
        self.transition(
            &texture,
            ImageLayout::TransferDstOptimal,
            ImageLayout::ShaderReadOnlyOptimal,
        )?;
        self.driver.command_end_label(cb)?;
        self.driver.end_command_buffer(cb)?;
        self.driver
            .execute_command_queue_and_present(self.queue, &[], &[cb], &[], Some(self.fence), &[])?;
        self.driver.wait_on_fence(self.fence)?;

        self.driver.destroy_buffer(staging.id);
        log::info!("Uploaded {TEXTURE_SIZE}x{TEXTURE_SIZE} texture");
        Ok(())
    }

    fn transition(
        &mut self,
        image: &Image,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) -> Result<(), DemoError> {
        self.driver.command_pipeline_barrier(
            self.cb,
            PipelineStages::TOP_OF_PIPE | PipelineStages::TRANSFER,
            PipelineStages::TRANSFER | PipelineStages::FRAGMENT_SHADER,
            &[],
            &[],
            &[ImageBarrier::transition(image, old_layout, new_layout)],
        )?;
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> Result<(), DemoError> {
        self.driver
            .resize_swapchain(self.queue, self.swapchain, self.desired_images)?;
        let (width, height) = self.driver.swapchain_extent(self.swapchain)?;
        log::info!("Swapchain recreated at {width}x{height}");
        Ok(())
    }

    fn run(&mut self, frames: u64) -> Result<(), DemoError> {
        let mut frame_number = 0;
        let mut resized = false;
        while frame_number < frames {
            let frame = match self
                .driver
                .acquire_swapchain_framebuffer(self.queue, self.swapchain)?
            {
                AcquireOutcome::Ready(frame) => frame,
                AcquireOutcome::ResizeRequired => {
                    self.recreate_swapchain()?;
                    continue;
                }
            };

            // Simulate the window being resized while a frame is in flight
            if !resized && frame_number == frames / 2 {
                let (width, height) = RESIZED_EXTENT;
                self.driver.surface_set_size(self.surface, width, height)?;
                resized = true;
            }

            let outcome = self.render_frame(&frame, frame_number)?;
            if !outcome.out_of_date.is_empty() {
                self.dropped_frames += 1;
                log::warn!("Frame {frame_number} was not presented");
                self.recreate_swapchain()?;
            }
            frame_number += 1;
        }

        log::info!(
            "Rendered {frames} frames, presented {}, dropped {}",
            self.driver.presented_frames(self.swapchain).unwrap_or(0),
            self.dropped_frames
        );
        Ok(())
    }

    fn render_frame(
        &mut self,
        frame: &SwapchainFrame,
        frame_number: u64,
    ) -> Result<PresentOutcome, DemoError> {
        let time = frame_number as f32 / 60.0;
        let mut uniform_data = [0f32; 16];
        uniform_data[0] = time;
        uniform_data[1] = frame.image.format.width as f32;
        uniform_data[2] = frame.image.format.height as f32;
        let bytes: Vec<u8> = uniform_data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.driver.write_buffer(&self.uniforms, 0, &bytes)?;

        // The previous frame's fence was waited on, so its sets are free
        self.descriptors.reset(&mut self.driver)?;
        let set = self.descriptors.allocate(&mut self.driver, self.layout)?;
        DescriptorSetWriter::new()
            .write_buffer(0, self.uniforms.id, 0, self.uniforms.size())
            .write_image(
                1,
                self.texture.id,
                self.sampler,
                ImageLayout::ShaderReadOnlyOptimal,
            )
            .update(&mut self.driver, &set)?;

        let cb = self.cb;
        let image = frame.image;
        let pulse = 0.5 + 0.5 * time.sin();
        self.driver.begin_command_buffer(cb)?;
        self.driver.command_begin_label(cb, "frame", [pulse, 0.2, 0.4, 1.0])?;
        self.transition(&image, ImageLayout::Undefined, ImageLayout::TransferDstOptimal)?;
        self.driver.command_clear_color_image(
            cb,
            &image,
            ImageLayout::TransferDstOptimal,
            [0.1, pulse, 0.3, 1.0],
            &ImageSubresourceRange::whole(&image.format),
        )?;
        self.transition(&image, ImageLayout::TransferDstOptimal, ImageLayout::PresentSrc)?;
        self.driver.command_end_label(cb)?;
        self.driver.end_command_buffer(cb)?;

        let outcome = self.driver.execute_command_queue_and_present(
            self.queue,
            &[],
            &[cb],
            &[],
            Some(self.fence),
            &[self.swapchain],
        )?;
        self.driver.wait_on_fence(self.fence)?;
        Ok(outcome)
    }

    fn shutdown(mut self) {
        self.descriptors.destroy_pools(&mut self.driver);
        self.driver.destroy_descriptor_set_layout(self.layout);
        self.driver.destroy_sampler(self.sampler);
        self.driver.destroy_image(self.texture.id);
        self.driver.destroy_buffer(self.uniforms.id);
        self.driver.destroy_swapchain(self.swapchain);
        self.driver.destroy_surface(self.surface);
        self.driver.destroy_fence(self.fence);
        self.driver.destroy_command_pool(self.pool);
        self.driver.destroy_command_queue(self.queue);
        log::info!("Device memory in use after shutdown: {} bytes", self.driver.memory_used());
    }
}

fn parse_args() -> Result<(DriverConfig, u64), DemoError> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => DriverConfig::load(&path)?,
        None => DriverConfig::new("Frame Demo"),
    };
    let frames = match args.next() {
        Some(count) => count
            .parse()
            .map_err(|_| DemoError::Argument(format!("frame count '{count}' is not a number")))?,
        None => DEFAULT_FRAMES,
    };
    Ok((config, frames))
}

fn main() -> Result<(), DemoError> {
    let (config, frames) = parse_args()?;
    logging::init_with_level(&config.log_level);
    log::info!("Starting {} for {frames} frames", config.application_name);

    let mut demo = FrameDemo::new(&config)?;
    let result = demo.run(frames);
    demo.shutdown();

    match result {
        Ok(()) => {
            log::info!("Frame demo finished successfully");
            Ok(())
        }
        Err(e) => {
            log::error!("Frame demo failed: {e}");
            Err(e)
        }
    }
}
