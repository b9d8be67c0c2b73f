//! Capability bit sets
//!
//! Stage, access, queue family, aspect and shader-stage bits use the same
//! numeric values as their Vulkan counterparts. Buffer and image usage are
//! driver-level sets and are translated explicitly by each backend.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Pipeline stages a barrier waits on or blocks
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipelineStages: u32 {
        /// Start of the pipeline
        const TOP_OF_PIPE = 0x0000_0001;
        /// Indirect argument reads
        const DRAW_INDIRECT = 0x0000_0002;
        /// Vertex and index fetch
        const VERTEX_INPUT = 0x0000_0004;
        /// Vertex shading
        const VERTEX_SHADER = 0x0000_0008;
        /// Tessellation control shading
        const TESSELLATION_CONTROL_SHADER = 0x0000_0010;
        /// Tessellation evaluation shading
        const TESSELLATION_EVALUATION_SHADER = 0x0000_0020;
        /// Fragment shading
        const FRAGMENT_SHADER = 0x0000_0080;
        /// Depth/stencil tests before fragment shading
        const EARLY_FRAGMENT_TESTS = 0x0000_0100;
        /// Depth/stencil tests after fragment shading
        const LATE_FRAGMENT_TESTS = 0x0000_0200;
        /// Color attachment writes and resolves
        const COLOR_ATTACHMENT_OUTPUT = 0x0000_0400;
        /// Compute shading
        const COMPUTE_SHADER = 0x0000_0800;
        /// Copy, clear and resolve commands
        const TRANSFER = 0x0000_1000;
        /// End of the pipeline
        const BOTTOM_OF_PIPE = 0x0000_2000;
        /// Host reads and writes of device memory
        const HOST = 0x0000_4000;
        /// Every graphics stage
        const ALL_GRAPHICS = 0x0000_8000;
        /// Every command
        const ALL_COMMANDS = 0x0001_0000;
    }
}

bitflags! {
    /// Memory access kinds made available or visible by a barrier
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BarrierAccess: u32 {
        /// Indirect command reads
        const INDIRECT_COMMAND_READ = 0x0000_0001;
        /// Index buffer reads
        const INDEX_READ = 0x0000_0002;
        /// Vertex buffer reads
        const VERTEX_ATTRIBUTE_READ = 0x0000_0004;
        /// Uniform buffer reads
        const UNIFORM_READ = 0x0000_0008;
        /// Input attachment reads
        const INPUT_ATTACHMENT_READ = 0x0000_0010;
        /// Shader storage/sampled reads
        const SHADER_READ = 0x0000_0020;
        /// Shader storage writes
        const SHADER_WRITE = 0x0000_0040;
        /// Color attachment reads
        const COLOR_ATTACHMENT_READ = 0x0000_0080;
        /// Color attachment writes
        const COLOR_ATTACHMENT_WRITE = 0x0000_0100;
        /// Depth/stencil attachment reads
        const DEPTH_STENCIL_ATTACHMENT_READ = 0x0000_0200;
        /// Depth/stencil attachment writes
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 0x0000_0400;
        /// Copy/resolve source reads
        const TRANSFER_READ = 0x0000_0800;
        /// Copy/clear/resolve destination writes
        const TRANSFER_WRITE = 0x0000_1000;
        /// Host reads
        const HOST_READ = 0x0000_2000;
        /// Host writes
        const HOST_WRITE = 0x0000_4000;
        /// Any read
        const MEMORY_READ = 0x0000_8000;
        /// Any write
        const MEMORY_WRITE = 0x0001_0000;
    }
}

bitflags! {
    /// Capabilities of a queue family
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct QueueFamilyFlags: u32 {
        /// Graphics commands
        const GRAPHICS = 0x1;
        /// Compute dispatches
        const COMPUTE = 0x2;
        /// Copy commands
        const TRANSFER = 0x4;
    }
}

bitflags! {
    /// Aspects of an image addressed by a subresource range
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImageAspect: u32 {
        /// Color data
        const COLOR = 0x1;
        /// Depth data
        const DEPTH = 0x2;
        /// Stencil data
        const STENCIL = 0x4;
    }
}

bitflags! {
    /// Operations a buffer may take part in
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        /// Source of copy commands
        const COPY_SOURCE = 0x01;
        /// Destination of copy and clear commands
        const COPY_DESTINATION = 0x02;
        /// Uniform buffer binding
        const UNIFORM = 0x04;
        /// Storage buffer binding
        const STORAGE = 0x08;
        /// Index buffer binding
        const INDEX = 0x10;
        /// Vertex buffer binding
        const VERTEX = 0x20;
        /// Indirect argument buffer
        const INDIRECT = 0x40;
    }
}

bitflags! {
    /// Operations an image may take part in
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImageUsage: u32 {
        /// Sampled from shaders
        const SAMPLING = 0x01;
        /// Color render target
        const COLOR_ATTACHMENT = 0x02;
        /// Depth/stencil render target
        const DEPTH_STENCIL_ATTACHMENT = 0x04;
        /// Storage image binding
        const STORAGE = 0x08;
        /// Input attachment binding
        const INPUT_ATTACHMENT = 0x10;
        /// Source of copy and resolve commands
        const COPY_SOURCE = 0x20;
        /// Destination of copy, clear and resolve commands
        const COPY_DESTINATION = 0x40;
        /// Host visible, linear storage that can be mapped
        const CPU_READ = 0x80;
    }
}

bitflags! {
    /// Shader stages consuming a binding or push constant range
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderStages: u32 {
        /// Vertex stage
        const VERTEX = 0x01;
        /// Tessellation control stage
        const TESSELLATION_CONTROL = 0x02;
        /// Tessellation evaluation stage
        const TESSELLATION_EVALUATION = 0x04;
        /// Fragment stage
        const FRAGMENT = 0x10;
        /// Compute stage
        const COMPUTE = 0x20;
    }
}
