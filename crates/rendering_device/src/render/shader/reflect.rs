//! SPIR-V reflection
//!
//! Each stage binary is reflected on its own into a [`StageReflection`].
//! [`merge_stage_reflections`] then folds the stages into one
//! [`ShaderReflection`]: a slot declared by several stages must agree on type
//! and array length, and its stage mask is the union of the declaring stages.

use std::collections::BTreeMap;

use log::debug;
use spirv_reflect::types::{ReflectDescriptorBinding, ReflectDescriptorType, ReflectShaderStageFlags};

use super::{ShaderStage, ShaderStageSpirv};
use crate::render::descriptor::{DescriptorSetLayoutBinding, DescriptorType};
use crate::render::error::ShaderError;
use crate::render::flags::ShaderStages;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// A binding as declared by one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedBinding {
    /// Descriptor set index
    pub set: u32,
    /// Binding slot
    pub binding: u32,
    /// Resource kind
    pub ty: DescriptorType,
    /// Array length
    pub count: u32,
    /// Name in the binary, may be empty
    pub name: String,
}

/// Everything reflection learned from one stage binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReflection {
    /// Stage of the binary
    pub stage: ShaderStage,
    /// Declared bindings
    pub bindings: Vec<ReflectedBinding>,
    /// Size of the push constant block, zero when absent
    pub push_constant_size: u32,
}

/// Merged binding of the whole program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedBinding {
    /// Binding slot
    pub binding: u32,
    /// Resource kind
    pub ty: DescriptorType,
    /// Array length
    pub count: u32,
    /// Every stage declaring the slot
    pub stages: ShaderStages,
    /// Name from the first declaring stage
    pub name: String,
}

/// Bindings of one set, sorted by slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedSet {
    /// Set index
    pub set: u32,
    /// Bindings of the set
    pub bindings: Vec<MergedBinding>,
}

impl ReflectedSet {
    /// Layout bindings for creating the set layout
    pub fn layout_bindings(&self) -> Vec<DescriptorSetLayoutBinding> {
        self.bindings
            .iter()
            .map(|binding| DescriptorSetLayoutBinding {
                binding: binding.binding,
                ty: binding.ty,
                count: binding.count,
                stages: binding.stages,
            })
            .collect()
    }
}

/// Reflection of a whole program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderReflection {
    /// Stages present
    pub stages: ShaderStages,
    /// Largest push constant block among the stages
    pub push_constant_size: u32,
    /// Stages that declare a push constant block
    pub push_constant_stages: ShaderStages,
    /// Sets sorted by index
    pub sets: Vec<ReflectedSet>,
}

/// Check that `bytes` look like a SPIR-V module
pub fn validate_spirv(stage: ShaderStage, bytes: &[u8]) -> Result<(), ShaderError> {
    let invalid = |reason: &str| ShaderError::InvalidSpirv {
        stage,
        reason: reason.to_string(),
    };

    if bytes.is_empty() {
        return Err(invalid("empty binary"));
    }
    if bytes.len() % 4 != 0 {
        return Err(invalid("length is not a multiple of four"));
    }
    if bytes.len() < 20 {
        return Err(invalid("binary is shorter than the module header"));
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != SPIRV_MAGIC {
        return Err(invalid(&format!("bad magic number {magic:#010x}")));
    }
    Ok(())
}

/// Reflect a single stage binary
pub fn reflect_stage(spirv: &ShaderStageSpirv) -> Result<StageReflection, ShaderError> {
    let stage = spirv.stage;
    validate_spirv(stage, &spirv.spirv)?;

    let module = spirv_reflect::create_shader_module(&spirv.spirv).map_err(|reason| {
        ShaderError::Reflection {
            stage,
            reason: reason.to_string(),
        }
    })?;

    let declared = module.get_shader_stage();
    if stage_from_reflect(declared) != Some(stage) {
        return Err(ShaderError::InvalidSpirv {
            stage,
            reason: format!("binary declares stage {declared:?}"),
        });
    }

    let reflection_error = |reason: &'static str| ShaderError::Reflection {
        stage,
        reason: reason.to_string(),
    };

    let mut bindings = Vec::new();
    for descriptor in &module
        .enumerate_descriptor_bindings(None)
        .map_err(reflection_error)?
    {
        bindings.push(to_reflected_binding(descriptor)?);
    }

    let push_constant_size = module
        .enumerate_push_constant_blocks(None)
        .map_err(reflection_error)?
        .iter()
        .map(|block| block.size)
        .max()
        .unwrap_or(0);

    debug!(
        "Reflected {:?} stage: {} bindings, {} push constant bytes",
        stage,
        bindings.len(),
        push_constant_size
    );

    Ok(StageReflection {
        stage,
        bindings,
        push_constant_size,
    })
}

/// Reflect every stage of a program and merge the results
pub fn reflect_shader(stages: &[ShaderStageSpirv]) -> Result<ShaderReflection, ShaderError> {
    let reflections = stages
        .iter()
        .map(reflect_stage)
        .collect::<Result<Vec<_>, _>>()?;
    merge_stage_reflections(&reflections)
}

/// Fold per-stage reflections into the program's binding list
pub fn merge_stage_reflections(
    reflections: &[StageReflection],
) -> Result<ShaderReflection, ShaderError> {
    if reflections.is_empty() {
        return Err(ShaderError::InvalidStages("no stages supplied".to_string()));
    }

    let mut stages = ShaderStages::empty();
    for reflection in reflections {
        let flag = reflection.stage.flag();
        if stages.contains(flag) {
            return Err(ShaderError::InvalidStages(format!(
                "{:?} supplied more than once",
                reflection.stage
            )));
        }
        stages |= flag;
    }
    if stages.contains(ShaderStages::COMPUTE) && stages != ShaderStages::COMPUTE {
        return Err(ShaderError::InvalidStages(
            "compute cannot be combined with graphics stages".to_string(),
        ));
    }

    let mut push_constant_size = 0;
    let mut push_constant_stages = ShaderStages::empty();
    let mut sets: BTreeMap<u32, BTreeMap<u32, MergedBinding>> = BTreeMap::new();

    for reflection in reflections {
        let flag = reflection.stage.flag();
        if reflection.push_constant_size > 0 {
            push_constant_size = push_constant_size.max(reflection.push_constant_size);
            push_constant_stages |= flag;
        }

        for declared in &reflection.bindings {
            let slots = sets.entry(declared.set).or_default();
            match slots.get_mut(&declared.binding) {
                Some(existing) => {
                    if existing.ty != declared.ty {
                        return Err(ShaderError::BindingMismatch {
                            set: declared.set,
                            binding: declared.binding,
                            detail: format!("type {:?} vs {:?}", existing.ty, declared.ty),
                        });
                    }
                    if existing.count != declared.count {
                        return Err(ShaderError::BindingMismatch {
                            set: declared.set,
                            binding: declared.binding,
                            detail: format!(
                                "array length {} vs {}",
                                existing.count, declared.count
                            ),
                        });
                    }
                    existing.stages |= flag;
                }
                None => {
                    slots.insert(
                        declared.binding,
                        MergedBinding {
                            binding: declared.binding,
                            ty: declared.ty,
                            count: declared.count,
                            stages: flag,
                            name: declared.name.clone(),
                        },
                    );
                }
            }
        }
    }

    Ok(ShaderReflection {
        stages,
        push_constant_size,
        push_constant_stages,
        sets: sets
            .into_iter()
            .map(|(set, bindings)| ReflectedSet {
                set,
                bindings: bindings.into_values().collect(),
            })
            .collect(),
    })
}

fn stage_from_reflect(flags: ReflectShaderStageFlags) -> Option<ShaderStage> {
    if flags == ReflectShaderStageFlags::VERTEX {
        Some(ShaderStage::Vertex)
    } else if flags == ReflectShaderStageFlags::FRAGMENT {
        Some(ShaderStage::Fragment)
    } else if flags == ReflectShaderStageFlags::TESSELLATION_CONTROL {
        Some(ShaderStage::TessellationControl)
    } else if flags == ReflectShaderStageFlags::TESSELLATION_EVALUATION {
        Some(ShaderStage::TessellationEvaluation)
    } else if flags == ReflectShaderStageFlags::COMPUTE {
        Some(ShaderStage::Compute)
    } else {
        None
    }
}

fn to_reflected_binding(
    descriptor: &ReflectDescriptorBinding,
) -> Result<ReflectedBinding, ShaderError> {
    let unsupported = || ShaderError::UnsupportedResource {
        name: descriptor.name.clone(),
        set: descriptor.set,
        binding: descriptor.binding,
    };

    let ty = match descriptor.descriptor_type {
        ReflectDescriptorType::Sampler => DescriptorType::Sampler,
        ReflectDescriptorType::CombinedImageSampler => DescriptorType::CombinedImageSampler,
        ReflectDescriptorType::SampledImage => DescriptorType::SampledImage,
        ReflectDescriptorType::StorageImage => DescriptorType::StorageImage,
        ReflectDescriptorType::UniformTexelBuffer => DescriptorType::UniformTexelBuffer,
        ReflectDescriptorType::StorageTexelBuffer => DescriptorType::StorageTexelBuffer,
        ReflectDescriptorType::UniformBuffer => DescriptorType::UniformBuffer,
        ReflectDescriptorType::StorageBuffer => DescriptorType::StorageBuffer,
        ReflectDescriptorType::UniformBufferDynamic => DescriptorType::UniformBufferDynamic,
        ReflectDescriptorType::StorageBufferDynamic => DescriptorType::StorageBufferDynamic,
        ReflectDescriptorType::InputAttachment => DescriptorType::InputAttachment,
        _ => return Err(unsupported()),
    };

    // Runtime-sized arrays
    if descriptor.count == 0 {
        return Err(unsupported());
    }

    Ok(ReflectedBinding {
        set: descriptor.set,
        binding: descriptor.binding,
        ty,
        count: descriptor.count,
        name: descriptor.name.clone(),
    })
}
