//! Shader metadata
//!
//! A [`Shader`] is built once from per-stage SPIR-V by reflection and is
//! immutable afterwards. Reflection is the only producer of its binding list.

pub mod compiler;
pub mod reflect;

use super::descriptor::{DescriptorSetLayoutBinding, DescriptorType};
use super::error::DriverResult;
use super::flags::ShaderStages;
use super::handles::{DescriptorSetLayoutId, ShaderId};

pub use compiler::{GlslcCompiler, ShaderCompiler};
pub use reflect::{merge_stage_reflections, reflect_shader, ShaderReflection, StageReflection};

/// A single programmable stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    /// Vertex stage
    Vertex,
    /// Tessellation control stage
    TessellationControl,
    /// Tessellation evaluation stage
    TessellationEvaluation,
    /// Fragment stage
    Fragment,
    /// Compute stage
    Compute,
}

impl ShaderStage {
    /// Bit for this stage
    pub const fn flag(self) -> ShaderStages {
        match self {
            Self::Vertex => ShaderStages::VERTEX,
            Self::TessellationControl => ShaderStages::TESSELLATION_CONTROL,
            Self::TessellationEvaluation => ShaderStages::TESSELLATION_EVALUATION,
            Self::Fragment => ShaderStages::FRAGMENT,
            Self::Compute => ShaderStages::COMPUTE,
        }
    }
}

/// Source language handed to a shader compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShaderLanguage {
    /// GLSL
    #[default]
    Glsl,
    /// HLSL
    Hlsl,
}

/// Compiled binary for one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStageSpirv {
    /// Stage the binary implements
    pub stage: ShaderStage,
    /// SPIR-V words as little-endian bytes
    pub spirv: Vec<u8>,
}

impl ShaderStageSpirv {
    /// Pair a stage with its binary
    pub fn new(stage: ShaderStage, spirv: impl Into<Vec<u8>>) -> Self {
        Self {
            stage,
            spirv: spirv.into(),
        }
    }
}

/// One reflected binding slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBinding {
    /// Resource kind
    pub ty: DescriptorType,
    /// Binding slot
    pub binding: u32,
    /// Array length
    pub length: u32,
    /// Stages reading the slot
    pub stages: ShaderStages,
    /// Name in the first stage that declared it
    pub name: String,
}

/// Bindings of one descriptor set index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformSet {
    /// Set index
    pub set: u32,
    /// Layout created for the set
    pub layout: DescriptorSetLayoutId,
    /// Bindings sorted by slot
    pub bindings: Vec<UniformBinding>,
}

/// Linked, reflected shader program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shader {
    /// Backend handle
    pub id: ShaderId,
    /// Debug name
    pub name: String,
    /// Stages present
    pub stages: ShaderStages,
    /// Push constant block size in bytes
    pub push_constant_size: u32,
    /// Stages reading push constants
    pub push_constant_stages: ShaderStages,
    /// Reflected sets, sorted by index
    pub uniform_sets: Vec<UniformSet>,
}

impl Shader {
    /// Layout of descriptor set `set`, if the shader uses it
    pub fn descriptor_set_layout(&self, set: u32) -> Option<DescriptorSetLayoutId> {
        self.uniform_set(set).map(|uniform_set| uniform_set.layout)
    }

    /// Reflected bindings of descriptor set `set`
    pub fn uniform_set(&self, set: u32) -> Option<&UniformSet> {
        self.uniform_sets.iter().find(|uniform_set| uniform_set.set == set)
    }
}

impl Shader {
    /// Assemble a shader from its reflection
    ///
    /// `create_layout` is called once per reflected set, in set order.
    pub fn from_reflection<F>(
        id: ShaderId,
        name: impl Into<String>,
        reflection: ShaderReflection,
        mut create_layout: F,
    ) -> DriverResult<Self>
    where
        F: FnMut(&[DescriptorSetLayoutBinding]) -> DriverResult<DescriptorSetLayoutId>,
    {
        let mut uniform_sets = Vec::with_capacity(reflection.sets.len());
        for set in reflection.sets {
            let layout = create_layout(&set.layout_bindings())?;
            uniform_sets.push(UniformSet {
                set: set.set,
                layout,
                bindings: set
                    .bindings
                    .into_iter()
                    .map(|binding| UniformBinding {
                        ty: binding.ty,
                        binding: binding.binding,
                        length: binding.count,
                        stages: binding.stages,
                        name: binding.name,
                    })
                    .collect(),
            });
        }

        Ok(Self {
            id,
            name: name.into(),
            stages: reflection.stages,
            push_constant_size: reflection.push_constant_size,
            push_constant_stages: reflection.push_constant_stages,
            uniform_sets,
        })
    }

    /// Layouts of every set, in set order
    pub fn descriptor_set_layouts(&self) -> impl Iterator<Item = DescriptorSetLayoutId> + '_ {
        self.uniform_sets.iter().map(|set| set.layout)
    }
}

#[cfg(test)]
mod tests {
    use slotmap::KeyData;

    use super::reflect::{MergedBinding, ReflectedSet};
    use super::*;

    #[test]
    fn test_shader_from_reflection() {
        let reflection = ShaderReflection {
            stages: ShaderStages::VERTEX | ShaderStages::FRAGMENT,
            push_constant_size: 64,
            push_constant_stages: ShaderStages::VERTEX,
            sets: vec![
                ReflectedSet {
                    set: 0,
                    bindings: vec![MergedBinding {
                        binding: 0,
                        ty: DescriptorType::UniformBuffer,
                        count: 1,
                        stages: ShaderStages::VERTEX,
                        name: "camera".to_string(),
                    }],
                },
                ReflectedSet {
                    set: 2,
                    bindings: Vec::new(),
                },
            ],
        };

        let mut next = 1u64;
        let shader = Shader::from_reflection(
            ShaderId::default(),
            "lit",
            reflection,
            |_bindings| {
                let id = DescriptorSetLayoutId::from(KeyData::from_ffi(next));
                next += 1;
                Ok(id)
            },
        )
        .unwrap();

        assert_eq!(shader.uniform_sets.len(), 2);
        assert_eq!(shader.uniform_set(0).unwrap().bindings[0].name, "camera");
        assert!(shader.descriptor_set_layout(1).is_none());
        assert_ne!(shader.descriptor_set_layout(0), shader.descriptor_set_layout(2));
        assert_eq!(shader.descriptor_set_layouts().count(), 2);
    }
}
