//! # Pipelines
//!
//! Pipeline shadow state and the shader tuple identifying a pipeline by the
//! content of its shaders.

use ash::vk;

use crate::error::{ProfilerError, Result};
use crate::util::hash::{fingerprint32, fingerprint32_words};

/// One shader stage of a pipeline create info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStageDesc {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry_point: String,
}

impl ShaderStageDesc {
    pub fn new(stage: vk::ShaderStageFlags, module: vk::ShaderModule, entry_point: &str) -> Self {
        Self {
            stage,
            module,
            entry_point: entry_point.to_string(),
        }
    }
}

/// The parts of a pipeline create info the profiler needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDesc {
    pub bind_point: vk::PipelineBindPoint,
    pub stages: Vec<ShaderStageDesc>,
}

impl PipelineDesc {
    /// Graphics pipeline description
    pub fn graphics(stages: Vec<ShaderStageDesc>) -> Self {
        Self {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            stages,
        }
    }

    /// Compute pipeline description
    pub fn compute(module: vk::ShaderModule, entry_point: &str) -> Self {
        Self {
            bind_point: vk::PipelineBindPoint::COMPUTE,
            stages: vec![ShaderStageDesc::new(
                vk::ShaderStageFlags::COMPUTE,
                module,
                entry_point,
            )],
        }
    }
}

/// Per-stage shader hashes of a pipeline
///
/// A stage hash mixes the 32-bit fingerprint of the module's SPIR-V with
/// the fingerprint of the entry point name; unused stages are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize)]
pub struct ShaderTuple {
    pub vert: u32,
    pub tesc: u32,
    pub tese: u32,
    pub geom: u32,
    pub frag: u32,
    pub comp: u32,
    /// Identity of the whole tuple
    pub hash: u32,
}

impl ShaderTuple {
    /// Hash of one stage
    pub fn stage_hash(module_hash: u32, entry_point: &str) -> u32 {
        module_hash ^ fingerprint32(entry_point.as_bytes())
    }

    /// Build the tuple of a pipeline, looking up module hashes
    pub fn from_desc<F>(desc: &PipelineDesc, mut module_hash: F) -> Result<Self>
    where
        F: FnMut(vk::ShaderModule) -> Result<u32>,
    {
        let mut tuple = ShaderTuple::default();

        for stage in &desc.stages {
            let hash = Self::stage_hash(module_hash(stage.module)?, &stage.entry_point);

            let slot = match stage.stage {
                vk::ShaderStageFlags::VERTEX => &mut tuple.vert,
                vk::ShaderStageFlags::TESSELLATION_CONTROL => &mut tuple.tesc,
                vk::ShaderStageFlags::TESSELLATION_EVALUATION => &mut tuple.tese,
                vk::ShaderStageFlags::GEOMETRY => &mut tuple.geom,
                vk::ShaderStageFlags::FRAGMENT => &mut tuple.frag,
                vk::ShaderStageFlags::COMPUTE => &mut tuple.comp,
                other => {
                    log::error!("Unsupported shader stage {:?}", other);
                    return Err(ProfilerError::InvalidArgument(format!(
                        "unsupported shader stage {:?}",
                        other
                    )));
                }
            };
            *slot = hash;
        }

        tuple.hash = fingerprint32_words(&[
            tuple.vert, tuple.tesc, tuple.tese, tuple.geom, tuple.frag, tuple.comp,
        ]);
        Ok(tuple)
    }

    /// Name used when the application did not name the pipeline
    pub fn default_name(&self, bind_point: vk::PipelineBindPoint) -> String {
        if bind_point == vk::PipelineBindPoint::COMPUTE {
            format!("CS={:08x}", self.comp)
        } else {
            format!("VS={:08x},PS={:08x}", self.vert, self.frag)
        }
    }
}

/// Pipeline shadow state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerPipeline {
    pub handle: vk::Pipeline,
    pub bind_point: vk::PipelineBindPoint,
    pub shader_tuple: ShaderTuple,
}

impl ProfilerPipeline {
    /// Pipeline created before the profiler was attached
    pub fn unknown(handle: vk::Pipeline, bind_point: vk::PipelineBindPoint) -> Self {
        Self {
            handle,
            bind_point,
            shader_tuple: ShaderTuple::default(),
        }
    }
}
