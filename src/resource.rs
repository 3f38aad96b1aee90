//! Tagged resource variants (SPEC_FULL.md §9, "virtual resource hierarchy").
//!
//! The original C++ source expresses buffers, textures, views, samplers,
//! pipelines and command handles as a class hierarchy rooted at a single
//! `RHIObject`. Rust has no open inheritance, so this reimplementation
//! expresses the same "one destroy path per kind" shape as a closed enum of
//! owned handles, each variant carrying its own concrete representation.

use std::cell::RefCell;
use std::rc::Rc;

use crate::buffer::Buffer;
use crate::command_buffer::CommandHandle;
use crate::handle::Handle;
use crate::pipeline::{ComputePipeline, GraphicsPipeline};
use crate::pipeline_layout::PipelineLayout;
use crate::sampler::Sampler;
use crate::texture::Texture;
use crate::view::View;

/// Any single RHI object that can be deferred-destroyed (SPEC_FULL.md §3,
/// "Lifecycles") or retained in a command handle's stagging list.
///
/// `CommandHandle` is the one variant not `Arc`-backed: command handles are
/// strictly thread-local (SPEC_FULL.md §5), so a secondary retained inside a
/// primary's stagging list is kept alive via the same `Rc<RefCell<_>>` the
/// command-buffer manager already hands out.
#[derive(Clone)]
pub enum Resource {
    Buffer(Handle<Buffer>),
    Texture(Handle<Texture>),
    View(Handle<View>),
    Sampler(Handle<Sampler>),
    PipelineLayout(Handle<PipelineLayout>),
    GraphicsPipeline(Handle<GraphicsPipeline>),
    ComputePipeline(Handle<ComputePipeline>),
    CommandHandle(Rc<RefCell<CommandHandle>>),
}

impl Resource {
    /// A short tag for logging (never used for dispatch — each variant still
    /// owns its own destroy path via normal `Drop`).
    pub fn kind_name(&self) -> &'static str {
        match self {
            Resource::Buffer(_) => "buffer",
            Resource::Texture(_) => "texture",
            Resource::View(_) => "view",
            Resource::Sampler(_) => "sampler",
            Resource::PipelineLayout(_) => "pipeline_layout",
            Resource::GraphicsPipeline(_) => "graphics_pipeline",
            Resource::ComputePipeline(_) => "compute_pipeline",
            Resource::CommandHandle(_) => "command_handle",
        }
    }
}

impl From<Handle<Buffer>> for Resource {
    fn from(h: Handle<Buffer>) -> Self {
        Resource::Buffer(h)
    }
}
impl From<Handle<Texture>> for Resource {
    fn from(h: Handle<Texture>) -> Self {
        Resource::Texture(h)
    }
}
impl From<Handle<View>> for Resource {
    fn from(h: Handle<View>) -> Self {
        Resource::View(h)
    }
}
impl From<Handle<Sampler>> for Resource {
    fn from(h: Handle<Sampler>) -> Self {
        Resource::Sampler(h)
    }
}
impl From<Handle<PipelineLayout>> for Resource {
    fn from(h: Handle<PipelineLayout>) -> Self {
        Resource::PipelineLayout(h)
    }
}
impl From<Handle<GraphicsPipeline>> for Resource {
    fn from(h: Handle<GraphicsPipeline>) -> Self {
        Resource::GraphicsPipeline(h)
    }
}
impl From<Handle<ComputePipeline>> for Resource {
    fn from(h: Handle<ComputePipeline>) -> Self {
        Resource::ComputePipeline(h)
    }
}
impl From<Rc<RefCell<CommandHandle>>> for Resource {
    fn from(h: Rc<RefCell<CommandHandle>>) -> Self {
        Resource::CommandHandle(h)
    }
}
