//! Engine-neutral vertex layout description (SPEC_FULL.md §4 component 1,
//! "not a shader compiler / reflection system" — these types describe the
//! fixed-function vertex input state baked into a graphics pipeline, they do
//! not introspect shader bytecode).
//!
//! Grounded on `render/src/vertex.rs`'s `VertexLayout`/`VertexAttributeType`
//! shape, reworked without the teacher's `autograph_render_macros` derive:
//! reflection/codegen is out of scope here (SPEC_FULL.md Non-goals), so
//! layouts are built by hand, the way `vulkan_pipeline.cpp` describes them.

use ash::vk;

use crate::error::{Result, RhiError};
use crate::format::Format;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexInputRate {
    Vertex,
    Instance,
}

impl VertexInputRate {
    pub fn to_vk(self) -> vk::VertexInputRate {
        match self {
            VertexInputRate::Vertex => vk::VertexInputRate::VERTEX,
            VertexInputRate::Instance => vk::VertexInputRate::INSTANCE,
        }
    }
}

/// One attribute within a vertex buffer's layout; `location` matches the
/// shader's `layout(location = N)` input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: Format,
    pub offset: u32,
}

/// Describes the fixed-function layout of one vertex buffer binding. Pipeline
/// -static (SPEC_FULL.md §4.8): baked into a `VkPipeline` at compile time, not
/// re-specified per draw.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: VertexInputRate,
    pub attributes: Vec<VertexAttribute>,
}

/// Describes the format of an index buffer's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub fn to_vk(self) -> vk::IndexType {
        match self {
            IndexFormat::U16 => vk::IndexType::UINT16,
            IndexFormat::U32 => vk::IndexType::UINT32,
        }
    }
}

/// Builds the `VkVertexInputBindingDescription`/`VkVertexInputAttributeDescription`
/// arrays a `VkPipelineVertexInputStateCreateInfo` borrows from (SPEC_FULL.md
/// §4.8 graphics pipeline construction, step 3).
pub fn to_vk_descriptions(
    layouts: &[VertexBufferLayout],
) -> (Vec<vk::VertexInputBindingDescription>, Vec<vk::VertexInputAttributeDescription>) {
    let bindings = layouts
        .iter()
        .map(|l| vk::VertexInputBindingDescription {
            binding: l.binding,
            stride: l.stride,
            input_rate: l.input_rate.to_vk(),
        })
        .collect();

    let attributes = layouts
        .iter()
        .flat_map(|l| {
            l.attributes.iter().map(move |a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: l.binding,
                format: a.format.to_vk(),
                offset: a.offset,
            })
        })
        .collect();

    (bindings, attributes)
}

/// Validates that a vertex buffer bound at `binding` actually matches the
/// pipeline's baked-in stride for that binding (SPEC_FULL.md §8 edge case:
/// "vertex buffer stride does not match the bound pipeline's vertex-input
/// description"). Runs once per bind rather than per vertex, since the stride
/// is a per-binding constant.
pub fn validate_stride(layouts: &[VertexBufferLayout], binding: u32, provided_stride: u32) -> Result<()> {
    if let Some(layout) = layouts.iter().find(|l| l.binding == binding) {
        if layout.stride != provided_stride {
            return Err(RhiError::VertexStrideMismatch);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            binding: 0,
            stride: 24,
            input_rate: VertexInputRate::Vertex,
            attributes: vec![
                VertexAttribute { location: 0, format: Format::R32G32B32Float, offset: 0 },
                VertexAttribute { location: 1, format: Format::R32G32Float, offset: 12 },
            ],
        }
    }

    #[test]
    fn descriptions_carry_one_binding_per_layout_and_one_attribute_entry_per_attribute() {
        let layouts = [layout()];
        let (bindings, attributes) = to_vk_descriptions(&layouts);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride, 24);
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes[1].offset, 12);
    }

    #[test]
    fn matching_stride_validates() {
        let layouts = [layout()];
        assert!(validate_stride(&layouts, 0, 24).is_ok());
    }

    #[test]
    fn mismatched_stride_is_rejected() {
        let layouts = [layout()];
        assert!(matches!(validate_stride(&layouts, 0, 16), Err(RhiError::VertexStrideMismatch)));
    }

    #[test]
    fn unknown_binding_is_not_validated() {
        let layouts = [layout()];
        assert!(validate_stride(&layouts, 5, 999).is_ok());
    }
}
