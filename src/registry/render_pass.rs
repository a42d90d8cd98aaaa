//! # Render Passes
//!
//! Implicit work of a render pass (load-op clears, resolves) derived once
//! from its create info.

use ash::vk;

/// One attachment of a render pass create info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
}

/// Depth-stencil resolve of a subpass (VK_KHR_depth_stencil_resolve)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilResolveDesc {
    pub attachment: u32,
    pub depth_mode: vk::ResolveModeFlags,
    pub stencil_mode: vk::ResolveModeFlags,
}

/// One subpass of a render pass create info
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubpassDesc {
    /// Resolve attachment indices, `vk::ATTACHMENT_UNUSED` if not resolved
    pub resolve_attachments: Vec<u32>,
    pub depth_stencil_resolve: Option<DepthStencilResolveDesc>,
}

/// The parts of a render pass create info the profiler needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderPassDesc {
    pub attachments: Vec<AttachmentDesc>,
    pub subpasses: Vec<SubpassDesc>,
}

/// Per-subpass implicit work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubpassMeta {
    pub resolve_count: u32,
}

/// Implicit work of a render pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderPassMeta {
    pub subpasses: Vec<SubpassMeta>,
    pub clear_color_count: u32,
    /// Depth and stencil clears of one attachment count once
    pub clear_depth_stencil_count: u32,
}

impl RenderPassMeta {
    /// Derive implicit work from a create info
    pub fn from_desc(desc: &RenderPassDesc) -> Self {
        let mut meta = RenderPassMeta::default();

        for attachment in &desc.attachments {
            let (depth, stencil) = format_aspects(attachment.format);

            if depth || stencil {
                let clears_depth = depth && attachment.load_op == vk::AttachmentLoadOp::CLEAR;
                let clears_stencil =
                    stencil && attachment.stencil_load_op == vk::AttachmentLoadOp::CLEAR;
                if clears_depth || clears_stencil {
                    meta.clear_depth_stencil_count += 1;
                }
            } else if attachment.load_op == vk::AttachmentLoadOp::CLEAR {
                meta.clear_color_count += 1;
            }
        }

        meta.subpasses = desc
            .subpasses
            .iter()
            .map(|subpass| {
                let color = subpass
                    .resolve_attachments
                    .iter()
                    .filter(|&&index| index != vk::ATTACHMENT_UNUSED)
                    .count() as u32;

                SubpassMeta {
                    resolve_count: color + depth_stencil_resolve_count(subpass.depth_stencil_resolve),
                }
            })
            .collect();

        meta
    }

    /// Resolve count of a subpass, zero if out of range
    pub fn subpass_resolve_count(&self, index: u32) -> u32 {
        self.subpasses
            .get(index as usize)
            .map_or(0, |subpass| subpass.resolve_count)
    }
}

/// Resolves issued by a depth-stencil resolve
///
/// Independent resolve modes for depth and stencil resolve the attachment
/// twice; a single mode (or identical modes) resolves it once.
fn depth_stencil_resolve_count(resolve: Option<DepthStencilResolveDesc>) -> u32 {
    let Some(resolve) = resolve else {
        return 0;
    };
    if resolve.attachment == vk::ATTACHMENT_UNUSED {
        return 0;
    }

    let depth = resolve.depth_mode != vk::ResolveModeFlags::NONE;
    let stencil = resolve.stencil_mode != vk::ResolveModeFlags::NONE;

    match (depth, stencil) {
        (false, false) => 0,
        (true, true) if resolve.depth_mode != resolve.stencil_mode => 2,
        _ => 1,
    }
}

/// (has depth aspect, has stencil aspect)
fn format_aspects(format: vk::Format) -> (bool, bool) {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            (true, false)
        }
        vk::Format::S8_UINT => (false, true),
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => (true, true),
        _ => (false, false),
    }
}
