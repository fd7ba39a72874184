use ash::vk;

/// 根据 format 推断 image 的 aspect
pub fn format_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// layout 转换时使用的 aspect
///
/// 目标 layout 是 depth 类型时一定包含 DEPTH，format 带 stencil 时再加上 STENCIL；
/// 其余情况由 format 决定
pub fn transition_aspect(new_layout: vk::ImageLayout, format: vk::Format) -> vk::ImageAspectFlags {
    match new_layout {
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => {
            (format_aspect(format) & vk::ImageAspectFlags::STENCIL) | vk::ImageAspectFlags::DEPTH
        }
        _ => format_aspect(format),
    }
}

/// 便捷创建 image memory barrier 的结构体
pub struct GfxImageBarrier {
    inner: vk::ImageMemoryBarrier2<'static>,
}

impl Default for GfxImageBarrier {
    fn default() -> Self {
        Self {
            inner: vk::ImageMemoryBarrier2 {
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::UNDEFINED,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::empty(),
                    base_array_layer: 0,
                    layer_count: 1,
                    base_mip_level: 0,
                    level_count: 1,
                },
                ..Default::default()
            },
        }
    }
}

impl GfxImageBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 粗粒度的 layout 转换：ALL_COMMANDS 之间的 MEMORY_WRITE -> MEMORY_WRITE | MEMORY_READ，
    /// 覆盖所有 mip level 和 array layer
    pub fn layout_transition(
        image: vk::Image,
        format: vk::Format,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        Self::new()
            .image(image)
            .src_mask(vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::MEMORY_WRITE)
            .dst_mask(
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ,
            )
            .layout_transfer(old_layout, new_layout)
            .image_aspect_flag(transition_aspect(new_layout, format))
            .all_subresources()
    }

    #[inline]
    pub fn inner(&self) -> &vk::ImageMemoryBarrier2<'_> {
        &self.inner
    }

    /// builder
    #[inline]
    pub fn queue_family_transfer(mut self, src_queue_family_index: u32, dst_queue_family_index: u32) -> Self {
        self.inner.src_queue_family_index = src_queue_family_index;
        self.inner.dst_queue_family_index = dst_queue_family_index;
        self
    }

    /// builder
    #[inline]
    pub fn layout_transfer(mut self, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        self.inner.old_layout = old_layout;
        self.inner.new_layout = new_layout;
        self
    }

    /// builder
    #[inline]
    pub fn src_mask(mut self, src_stage_mask: vk::PipelineStageFlags2, src_access_mask: vk::AccessFlags2) -> Self {
        self.inner.src_stage_mask = src_stage_mask;
        self.inner.src_access_mask = src_access_mask;
        self
    }

    /// builder
    #[inline]
    pub fn dst_mask(mut self, dst_stage_mask: vk::PipelineStageFlags2, dst_access_mask: vk::AccessFlags2) -> Self {
        self.inner.dst_stage_mask = dst_stage_mask;
        self.inner.dst_access_mask = dst_access_mask;
        self
    }

    /// builder
    /// layer 和 miplevel 都使用默认值
    #[inline]
    pub fn image_aspect_flag(mut self, aspect_mask: vk::ImageAspectFlags) -> Self {
        self.inner.subresource_range.aspect_mask = aspect_mask;
        self
    }

    /// builder
    #[inline]
    pub fn all_subresources(mut self) -> Self {
        self.inner.subresource_range.level_count = vk::REMAINING_MIP_LEVELS;
        self.inner.subresource_range.layer_count = vk::REMAINING_ARRAY_LAYERS;
        self
    }

    /// builder
    #[inline]
    pub fn image(mut self, image: vk::Image) -> Self {
        self.inner.image = image;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_aspect() {
        assert_eq!(
            transition_aspect(vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::Format::B8G8R8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            transition_aspect(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL, vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            transition_aspect(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL, vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        // format 未知时，depth layout 依然使用 DEPTH
        assert_eq!(
            transition_aspect(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL, vk::Format::UNDEFINED),
            vk::ImageAspectFlags::DEPTH
        );
        // depth image 拷贝时由 format 决定
        assert_eq!(
            transition_aspect(vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::Format::D32_SFLOAT_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn test_layout_transition_covers_all_subresources() {
        let barrier = GfxImageBarrier::layout_transition(
            vk::Image::null(),
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        let inner = barrier.inner();
        assert_eq!(inner.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(inner.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(inner.src_stage_mask, vk::PipelineStageFlags2::ALL_COMMANDS);
        assert_eq!(inner.dst_access_mask, vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ);
        assert_eq!(inner.subresource_range.level_count, vk::REMAINING_MIP_LEVELS);
        assert_eq!(inner.subresource_range.layer_count, vk::REMAINING_ARRAY_LAYERS);
        assert_eq!(inner.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }
}
