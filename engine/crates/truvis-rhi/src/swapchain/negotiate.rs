//! swapchain 创建参数的协商，全部是纯函数

use ash::vk;

use crate::error::{GfxError, GfxResult};

/// 按优先级排列的 surface format
pub const DESIRED_SURFACE_FORMATS: [vk::SurfaceFormatKHR; 3] = [
    vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    },
    vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    },
    vk::SurfaceFormatKHR {
        format: vk::Format::R8G8B8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    },
];

/// swapchain image 必须支持的 usage：TRANSFER_DST 用于 clear 和 blit
pub const SWAPCHAIN_IMAGE_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw() | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
);

/// - available 只有一个 UNDEFINED 时，表示任何 format 都可以，使用 desired[0]
/// - 否则使用第一个可用的 desired format
/// - 都不可用时退回 available[0]
///
/// available 为空时返回 None
pub fn select_surface_format(
    desired: &[vk::SurfaceFormatKHR],
    available: &[vk::SurfaceFormatKHR],
) -> Option<vk::SurfaceFormatKHR> {
    let first_available = *available.first()?;

    if available.len() == 1 && first_available.format == vk::Format::UNDEFINED {
        return Some(desired.first().copied().unwrap_or(DESIRED_SURFACE_FORMATS[0]));
    }

    desired
        .iter()
        .find(|d| available.iter().any(|a| a.format == d.format && a.color_space == d.color_space))
        .copied()
        .or(Some(first_available))
}

/// desired 不可用时退回 FIFO（规范保证一定支持）
pub fn select_present_mode(desired: vk::PresentModeKHR, available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if available.contains(&desired) {
        desired
    } else {
        log::warn!("present mode {:?} is not supported, falling back to FIFO", desired);
        vk::PresentModeKHR::FIFO
    }
}

/// 确定 swapchain 的 extent 尺寸
///
/// 如果 current_extent.width 为特殊值 0xFFFFFFFF，则表示可以自己设置交换链的 extent，
/// 此时将 desired 限制在 [min, max] 之间
pub fn select_extent(caps: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: desired.width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: desired.height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// image 数量至少为 frames_count + 1，保证 CPU 录制时总有一张 image 可以被 acquire
///
/// max_image_count == 0 表示不限制 image 数量
pub fn select_image_count(caps: &vk::SurfaceCapabilitiesKHR, frames_count: usize) -> u32 {
    let count = u32::try_from(frames_count).unwrap_or(u32::MAX).saturating_add(1).max(caps.min_image_count);
    if caps.max_image_count != 0 { count.min(caps.max_image_count) } else { count }
}

pub fn select_pre_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps.supported_transforms.contains(vk::SurfaceTransformFlagsKHR::IDENTITY) {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

/// OPAQUE 优先，否则使用第一个支持的 bit
pub fn select_composite_alpha(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    const CANDIDATES: [vk::CompositeAlphaFlagsKHR; 4] = [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ];
    CANDIDATES
        .into_iter()
        .find(|flag| caps.supported_composite_alpha.contains(*flag))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// graphics 与 present 不是同一个 family 时使用 CONCURRENT
pub fn select_sharing_mode(graphics_family: u32, present_family: u32) -> (vk::SharingMode, Vec<u32>) {
    if graphics_family == present_family {
        (vk::SharingMode::EXCLUSIVE, vec![])
    } else {
        (vk::SharingMode::CONCURRENT, vec![graphics_family, present_family])
    }
}

/// 创建完成之后检查：frames in flight 必须小于 image 数量
pub fn check_frames_fit(frames_count: usize, image_count: usize) -> GfxResult<()> {
    if frames_count == 0 || frames_count >= image_count {
        return Err(GfxError::TooFewSwapchainImages {
            frames: frames_count,
            images: image_count,
        });
    }
    Ok(())
}

/// resize 的目标尺寸：每一边都需要在 1..=max_image_dimension_2d 之间
pub fn check_resize_extent(width: u32, height: u32, max: u32) -> GfxResult<vk::Extent2D> {
    if width == 0 || height == 0 || width > max || height > max {
        return Err(GfxError::InvalidExtent { width, height, max });
    }
    Ok(vk::Extent2D { width, height })
}

#[inline]
pub fn present_mode_for_vsync(vsync: bool) -> vk::PresentModeKHR {
    if vsync { vk::PresentModeKHR::FIFO } else { vk::PresentModeKHR::MAILBOX }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn caps(min: (u32, u32), max: (u32, u32), current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_select_surface_format() {
        // UNDEFINED 表示任何 format 都可以
        let any = [format(vk::Format::UNDEFINED)];
        assert_eq!(select_surface_format(&DESIRED_SURFACE_FORMATS, &any), Some(DESIRED_SURFACE_FORMATS[0]));

        // 选择第一个可用的 desired format
        let available = [format(vk::Format::R8G8B8A8_UNORM), format(vk::Format::B8G8R8A8_SRGB)];
        assert_eq!(
            select_surface_format(&DESIRED_SURFACE_FORMATS, &available),
            Some(format(vk::Format::B8G8R8A8_SRGB))
        );

        // color space 不匹配时不算可用，退回 available[0]
        let hdr = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::HDR10_ST2084_EXT,
        };
        let available = [format(vk::Format::A2B10G10R10_UNORM_PACK32), hdr];
        assert_eq!(
            select_surface_format(&DESIRED_SURFACE_FORMATS, &available),
            Some(format(vk::Format::A2B10G10R10_UNORM_PACK32))
        );

        assert_eq!(select_surface_format(&DESIRED_SURFACE_FORMATS, &[]), None);
    }

    #[test]
    fn test_selected_format_is_available() {
        let pool = [
            format(vk::Format::R8G8B8A8_UNORM),
            format(vk::Format::B8G8R8A8_UNORM),
            format(vk::Format::R16G16B16A16_SFLOAT),
            format(vk::Format::B8G8R8A8_SRGB),
        ];
        for len in 1..=pool.len() {
            for start in 0..pool.len() {
                let available = pool.iter().cycle().skip(start).take(len).copied().collect::<Vec<_>>();
                let selected = select_surface_format(&DESIRED_SURFACE_FORMATS, &available).unwrap();
                assert!(available.contains(&selected));
            }
        }
    }

    #[test]
    fn test_select_present_mode() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(select_present_mode(vk::PresentModeKHR::MAILBOX, &available), vk::PresentModeKHR::MAILBOX);
        assert_eq!(select_present_mode(vk::PresentModeKHR::IMMEDIATE, &available), vk::PresentModeKHR::FIFO);
        assert_eq!(present_mode_for_vsync(true), vk::PresentModeKHR::FIFO);
        assert_eq!(present_mode_for_vsync(false), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn test_select_extent() {
        // current extent 固定时直接使用
        let fixed = caps((1, 1), (4096, 4096), (800, 600));
        let extent = select_extent(&fixed, vk::Extent2D { width: 1920, height: 1080 });
        assert_eq!((extent.width, extent.height), (800, 600));

        // 可变时 clamp 到 [min, max]
        let free = caps((64, 64), (2048, 1024), (u32::MAX, u32::MAX));
        for (w, h) in [(1, 1), (100, 5000), (1920, 1080), (4000, 4000), (640, 480)] {
            let extent = select_extent(&free, vk::Extent2D { width: w, height: h });
            assert_eq!(extent.width, w.clamp(64, 2048));
            assert_eq!(extent.height, h.clamp(64, 1024));
        }
    }

    #[test]
    fn test_image_count_exceeds_frames() {
        for min in 1..=4 {
            for max in [0, 3, 4, 8] {
                if max != 0 && max < min {
                    continue;
                }
                let mut c = caps((1, 1), (1, 1), (1, 1));
                c.min_image_count = min;
                c.max_image_count = max;
                for frames in 1..=3usize {
                    let count = select_image_count(&c, frames);
                    assert!(count >= min);
                    if max != 0 {
                        assert!(count <= max);
                    }
                    // surface 允许时，image 数量一定大于 frames in flight
                    if max == 0 || max as usize > frames {
                        assert!(frames < count as usize);
                    }
                }
            }
        }
    }

    #[test]
    fn test_transform_alpha_sharing() {
        let mut c = caps((1, 1), (1, 1), (1, 1));
        c.supported_transforms = vk::SurfaceTransformFlagsKHR::IDENTITY | vk::SurfaceTransformFlagsKHR::ROTATE_90;
        c.current_transform = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        assert_eq!(select_pre_transform(&c), vk::SurfaceTransformFlagsKHR::IDENTITY);
        c.supported_transforms = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        assert_eq!(select_pre_transform(&c), vk::SurfaceTransformFlagsKHR::ROTATE_90);

        c.supported_composite_alpha = vk::CompositeAlphaFlagsKHR::INHERIT | vk::CompositeAlphaFlagsKHR::OPAQUE;
        assert_eq!(select_composite_alpha(&c), vk::CompositeAlphaFlagsKHR::OPAQUE);
        c.supported_composite_alpha = vk::CompositeAlphaFlagsKHR::INHERIT;
        assert_eq!(select_composite_alpha(&c), vk::CompositeAlphaFlagsKHR::INHERIT);

        assert_eq!(select_sharing_mode(0, 0), (vk::SharingMode::EXCLUSIVE, vec![]));
        assert_eq!(select_sharing_mode(0, 2), (vk::SharingMode::CONCURRENT, vec![0, 2]));
    }

    #[test]
    fn test_image_count_saturates() {
        let mut c = caps((1, 1), (1, 1), (1, 1));
        c.max_image_count = 0;
        assert_eq!(select_image_count(&c, usize::MAX), u32::MAX);
        assert_eq!(select_image_count(&c, u32::MAX as usize), u32::MAX);
        c.max_image_count = 8;
        assert_eq!(select_image_count(&c, usize::MAX), 8);
    }

    #[test]
    fn test_frames_must_be_less_than_images() {
        assert!(check_frames_fit(2, 3).is_ok());
        assert!(check_frames_fit(1, 2).is_ok());
        assert!(matches!(
            check_frames_fit(3, 3),
            Err(GfxError::TooFewSwapchainImages { frames: 3, images: 3 })
        ));
        assert!(matches!(check_frames_fit(4, 2), Err(GfxError::TooFewSwapchainImages { .. })));
        assert!(matches!(check_frames_fit(0, 0), Err(GfxError::TooFewSwapchainImages { .. })));

        // surface 把 image 数量限制在 frames 以下时，创建之后的检查会失败
        let mut c = caps((1, 1), (1, 1), (1, 1));
        c.min_image_count = 2;
        c.max_image_count = 3;
        assert!(check_frames_fit(2, select_image_count(&c, 2) as usize).is_ok());
        assert!(check_frames_fit(3, select_image_count(&c, 3) as usize).is_err());
    }

    #[test]
    fn test_resize_extent_round_trip() {
        for (w, h) in [(0, 600), (800, 0), (0, 0), (16385, 600), (800, u32::MAX)] {
            assert!(matches!(
                check_resize_extent(w, h, 16384),
                Err(GfxError::InvalidExtent { max: 16384, .. })
            ));
        }

        // 与 resize 相同的路径：先检查，再作为 desired extent 参与协商
        let free = caps((64, 64), (4096, 4096), (u32::MAX, u32::MAX));
        for (w, h) in [(1, 1), (800, 600), (1920, 1080), (4096, 4096), (16384, 16384)] {
            let desired = check_resize_extent(w, h, 16384).unwrap();
            let extent = select_extent(&free, desired);
            assert_eq!((extent.width, extent.height), (w.clamp(64, 4096), h.clamp(64, 4096)));
        }
        let extent = select_extent(&free, check_resize_extent(1280, 720, 16384).unwrap());
        assert_eq!((extent.width, extent.height), (1280, 720));
    }
}
