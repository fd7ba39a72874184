use ash::vk;

use crate::swapchain::present_state::SwapchainState;

/// RHI 层对外暴露的错误
///
/// 只有「选择」和「创建」路径会返回错误；submit / present / wait 这类调用失败时直接视为致命错误
#[derive(Debug, thiserror::Error)]
pub enum GfxError {
    #[error("failed to load vulkan entry: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("vulkan call `{call}` failed: {result:?}")]
    Vk { call: &'static str, result: vk::Result },

    #[error("required instance extension {0} is not available")]
    MissingInstanceExtension(String),

    #[error("physical device selector is misconfigured: {0}")]
    InvalidSelector(String),

    #[error("no gpu with vulkan support was found")]
    NoPhysicalDevice,

    #[error("no physical device satisfies the requirements")]
    NoSuitableDevice,

    #[error("surface does not support image usage {0:?}")]
    UnsupportedSurfaceUsage(vk::ImageUsageFlags),

    #[error("surface reports no formats")]
    NoSurfaceFormat,

    #[error("swapchain has {images} images, frames in flight ({frames}) must be less than that")]
    TooFewSwapchainImages { frames: usize, images: usize },

    #[error("invalid swapchain extent {width}x{height}, each side must be in 1..={max}")]
    InvalidExtent { width: u32, height: u32, max: u32 },

    #[error("operation is not valid while the swapchain is {0:?}")]
    InvalidSwapchainState(SwapchainState),

    #[error("`{call}` did not complete within {timeout_ns} ns")]
    Timeout { call: &'static str, timeout_ns: u64 },

    #[error("failed to allocate `{name}`: {result:?}")]
    Allocation { name: String, result: vk::Result },
}

pub type GfxResult<T> = Result<T, GfxError>;

/// 为 `VkResult` 提供两种处理方式：向上传播，或者视为致命错误
pub trait VkResultExt<T> {
    fn vk_err(self, call: &'static str) -> GfxResult<T>;

    /// 记录错误日志后 panic
    fn vk_fatal(self, call: &'static str) -> T;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    #[inline]
    fn vk_err(self, call: &'static str) -> GfxResult<T> {
        self.map_err(|result| GfxError::Vk { call, result })
    }

    #[inline]
    #[track_caller]
    fn vk_fatal(self, call: &'static str) -> T {
        match self {
            Ok(value) => value,
            Err(result) => {
                log::error!("fatal: `{}` failed with {:?}", call, result);
                panic!("`{call}` failed with {result:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_err_keeps_call_name() {
        let r: Result<(), vk::Result> = Err(vk::Result::ERROR_DEVICE_LOST);
        match r.vk_err("vkCreateFence") {
            Err(GfxError::Vk { call, result }) => {
                assert_eq!(call, "vkCreateFence");
                assert_eq!(result, vk::Result::ERROR_DEVICE_LOST);
            }
            _ => panic!("expected a vk error"),
        }
    }

    #[test]
    #[should_panic(expected = "vkQueueSubmit2")]
    fn test_vk_fatal_panics() {
        let r: Result<(), vk::Result> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        r.vk_fatal("vkQueueSubmit2");
    }
}
