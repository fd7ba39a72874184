use std::ffi::CStr;

use ash::vk;

use crate::error::{GfxResult, VkResultExt};

/// 用于设置 debug name 的类型信息
pub trait DebugType {
    fn debug_type_name() -> &'static str;
    fn vk_handle(&self) -> impl vk::Handle;
}

/// `set_debug_utils_object_name` 的参数，object type 由 handle 的类型决定
pub(crate) fn object_name_info<T: vk::Handle>(handle: T, name: &CStr) -> vk::DebugUtilsObjectNameInfoEXT<'_> {
    vk::DebugUtilsObjectNameInfoEXT::default().object_name(name).object_handle(handle)
}

/// 带类型前缀的 debug name，例如 `GfxFence::render_frame_0`
pub(crate) fn typed_debug_name<T: DebugType>(name: &str) -> String {
    format!("{}::{}", T::debug_type_name(), name)
}

/// validation layer 的消息转发到 `log`
pub struct GfxDebugMsger {
    loader: ash::ext::debug_utils::Instance,
    handle: Option<vk::DebugUtilsMessengerEXT>,
}

// new & init
impl GfxDebugMsger {
    pub fn new(vk_entry: &ash::Entry, instance: &ash::Instance) -> GfxResult<Self> {
        let loader = ash::ext::debug_utils::Instance::new(vk_entry, instance);

        let create_info = Self::debug_utils_messenger_ci();
        let handle = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .vk_err("vkCreateDebugUtilsMessengerEXT")?;

        Ok(Self {
            loader,
            handle: Some(handle),
        })
    }

    /// 用于创建 debug messenger 的结构体
    ///
    /// 也会挂在 InstanceCreateInfo 的 p_next 上，以捕获 instance 创建和销毁过程中的消息
    pub fn debug_utils_messenger_ci() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
        vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vk_debug_callback))
    }
}
// destroy
impl GfxDebugMsger {
    pub fn destroy(mut self) {
        if let Some(handle) = self.handle.take() {
            log::info!("destroying debug messenger");
            unsafe { self.loader.destroy_debug_utils_messenger(handle, None) };
        }
    }
}
impl Drop for GfxDebugMsger {
    fn drop(&mut self) {
        if self.handle.is_some() {
            log::warn!("GfxDebugMsger dropped without destroy(), messenger leaked");
        }
    }
}

/// 把 validation 消息中的 json 拆开：MainMessage 里有换行符，单独输出
fn format_debug_message(message_type: vk::DebugUtilsMessageTypeFlagsEXT, msg: &str) -> String {
    let mut json_value = serde_json::from_str::<serde_json::Value>(msg);
    let mut json_obj = json_value.as_mut().ok().and_then(|v| v.as_object_mut());
    let main_msg_value = json_obj.as_mut().and_then(|obj| obj.remove("MainMessage"));
    let main_msg_str = main_msg_value.as_ref().and_then(|value| value.as_str()).unwrap_or_default();
    let total_msg_str =
        json_obj.and_then(|obj| serde_json::to_string_pretty(&obj).ok()).unwrap_or_else(|| msg.to_string());

    format!("[{:?}]\n{}\n{}\n", message_type, total_msg_str, main_msg_str)
}

/// debug messenger 的回调函数
unsafe extern "system" fn vk_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    let callback_data = unsafe { *p_callback_data };

    let msg = if callback_data.p_message.is_null() {
        std::borrow::Cow::from("")
    } else {
        unsafe { CStr::from_ptr(callback_data.p_message).to_string_lossy() }
    };
    let format_msg = format_debug_message(message_type, msg.as_ref());

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("{}", format_msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("{}", format_msg),
        _ => log::info!("{}", format_msg),
    };

    // 只有 layer developer 才需要返回 True
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeFence(vk::Fence);
    impl DebugType for FakeFence {
        fn debug_type_name() -> &'static str {
            "GfxFence"
        }

        fn vk_handle(&self) -> impl vk::Handle {
            self.0
        }
    }

    #[test]
    fn test_object_name_info_from_opaque_handle() {
        use ash::vk::Handle;

        let fence = FakeFence(vk::Fence::from_raw(0x1234));
        let name = std::ffi::CString::new(typed_debug_name::<FakeFence>("render_frame_0")).unwrap();
        let info = object_name_info(fence.vk_handle(), &name);

        assert_eq!(info.object_type, vk::ObjectType::FENCE);
        assert_eq!(info.object_handle, 0x1234);
        assert_eq!(name.as_c_str(), c"GfxFence::render_frame_0");
        assert_eq!(info.p_object_name, name.as_ptr());
    }

    #[test]
    fn test_format_plain_message() {
        let s = format_debug_message(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION, "plain text");
        assert!(s.contains("plain text"));
    }

    #[test]
    fn test_format_json_message_extracts_main_message() {
        let json = r#"{"MainMessage":"line1\nline2","MessageID":42}"#;
        let s = format_debug_message(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION, json);
        assert!(s.contains("MessageID"));
        assert!(s.ends_with("line1\nline2\n"));
    }
}
