use std::{
    collections::HashSet,
    ffi::{CStr, CString, c_char},
};

use ash::vk;
use itertools::Itertools;

use crate::{
    error::{GfxError, GfxResult, VkResultExt},
    foundation::debug_messenger::GfxDebugMsger,
};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct GfxInstance {
    /// 仅仅是函数指针，以及一个裸的 handle，可以随意 clone
    ///
    /// 生命周期由 Gfx 手动控制
    pub(crate) ash_instance: ash::Instance,
    /// VK_EXT_debug_utils 是否启用：决定 messenger、debug name 以及 label 是否可用
    debug_utils: bool,
}

// new & init
impl GfxInstance {
    /// 设置所需的 layers 和 extensions，创建 vk instance
    ///
    /// `extra_exts` 通常是 surface 所需的 extension，由 ash-window 根据 display handle 给出
    pub fn new(
        vk_entry: &ash::Entry,
        app_name: &str,
        engine_name: &str,
        extra_exts: &[&'static CStr],
        validation: bool,
    ) -> GfxResult<Self> {
        let _span = tracy_client::span!("GfxInstance::new");

        let app_name = CString::new(app_name).unwrap_or_default();
        let engine_name = CString::new(engine_name).unwrap_or_default();
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_3) // 版本过低时，有些函数无法正确加载
            .application_name(app_name.as_c_str())
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name.as_c_str())
            .engine_version(vk::make_api_version(0, 0, 1, 0));

        let (enabled_extensions, debug_utils) = Self::get_extensions(vk_entry, extra_exts, validation)?;
        log::info!(
            "instance extensions: {}",
            enabled_extensions.iter().map(|ext| format!("\n\t{:?}", unsafe { CStr::from_ptr(*ext) })).join("")
        );

        let enabled_layers = Self::get_layers(vk_entry, validation)?;
        log::info!(
            "instance layers: {}",
            enabled_layers.iter().map(|layer| format!("\n\t{:?}", unsafe { CStr::from_ptr(*layer) })).join("")
        );

        let mut instance_ci = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_extensions)
            .enabled_layer_names(&enabled_layers);

        // 为 instance info 添加 debug messenger，捕获 create/destroy instance 期间的消息
        let mut debug_utils_messenger_ci = GfxDebugMsger::debug_utils_messenger_ci();
        if debug_utils {
            instance_ci = instance_ci.push_next(&mut debug_utils_messenger_ci);
        }

        let ash_instance = unsafe { vk_entry.create_instance(&instance_ci, None) }.vk_err("vkCreateInstance")?;

        Ok(Self {
            ash_instance,
            debug_utils,
        })
    }

    /// instance 所需的，且受支持的 extension
    fn get_extensions(
        vk_entry: &ash::Entry,
        extra_exts: &[&'static CStr],
        validation: bool,
    ) -> GfxResult<(Vec<*const c_char>, bool)> {
        let all_ext_props = unsafe { vk_entry.enumerate_instance_extension_properties(None) }
            .vk_err("vkEnumerateInstanceExtensionProperties")?;
        let is_supported = |ext: &CStr| {
            all_ext_props.iter().any(|supported| supported.extension_name_as_c_str().is_ok_and(|name| name == ext))
        };

        let mut enabled_extensions: HashSet<&'static CStr> = HashSet::new();
        for &ext in extra_exts {
            if !is_supported(ext) {
                return Err(GfxError::MissingInstanceExtension(ext.to_string_lossy().into_owned()));
            }
            enabled_extensions.insert(ext);
        }

        // debug utils 提供 messenger、object name 以及 label，只在 validation 打开时需要
        let debug_utils = validation && is_supported(ash::ext::debug_utils::NAME);
        if debug_utils {
            enabled_extensions.insert(ash::ext::debug_utils::NAME);
        } else if validation {
            log::warn!("validation requested but {:?} is not available", ash::ext::debug_utils::NAME);
        }

        Ok((enabled_extensions.iter().map(|ext| ext.as_ptr()).collect_vec(), debug_utils))
    }

    /// instance 所需的所有 layers
    ///
    /// validation layer 缺失时只给出警告，也可以使用 vulkan configurator 控制 validation layer
    fn get_layers(vk_entry: &ash::Entry, validation: bool) -> GfxResult<Vec<*const c_char>> {
        if !validation {
            return Ok(Vec::new());
        }

        let all_layer_props =
            unsafe { vk_entry.enumerate_instance_layer_properties() }.vk_err("vkEnumerateInstanceLayerProperties")?;
        let supported = all_layer_props
            .iter()
            .any(|layer| layer.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
        if supported {
            Ok(vec![VALIDATION_LAYER.as_ptr()])
        } else {
            log::warn!("validation layer {:?} is not installed", VALIDATION_LAYER);
            Ok(Vec::new())
        }
    }
}
// destroy
impl GfxInstance {
    pub fn destroy(self) {
        log::info!("destroying instance");
        unsafe {
            self.ash_instance.destroy_instance(None);
        }
    }
}
// getters
impl GfxInstance {
    #[inline]
    pub fn ash_instance(&self) -> &ash::Instance {
        &self.ash_instance
    }

    #[inline]
    pub fn vk_instance(&self) -> vk::Instance {
        self.ash_instance.handle()
    }

    #[inline]
    pub fn debug_utils_enabled(&self) -> bool {
        self.debug_utils
    }
}
