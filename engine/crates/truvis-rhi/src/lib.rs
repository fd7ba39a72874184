//! Truvis 的 RHI 层，直接构建在 Vulkan（ash）之上：
//!
//! - physical device 与 queue family 的选择
//! - swapchain，以及 frames in flight 的同步
//! - 延迟销毁队列：保证 GPU 资源在 GPU 不再使用之后才被销毁

pub mod basic;
pub mod commands;
pub mod config;
pub mod error;
pub mod foundation;
pub mod gfx;
pub mod resources;
pub mod swapchain;
